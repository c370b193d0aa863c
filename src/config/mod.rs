pub mod types;

pub use types::{Config, ConfigFile};

use crate::error::DaemonError;
use std::path::Path;

impl Config {
    /// Load configuration from an optional file and apply `YAIM_*`
    /// environment overrides. With no file every setting may come from the
    /// environment; mandatory keys are enforced after both sources merge.
    pub fn load(path: Option<&Path>) -> Result<Self, DaemonError> {
        let mut file: ConfigFile = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    DaemonError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                match path.extension().and_then(|e| e.to_str()) {
                    Some("toml") => toml::from_str(&content)
                        .map_err(|e| DaemonError::Config(format!("{}: {}", path.display(), e)))?,
                    Some("json") => serde_json::from_str(&content)
                        .map_err(|e| DaemonError::Config(format!("{}: {}", path.display(), e)))?,
                    _ => {
                        return Err(DaemonError::Config(format!(
                            "unsupported config format for {}, use .toml or .json",
                            path.display()
                        )))
                    }
                }
            }
            None => ConfigFile::default(),
        };

        apply_env_overrides(&mut file);
        Config::resolve(file)
    }

    /// Log the effective settings, masking credentials. Runs after the
    /// tracing subscriber is installed.
    pub fn log_settings(&self) {
        tracing::info!(
            "config: interface={}, netmask={}, label={}, nodename={}",
            self.iface,
            self.netmask,
            self.full_label(),
            self.nodename
        );
        tracing::info!(
            "config: dcs-type={}, dcs-endpoints={:?}, dcs-namespace={}",
            self.dcs_type,
            self.dcs_endpoints,
            self.dcs_namespace
        );
        tracing::info!(
            "config: checker-type={}, http-url={}, http-expected-code={}",
            self.checker_type,
            self.http_url,
            self.http_expected_code
        );
        tracing::info!(
            "config: ttl={}ms, interval={}ms, retry-after={}ms, retry-num={}, drain-on-unhealthy={}",
            self.ttl.as_millis(),
            self.interval.as_millis(),
            self.retry_after.as_millis(),
            self.retry_num,
            self.drain_on_unhealthy
        );
        if let Some(ref user) = self.etcd_user {
            tracing::info!("config: etcd-user={}, etcd-password=*****", user);
        }
        if self.ttl <= self.interval {
            tracing::warn!(
                "config: ttl ({}ms) does not exceed interval ({}ms); marks will expire between refreshes",
                self.ttl.as_millis(),
                self.interval.as_millis()
            );
        }
    }
}

/// Environment overrides: `YAIM_` prefix, dashes become underscores
/// (`dcs-endpoints` → `YAIM_DCS_ENDPOINTS`).
fn apply_env_overrides(file: &mut ConfigFile) {
    fn var(key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }

    if let Some(v) = var("YAIM_NETMASK") {
        if let Ok(n) = v.parse() {
            file.netmask = Some(n);
        }
    }
    if let Some(v) = var("YAIM_INTERFACE") {
        file.interface = Some(v);
    }
    if let Some(v) = var("YAIM_LABEL") {
        file.label = Some(v);
    }
    if let Some(v) = var("YAIM_NODENAME") {
        file.nodename = Some(v);
    }

    if let Some(v) = var("YAIM_DCS_TYPE") {
        file.dcs_type = Some(v);
    }
    if let Some(v) = var("YAIM_DCS_ENDPOINTS") {
        file.dcs_endpoints = Some(v.split(',').map(|s| s.trim().to_string()).collect());
    }
    if let Some(v) = var("YAIM_DCS_NAMESPACE") {
        file.dcs_namespace = Some(v);
    }

    if let Some(v) = var("YAIM_CHECKER_TYPE") {
        file.checker_type = Some(v);
    }
    if let Some(v) = var("YAIM_HTTP_URL") {
        file.http_url = Some(v);
    }
    if let Some(v) = var("YAIM_HTTP_EXPECTED_CODE") {
        if let Ok(n) = v.parse() {
            file.http_expected_code = Some(n);
        }
    }
    if let Some(v) = var("YAIM_HTTP_EXPECTED_RESPONSE") {
        file.http_expected_response = Some(v);
    }
    if let Some(v) = var("YAIM_HTTP_EXPECTED_RESPONSE_CONTAINS") {
        file.http_expected_response_contains = Some(v);
    }

    if let Some(v) = var("YAIM_TTL") {
        if let Ok(n) = v.parse() {
            file.ttl = Some(n);
        }
    }
    if let Some(v) = var("YAIM_INTERVAL") {
        if let Ok(n) = v.parse() {
            file.interval = Some(n);
        }
    }
    if let Some(v) = var("YAIM_RETRY_AFTER") {
        if let Ok(n) = v.parse() {
            file.retry_after = Some(n);
        }
    }
    if let Some(v) = var("YAIM_RETRY_NUM") {
        if let Ok(n) = v.parse() {
            file.retry_num = Some(n);
        }
    }
    if let Some(v) = var("YAIM_DRAIN_ON_UNHEALTHY") {
        file.drain_on_unhealthy = Some(v == "true" || v == "1");
    }
    if let Some(v) = var("YAIM_LOG_LEVEL") {
        file.log_level = Some(v);
    }

    if let Some(v) = var("YAIM_ETCD_USER") {
        file.etcd_user = Some(v);
    }
    if let Some(v) = var("YAIM_ETCD_PASSWORD") {
        file.etcd_password = Some(v);
    }
    if let Some(v) = var("YAIM_ETCD_CA_FILE") {
        file.etcd_ca_file = Some(v.into());
    }
    if let Some(v) = var("YAIM_ETCD_CERT_FILE") {
        file.etcd_cert_file = Some(v.into());
    }
    if let Some(v) = var("YAIM_ETCD_KEY_FILE") {
        file.etcd_key_file = Some(v.into());
    }
}
