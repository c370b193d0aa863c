use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::DaemonError;

/// Deserialize a list that may also be given as a comma-separated string
/// (the usual shorthand for endpoint lists in flat config formats).
fn deserialize_string_or_seq<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrSeq {
        Str(String),
        Seq(Vec<String>),
    }

    Ok(Option::<StringOrSeq>::deserialize(deserializer)?.map(|v| match v {
        StringOrSeq::Str(s) => s.split(',').map(|p| p.trim().to_string()).collect(),
        StringOrSeq::Seq(seq) => seq,
    }))
}

/// Raw configuration as read from the file. Every key is optional here;
/// environment overrides and defaults are applied before [`Config::resolve`]
/// enforces the mandatory set. Precedence: env > file > default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    #[serde(default)]
    pub netmask: Option<u8>,

    #[serde(default)]
    pub interface: Option<String>,

    /// Suffix of the address label; the full label is `<interface>:<label>`.
    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub nodename: Option<String>,

    #[serde(default)]
    pub dcs_type: Option<String>,

    #[serde(default, deserialize_with = "deserialize_string_or_seq")]
    pub dcs_endpoints: Option<Vec<String>>,

    #[serde(default)]
    pub dcs_namespace: Option<String>,

    #[serde(default)]
    pub checker_type: Option<String>,

    #[serde(default)]
    pub http_url: Option<String>,

    #[serde(default)]
    pub http_expected_code: Option<u16>,

    #[serde(default)]
    pub http_expected_response: Option<String>,

    #[serde(default)]
    pub http_expected_response_contains: Option<String>,

    /// Mark and node-entry lifetime, milliseconds.
    #[serde(default)]
    pub ttl: Option<u64>,

    /// Tick period, milliseconds.
    #[serde(default)]
    pub interval: Option<u64>,

    /// Pause between probe/ARP retries, milliseconds.
    #[serde(default)]
    pub retry_after: Option<u64>,

    #[serde(default)]
    pub retry_num: Option<u32>,

    /// Drop local addresses and release marks on an unhealthy tick.
    #[serde(default)]
    pub drain_on_unhealthy: Option<bool>,

    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub etcd_user: Option<String>,

    #[serde(default)]
    pub etcd_password: Option<String>,

    #[serde(default)]
    pub etcd_ca_file: Option<PathBuf>,

    #[serde(default)]
    pub etcd_cert_file: Option<PathBuf>,

    #[serde(default)]
    pub etcd_key_file: Option<PathBuf>,
}

/// Resolved, validated settings bundle handed to every subsystem.
#[derive(Debug, Clone)]
pub struct Config {
    pub netmask: u8,
    pub iface: String,
    pub label: String,
    pub nodename: String,
    pub dcs_type: String,
    pub dcs_endpoints: Vec<String>,
    /// Normalized to a leading and trailing slash.
    pub dcs_namespace: String,
    pub checker_type: String,
    pub http_url: String,
    pub http_expected_code: u16,
    pub http_expected_response: String,
    pub http_expected_response_contains: String,
    pub ttl: Duration,
    pub interval: Duration,
    pub retry_after: Duration,
    pub retry_num: u32,
    pub drain_on_unhealthy: bool,
    pub log_level: String,
    pub etcd_user: Option<String>,
    pub etcd_password: Option<String>,
    pub etcd_ca_file: Option<PathBuf>,
    pub etcd_cert_file: Option<PathBuf>,
    pub etcd_key_file: Option<PathBuf>,
}

fn default_dcs_type() -> String {
    "etcd".to_string()
}

fn default_dcs_namespace() -> String {
    "/yaim/".to_string()
}

fn default_checker_type() -> String {
    "http".to_string()
}

fn default_label() -> String {
    "yaim".to_string()
}

fn default_http_expected_code() -> u16 {
    200
}

fn default_ttl_ms() -> u64 {
    3000
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_retry_after_ms() -> u64 {
    250
}

fn default_retry_num() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Default endpoint for a store reachable on localhost with standard ports.
fn default_endpoints(dcs_type: &str) -> Vec<String> {
    match dcs_type {
        "etcd" => vec!["http://127.0.0.1:2379".to_string()],
        _ => Vec::new(),
    }
}

/// Ensure the namespace is of the form `/…/` so key construction can
/// simply append `nodes/…` or `ips/…`.
fn normalize_namespace(ns: &str) -> String {
    let trimmed = ns.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

impl Config {
    /// Apply defaults and validate the raw file/env bundle.
    pub fn resolve(file: ConfigFile) -> Result<Self, DaemonError> {
        let dcs_type = file.dcs_type.unwrap_or_else(default_dcs_type);
        let checker_type = file.checker_type.unwrap_or_else(default_checker_type);

        let nodename = match file.nodename {
            Some(n) if !n.is_empty() => n,
            _ => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .ok_or_else(|| {
                    DaemonError::Config(
                        "nodename is not set and the hostname could not be determined".to_string(),
                    )
                })?,
        };

        let netmask = file
            .netmask
            .ok_or_else(|| DaemonError::Config("netmask is mandatory".to_string()))?;
        if netmask > 32 {
            return Err(DaemonError::Config(format!(
                "netmask must be a prefix length between 0 and 32, got {}",
                netmask
            )));
        }

        let iface = match file.interface {
            Some(i) if !i.is_empty() => i,
            _ => return Err(DaemonError::Config("interface is mandatory".to_string())),
        };

        let dcs_endpoints = match file.dcs_endpoints {
            Some(eps) if !eps.is_empty() => eps,
            _ => {
                let eps = default_endpoints(&dcs_type);
                if eps.is_empty() {
                    return Err(DaemonError::Config(format!(
                        "dcs-endpoints is mandatory for dcs-type {:?}",
                        dcs_type
                    )));
                }
                eps
            }
        };
        if dcs_endpoints.iter().any(|e| e.is_empty()) {
            return Err(DaemonError::Config(
                "dcs-endpoints must not contain empty entries".to_string(),
            ));
        }

        let http_url = file.http_url.unwrap_or_default();
        if checker_type == "http" && http_url.is_empty() {
            return Err(DaemonError::Config(
                "http-url is mandatory when checker-type is \"http\"".to_string(),
            ));
        }

        // Settings that imply one another.
        if file.etcd_user.is_some() != file.etcd_password.is_some() {
            return Err(DaemonError::Config(
                "etcd-user and etcd-password must be set together".to_string(),
            ));
        }
        if file.etcd_cert_file.is_some() != file.etcd_key_file.is_some() {
            return Err(DaemonError::Config(
                "etcd-cert-file and etcd-key-file must be set together".to_string(),
            ));
        }

        Ok(Config {
            netmask,
            iface,
            label: file.label.unwrap_or_else(default_label),
            nodename,
            dcs_type,
            dcs_endpoints,
            dcs_namespace: normalize_namespace(
                &file.dcs_namespace.unwrap_or_else(default_dcs_namespace),
            ),
            checker_type,
            http_url,
            http_expected_code: file.http_expected_code.unwrap_or_else(default_http_expected_code),
            http_expected_response: file.http_expected_response.unwrap_or_default(),
            http_expected_response_contains: file
                .http_expected_response_contains
                .unwrap_or_default(),
            ttl: Duration::from_millis(file.ttl.unwrap_or_else(default_ttl_ms)),
            interval: Duration::from_millis(file.interval.unwrap_or_else(default_interval_ms)),
            retry_after: Duration::from_millis(
                file.retry_after.unwrap_or_else(default_retry_after_ms),
            ),
            retry_num: file.retry_num.unwrap_or_else(default_retry_num).max(1),
            drain_on_unhealthy: file.drain_on_unhealthy.unwrap_or(false),
            log_level: file.log_level.unwrap_or_else(default_log_level),
            etcd_user: file.etcd_user,
            etcd_password: file.etcd_password,
            etcd_ca_file: file.etcd_ca_file,
            etcd_cert_file: file.etcd_cert_file,
            etcd_key_file: file.etcd_key_file,
        })
    }

    /// The label attached to every kernel address this daemon manages.
    pub fn full_label(&self) -> String {
        format!("{}:{}", self.iface, self.label)
    }
}
