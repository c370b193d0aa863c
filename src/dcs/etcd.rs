use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::{Dcs, IpCensus};
use crate::config::Config;
use crate::error::DaemonError;

// Keys API error codes the claim protocol distinguishes.
const CODE_KEY_NOT_FOUND: u64 = 100;
const CODE_TEST_FAILED: u64 = 101;
const CODE_NODE_EXIST: u64 = 105;

/// etcd v2 Keys API client (`/v2/keys/...` over HTTP/JSON).
///
/// The claim protocol needs exactly what this API offers natively: per-key
/// TTLs, `prevExist`/`prevValue` compare-and-set on both set and delete,
/// refresh-only TTL resets, and directory nodes with sorted quorum reads.
///
/// Cheaply cloneable: the underlying `reqwest::Client` is an `Arc`
/// internally.
#[derive(Clone)]
pub struct EtcdDcs {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
    nodename: String,
    ttl_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct KeysResponse {
    pub action: String,
    pub node: KeyNode,
}

#[derive(Debug, Default, Deserialize)]
pub struct KeyNode {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<KeyNode>,
    #[serde(default)]
    pub ttl: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
}

/// Outcome of a single Keys API request, before each operation maps it
/// onto the coordinator's error kinds.
#[derive(Debug)]
enum KeysError {
    Transport(String),
    Api {
        code: u64,
        message: String,
        cause: String,
    },
    Protocol(String),
}

impl fmt::Display for KeysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeysError::Transport(msg) => write!(f, "transport: {}", msg),
            KeysError::Api {
                code,
                message,
                cause,
            } => write!(f, "api error {}: {} ({})", code, message, cause),
            KeysError::Protocol(msg) => write!(f, "protocol: {}", msg),
        }
    }
}

impl KeysError {
    fn code(&self) -> Option<u64> {
        match self {
            KeysError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Lost race or vanished key: the CAS precondition did not hold.
    fn is_cas_failure(&self) -> bool {
        matches!(self.code(), Some(CODE_TEST_FAILED) | Some(CODE_KEY_NOT_FOUND))
    }
}

/// The Keys API takes TTLs as whole seconds; round the configured
/// millisecond value up so a mark never expires earlier than asked.
fn ttl_secs(ttl: Duration) -> u64 {
    ((ttl.as_millis() as u64).saturating_add(999) / 1000).max(1)
}

fn leaf_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Classify one recursive listing of the `ips/` tree. Pool entries must be
/// directories; anything else is a structural error, logged and skipped.
fn census_from_listing(root: &KeyNode, nodename: &str) -> Result<IpCensus, DaemonError> {
    if !root.dir {
        return Err(DaemonError::DcsRead(format!(
            "{} is not a directory",
            root.key
        )));
    }

    let mut census = IpCensus::default();
    for entry in &root.nodes {
        let ip = leaf_name(&entry.key).to_string();
        if !entry.dir {
            error!(
                "dcs: pool entries must be directories, {} is a key",
                entry.key
            );
            continue;
        }
        census.pool.push(ip.clone());
        if let Some(mark) = entry.nodes.iter().find(|n| leaf_name(&n.key) == "marked") {
            if mark.value.as_deref() == Some(nodename) {
                census.own_marked.push(ip.clone());
            }
        }
        if entry.nodes.is_empty() {
            census.unmarked.push(ip);
        }
    }
    Ok(census)
}

impl EtcdDcs {
    /// Connect to the store, trying each endpoint in order until one
    /// answers. Credentials become HTTP basic auth on every request; TLS
    /// materials are loaded onto the client.
    pub async fn connect(conf: &Config) -> Result<Self, DaemonError> {
        let http = build_client(conf)?;

        let mut last_error: Option<String> = None;
        for endpoint in &conf.dcs_endpoints {
            let base_url = endpoint.trim_end_matches('/').to_string();
            match http.get(format!("{}/version", base_url)).send().await {
                Ok(_) => {
                    info!("dcs: connected to {}", base_url);
                    return Ok(Self {
                        http,
                        base_url,
                        namespace: conf.dcs_namespace.clone(),
                        nodename: conf.nodename.clone(),
                        ttl_secs: ttl_secs(conf.ttl),
                    });
                }
                Err(e) => {
                    warn!("dcs: endpoint {} unreachable: {}, trying next", base_url, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(DaemonError::DcsRead(
            last_error.unwrap_or_else(|| "no endpoints configured".to_string()),
        ))
    }

    fn nodes_dir(&self) -> String {
        format!("{}nodes", self.namespace)
    }

    fn ips_dir(&self) -> String {
        format!("{}ips", self.namespace)
    }

    fn ip_dir(&self, ip: &str) -> String {
        format!("{}ips/{}", self.namespace, ip)
    }

    fn mark_key(&self, ip: &str) -> String {
        format!("{}ips/{}/marked", self.namespace, ip)
    }

    fn keys_url(&self, key: &str) -> String {
        format!("{}/v2/keys{}", self.base_url, key)
    }

    async fn get(&self, key: &str, recursive: bool) -> Result<KeysResponse, KeysError> {
        let req = self.http.get(self.keys_url(key)).query(&[
            ("recursive", if recursive { "true" } else { "false" }),
            ("sorted", "true"),
            ("quorum", "true"),
        ]);
        self.send(req).await
    }

    async fn put(&self, key: &str, params: &[(&str, String)]) -> Result<KeysResponse, KeysError> {
        self.send(self.http.put(self.keys_url(key)).form(params)).await
    }

    async fn delete(
        &self,
        key: &str,
        params: &[(&str, String)],
    ) -> Result<KeysResponse, KeysError> {
        self.send(self.http.delete(self.keys_url(key)).query(params))
            .await
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<KeysResponse, KeysError> {
        let resp = req
            .send()
            .await
            .map_err(|e| KeysError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| KeysError::Protocol(e.to_string()))?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| KeysError::Protocol(format!("{}: {}", e, body)))
        } else {
            match serde_json::from_str::<ApiError>(&body) {
                Ok(api) => Err(KeysError::Api {
                    code: api.error_code,
                    message: api.message,
                    cause: api.cause,
                }),
                Err(_) => Err(KeysError::Protocol(format!("status {}: {}", status, body))),
            }
        }
    }
}

#[async_trait]
impl Dcs for EtcdDcs {
    async fn bootstrap(&self) -> Result<(), DaemonError> {
        for dir in [self.nodes_dir(), self.ips_dir()] {
            match self.get(&dir, false).await {
                Ok(_) => {}
                Err(e) if e.code() == Some(CODE_KEY_NOT_FOUND) => {
                    self.put(&dir, &[("dir", "true".to_string())])
                        .await
                        .map_err(|e| DaemonError::DcsWrite(format!("create {}: {}", dir, e)))?;
                    info!("dcs: created directory {}", dir);
                }
                Err(e) => {
                    return Err(DaemonError::DcsRead(format!("bootstrap {}: {}", dir, e)));
                }
            }
        }
        Ok(())
    }

    async fn advertise(&self) -> Result<(), DaemonError> {
        let key = format!("{}/{}", self.nodes_dir(), self.nodename);
        self.put(
            &key,
            &[
                ("value", "healthy".to_string()),
                ("ttl", self.ttl_secs.to_string()),
            ],
        )
        .await
        .map_err(|e| DaemonError::DcsWrite(format!("advertise: {}", e)))?;
        Ok(())
    }

    async fn count_advertisers(&self) -> Result<usize, DaemonError> {
        let resp = self
            .get(&self.nodes_dir(), true)
            .await
            .map_err(|e| DaemonError::DcsRead(format!("count advertisers: {}", e)))?;
        if !resp.node.dir {
            return Err(DaemonError::DcsRead(format!(
                "{} is not a directory",
                self.nodes_dir()
            )));
        }
        Ok(resp.node.nodes.len())
    }

    async fn list_ips(&self) -> Result<IpCensus, DaemonError> {
        let resp = self
            .get(&self.ips_dir(), true)
            .await
            .map_err(|e| DaemonError::DcsRead(format!("list ips: {}", e)))?;
        census_from_listing(&resp.node, &self.nodename)
    }

    async fn claim(&self, ip: &str) -> bool {
        let params = [
            ("value", self.nodename.clone()),
            ("ttl", self.ttl_secs.to_string()),
            ("prevExist", "false".to_string()),
        ];
        match self.put(&self.mark_key(ip), &params).await {
            Ok(_) => {
                info!("dcs: marked ip {}", ip);
                true
            }
            Err(e) if e.code() == Some(CODE_NODE_EXIST) => {
                debug!("dcs: lost claim race for {}", ip);
                false
            }
            Err(e) => {
                warn!("dcs: claim failed for {}: {}", ip, e);
                false
            }
        }
    }

    async fn refresh(&self, ip: &str) -> Result<(), DaemonError> {
        let params = [
            ("ttl", self.ttl_secs.to_string()),
            ("refresh", "true".to_string()),
            ("prevValue", self.nodename.clone()),
        ];
        match self.put(&self.mark_key(ip), &params).await {
            Ok(_) => {
                debug!("dcs: refreshed mark for {}", ip);
                Ok(())
            }
            Err(e) if e.is_cas_failure() => Err(DaemonError::DcsPrecondition(format!(
                "refresh {}: {}",
                ip, e
            ))),
            Err(e) => Err(DaemonError::DcsWrite(format!("refresh {}: {}", ip, e))),
        }
    }

    async fn release(&self, ip: &str) -> Result<(), DaemonError> {
        match self
            .delete(&self.mark_key(ip), &[("prevValue", self.nodename.clone())])
            .await
        {
            Ok(_) => {
                info!("dcs: removed mark for {}", ip);
                Ok(())
            }
            Err(e) if e.is_cas_failure() => Err(DaemonError::DcsPrecondition(format!(
                "release {}: {}",
                ip, e
            ))),
            Err(e) => Err(DaemonError::DcsWrite(format!("release {}: {}", ip, e))),
        }
    }

    async fn check_ownership(&self, ip: &str) -> Result<bool, DaemonError> {
        let resp = match self.get(&self.ip_dir(ip), true).await {
            Ok(resp) => resp,
            // Pool entry gone: nothing marks the address as foreign-owned.
            Err(e) if e.code() == Some(CODE_KEY_NOT_FOUND) => return Ok(true),
            Err(e) => {
                return Err(DaemonError::DcsRead(format!("check ownership {}: {}", ip, e)));
            }
        };

        match resp
            .node
            .nodes
            .iter()
            .find(|n| leaf_name(&n.key) == "marked")
        {
            None => Ok(true),
            Some(mark) => Ok(mark.value.as_deref() == Some(self.nodename.as_str())),
        }
    }
}

/// Build the HTTP client: request deadline, optional CA and client identity.
fn build_client(conf: &Config) -> Result<reqwest::Client, DaemonError> {
    let mut builder = reqwest::Client::builder().timeout(conf.interval).no_proxy();

    if let Some(ref ca) = conf.etcd_ca_file {
        let pem = std::fs::read(ca)
            .map_err(|e| DaemonError::Config(format!("cannot read {}: {}", ca.display(), e)))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| DaemonError::Config(format!("invalid CA {}: {}", ca.display(), e)))?;
        builder = builder.add_root_certificate(cert);
    }

    if let (Some(cert), Some(key)) = (&conf.etcd_cert_file, &conf.etcd_key_file) {
        let mut pem = std::fs::read(cert)
            .map_err(|e| DaemonError::Config(format!("cannot read {}: {}", cert.display(), e)))?;
        let key_pem = std::fs::read(key)
            .map_err(|e| DaemonError::Config(format!("cannot read {}: {}", key.display(), e)))?;
        pem.extend_from_slice(&key_pem);
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| DaemonError::Config(format!("invalid client identity: {}", e)))?;
        builder = builder.identity(identity);
    }

    let mut client = builder;
    if let (Some(user), Some(pass)) = (&conf.etcd_user, &conf.etcd_password) {
        // reqwest has no client-wide basic auth; stash it as a default header.
        use base64::Engine;
        use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", user, pass).as_bytes());
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Basic {}", token))
            .map_err(|e| DaemonError::Config(format!("invalid etcd credentials: {}", e)))?;
        headers.insert(AUTHORIZATION, value);
        client = client.default_headers(headers);
    }

    client
        .build()
        .map_err(|e| DaemonError::Config(format!("cannot build dcs client: {}", e)))
}
