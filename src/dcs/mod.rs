pub mod etcd;

pub use etcd::EtcdDcs;

use crate::config::Config;
use crate::error::DaemonError;
use async_trait::async_trait;
use std::sync::Arc;

/// One pass over the managed address tree.
#[derive(Debug, Default, Clone)]
pub struct IpCensus {
    /// Every address in the managed pool.
    pub pool: Vec<String>,
    /// Addresses whose mark carries this peer's nodename, in the store's
    /// sorted listing order. Position decides which marks survive when the
    /// peer is over its share.
    pub own_marked: Vec<String>,
    /// Pool entries with no mark at all.
    pub unmarked: Vec<String>,
}

/// Coordination-store capability set. All cross-peer coordination goes
/// through these eight operations; the loop never sees the backend.
#[async_trait]
pub trait Dcs: Send + Sync {
    /// Ensure the `nodes/` and `ips/` directories exist. Fatal on failure.
    async fn bootstrap(&self) -> Result<(), DaemonError>;

    /// Upsert this peer's liveness entry with a fresh TTL.
    async fn advertise(&self) -> Result<(), DaemonError>;

    /// Number of peers currently advertising themselves as healthy.
    async fn count_advertisers(&self) -> Result<usize, DaemonError>;

    /// Enumerate the pool and classify each address relative to this peer.
    async fn list_ips(&self) -> Result<IpCensus, DaemonError>;

    /// Race for an unmarked address: create-if-absent with TTL. Any failure
    /// counts as a lost race; the call never retries internally.
    async fn claim(&self, ip: &str) -> bool;

    /// Reset the TTL of an owned mark without changing its value. Must not
    /// recreate the key when the mark expired or changed hands.
    async fn refresh(&self, ip: &str) -> Result<(), DaemonError>;

    /// Delete an owned mark; a failed value precondition is benign.
    async fn release(&self, ip: &str) -> Result<(), DaemonError>;

    /// Safety probe for a locally bound address: true iff the address has
    /// no mark or the mark is ours.
    async fn check_ownership(&self, ip: &str) -> Result<bool, DaemonError>;
}

/// Select and connect the store backend from `dcs-type`.
pub async fn new_dcs(conf: &Config) -> Result<Arc<dyn Dcs>, DaemonError> {
    match conf.dcs_type.as_str() {
        "etcd" => Ok(Arc::new(EtcdDcs::connect(conf).await?)),
        other => Err(DaemonError::Config(format!(
            "unsupported dcs-type {:?}",
            other
        ))),
    }
}
