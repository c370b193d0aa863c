//! Control-loop scenarios against an in-process coordination store.
//!
//! The store double keeps the same compare-and-set contract the real
//! backend provides (create-if-absent claims, value-checked refresh and
//! release); TTL expiry is driven explicitly through `expire_*` helpers so
//! scenarios stay deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use yaim::checker::Checker;
use yaim::config::{Config, ConfigFile};
use yaim::daemon::Coordinator;
use yaim::dcs::{Dcs, IpCensus};
use yaim::error::DaemonError;
use yaim::ip::IpManager;

// ── store double ────────────────────────────────────────────────────────

/// Cluster-wide state shared by every simulated peer.
struct Cluster {
    pool: Vec<String>,
    marks: Mutex<BTreeMap<String, String>>,
    advertisers: Mutex<BTreeSet<String>>,
}

impl Cluster {
    fn new(pool: &[&str]) -> Arc<Self> {
        let mut pool: Vec<String> = pool.iter().map(|s| s.to_string()).collect();
        pool.sort();
        Arc::new(Self {
            pool,
            marks: Mutex::new(BTreeMap::new()),
            advertisers: Mutex::new(BTreeSet::new()),
        })
    }

    /// Stand-in for TTL expiry of a mark.
    fn expire_mark(&self, ip: &str) {
        self.marks.lock().unwrap().remove(ip);
    }

    /// Stand-in for TTL expiry of a node entry.
    fn expire_advertiser(&self, node: &str) {
        self.advertisers.lock().unwrap().remove(node);
    }

    fn owner(&self, ip: &str) -> Option<String> {
        self.marks.lock().unwrap().get(ip).cloned()
    }

    fn marks_of(&self, node: &str) -> Vec<String> {
        self.marks
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, owner)| owner.as_str() == node)
            .map(|(ip, _)| ip.clone())
            .collect()
    }

    fn mark_count(&self) -> usize {
        self.marks.lock().unwrap().len()
    }

    /// Seed a mark directly, bypassing the claim race.
    fn seed_mark(&self, ip: &str, node: &str) {
        self.marks
            .lock()
            .unwrap()
            .insert(ip.to_string(), node.to_string());
    }
}

struct MemoryDcs {
    cluster: Arc<Cluster>,
    nodename: String,
}

#[async_trait]
impl Dcs for MemoryDcs {
    async fn bootstrap(&self) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn advertise(&self) -> Result<(), DaemonError> {
        self.cluster
            .advertisers
            .lock()
            .unwrap()
            .insert(self.nodename.clone());
        Ok(())
    }

    async fn count_advertisers(&self) -> Result<usize, DaemonError> {
        Ok(self.cluster.advertisers.lock().unwrap().len())
    }

    async fn list_ips(&self) -> Result<IpCensus, DaemonError> {
        let marks = self.cluster.marks.lock().unwrap();
        let mut census = IpCensus::default();
        for ip in &self.cluster.pool {
            census.pool.push(ip.clone());
            match marks.get(ip) {
                Some(owner) if owner == &self.nodename => census.own_marked.push(ip.clone()),
                Some(_) => {}
                None => census.unmarked.push(ip.clone()),
            }
        }
        Ok(census)
    }

    async fn claim(&self, ip: &str) -> bool {
        let mut marks = self.cluster.marks.lock().unwrap();
        match marks.entry(ip.to_string()) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(self.nodename.clone());
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    async fn refresh(&self, ip: &str) -> Result<(), DaemonError> {
        let marks = self.cluster.marks.lock().unwrap();
        match marks.get(ip) {
            Some(owner) if owner == &self.nodename => Ok(()),
            _ => Err(DaemonError::DcsPrecondition(format!(
                "refresh {}: not ours",
                ip
            ))),
        }
    }

    async fn release(&self, ip: &str) -> Result<(), DaemonError> {
        let mut marks = self.cluster.marks.lock().unwrap();
        match marks.get(ip) {
            Some(owner) if owner == &self.nodename => {
                marks.remove(ip);
                Ok(())
            }
            _ => Err(DaemonError::DcsPrecondition(format!(
                "release {}: not ours",
                ip
            ))),
        }
    }

    async fn check_ownership(&self, ip: &str) -> Result<bool, DaemonError> {
        let marks = self.cluster.marks.lock().unwrap();
        Ok(match marks.get(ip) {
            None => true,
            Some(owner) => owner == &self.nodename,
        })
    }
}

// ── kernel double ───────────────────────────────────────────────────────

#[derive(Default)]
struct MockIpManager {
    bound: Mutex<BTreeSet<String>>,
    fail_add: AtomicBool,
}

impl MockIpManager {
    fn bound_set(&self) -> BTreeSet<String> {
        self.bound.lock().unwrap().clone()
    }
}

#[async_trait]
impl IpManager for MockIpManager {
    async fn add_ip(&self, ip: &str) -> Result<(), DaemonError> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(DaemonError::KernelAddr(format!("add {}: injected", ip)));
        }
        self.bound.lock().unwrap().insert(ip.to_string());
        Ok(())
    }

    async fn delete_ip(&self, ip: &str) -> Result<(), DaemonError> {
        self.bound.lock().unwrap().remove(ip);
        Ok(())
    }

    async fn check_ip(&self, ip: &str) -> Result<bool, DaemonError> {
        Ok(self.bound.lock().unwrap().contains(ip))
    }

    async fn get_all_ip(&self) -> Result<Vec<String>, DaemonError> {
        Ok(self.bound.lock().unwrap().iter().cloned().collect())
    }

    async fn delete_all_ip(&self) {
        self.bound.lock().unwrap().clear();
    }
}

// ── probe double ────────────────────────────────────────────────────────

struct StaticChecker {
    healthy: AtomicBool,
}

#[async_trait]
impl Checker for StaticChecker {
    async fn is_healthy(&self) -> Result<bool, DaemonError> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}

// ── harness ─────────────────────────────────────────────────────────────

fn test_conf(nodename: &str, drain_on_unhealthy: bool) -> Config {
    Config::resolve(ConfigFile {
        netmask: Some(24),
        interface: Some("eth0".to_string()),
        nodename: Some(nodename.to_string()),
        http_url: Some("http://127.0.0.1/health".to_string()),
        interval: Some(10),
        retry_after: Some(1),
        retry_num: Some(1),
        drain_on_unhealthy: Some(drain_on_unhealthy),
        ..ConfigFile::default()
    })
    .unwrap()
}

struct Peer {
    dcs: Arc<MemoryDcs>,
    ip: Arc<MockIpManager>,
    checker: Arc<StaticChecker>,
    coordinator: Coordinator,
}

fn peer(cluster: &Arc<Cluster>, nodename: &str, drain_on_unhealthy: bool) -> Peer {
    let dcs = Arc::new(MemoryDcs {
        cluster: cluster.clone(),
        nodename: nodename.to_string(),
    });
    let ip = Arc::new(MockIpManager::default());
    let checker = Arc::new(StaticChecker {
        healthy: AtomicBool::new(true),
    });
    let coordinator = Coordinator::new(
        &test_conf(nodename, drain_on_unhealthy),
        checker.clone(),
        dcs.clone(),
        ip.clone(),
    );
    Peer {
        dcs,
        ip,
        checker,
        coordinator,
    }
}

fn set(ips: &[&str]) -> BTreeSet<String> {
    ips.iter().map(|s| s.to_string()).collect()
}

// ── scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn single_peer_claims_one_address_per_tick() {
    let cluster = Cluster::new(&["10.0.0.1", "10.0.0.2"]);
    let p = peer(&cluster, "node1", false);

    p.coordinator.tick().await;
    assert_eq!(cluster.mark_count(), 1);
    assert_eq!(p.ip.bound_set().len(), 1);

    p.coordinator.tick().await;
    assert_eq!(cluster.marks_of("node1").len(), 2);
    assert_eq!(p.ip.bound_set(), set(&["10.0.0.1", "10.0.0.2"]));
}

#[tokio::test]
async fn three_peers_settle_on_even_split() {
    let pool: Vec<String> = (1..=10).map(|i| format!("10.0.0.{}", i)).collect();
    let pool_refs: Vec<&str> = pool.iter().map(|s| s.as_str()).collect();
    let cluster = Cluster::new(&pool_refs);

    let peers = [
        peer(&cluster, "node1", false),
        peer(&cluster, "node2", false),
        peer(&cluster, "node3", false),
    ];

    for _ in 0..10 {
        for p in &peers {
            p.coordinator.tick().await;
        }
    }

    assert_eq!(cluster.mark_count(), 10);
    let mut counts: Vec<usize> = ["node1", "node2", "node3"]
        .iter()
        .map(|n| cluster.marks_of(n).len())
        .collect();
    counts.sort();
    assert_eq!(counts, vec![3, 3, 4]);

    // Kernel state mirrors the marks on every peer.
    for (p, node) in peers.iter().zip(["node1", "node2", "node3"]) {
        let marked: BTreeSet<String> = cluster.marks_of(node).into_iter().collect();
        assert_eq!(p.ip.bound_set(), marked);
    }
}

#[tokio::test]
async fn surplus_marks_release_in_listing_order() {
    let cluster = Cluster::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);
    let p = peer(&cluster, "node1", false);

    for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"] {
        cluster.seed_mark(ip, "node1");
        p.ip.add_ip(ip).await.unwrap();
    }
    // A second healthy peer halves the share.
    cluster
        .advertisers
        .lock()
        .unwrap()
        .insert("node2".to_string());

    p.coordinator.tick().await;

    assert_eq!(
        cluster.marks_of("node1"),
        vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
    );
    assert_eq!(p.ip.bound_set(), set(&["10.0.0.1", "10.0.0.2"]));
}

#[tokio::test]
async fn reconcile_drops_binding_marked_by_another_peer() {
    let cluster = Cluster::new(&["10.0.0.1", "10.0.0.2"]);
    let p = peer(&cluster, "node1", false);

    // Our mark expired and node2 took the address, but the kernel binding
    // survived locally.
    cluster.seed_mark("10.0.0.1", "node2");
    p.ip.add_ip("10.0.0.1").await.unwrap();

    p.coordinator.tick().await;

    assert!(!p.ip.bound_set().contains("10.0.0.1"));
    assert_eq!(cluster.owner("10.0.0.1").as_deref(), Some("node2"));
}

#[tokio::test]
async fn unbound_mark_is_released_without_claiming() {
    let cluster = Cluster::new(&["10.0.0.1", "10.0.0.2"]);
    let p = peer(&cluster, "node1", false);

    // Mark without a kernel binding (e.g. the add failed last tick).
    cluster.seed_mark("10.0.0.1", "node1");

    p.coordinator.tick().await;

    // The stale mark is gone, and no new claim happened this tick.
    assert_eq!(cluster.mark_count(), 0);
    assert!(p.ip.bound_set().is_empty());

    // The next tick claims normally again.
    p.coordinator.tick().await;
    assert_eq!(cluster.marks_of("node1").len(), 1);
}

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let cluster = Cluster::new(&["10.0.0.1"]);
    let a = peer(&cluster, "node1", false);
    let b = peer(&cluster, "node2", false);

    let (won_a, won_b) = tokio::join!(a.dcs.claim("10.0.0.1"), b.dcs.claim("10.0.0.1"));
    assert!(won_a ^ won_b);

    // The loser's next tick sees the address as marked and leaves it alone.
    let loser = if won_a { &b } else { &a };
    loser.coordinator.tick().await;
    assert_eq!(cluster.mark_count(), 1);
}

#[tokio::test]
async fn claim_then_release_restores_prior_state() {
    let cluster = Cluster::new(&["10.0.0.1"]);
    let p = peer(&cluster, "node1", false);

    assert_eq!(cluster.mark_count(), 0);
    assert!(p.dcs.claim("10.0.0.1").await);
    p.dcs.release("10.0.0.1").await.unwrap();
    assert_eq!(cluster.mark_count(), 0);
    assert_eq!(cluster.owner("10.0.0.1"), None);
}

#[tokio::test]
async fn refresh_never_resurrects_a_lost_mark() {
    let cluster = Cluster::new(&["10.0.0.1"]);
    let a = peer(&cluster, "node1", false);
    let b = peer(&cluster, "node2", false);

    cluster.seed_mark("10.0.0.1", "node1");
    cluster.expire_mark("10.0.0.1");
    assert!(b.dcs.claim("10.0.0.1").await);

    let err = a.dcs.refresh("10.0.0.1").await.unwrap_err();
    assert!(err.is_precondition());
    assert_eq!(cluster.owner("10.0.0.1").as_deref(), Some("node2"));
}

#[tokio::test]
async fn drain_leaves_no_bindings_and_no_own_marks() {
    let cluster = Cluster::new(&["10.0.0.1", "10.0.0.2"]);
    let p = peer(&cluster, "node1", false);

    p.coordinator.tick().await;
    p.coordinator.tick().await;
    assert_eq!(cluster.marks_of("node1").len(), 2);

    p.coordinator.drain().await;

    assert!(p.ip.bound_set().is_empty());
    assert!(cluster.marks_of("node1").is_empty());
}

#[tokio::test]
async fn drain_spares_marks_of_other_peers() {
    let cluster = Cluster::new(&["10.0.0.1", "10.0.0.2"]);
    let p = peer(&cluster, "node1", false);
    cluster.seed_mark("10.0.0.1", "node1");
    cluster.seed_mark("10.0.0.2", "node2");
    p.ip.add_ip("10.0.0.1").await.unwrap();

    p.coordinator.drain().await;

    assert_eq!(cluster.owner("10.0.0.1"), None);
    assert_eq!(cluster.owner("10.0.0.2").as_deref(), Some("node2"));
}

#[tokio::test]
async fn unhealthy_tick_keeps_bindings_by_default() {
    let cluster = Cluster::new(&["10.0.0.1"]);
    let p = peer(&cluster, "node1", false);

    p.coordinator.tick().await;
    assert_eq!(p.ip.bound_set(), set(&["10.0.0.1"]));

    p.checker.healthy.store(false, Ordering::SeqCst);
    p.coordinator.tick().await;

    // Addresses stay; only the refreshes stop, so the TTL does the freeing.
    assert_eq!(p.ip.bound_set(), set(&["10.0.0.1"]));
    assert_eq!(cluster.owner("10.0.0.1").as_deref(), Some("node1"));
}

#[tokio::test]
async fn unhealthy_tick_drains_when_configured() {
    let cluster = Cluster::new(&["10.0.0.1"]);
    let p = peer(&cluster, "node1", true);

    p.coordinator.tick().await;
    assert_eq!(p.ip.bound_set(), set(&["10.0.0.1"]));

    p.checker.healthy.store(false, Ordering::SeqCst);
    p.coordinator.tick().await;

    assert!(p.ip.bound_set().is_empty());
    assert_eq!(cluster.owner("10.0.0.1"), None);
}

#[tokio::test]
async fn failed_bind_keeps_the_mark_for_ttl_to_reap() {
    let cluster = Cluster::new(&["10.0.0.1"]);
    let p = peer(&cluster, "node1", false);

    p.ip.fail_add.store(true, Ordering::SeqCst);
    p.coordinator.tick().await;

    // Claim won, bind failed: the mark stays so no other peer grabs the
    // address before the TTL settles the question.
    assert_eq!(cluster.owner("10.0.0.1").as_deref(), Some("node1"));
    assert!(p.ip.bound_set().is_empty());

    // Once the kernel cooperates again: release of the unbound mark, then
    // a clean re-claim and bind.
    p.ip.fail_add.store(false, Ordering::SeqCst);
    p.coordinator.tick().await;
    assert_eq!(cluster.mark_count(), 0);
    p.coordinator.tick().await;
    assert_eq!(cluster.owner("10.0.0.1").as_deref(), Some("node1"));
    assert_eq!(p.ip.bound_set(), set(&["10.0.0.1"]));
}

#[tokio::test]
async fn crashed_peer_marks_are_reclaimed_after_expiry() {
    let cluster = Cluster::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);
    let a = peer(&cluster, "node1", false);
    let b = peer(&cluster, "node2", false);

    for _ in 0..3 {
        a.coordinator.tick().await;
        b.coordinator.tick().await;
    }
    assert_eq!(cluster.mark_count(), 4);
    let lost: Vec<String> = cluster.marks_of("node2");
    assert!(!lost.is_empty());

    // node2 dies: its node entry and marks expire.
    cluster.expire_advertiser("node2");
    for ip in &lost {
        cluster.expire_mark(ip);
    }

    for _ in 0..4 {
        a.coordinator.tick().await;
    }

    assert_eq!(cluster.marks_of("node1").len(), 4);
    assert_eq!(a.ip.bound_set().len(), 4);
}
