use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use crate::checker::Checker;
use crate::config::Config;
use crate::dcs::Dcs;
use crate::ip::IpManager;

/// Number of marks a peer aims to hold: the pool split evenly across the
/// advertising peers, rounded up so the whole pool is always covered.
fn target_share(pool: usize, advertisers: usize) -> usize {
    pool.div_ceil(advertisers)
}

/// The per-peer control loop body. Peers never talk to each other; every
/// tick reads and writes only the coordination store and the local kernel,
/// and the store's compare-and-set primitives serialize the races.
///
/// `tick` and `drain` are single-shot; the caller owns the loop and the
/// shutdown sequencing.
pub struct Coordinator {
    checker: Arc<dyn Checker>,
    dcs: Arc<dyn Dcs>,
    ip: Arc<dyn IpManager>,
    interval: Duration,
    retry_after: Duration,
    retry_num: u32,
    drain_on_unhealthy: bool,
}

impl Coordinator {
    pub fn new(
        conf: &Config,
        checker: Arc<dyn Checker>,
        dcs: Arc<dyn Dcs>,
        ip: Arc<dyn IpManager>,
    ) -> Self {
        Self {
            checker,
            dcs,
            ip,
            interval: conf.interval,
            retry_after: conf.retry_after,
            retry_num: conf.retry_num,
            drain_on_unhealthy: conf.drain_on_unhealthy,
        }
    }

    /// One pass: probe, advertise, reconcile, rebalance, claim.
    pub async fn tick(&self) {
        if !self.probe().await {
            warn!("control: node is not healthy");
            if self.drain_on_unhealthy {
                self.drain().await;
            }
            return;
        }
        debug!("control: node is healthy");

        // Errors here are swallowed: the entry is re-upserted every tick
        // anyway, and an expired entry only shrinks our own share.
        if let Err(e) = self.dcs.advertise().await {
            warn!("control: advertise failed: {}", e);
        }

        self.reconcile_local().await;

        let advertisers = match self.dcs.count_advertisers().await {
            Ok(n) => n,
            Err(e) => {
                warn!("control: cannot count advertisers, skipping tick: {}", e);
                return;
            }
        };
        if advertisers == 0 {
            warn!("control: advertiser listing is empty, skipping tick");
            return;
        }

        let census = match self.dcs.list_ips().await {
            Ok(c) => c,
            Err(e) => {
                warn!("control: cannot list managed ips, skipping tick: {}", e);
                return;
            }
        };

        let target = target_share(census.pool.len(), advertisers);
        info!(
            "control: advertisers={}, pool={}, own={}, target={}",
            advertisers,
            census.pool.len(),
            census.own_marked.len(),
            target
        );
        if target == 0 {
            return;
        }

        // The first `target` own marks (store sort order) are kept and
        // refreshed; the rest are surplus. A mark without a matching local
        // binding is released instead of refreshed, since the kernel state
        // is the ground truth for what we can actually serve.
        let mut released_unbound = false;
        for (i, ip) in census.own_marked.iter().enumerate() {
            if i < target {
                let bound = match self.ip.check_ip(ip).await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("control: cannot verify binding of {}: {}", ip, e);
                        true
                    }
                };
                if bound {
                    self.spawn_refresh(ip.clone());
                } else {
                    warn!(
                        "control: mark for {} held without a local binding, releasing",
                        ip
                    );
                    self.release_mark(ip).await;
                    released_unbound = true;
                }
            } else {
                info!("control: {} exceeds the target share, dropping", ip);
                if let Err(e) = self.ip.delete_ip(ip).await {
                    error!("control: cannot drop surplus address {}: {}", ip, e);
                }
                self.release_mark(ip).await;
            }
        }

        if released_unbound {
            // Claiming right after a release would re-race for an address
            // we just proved we cannot hold; wait a tick instead.
            return;
        }

        if census.own_marked.len() < target {
            let Some(pick) = census.unmarked.choose(&mut rand::thread_rng()) else {
                debug!("control: below target share but no unmarked addresses remain");
                return;
            };
            // One claim per tick keeps a fresh peer from stampeding the
            // pool; random selection keeps simultaneous peers apart.
            if self.dcs.claim(pick).await {
                if let Err(e) = self.ip.add_ip(pick).await {
                    // Keep the mark: either a later tick binds it, or the
                    // TTL frees it for someone who can.
                    error!("control: claimed {} but could not bind it: {}", pick, e);
                }
            }
        }
    }

    /// Release everything: local labeled addresses first, then every mark
    /// still carrying our nodename. Used on shutdown, and on unhealthy
    /// ticks when draining is enabled.
    pub async fn drain(&self) {
        self.ip.delete_all_ip().await;
        match self.dcs.list_ips().await {
            Ok(census) => {
                for ip in &census.own_marked {
                    self.release_mark(ip).await;
                }
            }
            Err(e) => {
                warn!("control: cannot enumerate own marks for release: {}", e);
            }
        }
    }

    /// Probe with retries; only probe errors are retried, a clean
    /// "unhealthy" answer is final for this tick.
    async fn probe(&self) -> bool {
        let mut errored = false;
        for attempt in 1..=self.retry_num {
            match self.checker.is_healthy().await {
                Ok(healthy) => return healthy,
                Err(e) => {
                    warn!(
                        "control: health probe failed, attempt={}/{}: {}",
                        attempt, self.retry_num, e
                    );
                    errored = true;
                }
            }
            if attempt < self.retry_num {
                tokio::time::sleep(self.retry_after).await;
            }
        }
        if errored {
            warn!("control: too many probe retries");
        }
        false
    }

    /// Safety pass: a locally bound address whose mark now names another
    /// peer means our mark expired while the kernel binding persisted.
    /// Drop the binding before it shadows the real owner.
    async fn reconcile_local(&self) {
        let bound = match self.ip.get_all_ip().await {
            Ok(b) => b,
            Err(e) => {
                warn!("control: cannot list local addresses: {}", e);
                return;
            }
        };

        for ip in bound {
            match self.dcs.check_ownership(&ip).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        "control: {} is bound locally but marked by another peer, dropping",
                        ip
                    );
                    if let Err(e) = self.ip.delete_ip(&ip).await {
                        error!("control: cannot drop {}: {}", ip, e);
                    }
                }
                Err(e) => {
                    warn!(
                        "control: ownership probe for {} failed, keeping binding: {}",
                        ip, e
                    );
                }
            }
        }
    }

    /// Fire-and-forget TTL refresh with its own deadline, so one slow
    /// store write cannot delay the next tick.
    fn spawn_refresh(&self, ip: String) {
        let dcs = self.dcs.clone();
        let deadline = self.interval;
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, dcs.refresh(&ip)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_precondition() => {
                    debug!("control: mark for {} expired or changed hands: {}", ip, e);
                }
                Ok(Err(e)) => {
                    warn!("control: refresh for {} failed: {}", ip, e);
                }
                Err(_) => {
                    warn!("control: refresh for {} timed out", ip);
                }
            }
        });
    }

    async fn release_mark(&self, ip: &str) {
        match self.dcs.release(ip).await {
            Ok(()) => {}
            Err(e) if e.is_precondition() => {
                debug!("control: release of {} found nothing ours: {}", ip, e);
            }
            Err(e) => {
                warn!("control: release of {} failed: {}", ip, e);
            }
        }
    }
}
