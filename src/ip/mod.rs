pub mod arp;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::AddressFamily;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::DaemonError;

/// Kernel address-label limit (IFNAMSIZ, including the NUL).
const MAX_LABEL_LEN: usize = 16;

/// Local realization of address ownership: every mark this peer holds must
/// end up as a labeled kernel address, and nothing else may carry the label.
#[async_trait]
pub trait IpManager: Send + Sync {
    /// Bind the address and announce it on the segment.
    async fn add_ip(&self, ip: &str) -> Result<(), DaemonError>;
    /// Remove the labeled address.
    async fn delete_ip(&self, ip: &str) -> Result<(), DaemonError>;
    /// True iff the labeled address with the configured prefix is bound.
    async fn check_ip(&self, ip: &str) -> Result<bool, DaemonError>;
    /// All labeled IPv4 addresses currently on the interface.
    async fn get_all_ip(&self) -> Result<Vec<String>, DaemonError>;
    /// Best-effort removal of every labeled address.
    async fn delete_all_ip(&self);
}

/// Manages addresses on a local interface through rtnetlink.
#[derive(Debug)]
pub struct LocalIpManager {
    handle: rtnetlink::Handle,
    iface: String,
    prefix_len: u8,
    label: String,
    announcer: arp::ArpAnnouncer,
    op_timeout: Duration,
}

impl LocalIpManager {
    /// Open the netlink connection and validate the label. Must run inside
    /// a tokio runtime (the connection task is spawned onto it).
    pub fn new(conf: &Config) -> Result<Self, DaemonError> {
        let label = conf.full_label();
        if label.len() >= MAX_LABEL_LEN {
            return Err(DaemonError::Config(format!(
                "address label {:?} is {} bytes, the kernel limit is {}",
                label,
                label.len(),
                MAX_LABEL_LEN
            )));
        }

        let (conn, handle, _) = rtnetlink::new_connection()
            .map_err(|e| DaemonError::KernelAddr(format!("netlink connection: {}", e)))?;
        tokio::spawn(conn);

        Ok(Self {
            handle,
            iface: conf.iface.clone(),
            prefix_len: conf.netmask,
            label,
            announcer: arp::ArpAnnouncer::new(&conf.iface, conf.retry_num, conf.retry_after),
            op_timeout: conf.interval,
        })
    }

    fn network(&self, addr: Ipv4Addr) -> Result<Ipv4Network, DaemonError> {
        Ipv4Network::new(addr, self.prefix_len)
            .map_err(|e| DaemonError::KernelAddr(format!("invalid prefix {}: {}", self.prefix_len, e)))
    }

    fn parse(&self, ip: &str) -> Result<Ipv4Network, DaemonError> {
        let addr: Ipv4Addr = ip
            .parse()
            .map_err(|e| DaemonError::KernelAddr(format!("invalid address {:?}: {}", ip, e)))?;
        self.network(addr)
    }

    async fn link_index(&self) -> Result<u32, DaemonError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(self.iface.clone())
            .execute();
        let msg = timeout(self.op_timeout, links.try_next())
            .await
            .map_err(|_| {
                DaemonError::KernelAddr(format!("link lookup timed out for {}", self.iface))
            })?
            .map_err(|e| DaemonError::KernelAddr(format!("link lookup for {}: {}", self.iface, e)))?
            .ok_or_else(|| DaemonError::KernelAddr(format!("no such interface: {}", self.iface)))?;
        Ok(msg.header.index)
    }

    /// IPv4 addresses on the interface that carry our label, as CIDRs.
    async fn labeled_addresses(&self) -> Result<Vec<(Ipv4Network, AddressMessage)>, DaemonError> {
        let index = self.link_index().await?;
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut out = Vec::new();
        loop {
            let next = timeout(self.op_timeout, addrs.try_next())
                .await
                .map_err(|_| DaemonError::KernelAddr("address list timed out".to_string()))?
                .map_err(|e| DaemonError::KernelAddr(format!("address list: {}", e)))?;
            let Some(msg) = next else { break };

            if msg.header.family != AddressFamily::Inet {
                continue;
            }

            let mut local = None;
            let mut address = None;
            let mut labeled = false;
            for attr in &msg.attributes {
                match attr {
                    AddressAttribute::Local(IpAddr::V4(ip)) => local = Some(*ip),
                    AddressAttribute::Address(IpAddr::V4(ip)) => address = Some(*ip),
                    AddressAttribute::Label(l) if *l == self.label => labeled = true,
                    _ => {}
                }
            }
            let Some(ip) = local.or(address) else { continue };
            if !labeled {
                continue;
            }
            match Ipv4Network::new(ip, msg.header.prefix_len) {
                Ok(net) => out.push((net, msg)),
                Err(e) => warn!("ip: skipping malformed kernel address {}: {}", ip, e),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl IpManager for LocalIpManager {
    async fn add_ip(&self, ip: &str) -> Result<(), DaemonError> {
        let net = self.parse(ip)?;
        let index = self.link_index().await?;

        let mut req = self
            .handle
            .address()
            .add(index, IpAddr::V4(net.ip()), net.prefix());
        req.message_mut()
            .attributes
            .push(AddressAttribute::Label(self.label.clone()));

        timeout(self.op_timeout, req.execute())
            .await
            .map_err(|_| DaemonError::KernelAddr(format!("address add timed out for {}", net)))?
            .map_err(|e| DaemonError::KernelAddr(format!("add {}: {}", net, e)))?;

        info!(
            "ip: registered address {} label={} on {}",
            net, self.label, self.iface
        );

        // The new mapping is useless until neighbors drop their stale ARP
        // entries; failure here keeps the address bound.
        if let Err(e) = self.announcer.announce(net.ip()).await {
            warn!("arp: announcement for {} failed: {}", net, e);
        }
        Ok(())
    }

    async fn delete_ip(&self, ip: &str) -> Result<(), DaemonError> {
        let net = self.parse(ip)?;
        let found = self
            .labeled_addresses()
            .await?
            .into_iter()
            .find(|(bound, _)| *bound == net);

        let Some((_, msg)) = found else {
            debug!("ip: address {} not bound, nothing to delete", net);
            return Ok(());
        };

        timeout(self.op_timeout, self.handle.address().del(msg).execute())
            .await
            .map_err(|_| DaemonError::KernelAddr(format!("address del timed out for {}", net)))?
            .map_err(|e| DaemonError::KernelAddr(format!("del {}: {}", net, e)))?;

        info!("ip: deregistered address {} from {}", net, self.iface);
        Ok(())
    }

    async fn check_ip(&self, ip: &str) -> Result<bool, DaemonError> {
        let net = self.parse(ip)?;
        Ok(self
            .labeled_addresses()
            .await?
            .iter()
            .any(|(bound, _)| *bound == net))
    }

    async fn get_all_ip(&self) -> Result<Vec<String>, DaemonError> {
        Ok(self
            .labeled_addresses()
            .await?
            .into_iter()
            .map(|(net, _)| net.ip().to_string())
            .collect())
    }

    async fn delete_all_ip(&self) {
        let addrs = match self.labeled_addresses().await {
            Ok(addrs) => addrs,
            Err(e) => {
                error!("ip: cannot enumerate labeled addresses for deletion: {}", e);
                return;
            }
        };
        if addrs.is_empty() {
            return;
        }

        for (net, msg) in addrs {
            match timeout(self.op_timeout, self.handle.address().del(msg).execute()).await {
                Ok(Ok(())) => {
                    info!("ip: deregistered address {}", net);
                }
                Ok(Err(e)) => {
                    error!("ip: failed to delete {}: {}", net, e);
                }
                Err(_) => {
                    error!("ip: delete timed out for {}", net);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;

    fn conf(iface: &str, label: &str) -> Config {
        let file = ConfigFile {
            netmask: Some(24),
            interface: Some(iface.to_string()),
            label: Some(label.to_string()),
            nodename: Some("node1".to_string()),
            http_url: Some("http://127.0.0.1/".to_string()),
            ..ConfigFile::default()
        };
        Config::resolve(file).unwrap()
    }

    #[tokio::test]
    async fn test_over_length_label_is_fatal() {
        // "eth0:" + 11 chars = 16 bytes, one over the usable limit.
        let err = LocalIpManager::new(&conf("eth0", "elevenchars")).unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
        assert!(err.to_string().contains("label"));
    }

    #[tokio::test]
    async fn test_label_at_limit_is_accepted() {
        // "eth0:" + 10 chars = 15 bytes, the longest the kernel stores.
        let mgr = LocalIpManager::new(&conf("eth0", "tencharss0")).unwrap();
        assert_eq!(mgr.label, "eth0:tencharss0");
    }

    #[tokio::test]
    async fn test_parse_rejects_garbage_and_v6() {
        let mgr = LocalIpManager::new(&conf("eth0", "ha")).unwrap();
        assert!(mgr.parse("10.0.0.1").is_ok());
        assert!(mgr.parse("not-an-ip").is_err());
        assert!(mgr.parse("fe80::1").is_err());
    }

    #[tokio::test]
    async fn test_parse_carries_configured_prefix() {
        let mgr = LocalIpManager::new(&conf("eth0", "ha")).unwrap();
        let net = mgr.parse("192.168.1.10").unwrap();
        assert_eq!(net.to_string(), "192.168.1.10/24");
    }
}
