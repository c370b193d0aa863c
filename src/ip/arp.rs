use std::net::Ipv4Addr;
use std::time::Duration;

use pnet_datalink::{self as datalink, Channel, MacAddr, NetworkInterface};
use pnet_packet::arp::{ArpHardwareTypes, ArpOperation, ArpOperations, MutableArpPacket};
use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
use tracing::{debug, info, warn};

use crate::error::DaemonError;

const ETHERNET_HEADER_LEN: usize = 14;
const ARP_PACKET_LEN: usize = 28;
const FRAME_LEN: usize = ETHERNET_HEADER_LEN + ARP_PACKET_LEN;

/// Broadcasts gratuitous ARP after an address takeover so neighbors replace
/// the previous owner's MAC in their caches. Each announcement sends a
/// reply (opcode 2) and a request (opcode 1); an attempt only counts as
/// successful when both frames were written.
#[derive(Clone, Debug)]
pub struct ArpAnnouncer {
    iface: String,
    retry_num: u32,
    retry_after: Duration,
}

impl ArpAnnouncer {
    pub fn new(iface: &str, retry_num: u32, retry_after: Duration) -> Self {
        Self {
            iface: iface.to_string(),
            retry_num,
            retry_after,
        }
    }

    /// Announce `ip` on the configured interface. Loopback interfaces have
    /// no segment to convince and are skipped. The raw-socket work is
    /// synchronous, so it runs on the blocking pool.
    pub async fn announce(&self, ip: Ipv4Addr) -> Result<(), DaemonError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.announce_blocking(ip))
            .await
            .map_err(|e| DaemonError::ArpSendFailed(format!("announce task: {}", e)))?
    }

    fn announce_blocking(&self, ip: Ipv4Addr) -> Result<(), DaemonError> {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == self.iface)
            .ok_or_else(|| {
                DaemonError::ArpSendFailed(format!("no such interface: {}", self.iface))
            })?;

        if iface.is_loopback() {
            debug!("arp: {} is loopback, skipping announcement", self.iface);
            return Ok(());
        }

        let mac = iface.mac.ok_or_else(|| {
            DaemonError::ArpSendFailed(format!("interface {} has no MAC address", self.iface))
        })?;

        let mut last_err = None;
        for attempt in 1..=self.retry_num {
            match send_announcement(&iface, mac, ip) {
                Ok(()) => {
                    info!("arp: announced {} as {} on {}", ip, mac, self.iface);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "arp: attempt {}/{} for {} failed: {}",
                        attempt, self.retry_num, ip, e
                    );
                    last_err = Some(e);
                }
            }
            if attempt < self.retry_num {
                std::thread::sleep(self.retry_after);
            }
        }

        Err(last_err
            .unwrap_or_else(|| DaemonError::ArpSendFailed("no attempts made".to_string())))
    }
}

/// One attempt: open a fresh channel and write the reply + request pair.
fn send_announcement(
    iface: &NetworkInterface,
    mac: MacAddr,
    ip: Ipv4Addr,
) -> Result<(), DaemonError> {
    let mut tx = match datalink::channel(iface, datalink::Config::default()) {
        Ok(Channel::Ethernet(tx, _rx)) => tx,
        Ok(_) => {
            return Err(DaemonError::ArpSendFailed(
                "unsupported datalink channel type".to_string(),
            ))
        }
        Err(e) => {
            return Err(DaemonError::ArpSendFailed(format!(
                "cannot open channel on {}: {}",
                iface.name, e
            )))
        }
    };

    for op in [ArpOperations::Reply, ArpOperations::Request] {
        let frame = build_frame(op, mac, ip);
        match tx.send_to(&frame, None) {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(DaemonError::ArpSendFailed(e.to_string())),
            None => {
                return Err(DaemonError::ArpSendFailed(
                    "channel rejected frame".to_string(),
                ))
            }
        }
    }
    Ok(())
}

/// Build one gratuitous frame to the broadcast MAC. Sender and target IP
/// are both the announced address; a request carries the all-zeros target
/// MAC, a reply repeats our own.
fn build_frame(op: ArpOperation, mac: MacAddr, ip: Ipv4Addr) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];

    {
        let mut eth =
            MutableEthernetPacket::new(&mut buf).expect("frame buffer fits an ethernet header");
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(mac);
        eth.set_ethertype(EtherTypes::Arp);
    }

    {
        let mut arp = MutableArpPacket::new(&mut buf[ETHERNET_HEADER_LEN..])
            .expect("frame buffer fits an arp packet");
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(op);
        arp.set_sender_hw_addr(mac);
        arp.set_sender_proto_addr(ip);
        arp.set_target_hw_addr(if op == ArpOperations::Request {
            MacAddr::zero()
        } else {
            mac
        });
        arp.set_target_proto_addr(ip);
    }

    buf
}
