use std::fmt;

/// Failure classes of the coordinator. The control loop keys its
/// skip/continue decisions off the variant, so wrapping layers must
/// preserve it rather than collapse everything into one case.
#[derive(Debug)]
pub enum DaemonError {
    /// The health probe could not be reached at all.
    CheckerTransport(String),
    /// The health probe answered but the response could not be read.
    CheckerProtocol(String),
    /// A coordination-store read failed; the current tick is skipped.
    DcsRead(String),
    /// A coordination-store write failed for reasons other than a lost race.
    DcsWrite(String),
    /// A compare-and-set precondition did not hold (lost race or expired
    /// mark). Benign: the next tick re-aligns local state.
    DcsPrecondition(String),
    /// A netlink address operation failed.
    KernelAddr(String),
    /// All gratuitous-ARP attempts failed. Soft: the address stays bound.
    ArpSendFailed(String),
    /// Invalid configuration; fatal at startup only.
    Config(String),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::CheckerTransport(msg) => write!(f, "checker transport error: {}", msg),
            DaemonError::CheckerProtocol(msg) => write!(f, "checker protocol error: {}", msg),
            DaemonError::DcsRead(msg) => write!(f, "dcs read error: {}", msg),
            DaemonError::DcsWrite(msg) => write!(f, "dcs write error: {}", msg),
            DaemonError::DcsPrecondition(msg) => write!(f, "dcs precondition failed: {}", msg),
            DaemonError::KernelAddr(msg) => write!(f, "kernel address error: {}", msg),
            DaemonError::ArpSendFailed(msg) => write!(f, "arp send failed: {}", msg),
            DaemonError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for DaemonError {}

impl DaemonError {
    /// True for lost-race / expired-mark outcomes that the loop treats as
    /// routine rather than as faults worth a warning.
    pub fn is_precondition(&self) -> bool {
        matches!(self, DaemonError::DcsPrecondition(_))
    }
}
