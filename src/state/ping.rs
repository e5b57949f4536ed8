use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// TTL used for targets registered without a fixed TTL
pub const DEFAULT_TTL: u8 = 64;

/// Opaque handle for a registered target (or a single-shot probe)
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TargetId(pub u64);

impl TargetId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A probe target owned by one engine's registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub address: IpAddr,
    /// Fixed outgoing TTL, if any
    pub ttl: Option<u8>,
}

impl Target {
    /// TTL placed on outgoing probes
    pub fn effective_ttl(&self) -> u8 {
        self.ttl.unwrap_or(DEFAULT_TTL)
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingStatus {
    /// Echo reply received
    EchoReply,
    /// A router reported the TTL expired in transit
    TtlExceeded,
    /// Explicit destination unreachable, with the ICMP code
    Unreachable(u8),
    /// No reply inside the timeout window
    Timeout,
}

impl PingStatus {
    pub fn is_timeout(self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Result of a single probe, emitted exactly once per issued sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResult {
    pub target: TargetId,
    /// Address the probe was sent to
    pub address: IpAddr,
    pub sequence: u16,
    pub ttl: u8,
    pub status: PingStatus,
    /// Round-trip time, `None` for timeouts
    pub rtt: Option<Duration>,
    /// Address that answered (a router for TTL-exceeded replies)
    pub responder: Option<IpAddr>,
    /// Wall-clock time the probe was sent
    pub sent_at: DateTime<Utc>,
}

impl PingResult {
    pub fn is_timeout(&self) -> bool {
        self.status.is_timeout()
    }
}
