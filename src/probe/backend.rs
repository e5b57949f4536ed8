//! Probe backend capability.
//!
//! A backend transmits echo probes and delivers whatever comes back as
//! [`Reply`] events on the channel handed to [`ProbeBackend::open`]. The engine
//! picks one variant at construction time and never inspects it afterwards.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::{BackendKind, Config};
use crate::error::Result;
use crate::probe::{ProcessBackend, RawSocketBackend};
use crate::state::TargetId;

/// One probe handed to a backend for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub target: TargetId,
    pub address: IpAddr,
    pub sequence: u16,
    pub ttl: u8,
    /// Send timestamp recorded by the engine just before `send`
    pub sent_at: Instant,
    /// Reply window; backends that block per probe use it as their own wait
    pub timeout: Duration,
}

/// Classification of an inbound reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    EchoReply,
    TtlExceeded,
    Unreachable(u8),
}

/// A reply correlated to one of our sequence numbers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub sequence: u16,
    /// Address the original probe was sent to, when the reply reveals it
    pub destination: Option<IpAddr>,
    pub responder: IpAddr,
    pub received_at: Instant,
    pub kind: ReplyKind,
}

pub type ReplySender = mpsc::UnboundedSender<Reply>;
pub type ReplyReceiver = mpsc::UnboundedReceiver<Reply>;

/// Capability set every probe backend provides
pub trait ProbeBackend: Send + Sync {
    /// Short name for log lines
    fn name(&self) -> &'static str;

    /// Acquire sockets (or check the external utility) and start delivering
    /// replies. Fails with `BackendUnavailable`.
    fn open(&self, replies: ReplySender) -> Result<()>;

    /// Transmit one probe. Must not block on the reply.
    fn send(&self, request: &ProbeRequest) -> Result<()>;

    /// Stop delivering replies and release sockets/children. Idempotent.
    fn close(&self);
}

/// Build the backend variant named by the configuration
pub fn create_backend(config: &Config) -> Arc<dyn ProbeBackend> {
    let ipv6 = config.ip_version.is_ipv6();
    match config.backend {
        BackendKind::Raw => Arc::new(RawSocketBackend::new(ipv6, config.payload_size)),
        BackendKind::Process => Arc::new(ProcessBackend::new(config.ping_command.clone(), ipv6)),
    }
}
