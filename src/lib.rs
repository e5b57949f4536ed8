//! ICMP latency probing and hop-by-hop route discovery.
//!
//! [`PingEngine`] probes a dynamic set of targets on a fixed interval and
//! pushes one [`PingResult`] per probe. [`RouteEngine`] runs concurrent
//! TTL-sweep discoveries on top of it and pushes progressive [`RouteUpdate`]s.

pub mod config;
pub mod error;
pub mod ping;
pub mod probe;
pub mod resolve;
pub mod state;
pub mod trace;

pub use config::{BackendKind, Config, IpVersion};
pub use error::{Error, Result};
pub use ping::{PingEngine, ResultReceiver};
pub use probe::{ProbeBackend, ProbeRequest, Reply, ReplyKind, ReplySender, create_backend};
pub use resolve::resolve_host;
pub use state::{
    DiscoveryState, HopStatus, PingResult, PingStatus, Route, RouteHop, RouteId, RouteUpdate,
    Target, TargetId,
};
pub use trace::{HopProber, RouteEngine, RouteSettings, RouteUpdateReceiver};
