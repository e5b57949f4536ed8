use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Identifies one route discovery request
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RouteId(pub u64);

impl RouteId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route-{}", self.0)
    }
}

/// Status of a single hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopStatus {
    Pending,
    Responded,
    Unresponsive,
}

/// One TTL level of a discovered route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    /// Hop index, equal to the TTL used (1-based)
    pub ttl: u8,
    /// Router (or destination) that answered, `None` if silent
    pub responder: Option<IpAddr>,
    /// Latency samples from probes that got an answer
    pub samples: Vec<Duration>,
    pub status: HopStatus,
}

impl RouteHop {
    pub fn new(ttl: u8) -> Self {
        Self {
            ttl,
            responder: None,
            samples: Vec::new(),
            status: HopStatus::Pending,
        }
    }

    /// Record an answer. The first responder seen for the hop is kept.
    pub fn record_response(&mut self, responder: IpAddr, rtt: Option<Duration>) {
        if self.responder.is_none() {
            self.responder = Some(responder);
        }
        if let Some(rtt) = rtt {
            self.samples.push(rtt);
        }
        self.status = HopStatus::Responded;
    }

    /// Close the hop; a hop that never answered becomes unresponsive
    pub fn finish(&mut self) {
        if self.status == HopStatus::Pending {
            self.status = HopStatus::Unresponsive;
        }
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.samples.iter().min().copied()
    }

    pub fn avg_rtt(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }
}

/// Lifecycle of a route discovery worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryState {
    Idle,
    Probing { ttl: u8 },
    /// Destination answered
    Complete,
    /// Maximum hop count reached without the destination answering
    Incomplete,
    /// Too many consecutive silent hops, or the destination was reported unreachable
    Failed,
    Cancelled,
}

impl DiscoveryState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Idle | Self::Probing { .. })
    }
}

/// Route being built towards a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: IpAddr,
    pub hops: Vec<RouteHop>,
    pub max_hops: u8,
    pub completed: bool,
}

impl Route {
    pub fn new(destination: IpAddr, max_hops: u8) -> Self {
        Self {
            destination,
            hops: Vec::with_capacity(max_hops as usize),
            max_hops,
            completed: false,
        }
    }

    /// Append the next hop. TTLs must arrive as 1, 2, 3, ...
    pub(crate) fn push(&mut self, hop: RouteHop) {
        debug_assert_eq!(hop.ttl as usize, self.hops.len() + 1);
        self.hops.push(hop);
    }

    /// Mark the route complete once the destination echoed on the last hop.
    ///
    /// Any other answer from the destination (an unreachable, say) leaves the
    /// route incomplete. Returns false if the last hop is not the destination.
    pub(crate) fn complete(&mut self) -> bool {
        let reached = self.hops.last().is_some_and(|hop| {
            hop.status == HopStatus::Responded && hop.responder == Some(self.destination)
        });
        self.completed = reached;
        reached
    }

    /// Total hop count, known only once the destination answered
    pub fn total_hops(&self) -> Option<u8> {
        if self.completed {
            self.hops.last().map(|h| h.ttl)
        } else {
            None
        }
    }

    /// Get hop by TTL (1-indexed)
    pub fn hop(&self, ttl: u8) -> Option<&RouteHop> {
        if ttl == 0 {
            None
        } else {
            self.hops.get(ttl as usize - 1)
        }
    }

    /// Trailing run of unresponsive hops
    pub fn consecutive_unresponsive(&self) -> usize {
        self.hops
            .iter()
            .rev()
            .take_while(|h| h.status == HopStatus::Unresponsive)
            .count()
    }
}

/// Progressive snapshot emitted after every hop a worker records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUpdate {
    pub request: RouteId,
    pub destination: IpAddr,
    pub hops: Vec<RouteHop>,
    pub completed: bool,
    /// Number of hops to the destination, `None` until it answered
    pub total_hops: Option<u8>,
    pub max_hops: u8,
    pub state: DiscoveryState,
}

impl RouteUpdate {
    pub fn snapshot(request: RouteId, route: &Route, state: DiscoveryState) -> Self {
        Self {
            request,
            destination: route.destination,
            hops: route.hops.clone(),
            completed: route.completed,
            total_hops: route.total_hops(),
            max_hops: route.max_hops,
            state,
        }
    }

    pub fn is_final(&self) -> bool {
        self.state.is_terminal()
    }
}
