//! Per-destination route discovery.
//!
//! A worker walks TTL 1, 2, 3, ... towards its destination, probing each hop
//! through a [`HopProber`] and publishing a [`RouteUpdate`] after every hop it
//! records. Cancellation is checked between probes, never mid-probe.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::ping::PingEngine;
use crate::state::{
    DiscoveryState, PingResult, PingStatus, Route, RouteHop, RouteId, RouteUpdate,
};

pub type RouteUpdateSender = mpsc::UnboundedSender<RouteUpdate>;
pub type RouteUpdateReceiver = mpsc::UnboundedReceiver<RouteUpdate>;

/// Sends one TTL-limited probe and waits for its outcome
#[async_trait]
pub trait HopProber: Send + Sync {
    async fn probe(&self, destination: IpAddr, ttl: u8, timeout: Duration) -> Result<PingResult>;
}

#[async_trait]
impl HopProber for PingEngine {
    async fn probe(&self, destination: IpAddr, ttl: u8, timeout: Duration) -> Result<PingResult> {
        self.single_shot(destination, ttl, timeout).await
    }
}

/// Per-discovery limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSettings {
    pub hop_timeout: Duration,
    pub max_hops: u8,
    pub probes_per_hop: u8,
    pub max_unresponsive_hops: u8,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RouteSettings {
    fn from(config: &Config) -> Self {
        Self {
            hop_timeout: config.hop_timeout,
            max_hops: config.max_hops,
            probes_per_hop: config.probes_per_hop,
            max_unresponsive_hops: config.max_unresponsive_hops,
        }
    }
}

/// What a hop's probes told us, strongest signal wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum HopOutcome {
    Silent,
    Transit,
    /// Echo reply from an address other than the destination
    Foreign,
    /// Prober failed (engine stopped or send error)
    Aborted,
    Unreachable,
    Reached,
}

pub struct RouteDiscoveryWorker<P: HopProber + ?Sized> {
    id: RouteId,
    destination: IpAddr,
    settings: RouteSettings,
    prober: Arc<P>,
    updates: RouteUpdateSender,
    cancel: CancellationToken,
}

impl<P: HopProber + ?Sized> RouteDiscoveryWorker<P> {
    pub fn new(
        id: RouteId,
        destination: IpAddr,
        settings: RouteSettings,
        prober: Arc<P>,
        updates: RouteUpdateSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            destination,
            settings,
            prober,
            updates,
            cancel,
        }
    }

    /// Run to a terminal state and return it
    pub async fn run(self) -> DiscoveryState {
        let mut route = Route::new(self.destination, self.settings.max_hops);
        tracing::debug!(
            route = %self.id,
            destination = %self.destination,
            max_hops = self.settings.max_hops,
            "route discovery started"
        );

        for ttl in 1..=self.settings.max_hops {
            if self.cancel.is_cancelled() {
                return self.finish(&route, DiscoveryState::Cancelled);
            }

            let (hop, outcome) = self.probe_hop(ttl).await;
            route.push(hop);
            if outcome == HopOutcome::Reached {
                route.complete();
            }

            let state = match outcome {
                HopOutcome::Reached => DiscoveryState::Complete,
                HopOutcome::Unreachable | HopOutcome::Foreign | HopOutcome::Aborted => {
                    DiscoveryState::Failed
                }
                HopOutcome::Silent
                    if route.consecutive_unresponsive()
                        >= self.settings.max_unresponsive_hops as usize =>
                {
                    DiscoveryState::Failed
                }
                HopOutcome::Silent | HopOutcome::Transit if ttl == self.settings.max_hops => {
                    DiscoveryState::Incomplete
                }
                HopOutcome::Silent | HopOutcome::Transit => {
                    DiscoveryState::Probing { ttl: ttl + 1 }
                }
            };

            if state.is_terminal() {
                return self.finish(&route, state);
            }
            self.publish(&route, state);
        }

        // Only reachable with max_hops == 0, which config validation rejects
        self.finish(&route, DiscoveryState::Incomplete)
    }

    /// Send the configured number of probes for one TTL
    async fn probe_hop(&self, ttl: u8) -> (RouteHop, HopOutcome) {
        let mut hop = RouteHop::new(ttl);
        let mut outcome = HopOutcome::Silent;

        for attempt in 0..self.settings.probes_per_hop {
            // The first probe of a hop always goes out; later ones yield to cancel
            if attempt > 0 && self.cancel.is_cancelled() {
                break;
            }
            let result = match self
                .prober
                .probe(self.destination, ttl, self.settings.hop_timeout)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(route = %self.id, ttl, error = %e, "hop probe failed");
                    outcome = outcome.max(HopOutcome::Aborted);
                    break;
                }
            };

            let responder = result.responder.unwrap_or(self.destination);
            let seen = match result.status {
                PingStatus::Timeout => HopOutcome::Silent,
                PingStatus::TtlExceeded => HopOutcome::Transit,
                PingStatus::Unreachable(_) => HopOutcome::Unreachable,
                PingStatus::EchoReply if responder == self.destination => HopOutcome::Reached,
                PingStatus::EchoReply => HopOutcome::Foreign,
            };
            if seen != HopOutcome::Silent {
                hop.record_response(responder, result.rtt);
            }
            if seen == HopOutcome::Reached {
                // Destination wins over a router seen by an earlier probe
                hop.responder = Some(self.destination);
            }
            tracing::trace!(
                route = %self.id,
                ttl,
                status = ?result.status,
                %responder,
                "hop probed"
            );
            outcome = outcome.max(seen);
        }

        hop.finish();
        (hop, outcome)
    }

    fn publish(&self, route: &Route, state: DiscoveryState) {
        if self
            .updates
            .send(RouteUpdate::snapshot(self.id, route, state))
            .is_err()
        {
            tracing::trace!(route = %self.id, "route update has no consumer");
        }
    }

    fn finish(&self, route: &Route, state: DiscoveryState) -> DiscoveryState {
        self.publish(route, state);
        tracing::info!(
            route = %self.id,
            destination = %self.destination,
            hops = route.hops.len(),
            ?state,
            "route discovery finished"
        );
        state
    }
}
