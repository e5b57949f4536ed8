//! Integration tests for the probe -> match -> result pipeline
//!
//! A simulated network stands in for the socket backend so these run without
//! privileges or network access, on tokio's paused clock.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use hopwatch::{
    Config, DiscoveryState, Error, HopStatus, PingEngine, PingResult, PingStatus, ProbeBackend,
    ProbeRequest, Reply, ReplyKind, ReplySender, ResultReceiver, RouteEngine, RouteSettings,
    RouteUpdate, RouteUpdateReceiver,
};

const DEST: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 50));

fn router(ttl: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, ttl))
}

/// Routers at TTL 1..hops-1, the destination at `hops`
struct SimulatedNetwork {
    hops: u8,
    delay: Box<dyn Fn(&ProbeRequest) -> Duration + Send + Sync>,
    silent_ttls: HashSet<u8>,
    available: bool,
    replies: Mutex<Option<ReplySender>>,
    sent: Mutex<Vec<ProbeRequest>>,
}

impl SimulatedNetwork {
    fn new(hops: u8, delay: Duration) -> Self {
        Self {
            hops,
            delay: Box::new(move |_| delay),
            silent_ttls: HashSet::new(),
            available: true,
            replies: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent_sequences(&self) -> Vec<u16> {
        self.sent.lock().iter().map(|r| r.sequence).collect()
    }
}

impl ProbeBackend for SimulatedNetwork {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn open(&self, replies: ReplySender) -> hopwatch::Result<()> {
        if !self.available {
            return Err(Error::BackendUnavailable("operation not permitted".into()));
        }
        *self.replies.lock() = Some(replies);
        Ok(())
    }

    fn send(&self, request: &ProbeRequest) -> hopwatch::Result<()> {
        let Some(replies) = self.replies.lock().clone() else {
            return Err(Error::NotRunning);
        };
        self.sent.lock().push(request.clone());
        if self.silent_ttls.contains(&request.ttl) {
            return Ok(());
        }

        let (kind, responder) = if request.ttl >= self.hops {
            (ReplyKind::EchoReply, request.address)
        } else {
            (ReplyKind::TtlExceeded, router(request.ttl))
        };
        let delay = (self.delay)(request);
        let reply = Reply {
            sequence: request.sequence,
            destination: Some(request.address),
            responder,
            received_at: request.sent_at + delay,
            kind,
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = replies.send(reply);
        });
        Ok(())
    }

    fn close(&self) {
        self.replies.lock().take();
    }
}

fn ping_config(interval_ms: u64, timeout_ms: u64) -> Config {
    Config {
        interval: Duration::from_millis(interval_ms),
        timeout: Duration::from_millis(timeout_ms),
        ..Config::default()
    }
}

fn drain(results: &mut ResultReceiver) -> Vec<PingResult> {
    let mut out = Vec::new();
    while let Ok(result) = results.try_recv() {
        out.push(result);
    }
    out
}

async fn collect_route(updates: &mut RouteUpdateReceiver) -> Vec<RouteUpdate> {
    let mut out = Vec::new();
    while let Some(update) = updates.recv().await {
        let done = update.is_final();
        out.push(update);
        if done {
            break;
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_steady_replies_one_result_per_tick() {
    let network = Arc::new(SimulatedNetwork::new(1, Duration::from_millis(50)));
    let (engine, mut results) = PingEngine::new(&ping_config(1000, 2000), network).unwrap();
    let id = engine.add_target(DEST, None);

    assert!(engine.start().await.unwrap());
    // Ticks at 0, 1000 and 2000; the last reply lands at 2050
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(engine.stop().await);

    let results = drain(&mut results);
    assert_eq!(results.len(), 3);
    for result in &results {
        assert_eq!(result.target, id);
        assert_eq!(result.status, PingStatus::EchoReply);
        assert_eq!(result.rtt, Some(Duration::from_millis(50)));
        assert_eq!(result.responder, Some(DEST));
    }
    assert!(!results.iter().any(PingResult::is_timeout));
}

#[tokio::test(start_paused = true)]
async fn test_every_sequence_settles_exactly_once_near_deadline() {
    // Replies straddle the 100ms timeout so matcher and sweep race
    let network = Arc::new(SimulatedNetwork {
        delay: Box::new(|r: &ProbeRequest| Duration::from_millis(95 + (r.sequence % 11) as u64)),
        ..SimulatedNetwork::new(1, Duration::ZERO)
    });
    let (engine, mut results) =
        PingEngine::new(&ping_config(5, 100), network.clone()).unwrap();
    engine.add_target(DEST, None);
    engine.add_target(DEST, Some(32));

    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    engine.stop().await;

    let results = drain(&mut results);
    let sent = network.sent_sequences();
    assert!(!sent.is_empty());
    assert_eq!(results.len(), sent.len());

    let settled: HashSet<u16> = results.iter().map(|r| r.sequence).collect();
    assert_eq!(settled.len(), results.len());
    assert_eq!(settled, sent.into_iter().collect::<HashSet<_>>());

    for result in &results {
        match result.status {
            PingStatus::EchoReply => assert!(result.rtt.unwrap() <= Duration::from_millis(100)),
            PingStatus::Timeout => assert!(result.rtt.is_none()),
            other => panic!("unexpected status {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_probes_time_out() {
    let mut network = SimulatedNetwork::new(1, Duration::from_millis(10));
    network.silent_ttls.insert(64);
    let (engine, mut results) = PingEngine::new(&ping_config(500, 200), Arc::new(network)).unwrap();
    engine.add_target(DEST, None);

    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    engine.stop().await;

    let results = drain(&mut results);
    // Ticks at 0 and 500 both expire before stop
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(PingResult::is_timeout));
}

#[tokio::test(start_paused = true)]
async fn test_removed_target_stops_producing_results() {
    let network = Arc::new(SimulatedNetwork::new(1, Duration::from_millis(5)));
    let (engine, mut results) = PingEngine::new(&ping_config(100, 1000), network).unwrap();
    let keep = engine.add_target(DEST, None);
    let gone = engine.add_target(router(9), None);

    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(engine.remove_target(gone));
    assert!(!engine.remove_target(gone));
    drain(&mut results);

    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.stop().await;

    let later = drain(&mut results);
    assert!(!later.is_empty());
    assert!(later.iter().all(|r| r.target == keep));
    assert_eq!(engine.targets().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_interval_change_speeds_up_probing() {
    let network = Arc::new(SimulatedNetwork::new(1, Duration::from_millis(1)));
    let (engine, mut results) =
        PingEngine::new(&ping_config(1000, 500), network.clone()).unwrap();
    engine.add_target(DEST, None);

    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(network.sent.lock().len(), 2);

    assert!(engine.set_interval(100));
    assert!(!engine.set_interval(0));
    assert_eq!(engine.interval(), Duration::from_millis(100));

    // Next tick still at 2000, then every 100ms: 2000, 2100, ..., 2900
    tokio::time::sleep(Duration::from_millis(1450)).await;
    engine.stop().await;
    assert_eq!(network.sent.lock().len(), 12);
    assert_eq!(drain(&mut results).len(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_restartable() {
    let network = Arc::new(SimulatedNetwork::new(1, Duration::from_millis(5)));
    let (engine, _results) = PingEngine::new(&ping_config(100, 1000), network).unwrap();

    assert!(!engine.stop().await);
    assert!(engine.start().await.unwrap());
    let first_epoch = engine.epoch().unwrap();
    assert!(engine.stop().await);
    assert!(!engine.stop().await);

    assert!(engine.start().await.unwrap());
    assert!(engine.epoch().unwrap() >= first_epoch);
    assert!(engine.stop().await);
}

#[tokio::test]
async fn test_backend_unavailable_fails_start() {
    let network = SimulatedNetwork {
        available: false,
        ..SimulatedNetwork::new(1, Duration::ZERO)
    };
    let (engine, _results) = PingEngine::new(&Config::default(), Arc::new(network)).unwrap();

    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)));
    assert!(!engine.is_running());
    assert!(!engine.stop().await);
}

fn route_settings(hop_timeout_ms: u64) -> RouteSettings {
    RouteSettings {
        hop_timeout: Duration::from_millis(hop_timeout_ms),
        ..RouteSettings::default()
    }
}

async fn route_engine(
    network: SimulatedNetwork,
    settings: RouteSettings,
) -> (RouteEngine, RouteUpdateReceiver) {
    // Long interval and no targets: only single-shot probes go out
    let (ping, _results) =
        PingEngine::new(&ping_config(60_000, 1000), Arc::new(network)).unwrap();
    let ping = Arc::new(ping);
    ping.start().await.unwrap();
    RouteEngine::new(ping, settings)
}

#[tokio::test(start_paused = true)]
async fn test_route_to_four_hop_destination() {
    let (routes, mut updates) = route_engine(
        SimulatedNetwork::new(4, Duration::from_millis(20)),
        route_settings(500),
    )
    .await;

    let id = routes.start_discovery(DEST);
    let updates = collect_route(&mut updates).await;

    assert_eq!(updates.len(), 4);
    assert!(updates.iter().all(|u| u.request == id && u.destination == DEST));
    let last = updates.last().unwrap();
    assert!(last.completed);
    assert_eq!(last.total_hops, Some(4));
    assert_eq!(last.state, DiscoveryState::Complete);

    let ttls: Vec<u8> = last.hops.iter().map(|h| h.ttl).collect();
    assert_eq!(ttls, vec![1, 2, 3, 4]);
    for hop in &last.hops[..3] {
        assert_eq!(hop.responder, Some(router(hop.ttl)));
        assert_eq!(hop.status, HopStatus::Responded);
    }
    assert_eq!(last.hops[3].responder, Some(DEST));
    assert_eq!(last.hops[3].avg_rtt(), Some(Duration::from_millis(20)));

    routes.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_route_survives_silent_hop() {
    let mut network = SimulatedNetwork::new(4, Duration::from_millis(20));
    network.silent_ttls.insert(2);
    let (routes, mut updates) = route_engine(network, route_settings(300)).await;

    routes.start_discovery(DEST);
    let updates = collect_route(&mut updates).await;

    assert_eq!(updates.len(), 4);
    let last = updates.last().unwrap();
    assert!(last.completed);
    assert_eq!(last.total_hops, Some(4));
    assert_eq!(last.hops[1].status, HopStatus::Unresponsive);
    assert_eq!(last.hops[1].responder, None);
    assert!(last.hops[1].samples.is_empty());

    routes.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_route_fails_after_unresponsive_cap() {
    let mut network = SimulatedNetwork::new(20, Duration::from_millis(5));
    network.silent_ttls.extend(2..20);
    let settings = RouteSettings {
        max_unresponsive_hops: 4,
        ..route_settings(100)
    };
    let (routes, mut updates) = route_engine(network, settings).await;

    routes.start_discovery(DEST);
    let updates = collect_route(&mut updates).await;

    let last = updates.last().unwrap();
    assert_eq!(last.state, DiscoveryState::Failed);
    assert_eq!(last.hops.len(), 5);
    assert!(!last.completed);
    assert_eq!(last.total_hops, None);

    routes.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_route_bounded_by_max_hops() {
    let settings = RouteSettings {
        max_hops: 5,
        ..route_settings(100)
    };
    let (routes, mut updates) =
        route_engine(SimulatedNetwork::new(12, Duration::from_millis(5)), settings).await;

    routes.start_discovery(DEST);
    let updates = collect_route(&mut updates).await;

    assert_eq!(updates.len(), 5);
    let last = updates.last().unwrap();
    assert_eq!(last.state, DiscoveryState::Incomplete);
    assert_eq!(last.max_hops, 5);
    assert!(!last.completed);

    routes.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_routes_tagged_by_request() {
    let (routes, mut updates) = route_engine(
        SimulatedNetwork::new(3, Duration::from_millis(10)),
        route_settings(200),
    )
    .await;

    let a = routes.start_discovery(DEST);
    let b = routes.start_discovery(router(200));
    assert_eq!(routes.active().len(), 2);

    let mut by_route: HashMap<_, Vec<RouteUpdate>> = HashMap::new();
    let mut finished = 0;
    while finished < 2 {
        let update = updates.recv().await.unwrap();
        if update.is_final() {
            finished += 1;
        }
        by_route.entry(update.request).or_default().push(update);
    }

    assert_eq!(by_route[&a].len(), 3);
    assert_eq!(by_route[&b].len(), 3);
    assert!(by_route[&b].iter().all(|u| u.destination == router(200)));

    routes.close().await;
    assert!(routes.active().is_empty());
}

#[test]
fn test_settings_record_roundtrip_through_engine() {
    let config = Config {
        interval: Duration::from_millis(750),
        timeout: Duration::from_millis(1500),
        ..Config::default()
    };
    let json = config.to_json().unwrap();
    let loaded = Config::from_json(&json).unwrap();

    let network = Arc::new(SimulatedNetwork::new(1, Duration::ZERO));
    let (engine, _results) = PingEngine::new(&Config::default(), network).unwrap();
    engine.apply(&loaded).unwrap();
    assert_eq!(engine.interval(), Duration::from_millis(750));
    assert_eq!(engine.timeout(), Duration::from_millis(1500));
}
