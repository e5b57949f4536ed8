//! Transmitter scheduler.
//!
//! One periodic loop per engine. Each tick snapshots the registry and sends
//! one probe per target. Interval and timeout live in atomics so setters never
//! wait on the loop; the next deadline is computed after each tick from the
//! interval current at that moment, so a change applies from the next tick on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::ping::{PendingProbe, PendingTable, TargetRegistry};
use crate::probe::{ProbeBackend, ProbeRequest};

/// Interval and timeout shared between the engine API and its tasks
#[derive(Debug)]
pub struct Timing {
    interval_ms: AtomicU64,
    timeout_ms: AtomicU64,
}

impl Timing {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval_ms: AtomicU64::new(interval.as_millis() as u64),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::Release);
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }
}

/// Register a probe, then hand it to the backend.
///
/// The entry exists before `send` so a fast reply always finds it; on send
/// failure it is removed again so no false timeout is reported.
pub fn transmit(
    pending: &PendingTable,
    backend: &dyn ProbeBackend,
    probe: PendingProbe,
    timeout: Duration,
) -> Result<u16> {
    let target = probe.target;
    let address = probe.address;
    let ttl = probe.ttl;
    let sent_at = probe.sent_at;

    let Some(sequence) = pending.insert(probe) else {
        return Err(std::io::Error::other("all sequence numbers are in flight").into());
    };
    let request = ProbeRequest {
        target,
        address,
        sequence,
        ttl,
        sent_at,
        timeout,
    };
    if let Err(e) = backend.send(&request) {
        pending.remove(sequence);
        return Err(e);
    }
    tracing::trace!(sequence, target_id = %target, %address, ttl, "probe sent");
    Ok(sequence)
}

pub struct Transmitter {
    registry: Arc<TargetRegistry>,
    pending: Arc<PendingTable>,
    backend: Arc<dyn ProbeBackend>,
    timing: Arc<Timing>,
    cancel: CancellationToken,
}

impl Transmitter {
    pub fn new(
        registry: Arc<TargetRegistry>,
        pending: Arc<PendingTable>,
        backend: Arc<dyn ProbeBackend>,
        timing: Arc<Timing>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            pending,
            backend,
            timing,
            cancel,
        }
    }

    pub async fn run(self) {
        // First tick fires immediately on start
        let mut next_tick = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(next_tick) => {
                    self.tick();

                    let interval = self.timing.interval();
                    let now = Instant::now();
                    next_tick += interval;
                    if next_tick <= now {
                        // Missed ticks are skipped, not bunched up
                        next_tick = now + interval;
                    }
                }
            }
        }
        tracing::debug!("transmitter stopped");
    }

    fn tick(&self) {
        let timeout = self.timing.timeout();
        for target in self.registry.snapshot() {
            let probe =
                PendingProbe::new(target.id, target.address, target.effective_ttl(), timeout);
            if let Err(e) = transmit(&self.pending, self.backend.as_ref(), probe, timeout) {
                // Target stays registered; the next tick tries again
                tracing::warn!(
                    target_id = %target.id,
                    address = %target.address,
                    error = %e,
                    "failed to send probe"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::probe::ReplySender;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};

    /// Records sends and optionally fails them
    #[derive(Default)]
    struct RecordingBackend {
        sent: Mutex<Vec<(ProbeRequest, Instant)>>,
        fail: bool,
    }

    impl ProbeBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }
        fn open(&self, _replies: ReplySender) -> Result<()> {
            Ok(())
        }
        fn send(&self, request: &ProbeRequest) -> Result<()> {
            if self.fail {
                return Err(Error::Send(std::io::Error::other("network down")));
            }
            self.sent.lock().push((request.clone(), Instant::now()));
            Ok(())
        }
        fn close(&self) {}
    }

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    fn spawn_transmitter(
        backend: Arc<RecordingBackend>,
        interval: Duration,
    ) -> (
        Arc<TargetRegistry>,
        Arc<PendingTable>,
        Arc<Timing>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let registry = Arc::new(TargetRegistry::new());
        let pending = Arc::new(PendingTable::new());
        let timing = Arc::new(Timing::new(interval, Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let transmitter = Transmitter::new(
            registry.clone(),
            pending.clone(),
            backend,
            timing.clone(),
            cancel.clone(),
        );
        let handle = tokio::spawn(transmitter.run());
        (registry, pending, timing, cancel, handle)
    }

    #[test]
    fn test_timing_roundtrip() {
        let timing = Timing::new(Duration::from_millis(250), Duration::from_secs(2));
        assert_eq!(timing.interval(), Duration::from_millis(250));
        timing.set_timeout(Duration::from_millis(10));
        assert_eq!(timing.timeout(), Duration::from_millis(10));
    }

    #[test]
    fn test_transmit_failure_leaves_no_pending_entry() {
        let pending = PendingTable::new();
        let backend = RecordingBackend {
            fail: true,
            ..Default::default()
        };
        let probe = PendingProbe::new(
            crate::state::TargetId(1),
            addr(1),
            64,
            Duration::from_secs(1),
        );
        assert!(transmit(&pending, &backend, probe, Duration::from_secs(1)).is_err());
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_probe_per_target_per_tick() {
        let backend = Arc::new(RecordingBackend::default());
        let (registry, pending, _timing, cancel, handle) =
            spawn_transmitter(backend.clone(), Duration::from_millis(100));
        registry.add(addr(1), None);
        registry.add(addr(2), Some(9));

        // Ticks at 0 (possibly before targets), 100, 200
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        handle.await.unwrap();

        let sent = backend.sent.lock();
        assert!(sent.len() >= 4);
        assert_eq!(sent.len() % 2, 0);
        assert_eq!(pending.len(), sent.len());
        assert!(sent.iter().any(|(r, _)| r.address == addr(2) && r.ttl == 9));
        assert!(sent.iter().any(|(r, _)| r.address == addr(1) && r.ttl == 64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_applies_from_next_tick() {
        let backend = Arc::new(RecordingBackend::default());
        let (registry, _pending, timing, cancel, handle) =
            spawn_transmitter(backend.clone(), Duration::from_millis(1000));
        registry.add(addr(1), None);
        let start = Instant::now();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        timing.set_interval(Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        cancel.cancel();
        handle.await.unwrap();

        let offsets: Vec<u64> = backend
            .sent
            .lock()
            .iter()
            .map(|(_, at)| at.duration_since(start).as_millis() as u64)
            .collect();
        // The tick at 2000 was scheduled before the change, spacing shrinks after it
        assert!(offsets.contains(&1000));
        assert!(offsets.contains(&2000));
        assert!(offsets.contains(&2200));
        assert!(offsets.contains(&2400));
        assert!(!offsets.iter().any(|&o| o > 1000 && o < 2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_keeps_target() {
        let backend = Arc::new(RecordingBackend {
            fail: true,
            ..Default::default()
        });
        let (registry, pending, _timing, cancel, handle) =
            spawn_transmitter(backend, Duration::from_millis(50));
        let id = registry.add(addr(1), None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(registry.contains(id));
        assert!(pending.is_empty());
    }
}
