use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, check_interval, check_timeout};
use crate::error::{Error, Result};
use crate::ping::{
    Matcher, PendingProbe, PendingTable, ResultReceiver, ResultSender, TargetRegistry, Timing,
    Transmitter, timeout_result, transmit,
};
use crate::probe::{ProbeBackend, create_backend};
use crate::state::{PingResult, Target, TargetId};

/// Extra wait past a single-shot timeout before the caller settles it itself
const SINGLE_SHOT_GRACE: Duration = Duration::from_millis(500);

struct Running {
    cancel: CancellationToken,
    transmitter: JoinHandle<()>,
    matcher: JoinHandle<()>,
}

/// Periodic ICMP prober for a dynamic set of targets.
///
/// Results are pushed on the channel returned by [`PingEngine::new`]; every
/// probe the scheduler issues produces exactly one [`PingResult`], either a
/// reply or a timeout.
pub struct PingEngine {
    backend: Arc<dyn ProbeBackend>,
    registry: Arc<TargetRegistry>,
    pending: Arc<PendingTable>,
    timing: Arc<Timing>,
    results: ResultSender,
    running: Mutex<Option<Running>>,
    is_running: AtomicBool,
    epoch: RwLock<Option<DateTime<Utc>>>,
}

impl PingEngine {
    /// Build an engine around an already chosen backend
    pub fn new(config: &Config, backend: Arc<dyn ProbeBackend>) -> Result<(Self, ResultReceiver)> {
        config.validate()?;
        let (results, receiver) = mpsc::unbounded_channel();
        let engine = Self {
            backend,
            registry: Arc::new(TargetRegistry::new()),
            pending: Arc::new(PendingTable::new()),
            timing: Arc::new(Timing::new(config.interval, config.timeout)),
            results,
            running: Mutex::new(None),
            is_running: AtomicBool::new(false),
            epoch: RwLock::new(None),
        };
        Ok((engine, receiver))
    }

    /// Build the backend named by `config` and an engine around it
    pub fn from_config(config: &Config) -> Result<(Self, ResultReceiver)> {
        config.validate()?;
        Self::new(config, create_backend(config))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn add_target(&self, address: IpAddr, ttl: Option<u8>) -> TargetId {
        self.registry.add(address, ttl)
    }

    /// Probes already in flight for the target still settle normally
    pub fn remove_target(&self, id: TargetId) -> bool {
        self.registry.remove(id)
    }

    pub fn targets(&self) -> Vec<Target> {
        self.registry.snapshot()
    }

    /// Returns false and leaves the interval unchanged when out of bounds
    pub fn set_interval(&self, millis: u64) -> bool {
        let interval = Duration::from_millis(millis);
        if let Err(e) = check_interval(interval) {
            tracing::warn!(error = %e, "interval rejected");
            return false;
        }
        self.timing.set_interval(interval);
        tracing::debug!(interval_ms = millis, "interval updated");
        true
    }

    /// Applies to probes sent after the call
    pub fn set_timeout(&self, millis: u64) -> bool {
        let timeout = Duration::from_millis(millis);
        if let Err(e) = check_timeout("timeout", timeout) {
            tracing::warn!(error = %e, "timeout rejected");
            return false;
        }
        self.timing.set_timeout(timeout);
        tracing::debug!(timeout_ms = millis, "timeout updated");
        true
    }

    pub fn interval(&self) -> Duration {
        self.timing.interval()
    }

    pub fn timeout(&self) -> Duration {
        self.timing.timeout()
    }

    /// Apply interval and timeout from a settings record.
    ///
    /// Backend and IP version are fixed when the engine is built.
    pub fn apply(&self, config: &Config) -> Result<()> {
        config.validate()?;
        self.timing.set_interval(config.interval);
        self.timing.set_timeout(config.timeout);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Wall-clock time of the last successful start
    pub fn epoch(&self) -> Option<DateTime<Utc>> {
        *self.epoch.read()
    }

    /// Open the backend and spawn the transmitter and matcher.
    ///
    /// Returns `Ok(false)` if already running. Fails with
    /// `BackendUnavailable` when the backend cannot be opened.
    pub async fn start(&self) -> Result<bool> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(false);
        }

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.backend.open(reply_tx)?;

        let cancel = CancellationToken::new();
        let matcher = Matcher::new(
            self.pending.clone(),
            reply_rx,
            self.results.clone(),
            cancel.clone(),
        );
        let transmitter = Transmitter::new(
            self.registry.clone(),
            self.pending.clone(),
            self.backend.clone(),
            self.timing.clone(),
            cancel.clone(),
        );

        *running = Some(Running {
            cancel,
            matcher: tokio::spawn(matcher.run()),
            transmitter: tokio::spawn(transmitter.run()),
        });
        *self.epoch.write() = Some(Utc::now());
        self.is_running.store(true, Ordering::Release);

        tracing::info!(
            backend = self.backend.name(),
            targets = self.registry.len(),
            interval_ms = self.timing.interval().as_millis() as u64,
            "ping engine started"
        );
        Ok(true)
    }

    /// Stop and join both tasks, close the backend and settle every
    /// outstanding probe as a timeout. Returns false if already stopped.
    pub async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(Running {
            cancel,
            transmitter,
            matcher,
        }) = running.take()
        else {
            return false;
        };
        self.is_running.store(false, Ordering::Release);

        cancel.cancel();
        if let Err(e) = transmitter.await {
            tracing::error!(error = %e, "transmitter task failed");
        }
        if let Err(e) = matcher.await {
            tracing::error!(error = %e, "matcher task failed");
        }

        // Closing the raw backend joins its receive thread
        let backend = self.backend.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || backend.close()).await {
            tracing::error!(error = %e, "backend close failed");
        }

        let outstanding = self.pending.drain();
        let settled = outstanding.len();
        for (sequence, probe) in outstanding {
            let (result, waiter) = timeout_result(sequence, probe);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(result);
                }
                None => {
                    let _ = self.results.send(result);
                }
            }
        }

        tracing::info!(settled, "ping engine stopped");
        true
    }

    /// Send one probe with an explicit TTL and wait for its own result.
    ///
    /// The result is not published on the shared stream. Fails with
    /// `NotRunning` if the engine is stopped.
    pub async fn single_shot(
        &self,
        address: IpAddr,
        ttl: u8,
        timeout: Duration,
    ) -> Result<PingResult> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        check_timeout("timeout", timeout)?;
        if ttl == 0 {
            return Err(Error::ConfigInvalid("ttl must be at least 1".into()));
        }

        let (tx, mut rx) = oneshot::channel();
        let probe =
            PendingProbe::new(self.registry.allocate_id(), address, ttl, timeout).with_waiter(tx);
        let sequence = transmit(&self.pending, self.backend.as_ref(), probe, timeout)?;

        match tokio::time::timeout(timeout + SINGLE_SHOT_GRACE, &mut rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(Error::NotRunning),
            // Nothing settled it (matcher gone); claim it here unless it just got settled
            Err(_) => match self.pending.remove(sequence) {
                Some(probe) => Ok(timeout_result(sequence, probe).0),
                None => rx.await.map_err(|_| Error::NotRunning),
            },
        }
    }
}

impl Drop for PingEngine {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock()
            && let Some(running) = running.take()
        {
            running.cancel.cancel();
        }
    }
}
