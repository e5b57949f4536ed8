use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::ping::PingEngine;
use crate::state::{DiscoveryState, RouteId};
use crate::trace::{
    HopProber, RouteDiscoveryWorker, RouteSettings, RouteUpdateReceiver, RouteUpdateSender,
};

struct WorkerEntry {
    destination: IpAddr,
    cancel: CancellationToken,
    handle: JoinHandle<DiscoveryState>,
}

type WorkerPool = Arc<Mutex<HashMap<RouteId, WorkerEntry>>>;

/// Pool of concurrent route discoveries sharing one prober.
///
/// Every worker publishes on the single update stream returned by
/// [`RouteEngine::new`]; updates carry the [`RouteId`] and destination they
/// belong to. Order is preserved per worker only.
pub struct RouteEngine<P: HopProber + ?Sized + 'static = PingEngine> {
    prober: Arc<P>,
    settings: RwLock<RouteSettings>,
    updates: RouteUpdateSender,
    workers: WorkerPool,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl<P: HopProber + ?Sized + 'static> RouteEngine<P> {
    pub fn new(prober: Arc<P>, settings: RouteSettings) -> (Self, RouteUpdateReceiver) {
        let (updates, receiver) = mpsc::unbounded_channel();
        let engine = Self {
            prober,
            settings: RwLock::new(settings),
            updates,
            workers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        };
        (engine, receiver)
    }

    pub fn prober(&self) -> &Arc<P> {
        &self.prober
    }

    pub fn settings(&self) -> RouteSettings {
        *self.settings.read()
    }

    /// Applies to discoveries started after the call
    pub fn set_settings(&self, settings: RouteSettings) {
        *self.settings.write() = settings;
    }

    /// Spawn a worker for `destination` and return its handle
    pub fn start_discovery(&self, destination: IpAddr) -> RouteId {
        let id = RouteId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let cancel = self.cancel.child_token();
        let worker = RouteDiscoveryWorker::new(
            id,
            destination,
            self.settings(),
            self.prober.clone(),
            self.updates.clone(),
            cancel.clone(),
        );

        // Held across the spawn so the worker's own removal can't run before the insert
        let mut workers = self.workers.lock();
        let pool = self.workers.clone();
        let handle = tokio::spawn(async move {
            let state = worker.run().await;
            pool.lock().remove(&id);
            state
        });
        workers.insert(
            id,
            WorkerEntry {
                destination,
                cancel,
                handle,
            },
        );
        id
    }

    /// Ask a worker to stop after its current hop. False if it already finished.
    pub fn cancel(&self, id: RouteId) -> bool {
        match self.workers.lock().get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::debug!(
                    route = %id,
                    destination = %entry.destination,
                    "route discovery cancel requested"
                );
                true
            }
            None => false,
        }
    }

    /// Discoveries still running, ordered by id
    pub fn active(&self) -> Vec<(RouteId, IpAddr)> {
        let mut active: Vec<_> = self
            .workers
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.destination))
            .collect();
        active.sort_unstable_by_key(|(id, _)| *id);
        active
    }

    pub fn is_active(&self, id: RouteId) -> bool {
        self.workers.lock().contains_key(&id)
    }

    /// Cancel every worker and wait for all of them to publish their last update
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let entries: Vec<(RouteId, WorkerEntry)> = self.workers.lock().drain().collect();
        for (id, entry) in entries {
            if let Err(e) = entry.handle.await {
                tracing::error!(route = %id, error = %e, "route worker failed");
            }
        }
    }
}

impl RouteEngine<PingEngine> {
    /// Build a ping engine from `config` and a route engine on top of it.
    ///
    /// The ping engine still has to be started before discoveries get answers.
    pub fn from_config(config: &Config) -> Result<(Self, RouteUpdateReceiver)> {
        // Single-shot probes resolve through their own waiter, not the stream
        let (ping, _results) = PingEngine::from_config(config)?;
        Ok(Self::new(Arc::new(ping), RouteSettings::from(config)))
    }

    pub async fn start(&self) -> Result<bool> {
        self.prober.start().await
    }

    /// Shut down every discovery, then stop the ping engine
    pub async fn close(&self) {
        self.shutdown().await;
        self.prober.stop().await;
    }
}

impl<P: HopProber + ?Sized + 'static> Drop for RouteEngine<P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
