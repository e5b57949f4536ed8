//! Target registry.
//!
//! Many readers (the transmitter walks it every tick), few writers (callers
//! adding and removing targets), so a `RwLock` over an ordered map keeps
//! transmission order stable by id.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::{Target, TargetId};

#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: RwLock<BTreeMap<TargetId, Target>>,
    next_id: AtomicU64,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id that no registered target will ever reuse
    pub fn allocate_id(&self) -> TargetId {
        TargetId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a target; duplicates of the same address get distinct ids
    pub fn add(&self, address: IpAddr, ttl: Option<u8>) -> TargetId {
        let id = self.allocate_id();
        self.targets.write().insert(id, Target { id, address, ttl });
        tracing::debug!(target_id = %id, %address, ?ttl, "target added");
        id
    }

    /// Returns false when the id is unknown
    pub fn remove(&self, id: TargetId) -> bool {
        let removed = self.targets.write().remove(&id).is_some();
        if removed {
            tracing::debug!(target_id = %id, "target removed");
        }
        removed
    }

    pub fn contains(&self, id: TargetId) -> bool {
        self.targets.read().contains_key(&id)
    }

    /// Copy of the current target set, ordered by id
    pub fn snapshot(&self) -> Vec<Target> {
        self.targets.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }
}
