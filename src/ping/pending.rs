//! Outstanding-probe table.
//!
//! The transmitter inserts an entry before it calls the backend; the matcher
//! removes it when a reply arrives or the timeout sweep finds it expired.
//! Removal under the table lock is what makes delivery exactly-once: whichever
//! side removes the entry emits the result, the other finds nothing.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::state::{PingResult, PingStatus, TargetId};

/// A probe that has been sent and is awaiting a reply or its deadline
#[derive(Debug)]
pub struct PendingProbe {
    pub target: TargetId,
    pub address: IpAddr,
    pub ttl: u8,
    pub sent_at: Instant,
    pub sent_wall: DateTime<Utc>,
    pub deadline: Instant,
    /// Set for single-shot probes; the result goes here instead of the stream
    pub waiter: Option<oneshot::Sender<PingResult>>,
}

impl PendingProbe {
    pub fn new(target: TargetId, address: IpAddr, ttl: u8, timeout: Duration) -> Self {
        let sent_at = Instant::now();
        Self {
            target,
            address,
            ttl,
            sent_at,
            sent_wall: Utc::now(),
            deadline: sent_at + timeout,
            waiter: None,
        }
    }

    pub fn with_waiter(mut self, waiter: oneshot::Sender<PingResult>) -> Self {
        self.waiter = Some(waiter);
        self
    }

    /// Turn the entry into its result, handing back the waiter if any
    pub fn into_result(
        self,
        sequence: u16,
        status: PingStatus,
        rtt: Option<Duration>,
        responder: Option<IpAddr>,
    ) -> (PingResult, Option<oneshot::Sender<PingResult>>) {
        let result = PingResult {
            target: self.target,
            address: self.address,
            sequence,
            ttl: self.ttl,
            status,
            rtt,
            responder,
            sent_at: self.sent_wall,
        };
        (result, self.waiter)
    }
}

#[derive(Debug, Default)]
struct Inner {
    probes: HashMap<u16, PendingProbe>,
    next_sequence: u16,
}

/// Outstanding probes keyed by sequence number
#[derive(Debug, Default)]
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a probe under a fresh sequence number.
    ///
    /// Sequence numbers wrap at 16 bits and skip any value still outstanding.
    /// Returns `None` only if every sequence number is in flight.
    pub fn insert(&self, probe: PendingProbe) -> Option<u16> {
        let mut inner = self.inner.lock();
        if inner.probes.len() > u16::MAX as usize {
            return None;
        }
        let mut sequence = inner.next_sequence;
        while inner.probes.contains_key(&sequence) {
            sequence = sequence.wrapping_add(1);
        }
        inner.next_sequence = sequence.wrapping_add(1);
        inner.probes.insert(sequence, probe);
        Some(sequence)
    }

    /// Claim the probe a reply belongs to.
    ///
    /// When the reply names the original destination it must match the
    /// probe's address, so a stray reply for an old sequence number on another
    /// host cannot steal the entry.
    pub fn take(&self, sequence: u16, destination: Option<IpAddr>) -> Option<PendingProbe> {
        let mut inner = self.inner.lock();
        let owned = match inner.probes.get(&sequence) {
            Some(probe) => destination.is_none_or(|dest| dest == probe.address),
            None => false,
        };
        if owned {
            inner.probes.remove(&sequence)
        } else {
            None
        }
    }

    /// Drop an entry without emitting anything (send failed)
    pub fn remove(&self, sequence: u16) -> Option<PendingProbe> {
        self.inner.lock().probes.remove(&sequence)
    }

    /// Remove and return every probe whose deadline is at or before `now`
    pub fn expire(&self, now: Instant) -> Vec<(u16, PendingProbe)> {
        let mut inner = self.inner.lock();
        let expired: Vec<u16> = inner
            .probes
            .iter()
            .filter(|(_, probe)| probe.deadline <= now)
            .map(|(sequence, _)| *sequence)
            .collect();
        expired
            .into_iter()
            .filter_map(|sequence| inner.probes.remove(&sequence).map(|p| (sequence, p)))
            .collect()
    }

    /// Remove everything (engine stop)
    pub fn drain(&self) -> Vec<(u16, PendingProbe)> {
        self.inner.lock().probes.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().probes.is_empty()
    }
}
