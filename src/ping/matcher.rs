//! Reply matcher and timeout sweep.
//!
//! Consumes backend replies, claims the matching outstanding probe and emits
//! its result. A periodic sweep turns expired probes into timeout results.
//! Both paths claim entries through [`PendingTable`], so a reply racing the
//! sweep for the same probe produces one result, never two.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::ping::{PendingProbe, PendingTable};
use crate::probe::{Reply, ReplyKind, ReplyReceiver};
use crate::state::{PingResult, PingStatus};

/// How often outstanding probes are checked against their deadline
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum replies handled per wake-up before the sweep gets a turn
const MAX_DRAIN_BATCH: usize = 100;

pub type ResultSender = mpsc::UnboundedSender<PingResult>;
pub type ResultReceiver = mpsc::UnboundedReceiver<PingResult>;

pub struct Matcher {
    pending: Arc<PendingTable>,
    replies: ReplyReceiver,
    results: ResultSender,
    cancel: CancellationToken,
}

impl Matcher {
    pub fn new(
        pending: Arc<PendingTable>,
        replies: ReplyReceiver,
        results: ResultSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pending,
            replies,
            results,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut replies_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                reply = self.replies.recv(), if replies_open => match reply {
                    Some(reply) => {
                        self.handle_reply(reply);
                        // Drain what is already queued before yielding to the sweep
                        for _ in 1..MAX_DRAIN_BATCH {
                            match self.replies.try_recv() {
                                Ok(reply) => self.handle_reply(reply),
                                Err(_) => break,
                            }
                        }
                    }
                    None => {
                        tracing::debug!("reply channel closed, matcher only sweeps from now on");
                        replies_open = false;
                    }
                },
                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }
        tracing::debug!("matcher stopped");
    }

    fn handle_reply(&self, reply: Reply) {
        let Some(probe) = self.pending.take(reply.sequence, reply.destination) else {
            tracing::debug!(
                sequence = reply.sequence,
                responder = %reply.responder,
                "reply for unknown or already settled probe"
            );
            return;
        };

        // Arrived after the window closed but before the sweep saw it
        if reply.received_at > probe.deadline {
            tracing::debug!(sequence = reply.sequence, "late reply counted as timeout");
            self.deliver(probe.into_result(reply.sequence, PingStatus::Timeout, None, None));
            return;
        }

        let status = match reply.kind {
            ReplyKind::EchoReply => PingStatus::EchoReply,
            ReplyKind::TtlExceeded => PingStatus::TtlExceeded,
            ReplyKind::Unreachable(code) => PingStatus::Unreachable(code),
        };
        let rtt = reply.received_at.saturating_duration_since(probe.sent_at);
        tracing::trace!(
            sequence = reply.sequence,
            target_id = %probe.target,
            responder = %reply.responder,
            rtt_us = rtt.as_micros() as u64,
            "probe matched"
        );
        self.deliver(probe.into_result(reply.sequence, status, Some(rtt), Some(reply.responder)));
    }

    fn sweep(&self, now: Instant) {
        for (sequence, probe) in self.pending.expire(now) {
            tracing::trace!(sequence, target_id = %probe.target, "probe timed out");
            self.deliver(timeout_result(sequence, probe));
        }
    }

    fn deliver(&self, (result, waiter): (PingResult, Option<oneshot::Sender<PingResult>>)) {
        match waiter {
            // The caller may have given up; nothing else wants the result
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => {
                if self.results.send(result).is_err() {
                    tracing::trace!("result stream has no consumer");
                }
            }
        }
    }
}

/// Timeout result for a probe removed by the sweep or on stop
pub fn timeout_result(
    sequence: u16,
    probe: PendingProbe,
) -> (PingResult, Option<oneshot::Sender<PingResult>>) {
    probe.into_result(sequence, PingStatus::Timeout, None, None)
}
