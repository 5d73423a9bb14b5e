//! Pending RPC store.
//!
//! Maps correlation ids to callers waiting for a reply. Each id resolves at
//! most once: whichever of `complete`, `expire`, `cancel` or `fail_all`
//! removes the entry first decides the outcome.

use crate::domain::correlation::CorrelationId;
use crate::domain::errors::{EventbusError, Result};
use crate::domain::message::Message;
use dashmap::DashMap;
use eventbus_telemetry::{RPC_LATENCY, RPC_PENDING};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

/// Receives the reply (or failure) for one call.
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<Message>>;

struct PendingRpc {
    sender: oneshot::Sender<Result<Message>>,
    created_at: Instant,
    routing_key: String,
    reply_queue: String,
}

/// Counters for the pending store.
#[derive(Debug, Default)]
pub struct PendingStats {
    pub total_registered: AtomicU64,
    pub total_completed: AtomicU64,
    pub total_timeouts: AtomicU64,
    /// Calls dropped by their caller before a reply arrived.
    pub total_cancelled: AtomicU64,
    /// Calls failed in bulk, e.g. on connection loss.
    pub total_failed: AtomicU64,
}

#[derive(Default)]
pub(crate) struct PendingRpcStore {
    pending: DashMap<CorrelationId, PendingRpc>,
    stats: PendingStats,
}

impl PendingRpcStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a call whose reply will come back on `reply_queue` and get
    /// the receiver it will arrive on.
    pub(crate) fn register(
        &self,
        id: CorrelationId,
        routing_key: &str,
        reply_queue: &str,
    ) -> ReplyReceiver {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingRpc {
                sender: tx,
                created_at: Instant::now(),
                routing_key: routing_key.to_string(),
                reply_queue: reply_queue.to_string(),
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        RPC_PENDING.inc();
        debug!(correlation_id = %id, routing_key, "Registered pending rpc");
        rx
    }

    /// Resolve a call. Returns false when the id is unknown or already
    /// resolved.
    pub(crate) fn complete(&self, id: &CorrelationId, result: Result<Message>) -> bool {
        let Some((_, pending)) = self.pending.remove(id) else {
            return false;
        };
        RPC_PENDING.dec();
        let elapsed = pending.created_at.elapsed();
        RPC_LATENCY.observe(elapsed.as_secs_f64());
        match pending.sender.send(result) {
            Ok(()) => {
                self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %id,
                    routing_key = %pending.routing_key,
                    response_time_ms = elapsed.as_millis(),
                    "Completed pending rpc"
                );
                true
            }
            Err(_) => {
                self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %id, "Pending rpc receiver dropped");
                false
            }
        }
    }

    /// Forget a call whose deadline passed.
    pub(crate) fn expire(&self, id: &CorrelationId) -> bool {
        if self.pending.remove(id).is_some() {
            RPC_PENDING.dec();
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Forget a call its caller abandoned.
    pub(crate) fn cancel(&self, id: &CorrelationId) -> bool {
        if self.pending.remove(id).is_some() {
            RPC_PENDING.dec();
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Fail every outstanding call with `error`. Returns how many there were.
    pub(crate) fn fail_all(&self, error: &EventbusError) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| e.key().clone()).collect();
        self.fail(ids, error)
    }

    /// Fail the calls waiting for replies on `reply_queue`.
    pub(crate) fn fail_queue(&self, reply_queue: &str, error: &EventbusError) -> usize {
        let ids: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|e| e.value().reply_queue == reply_queue)
            .map(|e| e.key().clone())
            .collect();
        self.fail(ids, error)
    }

    fn fail(&self, ids: Vec<CorrelationId>, error: &EventbusError) -> usize {
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                RPC_PENDING.dec();
                let _ = pending.sender.send(Err(error.clone()));
                failed += 1;
            }
        }
        if failed > 0 {
            self.stats
                .total_failed
                .fetch_add(failed as u64, Ordering::Relaxed);
            debug!(failed, error = %error, "Failed pending rpcs");
        }
        failed
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    pub(crate) fn stats(&self) -> &PendingStats {
        &self.stats
    }
}
