//! Publisher confirm tracking for one channel.
//!
//! Sequence numbers start at 1 and are assigned in the same critical section
//! that queues the publish frames, so the broker numbers deliveries exactly
//! as the tracker does.

use crate::domain::errors::{EventbusError, Result};
use eventbus_telemetry::{metric_inc, PUBLISH_CONFIRMS};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use tracing::debug;

/// Resolves once the broker acks (`Ok`) or nacks (`PublishRejected`) the
/// publish, or the channel goes away (`PublishAbandoned`).
pub(crate) type ConfirmReceiver = oneshot::Receiver<Result<()>>;

#[derive(Default)]
struct TrackerState {
    enabled: bool,
    next_seq: u64,
    pending: BTreeMap<u64, oneshot::Sender<Result<()>>>,
    closed: Option<EventbusError>,
}

#[derive(Default)]
pub(crate) struct ConfirmTracker {
    state: Mutex<TrackerState>,
}

impl ConfirmTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Switch the channel into confirm mode (after confirm.select-ok).
    pub(crate) fn enable(&self) {
        let mut state = self.state.lock();
        state.enabled = true;
        state.next_seq = 1;
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Run `send` under the tracker lock. In confirm mode the publish gets the
    /// next sequence number and a receiver for its outcome; otherwise `None`.
    pub(crate) fn register_and<F>(&self, send: F) -> Result<Option<ConfirmReceiver>>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        if !state.enabled {
            send()?;
            return Ok(None);
        }
        send()?;
        let seq = state.next_seq;
        state.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(seq, tx);
        Ok(Some(rx))
    }

    pub(crate) fn ack(&self, delivery_tag: u64, multiple: bool) -> usize {
        let resolved = self.resolve(delivery_tag, multiple, Ok(()));
        PUBLISH_CONFIRMS
            .with_label_values(&["ack"])
            .inc_by(resolved as f64);
        resolved
    }

    pub(crate) fn nack(&self, delivery_tag: u64, multiple: bool) -> usize {
        let resolved = self.resolve(delivery_tag, multiple, Err(EventbusError::PublishRejected));
        PUBLISH_CONFIRMS
            .with_label_values(&["nack"])
            .inc_by(resolved as f64);
        resolved
    }

    fn resolve(&self, delivery_tag: u64, multiple: bool, outcome: Result<()>) -> usize {
        let done = {
            let mut state = self.state.lock();
            if multiple {
                let rest = state.pending.split_off(&delivery_tag.saturating_add(1));
                std::mem::replace(&mut state.pending, rest)
            } else {
                state
                    .pending
                    .remove(&delivery_tag)
                    .map(|tx| BTreeMap::from([(delivery_tag, tx)]))
                    .unwrap_or_default()
            }
        };
        if done.is_empty() {
            debug!(delivery_tag, multiple, "Confirm for unknown sequence number");
        }
        let count = done.len();
        for (_, tx) in done {
            let _ = tx.send(outcome.clone());
        }
        count
    }

    /// Fail every outstanding publish and refuse new ones.
    pub(crate) fn abandon(&self, reason: &str) -> usize {
        let pending = {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(EventbusError::PublishAbandoned(reason.to_string()));
            }
            std::mem::take(&mut state.pending)
        };
        let count = pending.len();
        for (_, tx) in pending {
            metric_inc!(PUBLISH_CONFIRMS, &["abandoned"]);
            let _ = tx.send(Err(EventbusError::PublishAbandoned(reason.to_string())));
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}
