//! Per-consumer routing task and delivery settlement.

use super::{AckMode, Entries};
use crate::channel::{Channel, Delivery};
use crate::domain::codec;
use crate::domain::config::Role;
use crate::domain::message::Message;
use eventbus_telemetry::{metric_inc, DELIVERIES_RECEIVED, HANDLER_FAILURES};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A decoded delivery on its way to one worker.
pub(crate) struct Dispatched {
    pub message: Message,
    /// Present when the worker decides the broker acknowledgement.
    pub settle: Option<Settle>,
    /// Channel the delivery arrived on.
    pub channel: Arc<Channel>,
}

/// Acknowledgement shared by every manual entry a delivery was routed to.
/// The broker hears about it once, after the last of them finishes.
struct PendingAck {
    channel: Arc<Channel>,
    delivery_tag: u64,
    remaining: AtomicUsize,
    rejected: AtomicBool,
    abandoned: AtomicBool,
}

impl PendingAck {
    fn finish(&self, outcome: Outcome) {
        match outcome {
            Outcome::Handled => {}
            Outcome::Rejected => self.rejected.store(true, Ordering::Release),
            Outcome::Abandoned => self.abandoned.store(true, Ordering::Release),
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let tag = self.delivery_tag;
        let result = if self.rejected.load(Ordering::Acquire) {
            self.channel.nack(tag, false, false)
        } else if self.abandoned.load(Ordering::Acquire) {
            self.channel.nack(tag, false, true)
        } else {
            self.channel.ack(tag, false)
        };
        if let Err(e) = result {
            debug!(delivery_tag = tag, error = %e, "Could not settle delivery");
        }
    }
}

enum Outcome {
    Handled,
    Rejected,
    Abandoned,
}

/// One worker's share of a [`PendingAck`]. Dropping it unfinished (the worker
/// went away before handling the delivery) requeues the delivery.
pub(crate) struct Settle {
    ack: Arc<PendingAck>,
    finished: bool,
}

impl Settle {
    pub(crate) fn finish(mut self, handled: bool) {
        self.finished = true;
        self.ack.finish(if handled {
            Outcome::Handled
        } else {
            Outcome::Rejected
        });
    }
}

impl Drop for Settle {
    fn drop(&mut self) {
        if !self.finished {
            self.ack.finish(Outcome::Abandoned);
        }
    }
}

fn failure_kind(role: Role) -> &'static str {
    match role {
        Role::RpcServer => "provider",
        _ => "subscription",
    }
}

pub(super) async fn run(
    channel: Arc<Channel>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    entries: Entries,
    lost: mpsc::UnboundedSender<Role>,
) {
    while let Some(delivery) = deliveries.recv().await {
        metric_inc!(DELIVERIES_RECEIVED, &[channel.role().as_str()]);
        dispatch(&channel, delivery, &entries);
    }
    debug!(channel = channel.id(), role = %channel.role(), "Consumer stream ended");
    if channel.closed_by_broker() {
        let _ = lost.send(channel.role());
    }
}

fn dispatch(channel: &Arc<Channel>, delivery: Delivery, entries: &Entries) {
    let tag = delivery.info.delivery_tag;
    let body = match codec::decode(&delivery.body, delivery.properties.encoding()) {
        Ok(body) => body,
        Err(e) => {
            warn!(
                channel = channel.id(),
                routing_key = %delivery.info.routing_key,
                error = %e,
                "Dropping undecodable delivery"
            );
            metric_inc!(HANDLER_FAILURES, &[failure_kind(channel.role()), "decode"]);
            let _ = channel.nack(tag, false, false);
            return;
        }
    };

    let (targets, detached) = {
        let entries = entries.read();
        let targets: Vec<_> = entries
            .iter()
            .filter(|entry| entry.matches(&delivery.info.exchange, &delivery.info.routing_key))
            .cloned()
            .collect();
        (targets, entries.is_empty())
    };
    if detached {
        // Group is being torn down; let another consumer have it.
        let _ = channel.nack(tag, false, true);
        return;
    }
    if targets.is_empty() {
        debug!(
            exchange = %delivery.info.exchange,
            routing_key = %delivery.info.routing_key,
            "No subscription matches delivery"
        );
        let _ = channel.ack(tag, false);
        return;
    }

    let message = delivery.properties.into_message(body, Some(delivery.info));
    let manual = targets
        .iter()
        .filter(|entry| entry.ack_mode == AckMode::Manual)
        .count();
    let pending = if manual == 0 {
        if let Err(e) = channel.ack(tag, false) {
            debug!(delivery_tag = tag, error = %e, "Auto-ack failed");
        }
        None
    } else {
        Some(Arc::new(PendingAck {
            channel: channel.clone(),
            delivery_tag: tag,
            remaining: AtomicUsize::new(manual),
            rejected: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
        }))
    };

    for entry in targets {
        let settle = match (entry.ack_mode, &pending) {
            (AckMode::Manual, Some(ack)) => Some(Settle {
                ack: ack.clone(),
                finished: false,
            }),
            _ => None,
        };
        let dispatched = Dispatched {
            message: message.clone(),
            settle,
            channel: channel.clone(),
        };
        if entry.sink.send(dispatched).is_err() {
            debug!(entry = entry.id, "Worker gone, delivery not dispatched");
        }
    }
}
