//! Subscription dispatch.
//!
//! Entries that share a role and a queue share one broker consumer. A router
//! task per consumer decodes each delivery, re-applies the binding rules to
//! find the entries it belongs to and hands it to their workers. Entries and
//! their workers outlive a connection; [`Dispatcher::restore`] re-declares and
//! re-binds them on the next one.

mod router;
mod worker;

pub(crate) use router::{Dispatched, Settle};
pub(crate) use worker::{invoke, spawn_subscription_worker, Invocation};

use crate::channel::{Channel, ChannelPool, QueueSpec};
use crate::domain::config::{ExchangeKind, Role};
use crate::domain::errors::{EventbusError, Result};
use crate::domain::routing::binding_matches;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// When a delivery is acknowledged to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckMode {
    /// Acked as soon as it is dispatched; handler failures are not redelivered.
    Auto,
    /// Acked when the handler returns `Ok`, rejected when it fails.
    Manual,
}

/// Per-subscription settings. Unset fields fall back to the QoS config.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub ack_mode: Option<AckMode>,
    pub prefetch: Option<u16>,
    /// Consume from this queue instead of the configured one.
    pub queue: Option<String>,
    /// Treat a handler that runs longer than this as failed.
    pub handler_timeout: Option<Duration>,
}

impl SubscribeOptions {
    #[must_use]
    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = Some(ack_mode);
        self
    }

    #[must_use]
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }
}

/// Identifies the consumer an entry is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct GroupKey {
    pub role: Role,
    pub queue: String,
}

/// Queue declaration and consumer settings for a group.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GroupSpec {
    pub queue: QueueSpec,
    pub prefetch: Option<u16>,
}

/// One subscription or provider: what it is bound to and where its
/// deliveries go. The handler itself lives in the worker behind `sink`.
#[derive(Debug)]
pub(crate) struct SubscriptionEntry {
    pub id: u64,
    pub exchange: String,
    pub pattern: String,
    pub kind: ExchangeKind,
    pub ack_mode: AckMode,
    pub sink: mpsc::UnboundedSender<Dispatched>,
}

impl SubscriptionEntry {
    fn matches(&self, exchange: &str, routing_key: &str) -> bool {
        self.exchange == exchange && binding_matches(self.kind, &self.pattern, routing_key)
    }

    fn same_binding(&self, other: &SubscriptionEntry) -> bool {
        self.exchange == other.exchange && self.pattern == other.pattern
    }
}

pub(crate) type Entries = Arc<RwLock<Vec<Arc<SubscriptionEntry>>>>;

/// Roles whose consumer channel the broker closed, in the order reported.
pub(crate) type LostConsumers = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Role>>>;

struct ActiveConsumer {
    channel: Arc<Channel>,
    tag: String,
}

struct Group {
    spec: GroupSpec,
    entries: Entries,
    consumer: Option<ActiveConsumer>,
}

impl Group {
    fn has_live_consumer(&self) -> bool {
        self.consumer
            .as_ref()
            .is_some_and(|consumer| consumer.channel.is_open())
    }
}

pub(crate) struct Dispatcher {
    runtime: Handle,
    durable: bool,
    groups: tokio::sync::Mutex<HashMap<GroupKey, Group>>,
    next_id: AtomicU64,
    lost_tx: mpsc::UnboundedSender<Role>,
    lost_rx: LostConsumers,
}

impl Dispatcher {
    pub(crate) fn new(runtime: Handle, durable: bool) -> Self {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        Self {
            runtime,
            durable,
            groups: tokio::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            lost_tx,
            lost_rx: Arc::new(tokio::sync::Mutex::new(lost_rx)),
        }
    }

    /// Reports consumer channels closed by the broker. Pass each role to
    /// [`Dispatcher::heal`].
    pub(crate) fn lost_consumers(&self) -> LostConsumers {
        self.lost_rx.clone()
    }

    pub(crate) fn next_entry_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Declare and bind `entry` on the current session and make sure its
    /// group has a consumer. The entry is routable before the consumer starts.
    pub(crate) async fn add(
        &self,
        pool: &ChannelPool,
        key: GroupKey,
        spec: GroupSpec,
        entry: Arc<SubscriptionEntry>,
    ) -> Result<()> {
        let bind_error = |e: &EventbusError| EventbusError::bind(&entry.exchange, &entry.pattern, e);
        let mut groups = self.groups.lock().await;
        let channel = pool.get(key.role).await.map_err(|e| bind_error(&e))?;

        let group = groups.entry(key.clone()).or_insert_with(|| Group {
            spec,
            entries: Arc::new(RwLock::new(Vec::new())),
            consumer: None,
        });
        group.entries.write().push(entry.clone());

        let attached = async {
            let needs_consumer = !group.has_live_consumer();
            if needs_consumer {
                channel.declare_queue(&key.queue, group.spec.queue).await?;
            }
            self.bind(&channel, &key.queue, &entry).await?;
            if needs_consumer {
                self.start_consumer(&key, group, channel.clone()).await?;
            }
            Ok::<_, EventbusError>(())
        }
        .await;

        if let Err(e) = attached {
            group.entries.write().retain(|other| other.id != entry.id);
            if group.entries.read().is_empty() && !group.has_live_consumer() {
                groups.remove(&key);
            }
            if !channel.is_open() {
                // The broker closed the shared channel; the other groups on it
                // lost their consumers too.
                self.heal_groups(pool, key.role, &mut groups).await;
            }
            return Err(bind_error(&e));
        }
        debug!(
            entry = entry.id,
            role = %key.role,
            queue = %key.queue,
            exchange = %entry.exchange,
            pattern = %entry.pattern,
            "Subscription attached"
        );
        Ok(())
    }

    /// Detach entry `id`. Its binding goes when no sibling shares it and the
    /// consumer goes with the last entry. Returns false for unknown entries.
    pub(crate) async fn remove(&self, pool: Option<&ChannelPool>, key: &GroupKey, id: u64) -> bool {
        let mut groups = self.groups.lock().await;
        let Some(group) = groups.get_mut(key) else {
            return false;
        };
        let removed = {
            let mut entries = group.entries.write();
            entries
                .iter()
                .position(|entry| entry.id == id)
                .map(|index| entries.remove(index))
        };
        let Some(entry) = removed else {
            return false;
        };
        let shared = group.entries.read().iter().any(|e| e.same_binding(&entry));
        let empty = group.entries.read().is_empty();

        if !shared {
            if let Some(channel) = pool.and_then(|pool| pool.peek(key.role)) {
                if let Err(e) = channel
                    .unbind_queue(&key.queue, &entry.exchange, &entry.pattern)
                    .await
                {
                    warn!(entry = id, error = %e, "Failed to unbind subscription");
                }
            }
        }
        if empty {
            if let Some(consumer) = group.consumer.take() {
                if consumer.channel.is_open() {
                    if let Err(e) = consumer.channel.cancel(&consumer.tag).await {
                        warn!(consumer_tag = %consumer.tag, error = %e, "Failed to cancel consumer");
                    }
                }
            }
            groups.remove(key);
        }
        debug!(entry = id, queue = %key.queue, "Subscription detached");
        true
    }

    /// Re-attach every group on a fresh session. Returns the number of groups
    /// that could not be restored.
    pub(crate) async fn restore(&self, pool: &ChannelPool) -> usize {
        let mut groups = self.groups.lock().await;
        let mut failures = 0;
        for (key, group) in groups.iter_mut() {
            group.consumer = None;
            if let Err(e) = self.reattach(pool, key, group).await {
                failures += 1;
                error!(
                    role = %key.role,
                    queue = %key.queue,
                    error = %e,
                    "Failed to restore subscriptions"
                );
            }
        }
        if !groups.is_empty() {
            debug!(groups = groups.len(), failures, "Subscriptions restored");
        }
        failures
    }

    /// Re-attach the groups on `role` whose consumer channel has closed while
    /// the session stayed up. Returns the number that could not be restored.
    pub(crate) async fn heal(&self, pool: &ChannelPool, role: Role) -> usize {
        let mut groups = self.groups.lock().await;
        self.heal_groups(pool, role, &mut groups).await
    }

    async fn heal_groups(
        &self,
        pool: &ChannelPool,
        role: Role,
        groups: &mut HashMap<GroupKey, Group>,
    ) -> usize {
        let mut failures = 0;
        for (key, group) in groups.iter_mut() {
            if key.role != role || group.has_live_consumer() {
                continue;
            }
            group.consumer = None;
            match self.reattach(pool, key, group).await {
                Ok(()) => debug!(role = %role, queue = %key.queue, "Consumer re-attached"),
                Err(e) => {
                    failures += 1;
                    warn!(role = %role, queue = %key.queue, error = %e, "Failed to re-attach consumer");
                }
            }
        }
        failures
    }

    async fn reattach(&self, pool: &ChannelPool, key: &GroupKey, group: &mut Group) -> Result<()> {
        let channel = pool.get(key.role).await?;
        channel.declare_queue(&key.queue, group.spec.queue).await?;
        let entries: Vec<_> = group.entries.read().clone();
        for (index, entry) in entries.iter().enumerate() {
            if entries[..index].iter().any(|e| e.same_binding(entry)) {
                continue;
            }
            self.bind(&channel, &key.queue, entry).await?;
        }
        self.start_consumer(key, group, channel).await
    }

    /// Drop every entry and cancel live consumers. Workers finish what they
    /// already received and stop.
    pub(crate) async fn shutdown(&self) {
        let mut groups = self.groups.lock().await;
        for (key, group) in groups.drain() {
            group.entries.write().clear();
            let Some(consumer) = group.consumer else {
                continue;
            };
            if consumer.channel.is_open() {
                if let Err(e) = consumer.channel.cancel(&consumer.tag).await {
                    debug!(queue = %key.queue, error = %e, "Consumer cancel during shutdown failed");
                }
            }
        }
    }

    pub(crate) async fn entry_count(&self) -> usize {
        self.groups
            .lock()
            .await
            .values()
            .map(|group| group.entries.read().len())
            .sum()
    }

    async fn bind(&self, channel: &Channel, queue: &str, entry: &SubscriptionEntry) -> Result<()> {
        channel
            .declare_exchange(&entry.exchange, entry.kind, self.durable)
            .await?;
        channel
            .bind_queue(queue, &entry.exchange, &entry.pattern)
            .await
    }

    async fn start_consumer(
        &self,
        key: &GroupKey,
        group: &mut Group,
        channel: Arc<Channel>,
    ) -> Result<()> {
        if let Some(prefetch) = group.spec.prefetch {
            channel.qos(prefetch).await?;
        }
        let (tag, deliveries) = channel.consume(&key.queue, false, false).await?;
        self.runtime.spawn(router::run(
            channel.clone(),
            deliveries,
            group.entries.clone(),
            self.lost_tx.clone(),
        ));
        group.consumer = Some(ActiveConsumer { channel, tag });
        Ok(())
    }
}

#[cfg(test)]
mod tests;
