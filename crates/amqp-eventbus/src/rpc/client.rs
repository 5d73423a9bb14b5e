//! RPC client: correlation, reply queue and call deadlines.

use super::pending::{PendingRpcStore, ReplyReceiver};
use crate::channel::{Channel, Delivery, QueueSpec};
use crate::domain::codec;
use crate::domain::config::Role;
use crate::domain::correlation::{CorrelationId, CorrelationIdGenerator};
use crate::domain::errors::{EventbusError, Result};
use crate::domain::message::Message;
use crate::protocol::reply_code::CHANNEL_ERROR;
use async_trait::async_trait;
use eventbus_telemetry::{metric_inc, RPC_CALLS};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const REGISTER_ATTEMPTS: usize = 2;

/// A reply queue and the signal that replies can no longer arrive on it.
#[derive(Debug, Clone)]
pub(crate) struct ReplyRoute {
    pub queue: String,
    pub closed: CancellationToken,
}

/// Where a call's request goes out and its reply comes back. The eventbus
/// session implements it on top of the rpc-client channel.
#[async_trait]
pub(crate) trait RequestPath: Send + Sync {
    /// Queue replies should be sent to, created on first use.
    async fn reply_address(&self) -> Result<ReplyRoute>;

    /// Publish the request, waiting for the broker confirm when the channel
    /// tracks them.
    async fn send_request(&self, exchange: &str, routing_key: &str, request: Message) -> Result<()>;
}

/// Removes the pending entry if the caller's future is dropped mid-call.
struct CallGuard<'a> {
    store: &'a PendingRpcStore,
    id: CorrelationId,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.store.cancel(&self.id);
    }
}

pub(crate) struct RpcClient {
    ids: CorrelationIdGenerator,
    pending: Arc<PendingRpcStore>,
    auto_ack: bool,
    disposed: CancellationToken,
}

impl RpcClient {
    /// `auto_ack` makes the reply consumer use broker-side acknowledgement.
    /// Calls still waiting when `disposed` fires are cancelled.
    pub(crate) fn new(auto_ack: bool, disposed: CancellationToken) -> Self {
        Self {
            ids: CorrelationIdGenerator::new(),
            pending: Arc::new(PendingRpcStore::new()),
            auto_ack,
            disposed,
        }
    }

    pub(crate) fn pending(&self) -> &Arc<PendingRpcStore> {
        &self.pending
    }

    /// Send `request` and wait for the correlated reply. `timeout` bounds the
    /// whole round trip; `None` waits until a reply arrives, the reply queue
    /// goes away or the bus is disposed.
    pub(crate) async fn call(
        &self,
        path: &dyn RequestPath,
        exchange: &str,
        routing_key: &str,
        request: Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let id = self.ids.next_id();
        let _guard = CallGuard {
            store: &self.pending,
            id: id.clone(),
        };

        let round_trip = async {
            let (route, reply) = self.register(path, &id, routing_key).await?;
            let request = request
                .with_correlation_id(id.as_str())
                .with_reply_to(route.queue);
            path.send_request(exchange, routing_key, request).await?;
            reply
                .await
                .map_err(|_| EventbusError::RpcCancelled("pending call dropped".into()))?
        };
        let bounded = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, round_trip).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        self.pending.expire(&id);
                        Err(EventbusError::RpcTimeout(limit))
                    }
                },
                None => round_trip.await,
            }
        };
        let outcome = tokio::select! {
            biased;
            outcome = bounded => outcome,
            _ = self.disposed.cancelled() => {
                Err(EventbusError::RpcCancelled("eventbus disposed".into()))
            }
        };

        let label = match &outcome {
            Ok(_) => "ok",
            Err(EventbusError::RpcTimeout(_)) => "timeout",
            Err(e) if e.is_cancellation() => "cancelled",
            Err(_) => "failed",
        };
        metric_inc!(RPC_CALLS, &[label]);
        if let Err(e) = &outcome {
            debug!(correlation_id = %id, exchange, routing_key, error = %e, "RPC call failed");
        }
        outcome
    }

    /// Register `id` against an open reply queue. A queue that closes while
    /// the entry is being added may already have failed its callers, so the
    /// entry moves to the queue that replaces it.
    async fn register(
        &self,
        path: &dyn RequestPath,
        id: &CorrelationId,
        routing_key: &str,
    ) -> Result<(ReplyRoute, ReplyReceiver)> {
        for _ in 0..REGISTER_ATTEMPTS {
            let route = path.reply_address().await?;
            let reply = self.pending.register(id.clone(), routing_key, &route.queue);
            if !route.closed.is_cancelled() {
                return Ok((route, reply));
            }
            self.pending.cancel(id);
        }
        Err(EventbusError::Channel {
            role: Role::RpcClient,
            code: CHANNEL_ERROR,
            text: "reply queue closed".into(),
        })
    }

    /// Declare a private reply queue on `channel` and start its listener.
    /// The route's token fires once the listener stops.
    pub(crate) async fn open_reply_queue(
        &self,
        channel: &Arc<Channel>,
        runtime: &Handle,
    ) -> Result<ReplyRoute> {
        let queue = channel.declare_queue("", QueueSpec::private()).await?;
        let (tag, replies) = channel.consume(&queue, self.auto_ack, true).await?;
        let route = ReplyRoute {
            queue,
            closed: channel.closed_token().child_token(),
        };
        runtime.spawn(listen(
            channel.clone(),
            route.clone(),
            replies,
            self.pending.clone(),
            self.auto_ack,
        ));
        debug!(channel = channel.id(), queue = %route.queue, consumer_tag = %tag, "Reply queue ready");
        Ok(route)
    }
}

async fn listen(
    channel: Arc<Channel>,
    route: ReplyRoute,
    mut replies: mpsc::UnboundedReceiver<Delivery>,
    pending: Arc<PendingRpcStore>,
    auto_ack: bool,
) {
    while let Some(delivery) = replies.recv().await {
        if !auto_ack {
            if let Err(e) = channel.ack(delivery.info.delivery_tag, false) {
                debug!(error = %e, "Could not ack reply");
            }
        }
        resolve(&pending, delivery);
    }
    route.closed.cancel();
    let error = if channel.is_open() {
        EventbusError::Channel {
            role: Role::RpcClient,
            code: CHANNEL_ERROR,
            text: "reply consumer cancelled".into(),
        }
    } else {
        channel.closed_error()
    };
    let failed = pending.fail_queue(&route.queue, &error);
    debug!(channel = channel.id(), queue = %route.queue, failed, "Reply consumer stopped");
}

fn resolve(pending: &PendingRpcStore, delivery: Delivery) {
    let Some(id) = delivery
        .properties
        .correlation_id
        .as_deref()
        .map(CorrelationId::from_wire)
    else {
        warn!(routing_key = %delivery.info.routing_key, "Dropping reply without correlation id");
        return;
    };
    if !pending.is_pending(&id) {
        debug!(correlation_id = %id, "Dropping reply for unknown or expired call");
        return;
    }
    let result = codec::decode(&delivery.body, delivery.properties.encoding())
        .map(|body| delivery.properties.into_message(body, Some(delivery.info)))
        .map_err(EventbusError::from);
    pending.complete(&id, result);
}
