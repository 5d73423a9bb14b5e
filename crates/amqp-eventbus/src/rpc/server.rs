//! Resource providers: answer RPC requests with correlated replies.

use crate::channel::Channel;
use crate::dispatch::{invoke, Dispatched, Invocation};
use crate::domain::codec;
use crate::domain::errors::{EventbusError, Result};
use crate::domain::message::Message;
use crate::ports::inbound::ResourceHandler;
use crate::protocol::BasicProperties;
use eventbus_telemetry::{metric_inc, HANDLER_FAILURES, RPC_REPLIES_SENT};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Start the worker for one provider. Unlike subscriptions, requests are
/// served concurrently; the rpc-server prefetch bounds how many are in flight.
pub(crate) fn spawn_provider_worker(
    runtime: &Handle,
    id: u64,
    routing_key: String,
    handler: Arc<dyn ResourceHandler>,
    limit: Option<Duration>,
) -> mpsc::UnboundedSender<Dispatched> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Dispatched>();
    let spawner = runtime.clone();
    runtime.spawn(async move {
        let routing_key: Arc<str> = Arc::from(routing_key);
        while let Some(request) = rx.recv().await {
            spawner.spawn(serve(
                id,
                routing_key.clone(),
                handler.clone(),
                limit,
                request,
            ));
        }
        debug!(provider = id, routing_key = %routing_key, "Provider worker stopped");
    });
    tx
}

async fn serve(
    id: u64,
    routing_key: Arc<str>,
    handler: Arc<dyn ResourceHandler>,
    limit: Option<Duration>,
    request: Dispatched,
) {
    let Dispatched {
        message,
        settle,
        channel,
    } = request;
    let reply_to = message.reply_to.clone();
    let template = Message {
        content_type: message.content_type.clone(),
        content_encoding: message.content_encoding,
        correlation_id: message.correlation_id.clone(),
        ..Message::default()
    };

    let outcome = invoke(handler.handle(message), limit).await;
    let cause = outcome.cause();
    let result = match outcome {
        Invocation::Completed(body) => Ok(body),
        Invocation::Failed(reason) => {
            warn!(provider = id, routing_key = %routing_key, error = %reason, "Resource handler failed");
            Err(reason)
        }
        Invocation::Panicked(reason) => {
            error!(provider = id, routing_key = %routing_key, panic = %reason, "Resource handler panicked");
            Err(format!("handler panicked: {reason}"))
        }
        Invocation::TimedOut(limit) => {
            warn!(provider = id, routing_key = %routing_key, ?limit, "Resource handler timed out");
            Err(format!("handler timed out after {limit:?}"))
        }
    };
    let (reply, status) = match result {
        Ok(body) => (Message { body, ..template }, "ok"),
        Err(reason) => {
            metric_inc!(HANDLER_FAILURES, &["provider", cause]);
            let marker = Message::error_reply(&reason);
            let reply = Message {
                body: marker.body,
                headers: marker.headers,
                ..template
            };
            (reply, "error")
        }
    };

    match reply_to {
        Some(reply_to) if !reply_to.is_empty() => {
            match publish_reply(&channel, &reply_to, reply).await {
                Ok(()) => metric_inc!(RPC_REPLIES_SENT, &[status]),
                Err(e) => {
                    warn!(provider = id, reply_to = %reply_to, error = %e, "Failed to publish reply")
                }
            }
        }
        _ => debug!(provider = id, routing_key = %routing_key, "Request has no reply_to, reply not sent"),
    }

    if let Some(settle) = settle {
        settle.finish(true);
    }
}

/// Publish on the default exchange to `reply_to`, waiting for the confirm
/// when the channel tracks them.
async fn publish_reply(channel: &Channel, reply_to: &str, reply: Message) -> Result<()> {
    let body = codec::encode(&reply.body, reply.content_encoding)?;
    let properties = BasicProperties::from_message(&reply);
    if let Some(confirm) = channel.publish("", reply_to, properties, body)? {
        confirm
            .await
            .map_err(|_| EventbusError::PublishAbandoned("confirm dropped".into()))??;
    }
    Ok(())
}
