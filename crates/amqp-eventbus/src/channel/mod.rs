//! AMQP channels.
//!
//! A [`Channel`] owns one channel id on a [`Connection`]. Synchronous methods
//! (declare, bind, consume, ...) are serialised per channel; the channel task
//! reassembles content frames into deliveries, routes them to consumers and
//! feeds publisher confirms into the [`ConfirmTracker`].

pub(crate) mod confirms;
pub(crate) mod pool;

pub(crate) use confirms::{ConfirmReceiver, ConfirmTracker};
pub(crate) use pool::ChannelPool;

use crate::connection::Connection;
use crate::domain::config::{ExchangeKind, QoSConfig, Role};
use crate::domain::errors::{EventbusError, Result};
use crate::domain::message::DeliveryInfo;
use crate::protocol::methods::CLASS_BASIC;
use crate::protocol::reply_code::{REPLY_SUCCESS, UNEXPECTED_FRAME};
use crate::protocol::{BasicProperties, ContentHeader, FieldTable, Frame, Method};
use bytes::{Bytes, BytesMut};
use eventbus_telemetry::{metric_inc, MESSAGES_PUBLISHED};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a client-initiated close waits for channel.close-ok.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

static CONSUMER_TAGS: AtomicU64 = AtomicU64::new(1);

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub info: DeliveryInfo,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// Declaration flags for `queue.declare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueSpec {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Shared named queue.
    pub(crate) fn shared(durable: bool) -> Self {
        Self {
            durable,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Server-named private queue that disappears with its connection.
    pub(crate) fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

struct ConsumerSlot {
    sender: mpsc::UnboundedSender<Delivery>,
    no_ack: bool,
}

enum ContentKind {
    Deliver(DeliveryInfo),
    Return {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
}

struct PartialContent {
    kind: ContentKind,
    header: Option<ContentHeader>,
    body: BytesMut,
}

pub(crate) struct Channel {
    id: u16,
    role: Role,
    conn: Arc<Connection>,
    rpc_lock: tokio::sync::Mutex<()>,
    pending_reply: Mutex<Option<oneshot::Sender<Result<Method>>>>,
    consumers: Mutex<HashMap<String, ConsumerSlot>>,
    retired_no_ack: Mutex<HashSet<String>>,
    unacked: Mutex<BTreeSet<u64>>,
    confirms: ConfirmTracker,
    flow_active: AtomicBool,
    closed: CancellationToken,
    close_reason: OnceLock<EventbusError>,
}

impl Channel {
    /// Open a channel for `role`, enabling confirms and prefetch as the QoS
    /// configuration asks.
    pub(crate) async fn open(conn: &Arc<Connection>, role: Role, qos: &QoSConfig) -> Result<Arc<Self>> {
        let (id, frames) = conn.register_channel()?;
        let channel = Arc::new(Self {
            id,
            role,
            conn: conn.clone(),
            rpc_lock: tokio::sync::Mutex::new(()),
            pending_reply: Mutex::new(None),
            consumers: Mutex::new(HashMap::new()),
            retired_no_ack: Mutex::new(HashSet::new()),
            unacked: Mutex::new(BTreeSet::new()),
            confirms: ConfirmTracker::new(),
            flow_active: AtomicBool::new(true),
            closed: conn.shutdown_token().child_token(),
            close_reason: OnceLock::new(),
        });
        conn.runtime().spawn(channel.clone().run(frames));

        if let Err(e) = channel.handshake(qos).await {
            channel.shutdown(e.clone());
            return Err(e);
        }
        debug!(
            connection = conn.id(),
            channel = id,
            role = %role,
            confirms = channel.confirms.is_enabled(),
            "Channel opened"
        );
        Ok(channel)
    }

    async fn handshake(&self, qos: &QoSConfig) -> Result<()> {
        match self.call(Method::ChannelOpen).await? {
            Method::ChannelOpenOk => {}
            other => return Err(unexpected("channel.open-ok", &other)),
        }
        if qos.confirm_for(self.role) {
            match self.call(Method::ConfirmSelect { no_wait: false }).await? {
                Method::ConfirmSelectOk => self.confirms.enable(),
                other => return Err(unexpected("confirm.select-ok", &other)),
            }
        }
        if let Some(prefetch) = qos.prefetch_for(self.role) {
            self.qos(prefetch).await?;
        }
        Ok(())
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    pub(crate) fn confirms(&self) -> &ConfirmTracker {
        &self.confirms
    }

    /// Cancelled when the channel or its connection closes.
    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// True when the broker closed this channel and the connection is still up.
    pub(crate) fn closed_by_broker(&self) -> bool {
        !self.conn.is_closed()
            && matches!(
                self.close_reason.get(),
                Some(EventbusError::Channel { code, .. }) if *code != REPLY_SUCCESS
            )
    }

    /// Delivery tags handed out but not yet acked or nacked.
    pub(crate) fn outstanding_deliveries(&self) -> usize {
        self.unacked.lock().len()
    }

    /// Why the channel closed.
    pub(crate) fn closed_error(&self) -> EventbusError {
        match self.close_reason.get() {
            Some(reason) => reason.clone(),
            None if self.conn.is_closed() => self.conn.lost_error(),
            None => EventbusError::Channel {
                role: self.role,
                code: REPLY_SUCCESS,
                text: "channel closed".into(),
            },
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    /// Send a synchronous method and wait for its reply.
    async fn call(&self, method: Method) -> Result<Method> {
        let _serial = self.rpc_lock.lock().await;
        self.ensure_open()?;

        let (tx, rx) = oneshot::channel();
        *self.pending_reply.lock() = Some(tx);
        if let Err(e) = self.conn.send(vec![Frame::Method(self.id, method)]) {
            self.pending_reply.lock().take();
            return Err(e);
        }

        tokio::select! {
            biased;
            reply = rx => reply.unwrap_or_else(|_| Err(self.closed_error())),
            _ = self.closed.cancelled() => Err(self.closed_error()),
        }
    }

    pub(crate) async fn qos(&self, prefetch_count: u16) -> Result<()> {
        match self
            .call(Method::BasicQos {
                prefetch_size: 0,
                prefetch_count,
                global: false,
            })
            .await?
        {
            Method::BasicQosOk => Ok(()),
            other => Err(unexpected("basic.qos-ok", &other)),
        }
    }

    /// Declare `exchange`. The default exchange needs no declaration.
    pub(crate) async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<()> {
        if exchange.is_empty() {
            return Ok(());
        }
        match self
            .call(Method::ExchangeDeclare {
                exchange: exchange.to_string(),
                kind: kind.as_str().to_string(),
                passive: false,
                durable,
                auto_delete: false,
                internal: false,
                no_wait: false,
                arguments: FieldTable::new(),
            })
            .await?
        {
            Method::ExchangeDeclareOk => Ok(()),
            other => Err(unexpected("exchange.declare-ok", &other)),
        }
    }

    /// Declare a queue; an empty name asks the broker to generate one.
    /// Returns the queue's actual name.
    pub(crate) async fn declare_queue(&self, queue: &str, spec: QueueSpec) -> Result<String> {
        match self
            .call(Method::QueueDeclare {
                queue: queue.to_string(),
                passive: false,
                durable: spec.durable,
                exclusive: spec.exclusive,
                auto_delete: spec.auto_delete,
                no_wait: false,
                arguments: FieldTable::new(),
            })
            .await?
        {
            Method::QueueDeclareOk { queue, .. } => Ok(queue),
            other => Err(unexpected("queue.declare-ok", &other)),
        }
    }

    pub(crate) async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        match self
            .call(Method::QueueBind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                no_wait: false,
                arguments: FieldTable::new(),
            })
            .await?
        {
            Method::QueueBindOk => Ok(()),
            other => Err(unexpected("queue.bind-ok", &other)),
        }
    }

    pub(crate) async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        match self
            .call(Method::QueueUnbind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                arguments: FieldTable::new(),
            })
            .await?
        {
            Method::QueueUnbindOk => Ok(()),
            other => Err(unexpected("queue.unbind-ok", &other)),
        }
    }

    /// Start a consumer on `queue`. The consumer is registered before
    /// basic.consume goes out so no early delivery is lost.
    pub(crate) async fn consume(
        &self,
        queue: &str,
        no_ack: bool,
        exclusive: bool,
    ) -> Result<(String, mpsc::UnboundedReceiver<Delivery>)> {
        let tag = format!(
            "ctag-{}.{}",
            self.id,
            CONSUMER_TAGS.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers
            .lock()
            .insert(tag.clone(), ConsumerSlot { sender: tx, no_ack });

        let reply = self
            .call(Method::BasicConsume {
                queue: queue.to_string(),
                consumer_tag: tag.clone(),
                no_local: false,
                no_ack,
                exclusive,
                no_wait: false,
                arguments: FieldTable::new(),
            })
            .await;
        match reply {
            Ok(Method::BasicConsumeOk { .. }) => {
                debug!(channel = self.id, queue, consumer_tag = %tag, "Consumer started");
                Ok((tag, rx))
            }
            Ok(other) => {
                self.consumers.lock().remove(&tag);
                Err(unexpected("basic.consume-ok", &other))
            }
            Err(e) => {
                self.consumers.lock().remove(&tag);
                Err(e)
            }
        }
    }

    /// Cancel a consumer. Its delivery stream ends once the broker confirms.
    pub(crate) async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let reply = self
            .call(Method::BasicCancel {
                consumer_tag: consumer_tag.to_string(),
                no_wait: false,
            })
            .await;
        self.retire_consumer(consumer_tag);
        match reply? {
            Method::BasicCancelOk { .. } => Ok(()),
            other => Err(unexpected("basic.cancel-ok", &other)),
        }
    }

    /// Publish one message. Returns a confirm receiver when the channel is in
    /// confirm mode.
    pub(crate) fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<Option<ConfirmReceiver>> {
        self.ensure_open()?;
        if !self.flow_active.load(Ordering::Relaxed) {
            debug!(channel = self.id, "Publishing while broker flow control is active");
        }
        let chunk = self.conn.body_chunk_size();
        let mut frames = Vec::with_capacity(2 + body.len().div_ceil(chunk));
        frames.push(Frame::Method(
            self.id,
            Method::BasicPublish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                mandatory: false,
                immediate: false,
            },
        ));
        frames.push(Frame::Header(
            self.id,
            ContentHeader {
                class_id: CLASS_BASIC,
                body_size: body.len() as u64,
                properties,
            },
        ));
        let mut rest = body;
        while !rest.is_empty() {
            let take = chunk.min(rest.len());
            frames.push(Frame::Body(self.id, rest.split_to(take)));
        }

        let receiver = self.confirms.register_and(|| self.conn.send(frames))?;
        metric_inc!(MESSAGES_PUBLISHED, &[self.role.as_str()]);
        Ok(receiver)
    }

    pub(crate) fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.ensure_open()?;
        self.settle_tags(delivery_tag, multiple);
        self.conn.send(vec![Frame::Method(
            self.id,
            Method::BasicAck {
                delivery_tag,
                multiple,
            },
        )])
    }

    pub(crate) fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.settle_tags(delivery_tag, multiple);
        self.conn.send(vec![Frame::Method(
            self.id,
            Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            },
        )])
    }

    fn settle_tags(&self, delivery_tag: u64, multiple: bool) {
        let mut unacked = self.unacked.lock();
        if multiple {
            let rest = unacked.split_off(&delivery_tag.saturating_add(1));
            *unacked = rest;
        } else {
            unacked.remove(&delivery_tag);
        }
    }

    /// Close the channel politely. Idempotent.
    pub(crate) async fn close(&self) {
        if !self.is_open() {
            return;
        }
        let reply = tokio::time::timeout(
            CLOSE_TIMEOUT,
            self.call(Method::ChannelClose {
                reply_code: REPLY_SUCCESS,
                reply_text: "client closing".into(),
                class_id: 0,
                method_id: 0,
            }),
        )
        .await;
        if !matches!(reply, Ok(Ok(Method::ChannelCloseOk))) {
            debug!(channel = self.id, role = %self.role, "Channel close not acknowledged");
        }
        self.shutdown(EventbusError::Channel {
            role: self.role,
            code: REPLY_SUCCESS,
            text: "channel closed by client".into(),
        });
    }

    /// Record the close reason once and release everything bound to the
    /// channel: the pending reply, confirms, consumers and the channel id.
    fn shutdown(&self, reason: EventbusError) {
        if self.close_reason.set(reason.clone()).is_err() {
            return;
        }
        self.closed.cancel();
        if let Some(tx) = self.pending_reply.lock().take() {
            let _ = tx.send(Err(reason.clone()));
        }
        let abandoned = self.confirms.abandon(&reason.to_string());
        self.consumers.lock().clear();
        self.unacked.lock().clear();
        self.conn.release_channel(self.id);
        debug!(
            channel = self.id,
            role = %self.role,
            abandoned,
            reason = %reason,
            "Channel shut down"
        );
    }

    async fn run(self: Arc<Self>, mut frames: mpsc::UnboundedReceiver<Frame>) {
        let mut content: Option<PartialContent> = None;
        while let Some(frame) = frames.recv().await {
            let result = match frame {
                Frame::Method(_, method) if method.has_content() => {
                    if content.is_some() {
                        Err("content method while another content was in progress")
                    } else {
                        content = self.start_content(method);
                        Ok(())
                    }
                }
                Frame::Method(_, method) => {
                    if content.is_some() {
                        Err("method frame interrupted content")
                    } else {
                        self.handle_method(method);
                        Ok(())
                    }
                }
                Frame::Header(_, header) => match content.as_mut() {
                    Some(partial) if partial.header.is_none() => {
                        let empty = header.body_size == 0;
                        partial.header = Some(header);
                        if empty {
                            self.complete_content(content.take());
                        }
                        Ok(())
                    }
                    _ => Err("unexpected content header"),
                },
                Frame::Body(_, chunk) => match content.as_mut() {
                    Some(PartialContent {
                        header: Some(header),
                        body,
                        ..
                    }) => {
                        body.extend_from_slice(&chunk);
                        if body.len() as u64 >= header.body_size {
                            self.complete_content(content.take());
                        }
                        Ok(())
                    }
                    _ => Err("unexpected content body"),
                },
                Frame::Heartbeat => Ok(()),
            };

            if let Err(reason) = result {
                self.conn.fail(EventbusError::Protocol(format!(
                    "{UNEXPECTED_FRAME} {reason} on channel {}",
                    self.id
                )));
                break;
            }
            if !self.is_open() && self.close_reason.get().is_some() {
                break;
            }
        }
        self.shutdown(self.closed_error());
    }

    fn start_content(&self, method: Method) -> Option<PartialContent> {
        let kind = match method {
            Method::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => ContentKind::Deliver(DeliveryInfo {
                exchange,
                routing_key,
                delivery_tag,
                redelivered,
                consumer_tag,
            }),
            Method::BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => ContentKind::Return {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            },
            other => {
                warn!(channel = self.id, method = other.name(), "Unsupported content method");
                return None;
            }
        };
        Some(PartialContent {
            kind,
            header: None,
            body: BytesMut::new(),
        })
    }

    fn complete_content(&self, content: Option<PartialContent>) {
        let Some(PartialContent {
            kind,
            header: Some(header),
            body,
        }) = content
        else {
            return;
        };
        match kind {
            ContentKind::Deliver(info) => self.deliver(Delivery {
                info,
                properties: header.properties,
                body: body.freeze(),
            }),
            ContentKind::Return {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                warn!(
                    channel = self.id,
                    reply_code,
                    reply_text = %reply_text,
                    exchange = %exchange,
                    routing_key = %routing_key,
                    "Message returned by broker"
                );
            }
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let tag = delivery.info.delivery_tag;
        let requeue = {
            let consumers = self.consumers.lock();
            match consumers.get(&delivery.info.consumer_tag) {
                Some(slot) => {
                    if !slot.no_ack {
                        self.unacked.lock().insert(tag);
                    }
                    slot.sender.send(delivery).is_err() && !slot.no_ack
                }
                None => {
                    debug!(
                        channel = self.id,
                        consumer_tag = %delivery.info.consumer_tag,
                        "Delivery for cancelled consumer"
                    );
                    !self.retired_no_ack.lock().contains(&delivery.info.consumer_tag)
                }
            }
        };
        if requeue {
            let _ = self.nack(tag, false, true);
        }
    }

    fn retire_consumer(&self, consumer_tag: &str) {
        if let Some(slot) = self.consumers.lock().remove(consumer_tag) {
            if slot.no_ack {
                self.retired_no_ack.lock().insert(consumer_tag.to_string());
            }
        }
    }

    fn handle_method(&self, method: Method) {
        match method {
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => {
                self.confirms.ack(delivery_tag, multiple);
            }
            Method::BasicNack {
                delivery_tag,
                multiple,
                ..
            } => {
                self.confirms.nack(delivery_tag, multiple);
            }
            Method::ChannelClose {
                reply_code,
                reply_text,
                ..
            } => {
                let _ = self
                    .conn
                    .send(vec![Frame::Method(self.id, Method::ChannelCloseOk)]);
                warn!(
                    channel = self.id,
                    role = %self.role,
                    reply_code,
                    reply_text = %reply_text,
                    "Channel closed by broker"
                );
                self.shutdown(EventbusError::Channel {
                    role: self.role,
                    code: reply_code,
                    text: reply_text,
                });
            }
            Method::ChannelFlow { active } => {
                self.flow_active.store(active, Ordering::Relaxed);
                let _ = self
                    .conn
                    .send(vec![Frame::Method(self.id, Method::ChannelFlowOk { active })]);
            }
            Method::BasicCancel { consumer_tag, .. } => {
                warn!(channel = self.id, consumer_tag = %consumer_tag, "Consumer cancelled by broker");
                self.retire_consumer(&consumer_tag);
            }
            reply => match self.pending_reply.lock().take() {
                Some(tx) => {
                    let _ = tx.send(Ok(reply));
                }
                None => warn!(
                    channel = self.id,
                    method = reply.name(),
                    "Unsolicited method on channel"
                ),
            },
        }
    }
}

fn unexpected(expected: &str, got: &Method) -> EventbusError {
    EventbusError::Protocol(format!("expected {expected}, got {}", got.name()))
}
