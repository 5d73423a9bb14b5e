//! In-process AMQP 0-9-1 broker.
//!
//! Speaks the same wire codec as the client over `tokio::io::duplex` pipes.
//! Supports direct/topic/fanout/headers exchanges and the default exchange,
//! named and server-named queues, exclusive and auto-delete queues,
//! round-robin consumers with prefetch, acks/nacks with requeue, publisher
//! confirms (optionally batched or forced to nack), and fault injection:
//! refused dials, dropped, frozen or broker-closed connections.

use crate::domain::config::ExchangeKind;
use crate::domain::routing::topic_matches;
use crate::ports::outbound::AmqpStream;
use crate::protocol::methods::CLASS_BASIC;
use crate::protocol::reply_code::{
    ACCESS_REFUSED, CHANNEL_ERROR, COMMAND_INVALID, NOT_ALLOWED, NOT_FOUND, PRECONDITION_FAILED,
    RESOURCE_LOCKED, UNEXPECTED_FRAME,
};
use crate::protocol::{
    BasicProperties, ContentHeader, FieldTable, Frame, FrameCodec, Method, FRAME_OVERHEAD,
    PROTOCOL_HEADER,
};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type ServerStream = Framed<Box<dyn AmqpStream>, FrameCodec>;

const UNBOUNDED_CHUNK: usize = 128 * 1024;
const CONFIRM_FLUSH: Duration = Duration::from_millis(10);

/// A message as the broker received it from a publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

#[derive(Clone)]
pub(crate) struct Settings {
    pub(crate) users: HashMap<String, String>,
    pub(crate) vhosts: HashSet<String>,
    pub(crate) channel_max: u16,
    pub(crate) frame_max: u32,
    pub(crate) heartbeat: u16,
    pub(crate) confirm_batch: usize,
    pub(crate) nack_publishes: bool,
    pub(crate) tls: Option<TlsAcceptor>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            users: HashMap::from([("guest".to_string(), "guest".to_string())]),
            vhosts: HashSet::from(["/".to_string()]),
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 0,
            confirm_batch: 1,
            nack_publishes: false,
            tls: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct BrokerState {
    pub(crate) settings: Mutex<Settings>,
    core: Mutex<Core>,
    pub(crate) refuse: AtomicBool,
    next_conn: AtomicU64,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerRef>,
    cursor: usize,
    owner: Option<u64>,
    auto_delete: bool,
    had_consumer: bool,
}

#[derive(Clone)]
struct QueuedMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Bytes,
    redelivered: bool,
}

#[derive(Clone)]
struct ConsumerRef {
    conn: u64,
    channel: u16,
    tag: String,
    no_ack: bool,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: QueuedMessage,
}

struct PartialPublish {
    exchange: String,
    routing_key: String,
    header: Option<ContentHeader>,
    body: BytesMut,
}

#[derive(Default)]
struct ChanState {
    confirm: bool,
    publish_seq: u64,
    unconfirmed: usize,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    consumers: HashMap<String, String>,
    publish: Option<PartialPublish>,
}

struct ConnState {
    writer: mpsc::UnboundedSender<Vec<Frame>>,
    kill: CancellationToken,
    frozen: CancellationToken,
    chunk: usize,
    channels: HashMap<u16, ChanState>,
    closing: HashSet<u16>,
}

#[derive(Clone, Copy)]
struct ConfirmPolicy {
    batch: usize,
    nack: bool,
}

#[derive(Default)]
struct Core {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    connections: HashMap<u64, ConnState>,
    published: Vec<PublishedMessage>,
    generated: u64,
}

impl Core {
    fn send(&self, conn: u64, frames: Vec<Frame>) {
        if let Some(state) = self.connections.get(&conn) {
            let _ = state.writer.send(frames);
        }
    }

    fn reply(&self, conn: u64, channel: u16, method: Method) {
        self.send(conn, vec![Frame::Method(channel, method)]);
    }

    fn chan(&mut self, conn: u64, channel: u16) -> Option<&mut ChanState> {
        self.connections.get_mut(&conn)?.channels.get_mut(&channel)
    }

    /// Returns false when the connection must end.
    fn close_connection(&self, conn: u64, reply_code: u16, reply_text: String) -> bool {
        self.reply(
            conn,
            0,
            Method::ConnectionClose {
                reply_code,
                reply_text,
                class_id: 0,
                method_id: 0,
            },
        );
        false
    }

    fn close_channel(
        &mut self,
        conn: u64,
        channel: u16,
        reply_code: u16,
        reply_text: String,
        (class_id, method_id): (u16, u16),
    ) -> bool {
        self.reply(
            conn,
            channel,
            Method::ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            },
        );
        self.drop_channel(conn, channel);
        if let Some(state) = self.connections.get_mut(&conn) {
            state.closing.insert(channel);
        }
        true
    }

    /// Forget a channel: its consumers go away and unacked deliveries return
    /// to their queues.
    fn drop_channel(&mut self, conn: u64, channel: u16) {
        let Some(chan) = self
            .connections
            .get_mut(&conn)
            .and_then(|state| state.channels.remove(&channel))
        else {
            return;
        };
        let mut touched: HashSet<String> = HashSet::new();
        for (tag, queue) in chan.consumers {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.consumers.retain(|c| !(c.conn == conn && c.tag == tag));
            }
            touched.insert(queue);
        }
        for (_, unacked) in chan.unacked.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&unacked.queue) {
                q.ready.push_front(QueuedMessage {
                    redelivered: true,
                    ..unacked.message
                });
            }
            touched.insert(unacked.queue);
        }
        for queue in touched {
            self.reap_or_pump(&queue);
        }
    }

    fn disconnect(&mut self, conn: u64) {
        let channels: Vec<u16> = self
            .connections
            .get(&conn)
            .map(|state| state.channels.keys().copied().collect())
            .unwrap_or_default();
        for channel in channels {
            self.drop_channel(conn, channel);
        }
        self.connections.remove(&conn);
        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(conn))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in owned {
            self.delete_queue(&queue);
        }
    }

    fn delete_queue(&mut self, queue: &str) {
        self.queues.remove(queue);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != queue);
        }
    }

    fn reap_or_pump(&mut self, queue: &str) {
        let reap = self
            .queues
            .get(queue)
            .is_some_and(|q| q.auto_delete && q.had_consumer && q.consumers.is_empty());
        if reap {
            self.delete_queue(queue);
        } else {
            self.pump(queue);
        }
    }

    fn has_capacity(&self, consumer: &ConsumerRef) -> bool {
        let Some(state) = self.connections.get(&consumer.conn) else {
            return false;
        };
        let Some(chan) = state.channels.get(&consumer.channel) else {
            return false;
        };
        if consumer.no_ack || chan.prefetch == 0 {
            return true;
        }
        let held = chan
            .unacked
            .values()
            .filter(|u| u.consumer_tag == consumer.tag)
            .count();
        held < usize::from(chan.prefetch)
    }

    /// Hand ready messages to consumers round-robin while any has capacity.
    fn pump(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }
            let count = queue.consumers.len();
            let Some(index) = (0..count)
                .map(|i| (queue.cursor + i) % count)
                .find(|&i| self.has_capacity(&queue.consumers[i]))
            else {
                return;
            };

            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            let consumer = queue.consumers[index].clone();
            queue.cursor = index + 1;
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            self.deliver(queue_name, &consumer, message);
        }
    }

    fn deliver(&mut self, queue: &str, consumer: &ConsumerRef, message: QueuedMessage) {
        let Some(state) = self.connections.get_mut(&consumer.conn) else {
            return;
        };
        let chunk = state.chunk;
        let Some(chan) = state.channels.get_mut(&consumer.channel) else {
            return;
        };
        chan.next_tag += 1;
        let delivery_tag = chan.next_tag;
        let mut frames = vec![
            Frame::Method(
                consumer.channel,
                Method::BasicDeliver {
                    consumer_tag: consumer.tag.clone(),
                    delivery_tag,
                    redelivered: message.redelivered,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                },
            ),
            Frame::Header(
                consumer.channel,
                ContentHeader {
                    class_id: CLASS_BASIC,
                    body_size: message.body.len() as u64,
                    properties: message.properties.clone(),
                },
            ),
        ];
        let mut rest = message.body.clone();
        while !rest.is_empty() {
            let take = chunk.min(rest.len());
            frames.push(Frame::Body(consumer.channel, rest.split_to(take)));
        }
        if !consumer.no_ack {
            chan.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue.to_string(),
                    consumer_tag: consumer.tag.clone(),
                    message,
                },
            );
        }
        let _ = state.writer.send(frames);
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, String> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }
        let Some(target) = self.exchanges.get(exchange) else {
            return Err(format!("NOT_FOUND - no exchange '{exchange}' in vhost '/'"));
        };
        let mut queues: Vec<String> = Vec::new();
        for (queue, key) in &target.bindings {
            let hit = match target.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Topic => topic_matches(key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            };
            if hit && !queues.contains(queue) {
                queues.push(queue.clone());
            }
        }
        Ok(queues)
    }

    fn enqueue(&mut self, message: QueuedMessage, queues: &[String]) {
        for queue in queues {
            if let Some(q) = self.queues.get_mut(queue) {
                q.ready.push_back(message.clone());
            }
            self.pump(queue);
        }
    }

    fn method(&mut self, conn: u64, channel: u16, method: Method) -> bool {
        let Some(state) = self.connections.get_mut(&conn) else {
            return false;
        };
        if !state.channels.contains_key(&channel) {
            if state.closing.contains(&channel) {
                if matches!(method, Method::ChannelCloseOk) {
                    state.closing.remove(&channel);
                }
                return true;
            }
            if matches!(method, Method::ChannelOpen) {
                state.channels.insert(channel, ChanState::default());
                self.reply(conn, channel, Method::ChannelOpenOk);
                return true;
            }
            return self.close_connection(
                conn,
                CHANNEL_ERROR,
                format!("CHANNEL_ERROR - channel {channel} is not open"),
            );
        }

        let ids = method.ids();
        match method {
            Method::ChannelClose { .. } => {
                self.drop_channel(conn, channel);
                self.reply(conn, channel, Method::ChannelCloseOk);
            }
            Method::ChannelFlowOk { .. } => {}
            Method::ConfirmSelect { no_wait } => {
                if let Some(chan) = self.chan(conn, channel) {
                    chan.confirm = true;
                }
                if !no_wait {
                    self.reply(conn, channel, Method::ConfirmSelectOk);
                }
            }
            Method::BasicQos { prefetch_count, .. } => {
                if let Some(chan) = self.chan(conn, channel) {
                    chan.prefetch = prefetch_count;
                }
                self.reply(conn, channel, Method::BasicQosOk);
            }
            Method::ExchangeDeclare {
                exchange,
                kind,
                passive,
                ..
            } => {
                let Some(kind) = ExchangeKind::parse(&kind) else {
                    return self.close_connection(
                        conn,
                        COMMAND_INVALID,
                        format!("COMMAND_INVALID - unknown exchange type '{kind}'"),
                    );
                };
                match self.exchanges.get(&exchange) {
                    Some(existing) if existing.kind != kind => {
                        let text = format!(
                            "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{exchange}' \
                             in vhost '/': received '{}' but current is '{}'",
                            kind.as_str(),
                            existing.kind.as_str()
                        );
                        return self.close_channel(conn, channel, PRECONDITION_FAILED, text, ids);
                    }
                    Some(_) => {}
                    None if passive => {
                        let text = format!("NOT_FOUND - no exchange '{exchange}' in vhost '/'");
                        return self.close_channel(conn, channel, NOT_FOUND, text, ids);
                    }
                    None => {
                        self.exchanges.insert(
                            exchange,
                            Exchange {
                                kind,
                                bindings: Vec::new(),
                            },
                        );
                    }
                }
                self.reply(conn, channel, Method::ExchangeDeclareOk);
            }
            Method::QueueDeclare {
                queue,
                passive,
                exclusive,
                auto_delete,
                ..
            } => {
                let name = if queue.is_empty() {
                    self.generated += 1;
                    format!("amq.gen-{}", self.generated)
                } else {
                    queue
                };
                match self.queues.get(&name) {
                    Some(q) if q.owner.is_some_and(|owner| owner != conn) => {
                        let text = format!(
                            "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{name}'"
                        );
                        return self.close_channel(conn, channel, RESOURCE_LOCKED, text, ids);
                    }
                    Some(_) => {}
                    None if passive => {
                        let text = format!("NOT_FOUND - no queue '{name}' in vhost '/'");
                        return self.close_channel(conn, channel, NOT_FOUND, text, ids);
                    }
                    None => {
                        self.queues.insert(
                            name.clone(),
                            Queue {
                                owner: exclusive.then_some(conn),
                                auto_delete,
                                ..Queue::default()
                            },
                        );
                    }
                }
                let (message_count, consumer_count) = self
                    .queues
                    .get(&name)
                    .map(|q| (q.ready.len() as u32, q.consumers.len() as u32))
                    .unwrap_or_default();
                self.reply(
                    conn,
                    channel,
                    Method::QueueDeclareOk {
                        queue: name,
                        message_count,
                        consumer_count,
                    },
                );
            }
            Method::QueueBind {
                queue,
                exchange,
                routing_key,
                ..
            } => {
                if !self.queues.contains_key(&queue) {
                    let text = format!("NOT_FOUND - no queue '{queue}' in vhost '/'");
                    return self.close_channel(conn, channel, NOT_FOUND, text, ids);
                }
                let Some(target) = self.exchanges.get_mut(&exchange) else {
                    let text = format!("NOT_FOUND - no exchange '{exchange}' in vhost '/'");
                    return self.close_channel(conn, channel, NOT_FOUND, text, ids);
                };
                let binding = (queue, routing_key);
                if !target.bindings.contains(&binding) {
                    target.bindings.push(binding);
                }
                self.reply(conn, channel, Method::QueueBindOk);
            }
            Method::QueueUnbind {
                queue,
                exchange,
                routing_key,
                ..
            } => {
                let Some(target) = self.exchanges.get_mut(&exchange) else {
                    let text = format!("NOT_FOUND - no exchange '{exchange}' in vhost '/'");
                    return self.close_channel(conn, channel, NOT_FOUND, text, ids);
                };
                target
                    .bindings
                    .retain(|(q, key)| !(q == &queue && key == &routing_key));
                self.reply(conn, channel, Method::QueueUnbindOk);
            }
            Method::BasicConsume {
                queue,
                consumer_tag,
                no_ack,
                ..
            } => {
                let Some(q) = self.queues.get_mut(&queue) else {
                    let text = format!("NOT_FOUND - no queue '{queue}' in vhost '/'");
                    return self.close_channel(conn, channel, NOT_FOUND, text, ids);
                };
                if q.owner.is_some_and(|owner| owner != conn) {
                    let text = format!(
                        "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{queue}'"
                    );
                    return self.close_channel(conn, channel, RESOURCE_LOCKED, text, ids);
                }
                self.generated += 1;
                let tag = if consumer_tag.is_empty() {
                    format!("amq.ctag-{}", self.generated)
                } else {
                    consumer_tag
                };
                q.consumers.push(ConsumerRef {
                    conn,
                    channel,
                    tag: tag.clone(),
                    no_ack,
                });
                q.had_consumer = true;
                if let Some(chan) = self.chan(conn, channel) {
                    chan.consumers.insert(tag.clone(), queue.clone());
                }
                self.reply(conn, channel, Method::BasicConsumeOk { consumer_tag: tag });
                self.pump(&queue);
            }
            Method::BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                let queue = self
                    .chan(conn, channel)
                    .and_then(|chan| chan.consumers.remove(&consumer_tag));
                if let Some(queue) = queue {
                    if let Some(q) = self.queues.get_mut(&queue) {
                        q.consumers
                            .retain(|c| !(c.conn == conn && c.tag == consumer_tag));
                    }
                    if !no_wait {
                        self.reply(conn, channel, Method::BasicCancelOk { consumer_tag });
                    }
                    self.reap_or_pump(&queue);
                } else if !no_wait {
                    self.reply(conn, channel, Method::BasicCancelOk { consumer_tag });
                }
            }
            Method::BasicPublish {
                exchange,
                routing_key,
                ..
            } => {
                if let Some(chan) = self.chan(conn, channel) {
                    chan.publish = Some(PartialPublish {
                        exchange,
                        routing_key,
                        header: None,
                        body: BytesMut::new(),
                    });
                }
            }
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => return self.settle(conn, channel, delivery_tag, multiple, None, ids),
            Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => return self.settle(conn, channel, delivery_tag, multiple, Some(requeue), ids),
            Method::BasicReject {
                delivery_tag,
                requeue,
            } => return self.settle(conn, channel, delivery_tag, false, Some(requeue), ids),
            other => {
                return self.close_connection(
                    conn,
                    COMMAND_INVALID,
                    format!("COMMAND_INVALID - unexpected {}", other.name()),
                );
            }
        }
        true
    }

    fn settle(
        &mut self,
        conn: u64,
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: Option<bool>,
        ids: (u16, u16),
    ) -> bool {
        let Some(chan) = self.chan(conn, channel) else {
            return true;
        };
        let settled: Vec<Unacked> = if multiple {
            let upper = if delivery_tag == 0 { u64::MAX } else { delivery_tag };
            let tags: Vec<u64> = chan.unacked.range(..=upper).map(|(t, _)| *t).collect();
            tags.iter().filter_map(|t| chan.unacked.remove(t)).collect()
        } else {
            chan.unacked.remove(&delivery_tag).into_iter().collect()
        };
        if settled.is_empty() && !multiple {
            let text = format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}");
            return self.close_channel(conn, channel, PRECONDITION_FAILED, text, ids);
        }

        let mut touched: HashSet<String> = HashSet::new();
        for unacked in settled.into_iter().rev() {
            if requeue == Some(true) {
                if let Some(q) = self.queues.get_mut(&unacked.queue) {
                    q.ready.push_front(QueuedMessage {
                        redelivered: true,
                        ..unacked.message
                    });
                }
            }
            touched.insert(unacked.queue);
        }
        if let Some(chan) = self.chan(conn, channel) {
            touched.extend(chan.consumers.values().cloned());
        }
        for queue in touched {
            self.pump(&queue);
        }
        true
    }

    fn header(&mut self, conn: u64, channel: u16, header: ContentHeader, policy: ConfirmPolicy) -> bool {
        let complete = match self
            .chan(conn, channel)
            .and_then(|chan| chan.publish.as_mut())
        {
            Some(partial) if partial.header.is_none() => {
                let empty = header.body_size == 0;
                partial.header = Some(header);
                empty
            }
            _ => return self.unexpected_frame(conn, channel, "content header"),
        };
        if complete {
            self.finish_publish(conn, channel, policy);
        }
        true
    }

    fn body(&mut self, conn: u64, channel: u16, chunk: Bytes, policy: ConfirmPolicy) -> bool {
        let complete = match self
            .chan(conn, channel)
            .and_then(|chan| chan.publish.as_mut())
        {
            Some(PartialPublish {
                header: Some(header),
                body,
                ..
            }) => {
                body.extend_from_slice(&chunk);
                body.len() as u64 >= header.body_size
            }
            _ => return self.unexpected_frame(conn, channel, "content body"),
        };
        if complete {
            self.finish_publish(conn, channel, policy);
        }
        true
    }

    fn unexpected_frame(&self, conn: u64, channel: u16, what: &str) -> bool {
        self.close_connection(
            conn,
            UNEXPECTED_FRAME,
            format!("UNEXPECTED_FRAME - {what} on channel {channel}"),
        )
    }

    fn finish_publish(&mut self, conn: u64, channel: u16, policy: ConfirmPolicy) {
        let Some(PartialPublish {
            exchange,
            routing_key,
            header: Some(header),
            body,
        }) = self.chan(conn, channel).and_then(|chan| chan.publish.take())
        else {
            return;
        };
        let body = body.freeze();
        self.published.push(PublishedMessage {
            exchange: exchange.clone(),
            routing_key: routing_key.clone(),
            properties: header.properties.clone(),
            body: body.clone(),
        });

        let queues = match self.route(&exchange, &routing_key) {
            Ok(queues) => queues,
            Err(text) => {
                self.close_channel(conn, channel, NOT_FOUND, text, (CLASS_BASIC, 40));
                return;
            }
        };
        self.enqueue(
            QueuedMessage {
                exchange,
                routing_key,
                properties: header.properties,
                body,
                redelivered: false,
            },
            &queues,
        );

        let Some(chan) = self.chan(conn, channel) else {
            return;
        };
        if !chan.confirm {
            return;
        }
        chan.publish_seq += 1;
        let seq = chan.publish_seq;
        let confirm = if policy.nack {
            Some(Method::BasicNack {
                delivery_tag: seq,
                multiple: false,
                requeue: false,
            })
        } else if policy.batch > 1 {
            chan.unconfirmed += 1;
            if chan.unconfirmed >= policy.batch {
                chan.unconfirmed = 0;
                Some(Method::BasicAck {
                    delivery_tag: seq,
                    multiple: true,
                })
            } else {
                None
            }
        } else {
            Some(Method::BasicAck {
                delivery_tag: seq,
                multiple: false,
            })
        };
        if let Some(method) = confirm {
            self.reply(conn, channel, method);
        }
    }

    /// Ack whatever a batching policy is still holding back.
    fn flush_confirms(&mut self, conn: u64) {
        let Some(state) = self.connections.get_mut(&conn) else {
            return;
        };
        let mut frames = Vec::new();
        for (channel, chan) in state.channels.iter_mut() {
            if chan.unconfirmed > 0 {
                chan.unconfirmed = 0;
                frames.push(Frame::Method(
                    *channel,
                    Method::BasicAck {
                        delivery_tag: chan.publish_seq,
                        multiple: true,
                    },
                ));
            }
        }
        if !frames.is_empty() {
            let _ = state.writer.send(frames);
        }
    }
}

impl BrokerState {
    fn policy(&self) -> ConfirmPolicy {
        let settings = self.settings.lock();
        ConfirmPolicy {
            batch: settings.confirm_batch.max(1),
            nack: settings.nack_publishes,
        }
    }

    /// Returns false when the connection must end.
    fn handle_frame(&self, conn: u64, frame: Frame) -> bool {
        let policy = self.policy();
        let mut core = self.core.lock();
        match frame {
            Frame::Heartbeat => true,
            Frame::Method(0, Method::ConnectionClose { .. }) => {
                core.reply(conn, 0, Method::ConnectionCloseOk);
                false
            }
            Frame::Method(0, Method::ConnectionCloseOk) => false,
            Frame::Method(0, other) => core.close_connection(
                conn,
                COMMAND_INVALID,
                format!("COMMAND_INVALID - unexpected {} on channel 0", other.name()),
            ),
            Frame::Method(channel, method) => core.method(conn, channel, method),
            Frame::Header(channel, header) => core.header(conn, channel, header, policy),
            Frame::Body(channel, chunk) => core.body(conn, channel, chunk, policy),
        }
    }

    pub(crate) fn drop_connections(&self) {
        for state in self.core.lock().connections.values() {
            state.kill.cancel();
        }
    }

    pub(crate) fn freeze_connections(&self) {
        for state in self.core.lock().connections.values() {
            state.frozen.cancel();
        }
    }

    pub(crate) fn close_connections(&self, reply_code: u16, reply_text: &str) {
        let core = self.core.lock();
        for conn in core.connections.keys() {
            core.close_connection(*conn, reply_code, reply_text.to_string());
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.core.lock().connections.len()
    }

    pub(crate) fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&QueueView) -> T) -> Option<T> {
        let core = self.core.lock();
        let q = core.queues.get(queue)?;
        let unacked = core
            .connections
            .values()
            .flat_map(|state| state.channels.values())
            .flat_map(|chan| chan.unacked.values())
            .filter(|u| u.queue == queue)
            .count();
        Some(f(&QueueView {
            ready: q.ready.len(),
            unacked,
            consumers: q.consumers.len(),
        }))
    }

    pub(crate) fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.core.lock().exchanges.get(exchange).is_some_and(|ex| {
            ex.bindings
                .iter()
                .any(|(q, key)| q == queue && key == routing_key)
        })
    }

    pub(crate) fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.core.lock().exchanges.get(exchange).map(|ex| ex.kind)
    }

    pub(crate) fn published(&self) -> Vec<PublishedMessage> {
        self.core.lock().published.clone()
    }

    pub(crate) fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Bytes,
    ) -> usize {
        let mut core = self.core.lock();
        let Ok(queues) = core.route(exchange, routing_key) else {
            return 0;
        };
        core.enqueue(
            QueuedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties,
                body,
                redelivered: false,
            },
            &queues,
        );
        queues.len()
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Snapshot of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueView {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
}

async fn next_method(stream: &mut ServerStream) -> Option<Method> {
    loop {
        match stream.next().await? {
            Ok(Frame::Method(0, method)) => return Some(method),
            Ok(Frame::Heartbeat) => continue,
            _ => return None,
        }
    }
}

fn parse_plain(response: &[u8]) -> Option<(String, String)> {
    let mut parts = response.split(|b| *b == 0);
    let _authzid = parts.next()?;
    let user = std::str::from_utf8(parts.next()?).ok()?;
    let pass = std::str::from_utf8(parts.next()?).ok()?;
    Some((user.to_string(), pass.to_string()))
}

struct Accepted {
    stream: ServerStream,
    chunk: usize,
    heartbeat: Duration,
}

async fn accept(settings: &Settings, mut io: Box<dyn AmqpStream>) -> Option<Accepted> {
    let mut header = [0u8; 8];
    io.read_exact(&mut header).await.ok()?;
    if &header != PROTOCOL_HEADER {
        return None;
    }
    let mut stream = Framed::new(io, FrameCodec::new());
    stream
        .send(Frame::Method(
            0,
            Method::ConnectionStart {
                version_major: 0,
                version_minor: 9,
                server_properties: FieldTable::new(),
                mechanisms: "PLAIN AMQPLAIN".into(),
                locales: "en_US".into(),
            },
        ))
        .await
        .ok()?;

    let Method::ConnectionStartOk { response, .. } = next_method(&mut stream).await? else {
        return None;
    };
    let authorised = parse_plain(&response)
        .is_some_and(|(user, pass)| settings.users.get(&user) == Some(&pass));
    if !authorised {
        let _ = stream
            .send(Frame::Method(
                0,
                Method::ConnectionClose {
                    reply_code: ACCESS_REFUSED,
                    reply_text: "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN".into(),
                    class_id: 0,
                    method_id: 0,
                },
            ))
            .await;
        return None;
    }

    stream
        .send(Frame::Method(
            0,
            Method::ConnectionTune {
                channel_max: settings.channel_max,
                frame_max: settings.frame_max,
                heartbeat: settings.heartbeat,
            },
        ))
        .await
        .ok()?;
    let Method::ConnectionTuneOk {
        frame_max,
        heartbeat,
        ..
    } = next_method(&mut stream).await?
    else {
        return None;
    };
    stream.codec_mut().set_frame_max(frame_max);

    let Method::ConnectionOpen { virtual_host } = next_method(&mut stream).await? else {
        return None;
    };
    if !settings.vhosts.contains(&virtual_host) {
        let _ = stream
            .send(Frame::Method(
                0,
                Method::ConnectionClose {
                    reply_code: NOT_ALLOWED,
                    reply_text: format!("NOT_ALLOWED - vhost {virtual_host} not found"),
                    class_id: 10,
                    method_id: 40,
                },
            ))
            .await;
        return None;
    }
    stream
        .send(Frame::Method(0, Method::ConnectionOpenOk))
        .await
        .ok()?;

    let chunk = match frame_max {
        0 => UNBOUNDED_CHUNK,
        max => (max as usize).saturating_sub(FRAME_OVERHEAD).max(1),
    };
    Some(Accepted {
        stream,
        chunk,
        heartbeat: Duration::from_secs(u64::from(heartbeat)),
    })
}

/// Serve one client connection until it closes or is killed.
pub(crate) async fn serve(state: Arc<BrokerState>, io: DuplexStream) {
    let settings = state.settings.lock().clone();
    let io: Box<dyn AmqpStream> = match &settings.tls {
        Some(acceptor) => match acceptor.accept(io).await {
            Ok(tls) => Box::new(tls),
            Err(e) => {
                debug!(error = %e, "Mock broker TLS accept failed");
                return;
            }
        },
        None => Box::new(io),
    };
    let Some(accepted) = accept(&settings, io).await else {
        return;
    };

    let conn = state.next_connection_id();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    let frozen = CancellationToken::new();
    state.core.lock().connections.insert(
        conn,
        ConnState {
            writer: writer_tx,
            kill: kill.clone(),
            frozen: frozen.clone(),
            chunk: accepted.chunk,
            channels: HashMap::new(),
            closing: HashSet::new(),
        },
    );
    debug!(connection = conn, "Mock broker accepted connection");

    let (sink, mut stream) = accepted.stream.split();
    let writer = tokio::spawn(write_loop(
        sink,
        writer_rx,
        kill.clone(),
        frozen.clone(),
        accepted.heartbeat,
    ));

    let mut flush = tokio::time::interval(CONFIRM_FLUSH);
    loop {
        let frame = tokio::select! {
            biased;
            _ = kill.cancelled() => break,
            _ = frozen.cancelled() => {
                kill.cancelled().await;
                break;
            }
            _ = flush.tick() => {
                state.core.lock().flush_confirms(conn);
                continue;
            }
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => {
                if !state.handle_frame(conn, frame) {
                    break;
                }
            }
            Some(Err(_)) | None => break,
        }
    }

    state.core.lock().disconnect(conn);
    if kill.is_cancelled() {
        writer.abort();
    } else {
        let _ = writer.await;
    }
    debug!(connection = conn, "Mock broker connection ended");
}

async fn write_loop(
    mut sink: futures::stream::SplitSink<ServerStream, Frame>,
    mut rx: mpsc::UnboundedReceiver<Vec<Frame>>,
    kill: CancellationToken,
    frozen: CancellationToken,
    heartbeat: Duration,
) {
    let period = if heartbeat.is_zero() {
        Duration::from_secs(86_400)
    } else {
        heartbeat / 2
    };
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = kill.cancelled() => break,
            _ = frozen.cancelled() => {
                kill.cancelled().await;
                break;
            }
            batch = rx.recv() => {
                let Some(frames) = batch else { break };
                let mut failed = false;
                for frame in frames {
                    if sink.feed(frame).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed || sink.flush().await.is_err() {
                    break;
                }
            }
            _ = ticker.tick(), if !heartbeat.is_zero() => {
                if sink.send(Frame::Heartbeat).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}
