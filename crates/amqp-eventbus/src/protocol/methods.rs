//! AMQP 0-9-1 methods used by the eventbus (and by the in-process broker).

use super::types::{
    read_bits, read_long_bytes, read_long_str, read_short_str, read_table, read_u16, read_u32,
    read_u64, read_u8, write_bits, write_long_bytes, write_short_str, write_table, FieldTable,
};
use super::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;
pub const CLASS_EXCHANGE: u16 = 40;
pub const CLASS_QUEUE: u16 = 50;
pub const CLASS_BASIC: u16 = 60;
pub const CLASS_CONFIRM: u16 = 85;

/// A decoded method frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: String,
        locales: String,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: Bytes,
        locale: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,
    ConnectionBlocked {
        reason: String,
    },
    ConnectionUnblocked,
    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,
    ExchangeDeclare {
        exchange: String,
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeDeclareOk,
    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueBindOk,
    QueueUnbind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    QueueUnbindOk,
    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
        no_wait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicReturn {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    ConfirmSelect {
        no_wait: bool,
    },
    ConfirmSelectOk,
}

impl Method {
    /// `(class-id, method-id)` pair.
    pub fn ids(&self) -> (u16, u16) {
        use Method::*;
        match self {
            ConnectionStart { .. } => (CLASS_CONNECTION, 10),
            ConnectionStartOk { .. } => (CLASS_CONNECTION, 11),
            ConnectionTune { .. } => (CLASS_CONNECTION, 30),
            ConnectionTuneOk { .. } => (CLASS_CONNECTION, 31),
            ConnectionOpen { .. } => (CLASS_CONNECTION, 40),
            ConnectionOpenOk => (CLASS_CONNECTION, 41),
            ConnectionClose { .. } => (CLASS_CONNECTION, 50),
            ConnectionCloseOk => (CLASS_CONNECTION, 51),
            ConnectionBlocked { .. } => (CLASS_CONNECTION, 60),
            ConnectionUnblocked => (CLASS_CONNECTION, 61),
            ChannelOpen => (CLASS_CHANNEL, 10),
            ChannelOpenOk => (CLASS_CHANNEL, 11),
            ChannelFlow { .. } => (CLASS_CHANNEL, 20),
            ChannelFlowOk { .. } => (CLASS_CHANNEL, 21),
            ChannelClose { .. } => (CLASS_CHANNEL, 40),
            ChannelCloseOk => (CLASS_CHANNEL, 41),
            ExchangeDeclare { .. } => (CLASS_EXCHANGE, 10),
            ExchangeDeclareOk => (CLASS_EXCHANGE, 11),
            QueueDeclare { .. } => (CLASS_QUEUE, 10),
            QueueDeclareOk { .. } => (CLASS_QUEUE, 11),
            QueueBind { .. } => (CLASS_QUEUE, 20),
            QueueBindOk => (CLASS_QUEUE, 21),
            QueueUnbind { .. } => (CLASS_QUEUE, 50),
            QueueUnbindOk => (CLASS_QUEUE, 51),
            BasicQos { .. } => (CLASS_BASIC, 10),
            BasicQosOk => (CLASS_BASIC, 11),
            BasicConsume { .. } => (CLASS_BASIC, 20),
            BasicConsumeOk { .. } => (CLASS_BASIC, 21),
            BasicCancel { .. } => (CLASS_BASIC, 30),
            BasicCancelOk { .. } => (CLASS_BASIC, 31),
            BasicPublish { .. } => (CLASS_BASIC, 40),
            BasicReturn { .. } => (CLASS_BASIC, 50),
            BasicDeliver { .. } => (CLASS_BASIC, 60),
            BasicAck { .. } => (CLASS_BASIC, 80),
            BasicReject { .. } => (CLASS_BASIC, 90),
            BasicNack { .. } => (CLASS_BASIC, 120),
            ConfirmSelect { .. } => (CLASS_CONFIRM, 10),
            ConfirmSelectOk => (CLASS_CONFIRM, 11),
        }
    }

    /// Methods followed by a content header and body frames.
    pub fn has_content(&self) -> bool {
        matches!(
            self,
            Method::BasicPublish { .. } | Method::BasicReturn { .. } | Method::BasicDeliver { .. }
        )
    }

    /// Human-readable `class.method` name for logs and close reasons.
    pub fn name(&self) -> &'static str {
        use Method::*;
        match self {
            ConnectionStart { .. } => "connection.start",
            ConnectionStartOk { .. } => "connection.start-ok",
            ConnectionTune { .. } => "connection.tune",
            ConnectionTuneOk { .. } => "connection.tune-ok",
            ConnectionOpen { .. } => "connection.open",
            ConnectionOpenOk => "connection.open-ok",
            ConnectionClose { .. } => "connection.close",
            ConnectionCloseOk => "connection.close-ok",
            ConnectionBlocked { .. } => "connection.blocked",
            ConnectionUnblocked => "connection.unblocked",
            ChannelOpen => "channel.open",
            ChannelOpenOk => "channel.open-ok",
            ChannelFlow { .. } => "channel.flow",
            ChannelFlowOk { .. } => "channel.flow-ok",
            ChannelClose { .. } => "channel.close",
            ChannelCloseOk => "channel.close-ok",
            ExchangeDeclare { .. } => "exchange.declare",
            ExchangeDeclareOk => "exchange.declare-ok",
            QueueDeclare { .. } => "queue.declare",
            QueueDeclareOk { .. } => "queue.declare-ok",
            QueueBind { .. } => "queue.bind",
            QueueBindOk => "queue.bind-ok",
            QueueUnbind { .. } => "queue.unbind",
            QueueUnbindOk => "queue.unbind-ok",
            BasicQos { .. } => "basic.qos",
            BasicQosOk => "basic.qos-ok",
            BasicConsume { .. } => "basic.consume",
            BasicConsumeOk { .. } => "basic.consume-ok",
            BasicCancel { .. } => "basic.cancel",
            BasicCancelOk { .. } => "basic.cancel-ok",
            BasicPublish { .. } => "basic.publish",
            BasicReturn { .. } => "basic.return",
            BasicDeliver { .. } => "basic.deliver",
            BasicAck { .. } => "basic.ack",
            BasicReject { .. } => "basic.reject",
            BasicNack { .. } => "basic.nack",
            ConfirmSelect { .. } => "confirm.select",
            ConfirmSelectOk => "confirm.select-ok",
        }
    }

    /// Encode the method payload (class id, method id and arguments).
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        use Method::*;
        let (class_id, method_id) = self.ids();
        buf.put_u16(class_id);
        buf.put_u16(method_id);
        match self {
            ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                locales,
            } => {
                buf.put_u8(*version_major);
                buf.put_u8(*version_minor);
                write_table(buf, server_properties)?;
                write_long_bytes(buf, mechanisms.as_bytes())?;
                write_long_bytes(buf, locales.as_bytes())?;
            }
            ConnectionStartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                write_table(buf, client_properties)?;
                write_short_str(buf, mechanism)?;
                write_long_bytes(buf, response)?;
                write_short_str(buf, locale)?;
            }
            ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }
            | ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                buf.put_u16(*channel_max);
                buf.put_u32(*frame_max);
                buf.put_u16(*heartbeat);
            }
            ConnectionOpen { virtual_host } => {
                write_short_str(buf, virtual_host)?;
                write_short_str(buf, "")?;
                write_bits(buf, &[false]);
            }
            ConnectionOpenOk => write_short_str(buf, "")?,
            ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
            | ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                buf.put_u16(*reply_code);
                write_short_str(buf, reply_text)?;
                buf.put_u16(*class_id);
                buf.put_u16(*method_id);
            }
            ConnectionBlocked { reason } => write_short_str(buf, reason)?,
            ConnectionCloseOk | ConnectionUnblocked | ChannelCloseOk | ExchangeDeclareOk
            | QueueBindOk | QueueUnbindOk | BasicQosOk | ConfirmSelectOk => {}
            ChannelOpen => write_short_str(buf, "")?,
            ChannelOpenOk => write_long_bytes(buf, b"")?,
            ChannelFlow { active } | ChannelFlowOk { active } => write_bits(buf, &[*active]),
            ExchangeDeclare {
                exchange,
                kind,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
                arguments,
            } => {
                buf.put_u16(0);
                write_short_str(buf, exchange)?;
                write_short_str(buf, kind)?;
                write_bits(buf, &[*passive, *durable, *auto_delete, *internal, *no_wait]);
                write_table(buf, arguments)?;
            }
            QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments,
            } => {
                buf.put_u16(0);
                write_short_str(buf, queue)?;
                write_bits(buf, &[*passive, *durable, *exclusive, *auto_delete, *no_wait]);
                write_table(buf, arguments)?;
            }
            QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            } => {
                write_short_str(buf, queue)?;
                buf.put_u32(*message_count);
                buf.put_u32(*consumer_count);
            }
            QueueBind {
                queue,
                exchange,
                routing_key,
                no_wait,
                arguments,
            } => {
                buf.put_u16(0);
                write_short_str(buf, queue)?;
                write_short_str(buf, exchange)?;
                write_short_str(buf, routing_key)?;
                write_bits(buf, &[*no_wait]);
                write_table(buf, arguments)?;
            }
            QueueUnbind {
                queue,
                exchange,
                routing_key,
                arguments,
            } => {
                buf.put_u16(0);
                write_short_str(buf, queue)?;
                write_short_str(buf, exchange)?;
                write_short_str(buf, routing_key)?;
                write_table(buf, arguments)?;
            }
            BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            } => {
                buf.put_u32(*prefetch_size);
                buf.put_u16(*prefetch_count);
                write_bits(buf, &[*global]);
            }
            BasicConsume {
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
                arguments,
            } => {
                buf.put_u16(0);
                write_short_str(buf, queue)?;
                write_short_str(buf, consumer_tag)?;
                write_bits(buf, &[*no_local, *no_ack, *exclusive, *no_wait]);
                write_table(buf, arguments)?;
            }
            BasicConsumeOk { consumer_tag } | BasicCancelOk { consumer_tag } => {
                write_short_str(buf, consumer_tag)?;
            }
            BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                write_short_str(buf, consumer_tag)?;
                write_bits(buf, &[*no_wait]);
            }
            BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
            } => {
                buf.put_u16(0);
                write_short_str(buf, exchange)?;
                write_short_str(buf, routing_key)?;
                write_bits(buf, &[*mandatory, *immediate]);
            }
            BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                buf.put_u16(*reply_code);
                write_short_str(buf, reply_text)?;
                write_short_str(buf, exchange)?;
                write_short_str(buf, routing_key)?;
            }
            BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                write_short_str(buf, consumer_tag)?;
                buf.put_u64(*delivery_tag);
                write_bits(buf, &[*redelivered]);
                write_short_str(buf, exchange)?;
                write_short_str(buf, routing_key)?;
            }
            BasicAck {
                delivery_tag,
                multiple,
            } => {
                buf.put_u64(*delivery_tag);
                write_bits(buf, &[*multiple]);
            }
            BasicReject {
                delivery_tag,
                requeue,
            } => {
                buf.put_u64(*delivery_tag);
                write_bits(buf, &[*requeue]);
            }
            BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                buf.put_u64(*delivery_tag);
                write_bits(buf, &[*multiple, *requeue]);
            }
            ConfirmSelect { no_wait } => write_bits(buf, &[*no_wait]),
        }
        Ok(())
    }

    /// Decode a method frame payload.
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let buf = &mut buf;
        let class_id = read_u16(buf)?;
        let method_id = read_u16(buf)?;
        let method = match (class_id, method_id) {
            (CLASS_CONNECTION, 10) => Method::ConnectionStart {
                version_major: read_u8(buf)?,
                version_minor: read_u8(buf)?,
                server_properties: read_table(buf)?,
                mechanisms: read_long_str(buf)?,
                locales: read_long_str(buf)?,
            },
            (CLASS_CONNECTION, 11) => Method::ConnectionStartOk {
                client_properties: read_table(buf)?,
                mechanism: read_short_str(buf)?,
                response: read_long_bytes(buf)?,
                locale: read_short_str(buf)?,
            },
            (CLASS_CONNECTION, 30) => Method::ConnectionTune {
                channel_max: read_u16(buf)?,
                frame_max: read_u32(buf)?,
                heartbeat: read_u16(buf)?,
            },
            (CLASS_CONNECTION, 31) => Method::ConnectionTuneOk {
                channel_max: read_u16(buf)?,
                frame_max: read_u32(buf)?,
                heartbeat: read_u16(buf)?,
            },
            (CLASS_CONNECTION, 40) => {
                let virtual_host = read_short_str(buf)?;
                let _capabilities = read_short_str(buf)?;
                let _insist = read_bits::<1>(buf)?;
                Method::ConnectionOpen { virtual_host }
            }
            (CLASS_CONNECTION, 41) => {
                let _known_hosts = read_short_str(buf)?;
                Method::ConnectionOpenOk
            }
            (CLASS_CONNECTION, 50) => Method::ConnectionClose {
                reply_code: read_u16(buf)?,
                reply_text: read_short_str(buf)?,
                class_id: read_u16(buf)?,
                method_id: read_u16(buf)?,
            },
            (CLASS_CONNECTION, 51) => Method::ConnectionCloseOk,
            (CLASS_CONNECTION, 60) => Method::ConnectionBlocked {
                reason: read_short_str(buf)?,
            },
            (CLASS_CONNECTION, 61) => Method::ConnectionUnblocked,
            (CLASS_CHANNEL, 10) => {
                let _out_of_band = read_short_str(buf)?;
                Method::ChannelOpen
            }
            (CLASS_CHANNEL, 11) => {
                let _channel_id = read_long_bytes(buf)?;
                Method::ChannelOpenOk
            }
            (CLASS_CHANNEL, 20) => {
                let [active] = read_bits::<1>(buf)?;
                Method::ChannelFlow { active }
            }
            (CLASS_CHANNEL, 21) => {
                let [active] = read_bits::<1>(buf)?;
                Method::ChannelFlowOk { active }
            }
            (CLASS_CHANNEL, 40) => Method::ChannelClose {
                reply_code: read_u16(buf)?,
                reply_text: read_short_str(buf)?,
                class_id: read_u16(buf)?,
                method_id: read_u16(buf)?,
            },
            (CLASS_CHANNEL, 41) => Method::ChannelCloseOk,
            (CLASS_EXCHANGE, 10) => {
                let _ticket = read_u16(buf)?;
                let exchange = read_short_str(buf)?;
                let kind = read_short_str(buf)?;
                let [passive, durable, auto_delete, internal, no_wait] = read_bits::<5>(buf)?;
                Method::ExchangeDeclare {
                    exchange,
                    kind,
                    passive,
                    durable,
                    auto_delete,
                    internal,
                    no_wait,
                    arguments: read_table(buf)?,
                }
            }
            (CLASS_EXCHANGE, 11) => Method::ExchangeDeclareOk,
            (CLASS_QUEUE, 10) => {
                let _ticket = read_u16(buf)?;
                let queue = read_short_str(buf)?;
                let [passive, durable, exclusive, auto_delete, no_wait] = read_bits::<5>(buf)?;
                Method::QueueDeclare {
                    queue,
                    passive,
                    durable,
                    exclusive,
                    auto_delete,
                    no_wait,
                    arguments: read_table(buf)?,
                }
            }
            (CLASS_QUEUE, 11) => Method::QueueDeclareOk {
                queue: read_short_str(buf)?,
                message_count: read_u32(buf)?,
                consumer_count: read_u32(buf)?,
            },
            (CLASS_QUEUE, 20) => {
                let _ticket = read_u16(buf)?;
                let queue = read_short_str(buf)?;
                let exchange = read_short_str(buf)?;
                let routing_key = read_short_str(buf)?;
                let [no_wait] = read_bits::<1>(buf)?;
                Method::QueueBind {
                    queue,
                    exchange,
                    routing_key,
                    no_wait,
                    arguments: read_table(buf)?,
                }
            }
            (CLASS_QUEUE, 21) => Method::QueueBindOk,
            (CLASS_QUEUE, 50) => {
                let _ticket = read_u16(buf)?;
                Method::QueueUnbind {
                    queue: read_short_str(buf)?,
                    exchange: read_short_str(buf)?,
                    routing_key: read_short_str(buf)?,
                    arguments: read_table(buf)?,
                }
            }
            (CLASS_QUEUE, 51) => Method::QueueUnbindOk,
            (CLASS_BASIC, 10) => {
                let prefetch_size = read_u32(buf)?;
                let prefetch_count = read_u16(buf)?;
                let [global] = read_bits::<1>(buf)?;
                Method::BasicQos {
                    prefetch_size,
                    prefetch_count,
                    global,
                }
            }
            (CLASS_BASIC, 11) => Method::BasicQosOk,
            (CLASS_BASIC, 20) => {
                let _ticket = read_u16(buf)?;
                let queue = read_short_str(buf)?;
                let consumer_tag = read_short_str(buf)?;
                let [no_local, no_ack, exclusive, no_wait] = read_bits::<4>(buf)?;
                Method::BasicConsume {
                    queue,
                    consumer_tag,
                    no_local,
                    no_ack,
                    exclusive,
                    no_wait,
                    arguments: read_table(buf)?,
                }
            }
            (CLASS_BASIC, 21) => Method::BasicConsumeOk {
                consumer_tag: read_short_str(buf)?,
            },
            (CLASS_BASIC, 30) => {
                let consumer_tag = read_short_str(buf)?;
                let [no_wait] = read_bits::<1>(buf)?;
                Method::BasicCancel {
                    consumer_tag,
                    no_wait,
                }
            }
            (CLASS_BASIC, 31) => Method::BasicCancelOk {
                consumer_tag: read_short_str(buf)?,
            },
            (CLASS_BASIC, 40) => {
                let _ticket = read_u16(buf)?;
                let exchange = read_short_str(buf)?;
                let routing_key = read_short_str(buf)?;
                let [mandatory, immediate] = read_bits::<2>(buf)?;
                Method::BasicPublish {
                    exchange,
                    routing_key,
                    mandatory,
                    immediate,
                }
            }
            (CLASS_BASIC, 50) => Method::BasicReturn {
                reply_code: read_u16(buf)?,
                reply_text: read_short_str(buf)?,
                exchange: read_short_str(buf)?,
                routing_key: read_short_str(buf)?,
            },
            (CLASS_BASIC, 60) => {
                let consumer_tag = read_short_str(buf)?;
                let delivery_tag = read_u64(buf)?;
                let [redelivered] = read_bits::<1>(buf)?;
                Method::BasicDeliver {
                    consumer_tag,
                    delivery_tag,
                    redelivered,
                    exchange: read_short_str(buf)?,
                    routing_key: read_short_str(buf)?,
                }
            }
            (CLASS_BASIC, 80) => {
                let delivery_tag = read_u64(buf)?;
                let [multiple] = read_bits::<1>(buf)?;
                Method::BasicAck {
                    delivery_tag,
                    multiple,
                }
            }
            (CLASS_BASIC, 90) => {
                let delivery_tag = read_u64(buf)?;
                let [requeue] = read_bits::<1>(buf)?;
                Method::BasicReject {
                    delivery_tag,
                    requeue,
                }
            }
            (CLASS_BASIC, 120) => {
                let delivery_tag = read_u64(buf)?;
                let [multiple, requeue] = read_bits::<2>(buf)?;
                Method::BasicNack {
                    delivery_tag,
                    multiple,
                    requeue,
                }
            }
            (CLASS_CONFIRM, 10) => {
                let [no_wait] = read_bits::<1>(buf)?;
                Method::ConfirmSelect { no_wait }
            }
            (CLASS_CONFIRM, 11) => Method::ConfirmSelectOk,
            (class_id, method_id) => {
                return Err(ProtocolError::UnknownMethod {
                    class_id,
                    method_id,
                })
            }
        };
        Ok(method)
    }
}
