//! Basic-class content properties and their mapping to [`Message`].

use super::types::{
    read_short_str, read_table, read_u16, read_u64, read_u8, write_short_str, write_table,
    FieldTable, FieldValue,
};
use super::ProtocolError;
use crate::domain::message::{
    ContentEncoding, DeliveryInfo, DeliveryMode, HeaderValue, Headers, Message,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tracing::warn;

const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_TYPE: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;
const FLAG_CLUSTER_ID: u16 = 1 << 2;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

impl BasicProperties {
    fn flags(&self) -> u16 {
        let mut flags = 0;
        let mut set = |present: bool, flag: u16| {
            if present {
                flags |= flag;
            }
        };
        set(self.content_type.is_some(), FLAG_CONTENT_TYPE);
        set(self.content_encoding.is_some(), FLAG_CONTENT_ENCODING);
        set(self.headers.is_some(), FLAG_HEADERS);
        set(self.delivery_mode.is_some(), FLAG_DELIVERY_MODE);
        set(self.priority.is_some(), FLAG_PRIORITY);
        set(self.correlation_id.is_some(), FLAG_CORRELATION_ID);
        set(self.reply_to.is_some(), FLAG_REPLY_TO);
        set(self.expiration.is_some(), FLAG_EXPIRATION);
        set(self.message_id.is_some(), FLAG_MESSAGE_ID);
        set(self.timestamp.is_some(), FLAG_TIMESTAMP);
        set(self.kind.is_some(), FLAG_TYPE);
        set(self.user_id.is_some(), FLAG_USER_ID);
        set(self.app_id.is_some(), FLAG_APP_ID);
        set(self.cluster_id.is_some(), FLAG_CLUSTER_ID);
        flags
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u16(self.flags());
        let short = |buf: &mut BytesMut, v: &Option<String>| -> Result<(), ProtocolError> {
            match v {
                Some(s) => write_short_str(buf, s),
                None => Ok(()),
            }
        };
        short(buf, &self.content_type)?;
        short(buf, &self.content_encoding)?;
        if let Some(headers) = &self.headers {
            write_table(buf, headers)?;
        }
        if let Some(mode) = self.delivery_mode {
            buf.put_u8(mode);
        }
        if let Some(priority) = self.priority {
            buf.put_u8(priority);
        }
        short(buf, &self.correlation_id)?;
        short(buf, &self.reply_to)?;
        short(buf, &self.expiration)?;
        short(buf, &self.message_id)?;
        if let Some(ts) = self.timestamp {
            buf.put_u64(ts);
        }
        short(buf, &self.kind)?;
        short(buf, &self.user_id)?;
        short(buf, &self.app_id)?;
        short(buf, &self.cluster_id)?;
        Ok(())
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let flags = read_u16(buf)?;
        let short = |buf: &mut Bytes, flag: u16| -> Result<Option<String>, ProtocolError> {
            if flags & flag != 0 {
                read_short_str(buf).map(Some)
            } else {
                Ok(None)
            }
        };
        let content_type = short(buf, FLAG_CONTENT_TYPE)?;
        let content_encoding = short(buf, FLAG_CONTENT_ENCODING)?;
        let headers = if flags & FLAG_HEADERS != 0 {
            Some(read_table(buf)?)
        } else {
            None
        };
        let delivery_mode = if flags & FLAG_DELIVERY_MODE != 0 {
            Some(read_u8(buf)?)
        } else {
            None
        };
        let priority = if flags & FLAG_PRIORITY != 0 {
            Some(read_u8(buf)?)
        } else {
            None
        };
        let correlation_id = short(buf, FLAG_CORRELATION_ID)?;
        let reply_to = short(buf, FLAG_REPLY_TO)?;
        let expiration = short(buf, FLAG_EXPIRATION)?;
        let message_id = short(buf, FLAG_MESSAGE_ID)?;
        let timestamp = if flags & FLAG_TIMESTAMP != 0 {
            Some(read_u64(buf)?)
        } else {
            None
        };
        Ok(Self {
            content_type,
            content_encoding,
            headers,
            delivery_mode,
            priority,
            correlation_id,
            reply_to,
            expiration,
            message_id,
            timestamp,
            kind: short(buf, FLAG_TYPE)?,
            user_id: short(buf, FLAG_USER_ID)?,
            app_id: short(buf, FLAG_APP_ID)?,
            cluster_id: short(buf, FLAG_CLUSTER_ID)?,
        })
    }

    /// Properties for publishing `message` (the body is encoded separately).
    pub fn from_message(message: &Message) -> Self {
        Self {
            content_type: message.content_type.clone(),
            content_encoding: message.content_encoding.as_tag().map(str::to_string),
            headers: if message.headers.is_empty() {
                None
            } else {
                Some(headers_to_table(&message.headers))
            },
            delivery_mode: Some(message.delivery_mode.as_u8()),
            correlation_id: message.correlation_id.clone(),
            reply_to: message.reply_to.clone(),
            expiration: message.expiration.map(|ttl| ttl.as_millis().to_string()),
            message_id: message.message_id.clone(),
            timestamp: message.timestamp,
            ..Self::default()
        }
    }

    /// Content encoding announced by these properties; unknown tags fall back
    /// to `Null` so the body is handed over untouched.
    pub fn encoding(&self) -> ContentEncoding {
        match self.content_encoding.as_deref() {
            None => ContentEncoding::Null,
            Some(tag) => ContentEncoding::from_tag(tag).unwrap_or_else(|| {
                warn!(encoding = tag, "Unknown content encoding, passing body through");
                ContentEncoding::Null
            }),
        }
    }

    /// Build a message from received properties and an already decoded body.
    pub fn into_message(self, body: Bytes, delivery: Option<DeliveryInfo>) -> Message {
        let content_encoding = self.encoding();
        Message {
            body,
            content_type: self.content_type,
            content_encoding,
            correlation_id: self.correlation_id,
            reply_to: self.reply_to,
            headers: self.headers.as_ref().map(table_to_headers).unwrap_or_default(),
            expiration: self
                .expiration
                .and_then(|ms| ms.parse::<u64>().ok())
                .map(Duration::from_millis),
            delivery_mode: DeliveryMode::from_u8(self.delivery_mode.unwrap_or(1)),
            message_id: self.message_id,
            timestamp: self.timestamp,
            delivery,
        }
    }
}

pub(crate) fn headers_to_table(headers: &Headers) -> FieldTable {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), header_to_field(v)))
        .collect()
}

fn header_to_field(value: &HeaderValue) -> FieldValue {
    match value {
        HeaderValue::Bool(b) => FieldValue::Bool(*b),
        HeaderValue::Int(i) => FieldValue::I64(*i),
        HeaderValue::Float(f) => FieldValue::F64(*f),
        HeaderValue::String(s) => FieldValue::string(s.clone()),
        HeaderValue::Bytes(b) => FieldValue::Bytes(b.clone()),
        HeaderValue::List(items) => FieldValue::Array(items.iter().map(header_to_field).collect()),
        HeaderValue::Table(t) => FieldValue::Table(headers_to_table(t)),
    }
}

pub(crate) fn table_to_headers(table: &FieldTable) -> Headers {
    table
        .iter()
        .filter_map(|(k, v)| field_to_header(v).map(|v| (k.clone(), v)))
        .collect()
}

fn field_to_header(value: &FieldValue) -> Option<HeaderValue> {
    let header = match value {
        FieldValue::Bool(b) => HeaderValue::Bool(*b),
        FieldValue::I8(i) => HeaderValue::Int(i64::from(*i)),
        FieldValue::U8(i) => HeaderValue::Int(i64::from(*i)),
        FieldValue::I16(i) => HeaderValue::Int(i64::from(*i)),
        FieldValue::U16(i) => HeaderValue::Int(i64::from(*i)),
        FieldValue::I32(i) => HeaderValue::Int(i64::from(*i)),
        FieldValue::U32(i) => HeaderValue::Int(i64::from(*i)),
        FieldValue::I64(i) => HeaderValue::Int(*i),
        FieldValue::Timestamp(t) => HeaderValue::Int(i64::try_from(*t).ok()?),
        FieldValue::F32(f) => HeaderValue::Float(f64::from(*f)),
        FieldValue::F64(f) => HeaderValue::Float(*f),
        FieldValue::Decimal(scale, v) => {
            HeaderValue::Float(f64::from(*v) / 10f64.powi(i32::from(*scale)))
        }
        FieldValue::LongStr(b) => match std::str::from_utf8(b) {
            Ok(s) => HeaderValue::String(s.to_string()),
            Err(_) => HeaderValue::Bytes(b.clone()),
        },
        FieldValue::Bytes(b) => HeaderValue::Bytes(b.clone()),
        FieldValue::Array(items) => {
            HeaderValue::List(items.iter().filter_map(field_to_header).collect())
        }
        FieldValue::Table(t) => HeaderValue::Table(table_to_headers(t)),
        FieldValue::Void => return None,
    };
    Some(header)
}
