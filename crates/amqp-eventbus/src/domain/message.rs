//! Messages exchanged over the bus.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Header set on RPC replies whose handler failed.
pub const ERROR_HEADER: &str = "x-eventbus-error";

/// Prefix of the body of an error reply.
pub const ERROR_PREFIX: &str = "Error: ";

/// Message headers.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Header value. A subset of AMQP field values that callers can set.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Bytes),
    List(Vec<HeaderValue>),
    Table(Headers),
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::String(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::String(v)
    }
}

/// Body compression, carried in the `content-encoding` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentEncoding {
    #[default]
    Null,
    Zlib,
    Zstd,
    Lz4,
}

impl ContentEncoding {
    /// Wire tag, `None` for uncompressed bodies.
    pub fn as_tag(&self) -> Option<&'static str> {
        match self {
            ContentEncoding::Null => None,
            ContentEncoding::Zlib => Some("zlib"),
            ContentEncoding::Zstd => Some("zstd"),
            ContentEncoding::Lz4 => Some("lz4"),
        }
    }

    /// Parse a wire tag. Unknown tags yield `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "zlib" => Some(ContentEncoding::Zlib),
            "zstd" => Some(ContentEncoding::Zstd),
            "lz4" => Some(ContentEncoding::Lz4),
            "" | "identity" | "null" => Some(ContentEncoding::Null),
            _ => None,
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag().unwrap_or("null"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

impl DeliveryMode {
    pub fn as_u8(&self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_u8(mode: u8) -> Self {
        if mode == 2 {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }
}

/// Broker-side information attached to a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub consumer_tag: String,
}

/// A message body plus its properties.
///
/// `body` is always the decoded payload; compression is applied on publish
/// and removed on delivery according to `content_encoding`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub content_encoding: ContentEncoding,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: Headers,
    pub expiration: Option<Duration>,
    pub delivery_mode: DeliveryMode,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub delivery: Option<DeliveryInfo>,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.content_encoding = encoding;
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Routing key the message was delivered with, if it was received.
    pub fn routing_key(&self) -> Option<&str> {
        self.delivery.as_ref().map(|d| d.routing_key.as_str())
    }

    pub fn exchange(&self) -> Option<&str> {
        self.delivery.as_ref().map(|d| d.exchange.as_str())
    }

    /// True when this is an RPC reply produced by a failing handler.
    pub fn is_error_reply(&self) -> bool {
        matches!(self.headers.get(ERROR_HEADER), Some(HeaderValue::Bool(true)))
    }

    /// Error text of an error reply (body without the `Error: ` prefix).
    pub fn error_text(&self) -> Option<String> {
        if !self.is_error_reply() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.body);
        Some(
            text.strip_prefix(ERROR_PREFIX)
                .unwrap_or(&text)
                .to_string(),
        )
    }

    /// Build the error reply for a failed request.
    pub(crate) fn error_reply(reason: &str) -> Self {
        Message::new(format!("{ERROR_PREFIX}{reason}")).with_header(ERROR_HEADER, true)
    }
}
