//! AMQP 0-9-1 wire protocol.
//!
//! Only the subset of classes and methods an eventbus client needs is
//! modelled: connection, channel, exchange, queue, basic and confirm.

pub mod frame;
pub mod methods;
pub mod properties;
pub mod types;

pub use frame::{ContentHeader, Frame, FrameCodec, FRAME_MIN_SIZE, FRAME_OVERHEAD, PROTOCOL_HEADER};
pub use methods::Method;
pub use properties::BasicProperties;
pub use types::{FieldTable, FieldValue};

use crate::domain::errors::EventbusError;
use thiserror::Error;

/// Reply codes used in close methods.
pub mod reply_code {
    pub const REPLY_SUCCESS: u16 = 200;
    pub const CONTENT_TOO_LARGE: u16 = 311;
    pub const NO_ROUTE: u16 = 312;
    pub const CONNECTION_FORCED: u16 = 320;
    pub const INVALID_PATH: u16 = 402;
    pub const ACCESS_REFUSED: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const RESOURCE_LOCKED: u16 = 405;
    pub const PRECONDITION_FAILED: u16 = 406;
    pub const FRAME_ERROR: u16 = 501;
    pub const SYNTAX_ERROR: u16 = 502;
    pub const COMMAND_INVALID: u16 = 503;
    pub const CHANNEL_ERROR: u16 = 504;
    pub const UNEXPECTED_FRAME: u16 = 505;
    pub const NOT_ALLOWED: u16 = 530;
    pub const INTERNAL_ERROR: u16 = 541;
}

/// Wire-level decoding and encoding failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("invalid frame end marker {0:#04x}")]
    FrameEnd(u8),

    #[error("frame of {size} bytes exceeds frame-max {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unknown method {class_id}.{method_id}")]
    UnknownMethod { class_id: u16, method_id: u16 },

    #[error("unknown field value type {0:#04x}")]
    UnknownFieldType(u8),

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("string of {0} bytes does not fit its length prefix")]
    StringTooLong(usize),

    #[error("peer does not support AMQP 0-9-1")]
    ProtocolVersion,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for EventbusError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(io) => EventbusError::ConnectionLost(io.to_string()),
            other => EventbusError::Protocol(other.to_string()),
        }
    }
}
