//! Domain layer: configuration, messages, routing and error types.

pub mod codec;
pub mod config;
pub mod correlation;
pub mod errors;
pub mod message;
pub mod routing;

pub use config::{
    Config, ConfigOptions, ConnectionTuning, ExchangeKind, QoSConfig, ReconnectPolicy, Role,
};
pub use correlation::{CorrelationId, CorrelationIdGenerator};
pub use errors::{DecodeError, EventbusError, Result};
pub use message::{
    ContentEncoding, DeliveryInfo, DeliveryMode, HeaderValue, Headers, Message, ERROR_HEADER,
};
