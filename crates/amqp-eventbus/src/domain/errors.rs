//! Eventbus error types.
//!
//! One error enum crosses the public surface. It is `Clone` because a single
//! failure (a lost connection, a closed channel) resolves many pending
//! entries at once.

use super::config::Role;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = EventbusError> = std::result::Result<T, E>;

/// Errors surfaced by the eventbus runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventbusError {
    /// Transport-level failure while establishing the connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// TLS material was invalid or the handshake failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// The broker refused the supplied credentials.
    #[error("authentication refused: {0}")]
    Auth(String),

    /// An established connection went away.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A channel-level error; scoped to one role.
    #[error("channel error on {role} channel: {code} {text}")]
    Channel { role: Role, code: u16, text: String },

    /// Declaring or binding a consumer failed.
    #[error("bind failed for {exchange}/{routing_key}: {reason}")]
    Bind {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    /// The broker nacked a confirm-tracked publish.
    #[error("publish rejected by broker")]
    PublishRejected,

    /// The channel closed before the broker answered a confirm-tracked publish.
    #[error("publish abandoned: {0}")]
    PublishAbandoned(String),

    /// The caller's publish timeout elapsed before the broker confirmed.
    #[error("publish confirm timed out after {0:?}")]
    PublishTimeout(Duration),

    /// No reply arrived before the RPC deadline.
    #[error("rpc call timed out after {0:?}")]
    RpcTimeout(Duration),

    /// The RPC call was cancelled before a reply arrived.
    #[error("rpc call cancelled: {0}")]
    RpcCancelled(String),

    /// A message body could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The eventbus has been disposed.
    #[error("eventbus disposed")]
    Disposed,
}

impl EventbusError {
    /// Returns true for failures caused by cancellation or disposal.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::RpcCancelled(_) | Self::PublishAbandoned(_) | Self::Disposed
        )
    }

    /// Returns true for failures that take the whole connection down.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ConnectionLost(_) | Self::TlsHandshake(_) | Self::Auth(_)
        )
    }

    pub(crate) fn bind(exchange: &str, routing_key: &str, cause: &EventbusError) -> Self {
        Self::Bind {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reason: cause.to_string(),
        }
    }
}

/// Content codec failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed {encoding} payload: {reason}")]
    Malformed {
        encoding: &'static str,
        reason: String,
    },

    #[error("failed to compress {encoding} payload: {reason}")]
    Compress {
        encoding: &'static str,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_class() {
        assert!(EventbusError::Disposed.is_cancellation());
        assert!(EventbusError::RpcCancelled("bye".into()).is_cancellation());
        assert!(EventbusError::PublishAbandoned("closed".into()).is_cancellation());
        assert!(!EventbusError::RpcTimeout(Duration::from_millis(5)).is_cancellation());
    }

    #[test]
    fn test_channel_error_display() {
        let err = EventbusError::Channel {
            role: Role::Publish,
            code: 404,
            text: "NOT_FOUND - no exchange 'x'".into(),
        };
        assert_eq!(
            err.to_string(),
            "channel error on publish channel: 404 NOT_FOUND - no exchange 'x'"
        );
    }

    #[test]
    fn test_bind_wraps_cause() {
        let cause = EventbusError::ConnectionLost("socket closed".into());
        let err = EventbusError::bind("events", "a.*", &cause);
        assert!(err.to_string().contains("connection lost: socket closed"));
    }
}
