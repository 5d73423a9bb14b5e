//! Outbound (driven) ports: how the runtime reaches a broker.

use crate::domain::config::Config;
use crate::domain::errors::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream carrying AMQP frames (plain TCP, TLS or an
/// in-memory pipe).
pub trait AmqpStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AmqpStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Opens transport streams to the broker described by a [`Config`].
///
/// The connector is responsible for the transport and TLS only; the AMQP
/// handshake runs on top of the returned stream.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &Config) -> Result<Box<dyn AmqpStream>>;
}
