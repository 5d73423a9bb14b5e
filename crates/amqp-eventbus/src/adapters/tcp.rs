//! Plain TCP transport, optionally upgraded to TLS.

use crate::domain::config::Config;
use crate::domain::errors::{EventbusError, Result};
use crate::ports::outbound::{AmqpStream, Connector};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Dials the broker over TCP and wraps the socket in TLS when the config
/// carries a [`TlsAdaptor`](super::tls::TlsAdaptor).
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &Config) -> Result<Box<dyn AmqpStream>> {
        let address = config.address();
        let tcp = TcpStream::connect(&address)
            .await
            .map_err(|e| EventbusError::Connection(format!("{address}: {e}")))?;
        tcp.set_nodelay(true)
            .map_err(|e| EventbusError::Connection(e.to_string()))?;
        debug!(address = %address, tls = config.tls_adaptor.is_some(), "TCP connected");

        match &config.tls_adaptor {
            Some(tls) => Ok(Box::new(tls.connect(tcp).await?)),
            None => Ok(Box::new(tcp)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.is_ok() });

        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = port;
        assert!(TcpConnector::new().connect(&config).await.is_ok());
        assert!(accept.await.unwrap());
    }

    #[tokio::test]
    async fn test_refused_connection_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = port;
        let err = TcpConnector::new().connect(&config).await.err().unwrap();
        assert!(matches!(err, EventbusError::Connection(_)));
    }
}
