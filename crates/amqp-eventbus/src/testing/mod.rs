//! Test support: an in-process broker and a connector that dials it.
//!
//! ```ignore
//! let broker = MockBroker::new();
//! let bus = Eventbus::builder(broker.config(), QoSConfig::default())
//!     .connector(broker.connector())
//!     .connect()
//!     .await?;
//! ```

mod broker;

pub use broker::PublishedMessage;

use crate::domain::config::{Config, ConfigOptions, ExchangeKind, ReconnectPolicy};
use crate::domain::errors::{EventbusError, Result};
use crate::ports::outbound::{AmqpStream, Connector};
use crate::protocol::BasicProperties;
use async_trait::async_trait;
use broker::{serve, BrokerState};
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;

const PIPE_CAPACITY: usize = 1024 * 1024;

/// In-process AMQP broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_user(self, username: &str, password: &str) -> Self {
        self.state
            .settings
            .lock()
            .users
            .insert(username.to_string(), password.to_string());
        self
    }

    #[must_use]
    pub fn with_vhost(self, vhost: &str) -> Self {
        self.state.settings.lock().vhosts.insert(vhost.to_string());
        self
    }

    #[must_use]
    pub fn with_frame_max(self, frame_max: u32) -> Self {
        self.state.settings.lock().frame_max = frame_max;
        self
    }

    #[must_use]
    pub fn with_channel_max(self, channel_max: u16) -> Self {
        self.state.settings.lock().channel_max = channel_max;
        self
    }

    #[must_use]
    pub fn with_heartbeat(self, seconds: u16) -> Self {
        self.state.settings.lock().heartbeat = seconds;
        self
    }

    /// Require clients to speak TLS.
    #[must_use]
    pub fn with_tls(self, server: Arc<rustls::ServerConfig>) -> Self {
        self.state.settings.lock().tls = Some(TlsAcceptor::from(server));
        self
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            state: self.state.clone(),
        }
    }

    /// A config that dials this broker with fast reconnects.
    pub fn config(&self) -> Config {
        self.config_with(ConfigOptions::default())
    }

    pub fn config_with(&self, options: ConfigOptions) -> Config {
        Config::new("mock-broker", 5672, "guest", "guest", "/", options).with_reconnect(
            ReconnectPolicy {
                enabled: true,
                max_attempts: None,
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(200),
            },
        )
    }

    /// Ack confirms in batches of `n` using multiple=true.
    pub fn set_confirm_batch(&self, n: usize) {
        self.state.settings.lock().confirm_batch = n;
    }

    /// Nack every confirm-tracked publish.
    pub fn set_nack_publishes(&self, nack: bool) {
        self.state.settings.lock().nack_publishes = nack;
    }

    /// Make new dials fail until switched back.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Sever every connection as if the network went away.
    pub fn drop_connections(&self) {
        self.state.drop_connections();
    }

    /// Stop reading and writing on every connection while keeping sockets open.
    pub fn freeze_connections(&self) {
        self.state.freeze_connections();
    }

    /// Send connection.close to every client.
    pub fn close_connections(&self, reply_code: u16, reply_text: &str) {
        self.state.close_connections(reply_code, reply_text);
    }

    pub fn connection_count(&self) -> usize {
        self.state.connection_count()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.with_queue(queue, |_| ()).is_some()
    }

    /// Messages ready for delivery on `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state.with_queue(queue, |q| q.ready).unwrap_or(0)
    }

    /// Messages delivered from `queue` and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state.with_queue(queue, |q| q.unacked).unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state.with_queue(queue, |q| q.consumers).unwrap_or(0)
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state.has_binding(queue, exchange, routing_key)
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.state.exchange_kind(exchange)
    }

    /// Every message received from publishers, in arrival order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published()
    }

    /// Route a message as if a third party published it. Returns the number
    /// of queues it reached.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: impl Into<Bytes>,
    ) -> usize {
        self.state
            .inject(exchange, routing_key, properties, body.into())
    }

    /// Open a bare connection for channel-level tests.
    #[cfg(test)]
    pub(crate) async fn connect_raw(&self) -> Result<Arc<crate::connection::Connection>> {
        crate::connection::Connection::open(
            &self.config(),
            &self.connector(),
            tokio::runtime::Handle::current(),
        )
        .await
    }
}

/// Dials a [`MockBroker`] over an in-memory pipe.
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<BrokerState>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &Config) -> Result<Box<dyn AmqpStream>> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(EventbusError::Connection(format!(
                "connection refused by {}",
                config.address()
            )));
        }
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(serve(self.state.clone(), server));
        match &config.tls_adaptor {
            Some(tls) => Ok(Box::new(tls.connect(client).await?)),
            None => Ok(Box::new(client)),
        }
    }
}
