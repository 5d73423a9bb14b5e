//! Connection and QoS configuration.
//!
//! Both structures are immutable once the eventbus is built; the QoS config
//! is shared by reference across every channel of a role.

use super::errors::{EventbusError, Result};
use crate::adapters::tls::TlsAdaptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Channel role. Each role gets its own channel, ack mode and prefetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Publish,
    Subscribe,
    RpcClient,
    RpcServer,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Publish, Role::Subscribe, Role::RpcClient, Role::RpcServer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publish => "publish",
            Role::Subscribe => "subscribe",
            Role::RpcClient => "rpc-client",
            Role::RpcServer => "rpc-server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange type used when the eventbus declares an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "direct" => Some(ExchangeKind::Direct),
            "topic" => Some(ExchangeKind::Topic),
            "fanout" => Some(ExchangeKind::Fanout),
            "headers" => Some(ExchangeKind::Headers),
            _ => None,
        }
    }
}

/// Default queue and exchange names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOptions {
    /// Queue shared by `subscribe` consumers.
    pub queue_name: String,
    /// Exchange that resource providers bind to.
    pub rpc_exchange_name: String,
    /// Queue that resource providers consume.
    pub rpc_queue_name: String,
    /// Type of exchanges declared for pub/sub.
    pub exchange_kind: ExchangeKind,
    /// Type of the RPC exchange.
    pub rpc_exchange_kind: ExchangeKind,
    /// Declare exchanges and named queues as durable.
    pub durable: bool,
}

impl ConfigOptions {
    pub fn new(
        queue_name: impl Into<String>,
        rpc_exchange_name: impl Into<String>,
        rpc_queue_name: impl Into<String>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            rpc_exchange_name: rpc_exchange_name.into(),
            rpc_queue_name: rpc_queue_name.into(),
            ..Self::default()
        }
    }

    /// Exchange type to use when declaring `exchange`.
    pub fn kind_for(&self, exchange: &str) -> ExchangeKind {
        if exchange == self.rpc_exchange_name {
            self.rpc_exchange_kind
        } else {
            self.exchange_kind
        }
    }
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            queue_name: "eventbus_queue".to_string(),
            rpc_exchange_name: "eventbus_rpc_exchange".to_string(),
            rpc_queue_name: "eventbus_rpc_queue".to_string(),
            exchange_kind: ExchangeKind::Topic,
            rpc_exchange_kind: ExchangeKind::Direct,
            durable: true,
        }
    }
}

/// Per-role publisher confirms, auto-ack and prefetch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QoSConfig {
    pub pub_confirm: bool,
    pub rpc_client_confirm: bool,
    pub rpc_server_confirm: bool,
    pub sub_auto_ack: bool,
    pub rpc_server_auto_ack: bool,
    pub rpc_client_auto_ack: bool,
    pub sub_prefetch: Option<u16>,
    pub rpc_server_prefetch: Option<u16>,
    pub rpc_client_prefetch: Option<u16>,
}

impl Default for QoSConfig {
    fn default() -> Self {
        Self {
            pub_confirm: true,
            rpc_client_confirm: true,
            rpc_server_confirm: false,
            sub_auto_ack: false,
            rpc_server_auto_ack: false,
            rpc_client_auto_ack: false,
            sub_prefetch: None,
            rpc_server_prefetch: None,
            rpc_client_prefetch: None,
        }
    }
}

impl QoSConfig {
    /// Whether publishes on `role`'s channel are confirm-tracked.
    ///
    /// The subscribe role never publishes, so it never enables confirms.
    pub fn confirm_for(&self, role: Role) -> bool {
        match role {
            Role::Publish => self.pub_confirm,
            Role::RpcClient => self.rpc_client_confirm,
            Role::RpcServer => self.rpc_server_confirm,
            Role::Subscribe => false,
        }
    }

    pub fn auto_ack_for(&self, role: Role) -> bool {
        match role {
            Role::Subscribe => self.sub_auto_ack,
            Role::RpcClient => self.rpc_client_auto_ack,
            Role::RpcServer => self.rpc_server_auto_ack,
            Role::Publish => false,
        }
    }

    pub fn prefetch_for(&self, role: Role) -> Option<u16> {
        match role {
            Role::Subscribe => self.sub_prefetch,
            Role::RpcClient => self.rpc_client_prefetch,
            Role::RpcServer => self.rpc_server_prefetch,
            Role::Publish => None,
        }
    }
}

/// Low-level connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTuning {
    /// Requested heartbeat interval; zero disables heartbeats on our side.
    pub heartbeat: Duration,
    /// TCP + TLS + AMQP handshake budget.
    pub connect_timeout: Duration,
    /// Requested channel-max (0 = no limit from our side).
    pub channel_max: u16,
    /// Requested frame-max (0 = no limit from our side).
    pub frame_max: u32,
    /// Upper bound on draining pending work during graceful disposal.
    pub dispose_drain_timeout: Duration,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            channel_max: 2047,
            frame_max: 131_072,
            dispose_drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Reconnection behaviour after a lost connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Exponential backoff with full jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exp = 2_u32.saturating_pow(attempt.saturating_sub(1));
        let candidate = self.base_delay.checked_mul(exp).unwrap_or(self.max_delay);
        let capped = self.max_delay.min(candidate);
        let nanos = u64::try_from(capped.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(nanos / 2..=nanos))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: None,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Broker connection configuration.
#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    pub options: ConfigOptions,
    pub tls_adaptor: Option<TlsAdaptor>,
    pub tuning: ConnectionTuning,
    pub reconnect: ReconnectPolicy,
}

impl Config {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        virtual_host: impl Into<String>,
        options: ConfigOptions,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            virtual_host: virtual_host.into(),
            options,
            tls_adaptor: None,
            tuning: ConnectionTuning::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_tls(mut self, tls_adaptor: TlsAdaptor) -> Self {
        self.tls_adaptor = Some(tls_adaptor);
        self
    }

    #[must_use]
    pub fn with_tuning(mut self, tuning: ConnectionTuning) -> Self {
        self.tuning = tuning;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(EventbusError::Config("host cannot be empty".into()));
        }
        if self.port == 0 {
            return Err(EventbusError::Config("port cannot be 0".into()));
        }
        if self.username.is_empty() {
            return Err(EventbusError::Config("username cannot be empty".into()));
        }
        if self.options.queue_name.is_empty() || self.options.rpc_queue_name.is_empty() {
            return Err(EventbusError::Config("queue names cannot be empty".into()));
        }
        if self.options.rpc_exchange_name.is_empty() {
            return Err(EventbusError::Config(
                "rpc exchange cannot be the default exchange".into(),
            ));
        }
        if self.tuning.frame_max != 0 && self.tuning.frame_max < 4096 {
            return Err(EventbusError::Config(
                "frame_max must be 0 or at least 4096".into(),
            ));
        }
        if self.reconnect.enabled && self.reconnect.base_delay.is_zero() {
            return Err(EventbusError::Config(
                "reconnect base_delay cannot be 0".into(),
            ));
        }
        Ok(())
    }

    /// `host:port` as used for dialing and logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("localhost", 5672, "guest", "guest", "/", ConfigOptions::default())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("virtual_host", &self.virtual_host)
            .field("options", &self.options)
            .field("tls", &self.tls_adaptor.is_some())
            .field("tuning", &self.tuning)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}
