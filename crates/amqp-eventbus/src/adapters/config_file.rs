//! TOML configuration file with environment overrides.
//!
//! ```toml
//! [broker]
//! host = "rabbit.internal"
//! port = 5671
//! username = "svc"
//! password = "secret"
//! virtual_host = "/"
//!
//! [options]
//! queue_name = "billing"
//! rpc_exchange_name = "billing_rpc"
//! rpc_queue_name = "billing_rpc_queue"
//!
//! [qos]
//! pub_confirm = true
//! sub_prefetch = 50
//!
//! [tuning]
//! heartbeat_secs = 30
//!
//! [reconnect]
//! max_attempts = 10
//!
//! [tls]
//! ca_path = "/etc/ssl/rabbit-ca.pem"
//! server_name = "rabbit.internal"
//! ```
//!
//! `EVENTBUS_HOST`, `EVENTBUS_PORT`, `EVENTBUS_USERNAME`, `EVENTBUS_PASSWORD`
//! and `EVENTBUS_VHOST` override the `[broker]` section.

use super::tls::{TlsAdaptor, TlsMaterial};
use crate::domain::config::{
    Config, ConfigOptions, ConnectionTuning, QoSConfig, ReconnectPolicy,
};
use crate::domain::errors::{EventbusError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub broker: BrokerSection,
    pub options: ConfigOptions,
    pub qos: QoSConfig,
    pub tuning: TuningSection,
    pub reconnect: ReconnectSection,
    pub tls: Option<TlsSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TuningSection {
    pub heartbeat_secs: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub channel_max: Option<u16>,
    pub frame_max: Option<u32>,
    pub dispose_drain_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    pub ca_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub server_name: String,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| EventbusError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loaded eventbus config file");
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EventbusError::Config(e.to_string()))
    }

    /// Apply `EVENTBUS_*` environment overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = lookup("EVENTBUS_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("EVENTBUS_PORT").and_then(|p| p.parse().ok()) {
            self.broker.port = port;
        }
        if let Some(username) = lookup("EVENTBUS_USERNAME") {
            self.broker.username = username;
        }
        if let Some(password) = lookup("EVENTBUS_PASSWORD") {
            self.broker.password = password;
        }
        if let Some(vhost) = lookup("EVENTBUS_VHOST") {
            self.broker.virtual_host = vhost;
        }
        self
    }

    /// Build the connection and QoS configuration, reading any TLS files.
    pub fn into_configs(self) -> Result<(Config, QoSConfig)> {
        let defaults = ConnectionTuning::default();
        let tuning = ConnectionTuning {
            heartbeat: self
                .tuning
                .heartbeat_secs
                .map_or(defaults.heartbeat, Duration::from_secs),
            connect_timeout: self
                .tuning
                .connect_timeout_ms
                .map_or(defaults.connect_timeout, Duration::from_millis),
            channel_max: self.tuning.channel_max.unwrap_or(defaults.channel_max),
            frame_max: self.tuning.frame_max.unwrap_or(defaults.frame_max),
            dispose_drain_timeout: self
                .tuning
                .dispose_drain_timeout_ms
                .map_or(defaults.dispose_drain_timeout, Duration::from_millis),
        };

        let policy = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            enabled: self.reconnect.enabled.unwrap_or(policy.enabled),
            max_attempts: self.reconnect.max_attempts.or(policy.max_attempts),
            base_delay: self
                .reconnect
                .base_delay_ms
                .map_or(policy.base_delay, Duration::from_millis),
            max_delay: self
                .reconnect
                .max_delay_ms
                .map_or(policy.max_delay, Duration::from_millis),
        };

        let mut config = Config::new(
            self.broker.host,
            self.broker.port,
            self.broker.username,
            self.broker.password,
            self.broker.virtual_host,
            self.options,
        )
        .with_tuning(tuning)
        .with_reconnect(reconnect);

        if let Some(tls) = self.tls {
            let material = load_tls_material(
                tls.ca_path.as_deref(),
                tls.cert_path.as_deref(),
                tls.key_path.as_deref(),
                &tls.server_name,
            )?;
            config = config.with_tls(TlsAdaptor::from_material(&material)?);
        }

        config.validate()?;
        Ok((config, self.qos))
    }
}

/// Read PEM files into [`TlsMaterial`].
pub fn load_tls_material(
    ca_path: Option<&Path>,
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
    server_name: &str,
) -> Result<TlsMaterial> {
    let read = |path: Option<&Path>| -> Result<Option<Vec<u8>>> {
        path.map(|p| {
            fs::read(p).map_err(|e| {
                EventbusError::TlsHandshake(format!("cannot read {}: {e}", p.display()))
            })
        })
        .transpose()
    };
    Ok(TlsMaterial {
        ca_pem: read(ca_path)?,
        cert_chain_pem: read(cert_path)?,
        key_pem: read(key_path)?,
        server_name: server_name.to_string(),
    })
}
