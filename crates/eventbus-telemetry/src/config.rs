//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for logging and metrics.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Log level filter (an `EnvFilter` directive such as `info,amqp_eventbus=debug`)
    pub log_level: String,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,

    /// Include span open/close events
    pub span_events: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "amqp-eventbus".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            span_events: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `EVENTBUS_SERVICE_NAME`: Service name (default: amqp-eventbus)
    /// - `EVENTBUS_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `EVENTBUS_JSON_LOGS`: Enable JSON logs (default: false outside containers)
    /// - `EVENTBUS_SPAN_EVENTS`: Log span lifecycle (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let is_container =
            lookup("KUBERNETES_SERVICE_HOST").is_some() || lookup("DOCKER_CONTAINER").is_some();
        let flag = |v: String| v.eq_ignore_ascii_case("true") || v == "1";

        Self {
            service_name: lookup("EVENTBUS_SERVICE_NAME")
                .unwrap_or_else(|| "amqp-eventbus".to_string()),

            log_level: lookup("EVENTBUS_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or_else(|| "info".to_string()),

            json_logs: lookup("EVENTBUS_JSON_LOGS")
                .map(flag)
                .unwrap_or(is_container),

            span_events: lookup("EVENTBUS_SPAN_EVENTS").map(flag).unwrap_or(false),
        }
    }
}
