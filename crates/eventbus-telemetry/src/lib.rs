//! # Eventbus Telemetry
//!
//! Logging and metrics shared by the eventbus runtime.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use eventbus_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() {
//!     init_telemetry(&TelemetryConfig::from_env()).expect("telemetry");
//!     // eventbus code runs here; logs go to stdout, metrics to the registry
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `EVENTBUS_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `EVENTBUS_JSON_LOGS` | `false` | Emit JSON log lines |
//! | `EVENTBUS_SERVICE_NAME` | `amqp-eventbus` | Service name attached to logs |

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{
    gather_metrics, register_metrics, DELIVERIES_RECEIVED, HANDLER_FAILURES, MESSAGES_PUBLISHED,
    PUBLISH_CONFIRMS, RECONNECTS, RPC_CALLS, RPC_LATENCY, RPC_PENDING, RPC_REPLIES_SENT,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Install logging and register metrics.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    register_metrics()?;
    init_logging(config)?;
    tracing::info!(service = %config.service_name, "Telemetry initialized");
    Ok(())
}

/// Convenience macro for recording a metric increment.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}
