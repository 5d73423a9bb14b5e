//! Prometheus metrics for the eventbus.
//!
//! All metrics follow the naming convention: `eventbus_<area>_<metric>_<unit>`

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISH METRICS
    // =========================================================================

    /// Messages written to the broker
    pub static ref MESSAGES_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("eventbus_messages_published_total", "Messages published to the broker"),
        &["role"]  // role: publish/rpc-client/rpc-server
    ).expect("metric creation failed");

    /// Publisher confirm outcomes
    pub static ref PUBLISH_CONFIRMS: CounterVec = CounterVec::new(
        Opts::new("eventbus_publish_confirms_total", "Publisher confirm outcomes"),
        &["outcome"]  // outcome: ack/nack/abandoned
    ).expect("metric creation failed");

    // =========================================================================
    // CONSUME METRICS
    // =========================================================================

    /// Deliveries received from the broker
    pub static ref DELIVERIES_RECEIVED: CounterVec = CounterVec::new(
        Opts::new("eventbus_deliveries_received_total", "Deliveries received from the broker"),
        &["role"]
    ).expect("metric creation failed");

    /// Handler errors and panics
    pub static ref HANDLER_FAILURES: CounterVec = CounterVec::new(
        Opts::new("eventbus_handler_failures_total", "Failed handler invocations"),
        &["kind", "cause"]  // kind: subscription/provider, cause: error/panic/timeout/decode
    ).expect("metric creation failed");

    // =========================================================================
    // RPC METRICS
    // =========================================================================

    /// RPC calls by outcome
    pub static ref RPC_CALLS: CounterVec = CounterVec::new(
        Opts::new("eventbus_rpc_calls_total", "RPC client calls"),
        &["outcome"]  // outcome: ok/timeout/cancelled/failed
    ).expect("metric creation failed");

    /// Calls waiting for a reply
    pub static ref RPC_PENDING: Gauge = Gauge::new(
        "eventbus_rpc_pending",
        "RPC calls currently awaiting a reply"
    ).expect("metric creation failed");

    /// RPC round-trip latency
    pub static ref RPC_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "eventbus_rpc_latency_seconds",
            "Time from request publish to reply"
        ).buckets(exponential_buckets(0.0001, 2.0, 16).expect("bucket creation failed"))
    ).expect("metric creation failed");

    /// Replies sent by resource providers
    pub static ref RPC_REPLIES_SENT: CounterVec = CounterVec::new(
        Opts::new("eventbus_rpc_replies_sent_total", "Replies sent by resource providers"),
        &["status"]  // status: ok/error
    ).expect("metric creation failed");

    // =========================================================================
    // CONNECTION METRICS
    // =========================================================================

    /// Reconnect attempts
    pub static ref RECONNECTS: CounterVec = CounterVec::new(
        Opts::new("eventbus_reconnects_total", "Reconnect attempts after a lost connection"),
        &["outcome"]  // outcome: success/failed
    ).expect("metric creation failed");
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; metrics already registered are skipped.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Publish
        Box::new(MESSAGES_PUBLISHED.clone()),
        Box::new(PUBLISH_CONFIRMS.clone()),
        // Consume
        Box::new(DELIVERIES_RECEIVED.clone()),
        Box::new(HANDLER_FAILURES.clone()),
        // RPC
        Box::new(RPC_CALLS.clone()),
        Box::new(RPC_PENDING.clone()),
        Box::new(RPC_LATENCY.clone()),
        Box::new(RPC_REPLIES_SENT.clone()),
        // Connection
        Box::new(RECONNECTS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

/// Encode all metrics as Prometheus text format.
pub fn gather_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
