//! Correlation IDs for request/reply matching.
//!
//! An id is `<prefix>.<counter>`: the prefix is random per client instance and
//! the counter increases monotonically, so ids never repeat within a process
//! and stay distinct across processes sharing a broker.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Correlation ID carried in the `correlation-id` property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Wrap an id received from the wire.
    pub fn from_wire(id: &str) -> Self {
        Self(Arc::from(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Generates correlation ids for one RPC client.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl CorrelationIdGenerator {
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self {
            prefix: uuid[..12].to_string(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> CorrelationId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        CorrelationId(Arc::from(format!("{}.{}", self.prefix, n)))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
