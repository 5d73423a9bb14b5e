//! # AMQP Eventbus Test Suite
//!
//! End-to-end flows that drive the public [`amqp_eventbus::Eventbus`] API
//! against the in-process `MockBroker`.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── src/integration/
//! │   ├── pubsub.rs      # Topic routing, ordering, acknowledgement
//! │   ├── rpc.rs         # Request/response, error replies, deadlines
//! │   ├── lifecycle.rs   # Confirms, reconnects, disposal, auth
//! │   └── tls.rs         # TLS transport
//! └── benches/
//!     └── eventbus_benchmarks.rs
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p eventbus-tests
//! cargo test -p eventbus-tests integration::rpc::
//! cargo bench -p eventbus-tests
//! ```

pub mod integration;
