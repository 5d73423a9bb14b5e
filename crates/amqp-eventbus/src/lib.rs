//! AMQP Eventbus - asynchronous publish/subscribe and RPC over AMQP 0-9-1.
//!
//! One [`Eventbus`] multiplexes every messaging pattern over a single broker
//! connection, with one channel per role.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Eventbus                            │
//! │   publish   subscribe   rpc_client   provide_resource        │
//! ├────────────┬──────────────────┬──────────────────────────────┤
//! │  Confirm   │   Subscription   │   RPC correlation            │
//! │  tracker   │   dispatcher     │   (pending store, reply q)   │
//! ├────────────┴──────────────────┴──────────────────────────────┤
//! │        Channel pool: publish | subscribe | rpc-client |      │
//! │                      rpc-server                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Connection: frame codec, heartbeats, reader/writer tasks   │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Connector: TCP or TLS (rustls)                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use amqp_eventbus::{
//!     Config, ConfigOptions, Eventbus, HandlerError, Message, PublishOptions, QoSConfig,
//!     RpcOptions, SubscribeOptions,
//! };
//!
//! let config = Config::new("localhost", 5672, "guest", "guest", "/", ConfigOptions::default());
//! let bus = Eventbus::connect(config, QoSConfig::default()).await?;
//!
//! bus.subscribe("events", "orders.*", |msg: Message| async move {
//!     println!("{:?}", msg.body);
//!     Ok::<(), HandlerError>(())
//! }, SubscribeOptions::default()).await?;
//!
//! bus.publish("events", "orders.created", "{}", PublishOptions::default()).await?;
//! let reply = bus.rpc_client("rpc", "inventory.lookup", "sku-1", RpcOptions::default()).await?;
//! bus.dispose(true).await?;
//! ```
//!
//! # Delivery guarantees
//!
//! - Confirm-tracked publishes resolve exactly once: confirmed, rejected,
//!   abandoned or timed out.
//! - Each subscription sees its messages in broker order.
//! - Every RPC call resolves exactly once; disposal cancels the rest.
//! - Subscriptions survive a reconnect.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod protocol;
pub mod service;

mod channel;
mod connection;
mod dispatch;
mod rpc;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use adapters::{load_tls_material, ConfigFile, TcpConnector, TlsAdaptor, TlsMaterial};
pub use dispatch::{AckMode, SubscribeOptions};
pub use domain::{
    Config, ConfigOptions, ConnectionTuning, ContentEncoding, CorrelationId, DecodeError,
    DeliveryInfo, DeliveryMode, EventbusError, ExchangeKind, HeaderValue, Headers, Message,
    QoSConfig, ReconnectPolicy, Result, Role,
};
pub use ports::{AmqpStream, Connector, HandlerError, MessageHandler, ResourceHandler};
pub use service::{
    BusState, Eventbus, EventbusBuilder, ProvideOptions, ProviderHandle, PublishOptions,
    RpcOptions, SubscriptionHandle,
};
