//! Ports: the traits callers implement (handlers) and the traits the runtime
//! depends on (transport).

pub mod inbound;
pub mod outbound;

pub use inbound::{HandlerError, MessageHandler, ResourceHandler};
pub use outbound::{AmqpStream, Connector};
