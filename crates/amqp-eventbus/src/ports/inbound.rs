//! Inbound (driving) ports: handlers invoked by the eventbus.
//!
//! Both traits have blanket implementations for async closures, so
//! `|msg| async move { ... }` can be passed anywhere a handler is expected.

use crate::domain::message::Message;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;

/// Failure returned by a handler. Logged and, for resource handlers, sent back
/// to the caller as an error reply.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumes messages delivered to a subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one delivery. Returning `Err` nacks the delivery when the
    /// subscription uses manual acknowledgement.
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Serves RPC requests. The returned bytes become the reply body.
#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    async fn handle(&self, request: Message) -> Result<Bytes, HandlerError>;
}

#[async_trait]
impl<F, Fut> ResourceHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Message) -> Result<Bytes, HandlerError> {
        (self)(request).await
    }
}
