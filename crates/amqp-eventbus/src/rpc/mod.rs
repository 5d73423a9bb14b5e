//! Request/response over the broker.
//!
//! Callers publish a request carrying a fresh correlation id and a private
//! reply queue; providers answer on the default exchange. The pending store
//! pairs replies with waiting callers.

mod client;
mod pending;
mod server;

pub(crate) use client::{ReplyRoute, RequestPath, RpcClient};
pub(crate) use server::spawn_provider_worker;
