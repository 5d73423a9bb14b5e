//! One lazily opened channel per role.

use super::Channel;
use crate::connection::Connection;
use crate::domain::config::{QoSConfig, Role};
use crate::domain::errors::{EventbusError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct ChannelPool {
    conn: Arc<Connection>,
    qos: Arc<QoSConfig>,
    channels: Mutex<HashMap<Role, Arc<Channel>>>,
    opening: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl ChannelPool {
    pub(crate) fn new(conn: Arc<Connection>, qos: Arc<QoSConfig>) -> Self {
        Self {
            conn,
            qos,
            channels: Mutex::new(HashMap::new()),
            opening: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// The open channel for `role`, opening it on first use. A channel the
    /// broker closed is replaced; other roles keep theirs.
    pub(crate) async fn get(&self, role: Role) -> Result<Arc<Channel>> {
        if let Some(channel) = self.cached(role)? {
            return Ok(channel);
        }

        let _opening = self.opening.lock().await;
        if let Some(channel) = self.cached(role)? {
            return Ok(channel);
        }
        let channel = Channel::open(&self.conn, role, &self.qos).await?;
        if self.closed.load(Ordering::Acquire) {
            channel.close().await;
            return Err(EventbusError::Disposed);
        }
        self.channels.lock().insert(role, channel.clone());
        Ok(channel)
    }

    fn cached(&self, role: Role) -> Result<Option<Arc<Channel>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventbusError::Disposed);
        }
        if self.conn.is_closed() {
            return Err(self.conn.lost_error());
        }
        let mut channels = self.channels.lock();
        match channels.get(&role) {
            Some(channel) if channel.is_open() => Ok(Some(channel.clone())),
            Some(_) => {
                debug!(role = %role, "Dropping closed channel from pool");
                channels.remove(&role);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// The channel for `role` if it is currently open, without opening one.
    pub(crate) fn peek(&self, role: Role) -> Option<Arc<Channel>> {
        self.channels
            .lock()
            .get(&role)
            .filter(|channel| channel.is_open())
            .cloned()
    }

    /// Resolve every outstanding confirm as abandoned.
    pub(crate) fn abandon_confirms(&self, reason: &str) -> usize {
        self.channels
            .lock()
            .values()
            .map(|channel| channel.confirms().abandon(reason))
            .sum()
    }

    /// Close every channel. Idempotent.
    pub(crate) async fn close_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, c)| c).collect();
        futures::future::join_all(channels.iter().map(|channel| channel.close())).await;
        debug!(
            connection = self.conn.id(),
            closed = channels.len(),
            "Channel pool closed"
        );
    }
}
