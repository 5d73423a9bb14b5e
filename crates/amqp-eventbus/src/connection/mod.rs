//! One multiplexed AMQP connection.
//!
//! A connection owns two tasks: the reader demultiplexes inbound frames onto
//! per-channel queues and watches heartbeats; the writer serialises outbound
//! frame batches and emits heartbeats when idle. Any transport failure is
//! recorded once and broadcast through a cancellation token.

mod handshake;
mod io;

pub(crate) use handshake::Negotiated;

use crate::domain::config::Config;
use crate::domain::errors::{EventbusError, Result};
use crate::ports::outbound::Connector;
use crate::protocol::reply_code::REPLY_SUCCESS;
use crate::protocol::{Frame, Method, FRAME_OVERHEAD};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Body chunk size used when the broker imposes no frame-max.
const UNBOUNDED_CHUNK: usize = 128 * 1024;

/// How long `close` waits for connection.close-ok.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

struct ChannelSlots {
    senders: HashMap<u16, mpsc::UnboundedSender<Frame>>,
    cursor: u16,
}

pub(crate) struct Connection {
    id: u64,
    runtime: Handle,
    negotiated: Negotiated,
    writer: mpsc::UnboundedSender<Vec<Frame>>,
    channels: Mutex<ChannelSlots>,
    shutdown: CancellationToken,
    lost_reason: OnceLock<EventbusError>,
    close_ok: Mutex<Option<oneshot::Sender<()>>>,
    blocked: AtomicBool,
}

impl Connection {
    /// Dial, handshake and start the I/O tasks, all within `connect_timeout`.
    pub(crate) async fn open(
        config: &Config,
        connector: &dyn Connector,
        runtime: Handle,
    ) -> Result<Arc<Self>> {
        let timeout = config.tuning.connect_timeout;
        let (framed, negotiated) = tokio::time::timeout(timeout, async {
            let stream = connector.connect(config).await?;
            handshake::handshake(stream, config).await
        })
        .await
        .map_err(|_| {
            EventbusError::Connection(format!(
                "connecting to {} timed out after {timeout:?}",
                config.address()
            ))
        })??;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: CONNECTION_IDS.fetch_add(1, Ordering::Relaxed),
            runtime: runtime.clone(),
            negotiated,
            writer: writer_tx,
            channels: Mutex::new(ChannelSlots {
                senders: HashMap::new(),
                cursor: 0,
            }),
            shutdown: CancellationToken::new(),
            lost_reason: OnceLock::new(),
            close_ok: Mutex::new(None),
            blocked: AtomicBool::new(false),
        });

        let (sink, stream) = futures::StreamExt::split(framed);
        runtime.spawn(io::writer_loop(conn.clone(), sink, writer_rx));
        runtime.spawn(io::reader_loop(conn.clone(), stream));

        debug!(
            connection = conn.id,
            address = %config.address(),
            vhost = %config.virtual_host,
            "Connection opened"
        );
        Ok(conn)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    /// Largest body slice that fits in one body frame.
    pub(crate) fn body_chunk_size(&self) -> usize {
        match self.negotiated.frame_max {
            0 => UNBOUNDED_CHUNK,
            max => (max as usize).saturating_sub(FRAME_OVERHEAD).max(1),
        }
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled when the connection goes away for any reason.
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// The error dependents should report once the connection is gone.
    pub(crate) fn lost_error(&self) -> EventbusError {
        self.lost_reason
            .get()
            .cloned()
            .unwrap_or_else(|| EventbusError::ConnectionLost("connection closed".into()))
    }

    /// Queue frames for the writer; a batch is written contiguously.
    pub(crate) fn send(&self, frames: Vec<Frame>) -> Result<()> {
        if self.is_closed() {
            return Err(self.lost_error());
        }
        self.writer.send(frames).map_err(|_| self.lost_error())
    }

    /// Allocate a channel id and its inbound frame queue.
    pub(crate) fn register_channel(&self) -> Result<(u16, mpsc::UnboundedReceiver<Frame>)> {
        if self.is_closed() {
            return Err(self.lost_error());
        }
        let max = match self.negotiated.channel_max {
            0 => u16::MAX,
            n => n,
        };
        let mut slots = self.channels.lock();
        for _ in 0..max {
            slots.cursor = if slots.cursor >= max { 1 } else { slots.cursor + 1 };
            let id = slots.cursor;
            if !slots.senders.contains_key(&id) {
                let (tx, rx) = mpsc::unbounded_channel();
                slots.senders.insert(id, tx);
                return Ok((id, rx));
            }
        }
        Err(EventbusError::Connection(format!(
            "all {max} channels are in use"
        )))
    }

    pub(crate) fn release_channel(&self, id: u16) {
        self.channels.lock().senders.remove(&id);
    }

    fn route(&self, frame: Frame) {
        let channel = frame.channel();
        let sender = self.channels.lock().senders.get(&channel).cloned();
        match sender {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    self.release_channel(channel);
                }
            }
            None => debug!(connection = self.id, channel, "Frame for unknown channel dropped"),
        }
    }

    /// Record the failure once and wake every dependent.
    pub(crate) fn fail(&self, reason: EventbusError) {
        if self.lost_reason.set(reason.clone()).is_ok() {
            warn!(connection = self.id, error = %reason, "Connection lost");
        }
        self.shutdown.cancel();
        self.channels.lock().senders.clear();
    }

    /// Close the connection politely: connection.close, wait briefly for
    /// close-ok, then stop the I/O tasks.
    pub(crate) async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        *self.close_ok.lock() = Some(tx);
        let sent = self.send(vec![Frame::Method(
            0,
            Method::ConnectionClose {
                reply_code: REPLY_SUCCESS,
                reply_text: "client closing".into(),
                class_id: 0,
                method_id: 0,
            },
        )]);
        if sent.is_ok() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, rx).await;
        }
        // Recorded first so `fail` does not report a client close as a loss.
        let _ = self
            .lost_reason
            .set(EventbusError::ConnectionLost("closed by client".into()));
        self.fail(EventbusError::ConnectionLost("closed by client".into()));
        debug!(connection = self.id, "Connection closed");
    }

    /// Stop the I/O tasks without the close handshake.
    pub(crate) fn abort(&self, reason: &str) {
        let _ = self
            .lost_reason
            .set(EventbusError::ConnectionLost(reason.to_string()));
        self.fail(EventbusError::ConnectionLost(reason.to_string()));
    }
}
