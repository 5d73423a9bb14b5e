//! Reader and writer tasks.

use super::handshake::FramedStream;
use super::Connection;
use crate::domain::errors::EventbusError;
use crate::protocol::{Frame, Method, ProtocolError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Far-future deadline used when heartbeats are disabled.
const NEVER: Duration = Duration::from_secs(86_400 * 365);

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(super) async fn writer_loop(
    conn: Arc<Connection>,
    mut sink: SplitSink<FramedStream, Frame>,
    mut rx: mpsc::UnboundedReceiver<Vec<Frame>>,
) {
    let heartbeat = conn.negotiated.heartbeat;
    let idle_limit = if heartbeat.is_zero() {
        NEVER
    } else {
        heartbeat / 2
    };
    let idle = sleep(idle_limit);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;
            _ = conn.shutdown.cancelled() => break,
            batch = rx.recv() => {
                let Some(frames) = batch else { break };
                let written = tokio::select! {
                    written = write_batch(&mut sink, frames) => written,
                    _ = conn.shutdown.cancelled() => break,
                };
                if let Err(e) = written {
                    conn.fail(EventbusError::from(e));
                    break;
                }
                idle.as_mut().reset(Instant::now() + idle_limit);
            }
            _ = &mut idle => {
                if let Err(e) = sink.send(Frame::Heartbeat).await {
                    conn.fail(EventbusError::from(e));
                    break;
                }
                idle.as_mut().reset(Instant::now() + idle_limit);
            }
        }
    }

    // Drain what was queued before shutdown (connection.close, close-ok).
    let drain = async {
        while let Ok(frames) = rx.try_recv() {
            write_batch(&mut sink, frames).await?;
        }
        sink.close().await
    };
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
    debug!(connection = conn.id, "Writer stopped");
}

async fn write_batch(
    sink: &mut SplitSink<FramedStream, Frame>,
    frames: Vec<Frame>,
) -> Result<(), ProtocolError> {
    for frame in frames {
        sink.feed(frame).await?;
    }
    sink.flush().await
}

pub(super) async fn reader_loop(conn: Arc<Connection>, mut stream: SplitStream<FramedStream>) {
    let heartbeat = conn.negotiated.heartbeat;
    let read_limit = if heartbeat.is_zero() {
        NEVER
    } else {
        heartbeat * 2
    };

    loop {
        let next = tokio::select! {
            _ = conn.shutdown.cancelled() => break,
            next = tokio::time::timeout(read_limit, stream.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                conn.fail(EventbusError::ConnectionLost(format!(
                    "missed heartbeats for {read_limit:?}"
                )));
                break;
            }
            Ok(None) => {
                conn.fail(EventbusError::ConnectionLost(
                    "connection closed by peer".into(),
                ));
                break;
            }
            Ok(Some(Err(e))) => {
                conn.fail(EventbusError::from(e));
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Heartbeat => {}
            Frame::Method(0, method) => {
                if !handle_connection_method(&conn, method) {
                    break;
                }
            }
            other => conn.route(other),
        }
    }
    debug!(connection = conn.id, "Reader stopped");
}

/// Returns false when the reader should stop.
fn handle_connection_method(conn: &Connection, method: Method) -> bool {
    match method {
        Method::ConnectionClose {
            reply_code,
            reply_text,
            ..
        } => {
            let _ = conn.send(vec![Frame::Method(0, Method::ConnectionCloseOk)]);
            conn.fail(EventbusError::ConnectionLost(format!(
                "broker closed connection: {reply_code} {reply_text}"
            )));
            false
        }
        Method::ConnectionCloseOk => {
            if let Some(tx) = conn.close_ok.lock().take() {
                let _ = tx.send(());
            }
            false
        }
        Method::ConnectionBlocked { reason } => {
            conn.blocked.store(true, Ordering::Relaxed);
            info!(connection = conn.id, reason = %reason, "Broker blocked publishing");
            true
        }
        Method::ConnectionUnblocked => {
            conn.blocked.store(false, Ordering::Relaxed);
            info!(connection = conn.id, "Broker unblocked publishing");
            true
        }
        other => {
            conn.fail(EventbusError::Protocol(format!(
                "unexpected {} on channel 0",
                other.name()
            )));
            false
        }
    }
}
