//! Connection handshake: protocol header, Start/StartOk, Tune/TuneOk and
//! Open/OpenOk.

use crate::domain::config::Config;
use crate::domain::errors::{EventbusError, Result};
use crate::ports::outbound::AmqpStream;
use crate::protocol::reply_code::ACCESS_REFUSED;
use crate::protocol::{FieldTable, FieldValue, Frame, FrameCodec, Method, PROTOCOL_HEADER};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Framed;
use tracing::debug;

pub(crate) type FramedStream = Framed<Box<dyn AmqpStream>, FrameCodec>;

/// Values agreed during Tune/TuneOk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: Duration,
}

/// Lower non-zero value wins; zero on one side defers to the other.
pub(crate) fn negotiate<T: Ord + Copy + Default>(client: T, server: T) -> T {
    let zero = T::default();
    if client == zero {
        server
    } else if server == zero {
        client
    } else {
        client.min(server)
    }
}

/// Heartbeat in whole seconds, rounding sub-second values up.
fn heartbeat_secs(heartbeat: Duration) -> u16 {
    let secs = heartbeat.as_millis().div_ceil(1000);
    u16::try_from(secs).unwrap_or(u16::MAX)
}

pub(crate) fn plain_response(username: &str, password: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(username.len() + password.len() + 2);
    buf.put_u8(0);
    buf.put_slice(username.as_bytes());
    buf.put_u8(0);
    buf.put_slice(password.as_bytes());
    buf.freeze()
}

fn client_properties() -> FieldTable {
    let mut capabilities = FieldTable::new();
    for cap in [
        "publisher_confirms",
        "consumer_cancel_notify",
        "basic.nack",
        "connection.blocked",
        "authentication_failure_close",
    ] {
        capabilities.insert(cap.to_string(), FieldValue::Bool(true));
    }

    let mut props = FieldTable::new();
    props.insert("product".into(), FieldValue::string("amqp-eventbus"));
    props.insert("version".into(), FieldValue::string(env!("CARGO_PKG_VERSION")));
    props.insert("platform".into(), FieldValue::string("Rust"));
    props.insert("capabilities".into(), FieldValue::Table(capabilities));
    props
}

async fn next_method(framed: &mut FramedStream, stage: &'static str) -> Result<Option<Method>> {
    loop {
        match framed.next().await {
            None => return Ok(None),
            Some(Err(e)) => {
                return Err(EventbusError::Connection(format!("{stage}: {e}")));
            }
            Some(Ok(Frame::Heartbeat)) => continue,
            Some(Ok(Frame::Method(0, method))) => return Ok(Some(method)),
            Some(Ok(other)) => {
                return Err(EventbusError::Protocol(format!(
                    "unexpected frame on channel {} during {stage}",
                    other.channel()
                )));
            }
        }
    }
}

async fn send(framed: &mut FramedStream, method: Method) -> Result<()> {
    framed
        .send(Frame::Method(0, method))
        .await
        .map_err(|e| EventbusError::Connection(e.to_string()))
}

/// Run the handshake over a freshly connected stream.
pub(crate) async fn handshake(
    mut stream: Box<dyn AmqpStream>,
    config: &Config,
) -> Result<(FramedStream, Negotiated)> {
    stream
        .write_all(PROTOCOL_HEADER)
        .await
        .map_err(|e| EventbusError::Connection(e.to_string()))?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    let mechanisms = match next_method(&mut framed, "connection.start").await? {
        Some(Method::ConnectionStart { mechanisms, .. }) => mechanisms,
        Some(other) => {
            return Err(EventbusError::Protocol(format!(
                "expected connection.start, got {}",
                other.name()
            )))
        }
        None => {
            return Err(EventbusError::Connection(
                "connection closed before connection.start".into(),
            ))
        }
    };
    if !mechanisms.split(' ').any(|m| m == "PLAIN") {
        return Err(EventbusError::Auth(format!(
            "broker does not offer PLAIN (offers {mechanisms})"
        )));
    }

    send(
        &mut framed,
        Method::ConnectionStartOk {
            client_properties: client_properties(),
            mechanism: "PLAIN".into(),
            response: plain_response(&config.username, &config.password),
            locale: "en_US".into(),
        },
    )
    .await?;

    let (server_channel_max, server_frame_max, server_heartbeat) =
        match next_method(&mut framed, "connection.tune").await? {
            Some(Method::ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }) => (channel_max, frame_max, heartbeat),
            Some(Method::ConnectionClose {
                reply_code,
                reply_text,
                ..
            }) => {
                let _ = send(&mut framed, Method::ConnectionCloseOk).await;
                return Err(if reply_code == ACCESS_REFUSED {
                    EventbusError::Auth(reply_text)
                } else {
                    EventbusError::Connection(format!("{reply_code} {reply_text}"))
                });
            }
            Some(other) => {
                return Err(EventbusError::Protocol(format!(
                    "expected connection.tune, got {}",
                    other.name()
                )))
            }
            // Brokers without authentication_failure_close drop the socket.
            None => {
                return Err(EventbusError::Auth(
                    "connection closed during authentication".into(),
                ))
            }
        };

    let tuning = &config.tuning;
    let negotiated = Negotiated {
        channel_max: negotiate(tuning.channel_max, server_channel_max),
        frame_max: negotiate(tuning.frame_max, server_frame_max),
        heartbeat: Duration::from_secs(u64::from(negotiate(
            heartbeat_secs(tuning.heartbeat),
            server_heartbeat,
        ))),
    };

    send(
        &mut framed,
        Method::ConnectionTuneOk {
            channel_max: negotiated.channel_max,
            frame_max: negotiated.frame_max,
            heartbeat: heartbeat_secs(negotiated.heartbeat),
        },
    )
    .await?;
    framed.codec_mut().set_frame_max(negotiated.frame_max);

    send(
        &mut framed,
        Method::ConnectionOpen {
            virtual_host: config.virtual_host.clone(),
        },
    )
    .await?;

    match next_method(&mut framed, "connection.open").await? {
        Some(Method::ConnectionOpenOk) => {}
        Some(Method::ConnectionClose {
            reply_code,
            reply_text,
            ..
        }) => {
            let _ = send(&mut framed, Method::ConnectionCloseOk).await;
            return Err(EventbusError::Connection(format!(
                "virtual host {:?} refused: {reply_code} {reply_text}",
                config.virtual_host
            )));
        }
        Some(other) => {
            return Err(EventbusError::Protocol(format!(
                "expected connection.open-ok, got {}",
                other.name()
            )))
        }
        None => {
            return Err(EventbusError::Connection(
                "connection closed during connection.open".into(),
            ))
        }
    }

    debug!(
        channel_max = negotiated.channel_max,
        frame_max = negotiated.frame_max,
        heartbeat_secs = negotiated.heartbeat.as_secs(),
        "AMQP handshake complete"
    );
    Ok((framed, negotiated))
}
