//! Frame layer and the `tokio_util` codec that reads and writes it.

use super::methods::Method;
use super::properties::BasicProperties;
use super::types::{read_u16, read_u64};
use super::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;
pub const FRAME_END: u8 = 0xCE;

/// Protocol header sent by the client before any frame.
pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

/// Frame overhead: type (1) + channel (2) + size (4) + end marker (1).
pub const FRAME_OVERHEAD: usize = 8;

/// Minimum frame-max every peer must accept.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Upper bound applied before frame-max is negotiated.
const DEFAULT_MAX_FRAME: usize = 128 * 1024 * 1024;

/// Content header frame payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub body_size: u64,
    pub properties: BasicProperties,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Method(u16, Method),
    Header(u16, ContentHeader),
    Body(u16, Bytes),
    Heartbeat,
}

impl Frame {
    pub fn channel(&self) -> u16 {
        match self {
            Frame::Method(ch, _) | Frame::Header(ch, _) | Frame::Body(ch, _) => *ch,
            Frame::Heartbeat => 0,
        }
    }
}

/// Frame codec. The first byte of an inbound stream that is not a frame type
/// but an `AMQP` protocol header means the peer rejected our version.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// Apply the negotiated frame-max (0 keeps the default bound).
    pub fn set_frame_max(&mut self, frame_max: u32) {
        if frame_max != 0 {
            self.max_frame = frame_max as usize;
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < 7 {
            return Ok(None);
        }
        if src[0] == b'A' {
            return Err(ProtocolError::ProtocolVersion);
        }
        let frame_type = src[0];
        let channel = u16::from_be_bytes([src[1], src[2]]);
        let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
        if size + FRAME_OVERHEAD > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                size: size + FRAME_OVERHEAD,
                max: self.max_frame,
            });
        }
        if src.len() < size + FRAME_OVERHEAD {
            src.reserve(size + FRAME_OVERHEAD - src.len());
            return Ok(None);
        }

        src.advance(7);
        let mut payload = src.split_to(size).freeze();
        let end = src.get_u8();
        if end != FRAME_END {
            return Err(ProtocolError::FrameEnd(end));
        }

        let frame = match frame_type {
            FRAME_METHOD => Frame::Method(channel, Method::decode(payload)?),
            FRAME_HEADER => {
                let class_id = read_u16(&mut payload)?;
                let _weight = read_u16(&mut payload)?;
                let body_size = read_u64(&mut payload)?;
                let properties = BasicProperties::decode(&mut payload)?;
                Frame::Header(
                    channel,
                    ContentHeader {
                        class_id,
                        body_size,
                        properties,
                    },
                )
            }
            FRAME_BODY => Frame::Body(channel, payload),
            FRAME_HEARTBEAT => Frame::Heartbeat,
            other => return Err(ProtocolError::UnknownFrameType(other)),
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let (frame_type, channel) = match &frame {
            Frame::Method(ch, _) => (FRAME_METHOD, *ch),
            Frame::Header(ch, _) => (FRAME_HEADER, *ch),
            Frame::Body(ch, _) => (FRAME_BODY, *ch),
            Frame::Heartbeat => (FRAME_HEARTBEAT, 0),
        };
        let mut payload = BytesMut::new();
        match frame {
            Frame::Method(_, method) => method.encode(&mut payload)?,
            Frame::Header(_, header) => {
                payload.put_u16(header.class_id);
                payload.put_u16(0);
                payload.put_u64(header.body_size);
                header.properties.encode(&mut payload)?;
            }
            Frame::Body(_, body) => payload.extend_from_slice(&body),
            Frame::Heartbeat => {}
        }
        let size = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;

        dst.reserve(payload.len() + FRAME_OVERHEAD);
        dst.put_u8(frame_type);
        dst.put_u16(channel);
        dst.put_u32(size);
        dst.extend_from_slice(&payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }
}
