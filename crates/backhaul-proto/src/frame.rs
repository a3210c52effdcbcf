//! Frame layer for multiplexing streams over a single connection

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Opens a new stream with the carried stream ID
    Open = 0,
    /// Payload bytes for an open stream
    Data = 1,
    /// Closes a stream (FIN for graceful, RST for abortive)
    Close = 2,
    /// Session-level liveness probe
    Ping = 3,
    /// Answer to a ping, echoing its payload
    Pong = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::Ping),
            4 => Ok(FrameType::Pong),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const RST: u8 = 0b0000_0010;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// A single multiplexed frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: u32,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + flags (1) + length (4) = 10 bytes
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: u32, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn open(stream_id: u32) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new())
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    /// Graceful half-close of a stream
    pub fn close(stream_id: u32) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
            .with_flags(FrameFlags::new().with_fin())
    }

    /// Abortive close of a stream
    pub fn reset(stream_id: u32) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
            .with_flags(FrameFlags::new().with_rst())
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(
            crate::SESSION_STREAM_ID,
            FrameType::Ping,
            Bytes::copy_from_slice(&seq.to_be_bytes()),
        )
    }

    pub fn pong(payload: Bytes) -> Self {
        Self::new(crate::SESSION_STREAM_ID, FrameType::Pong, payload)
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Length-delimited frame codec for use with `FramedRead`/`FramedWrite`
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = frame.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        dst.reserve(Frame::HEADER_SIZE + payload_len);
        dst.put_u32(frame.stream_id);
        dst.put_u8(frame.frame_type as u8);
        dst.put_u8(frame.flags.as_u8());
        dst.put_u32(payload_len as u32);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..Frame::HEADER_SIZE];
        let stream_id = header.get_u32();
        let type_byte = header.get_u8();
        let flags = FrameFlags::from_u8(header.get_u8());
        let length = header.get_u32() as usize;

        if length > crate::MAX_FRAME_SIZE as usize {
            return Err(FrameError::FrameTooLarge(length));
        }

        if src.len() < Frame::HEADER_SIZE + length {
            src.reserve(Frame::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(Frame::HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame {
            stream_id,
            frame_type: FrameType::try_from(type_byte)?,
            flags,
            payload,
        }))
    }
}
