//! Wire protocol definitions for the backhaul reverse-tunnel system.
//!
//! This crate defines the frame layer used to multiplex independent streams
//! over a single connection, and the control messages (handshake, proxy
//! instructions, per-stream replies) exchanged on those streams.

pub mod frame;
pub mod messages;

pub use frame::{Frame, FrameCodec, FrameError, FrameFlags, FrameType};
pub use messages::{
    Action, ControlMessage, Handshake, HandshakeReply, ProtocolError, StreamReply, Tunnel,
};

/// Maximum frame payload size (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Stream ID addressed to the session itself (ping/pong frames)
pub const SESSION_STREAM_ID: u32 = 0;
