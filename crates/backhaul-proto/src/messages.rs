//! Control message types exchanged over tunnel streams

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Protocol errors, distinct from transport-level failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown action: {0}")]
    UnknownAction(u8),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Control message actions. Future actions are reserved; the wire carries a
/// raw discriminant so an unrecognized value decodes and is rejected at
/// dispatch instead of tearing down the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    Proxy = 1,
}

impl TryFrom<u8> for Action {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Action::Proxy),
            other => Err(ProtocolError::UnknownAction(other)),
        }
    }
}

/// A single forwarding rule: traffic addressed to the tunnel's public name is
/// proxied to `local_addr` on the client side. The set of tunnels a client
/// offers is fixed at handshake time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tunnel {
    /// Application protocol carried over the tunnel (e.g., "tcp")
    pub protocol: String,
    /// Local target address in host:port format
    pub local_addr: String,
}

impl Tunnel {
    pub fn tcp(local_addr: impl Into<String>) -> Self {
        Self {
            protocol: "tcp".to_string(),
            local_addr: local_addr.into(),
        }
    }
}

/// The header block written as the first message of every proxied stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    /// Raw action discriminant, validated via [`ControlMessage::action`]
    pub action: u8,
    /// Public name of the target tunnel
    pub tunnel_name: String,
    /// Protocol of the target tunnel
    pub protocol: String,
    /// Address of the originating caller, for logging on the far side
    pub forwarded_for: String,
}

impl ControlMessage {
    pub fn proxy(
        tunnel_name: impl Into<String>,
        protocol: impl Into<String>,
        forwarded_for: impl Into<String>,
    ) -> Self {
        Self {
            action: Action::Proxy as u8,
            tunnel_name: tunnel_name.into(),
            protocol: protocol.into(),
            forwarded_for: forwarded_for.into(),
        }
    }

    pub fn action(&self) -> Result<Action, ProtocolError> {
        Action::try_from(self.action)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.tunnel_name.is_empty() {
            return Err(ProtocolError::MissingField("tunnel_name"));
        }
        Ok(())
    }
}

/// Handshake record sent by the client on its control stream right after
/// connecting. Carries the authentication token, the client's identity name,
/// and the full tunnel set the client offers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handshake {
    pub auth_token: String,
    pub client_name: String,
    pub tunnels: HashMap<String, Tunnel>,
}

impl Handshake {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.auth_token.is_empty() {
            return Err(ProtocolError::MissingField("auth_token"));
        }
        if self.client_name.is_empty() {
            return Err(ProtocolError::MissingField("client_name"));
        }
        if self.tunnels.is_empty() {
            return Err(ProtocolError::MissingField("tunnels"));
        }
        Ok(())
    }
}

/// Server answer to a [`Handshake`]. The error variant is the reserved
/// out-of-band channel for rejections that happen before any control message
/// can be decoded (bad token, duplicate identity), so the client can tell an
/// application-level rejection apart from a transport failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HandshakeReply {
    Ok,
    Error { reason: String },
}

/// Per-stream acknowledgement sent by the client after reading a
/// [`ControlMessage`]: `Ok` before payload bytes start flowing, `Error` when
/// the message was malformed or the local target is unreachable. Errors are
/// local to the stream; the carrying session stays open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StreamReply {
    Ok,
    Error { reason: String },
}
