//! Tunnel client: dials out to a relay server, registers its tunnels, and
//! serves proxied streams toward local services.
//!
//! The client owns the connection lifecycle. It reconnects with exponential
//! backoff when the transport drops, and treats rapid repeated disconnects as
//! the server cutting the connection on purpose.

pub mod client;
pub mod config;
pub mod proxy;

pub use client::{ClientError, TunnelClient};
pub use config::ClientConfig;
