//! Multiplexed tunnel sessions and reconnection backoff.
//!
//! A [`MuxSession`] wraps a single TCP connection and carries many
//! independent logical streams over it, so the server side of a tunnel can
//! keep issuing requests toward a client that dialed out once. The
//! [`Backoff`] policy paces the client's reconnect attempts.

pub mod backoff;
pub mod keepalive;
pub mod session;

pub use backoff::{Backoff, BackoffConfig, ExponentialBackoff};
pub use keepalive::set_keepalive;
pub use session::{MuxSession, MuxStream, RecvHalf, SendHalf, SessionError, Side};

/// Default timeout for session liveness probes
pub const DEFAULT_PING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
