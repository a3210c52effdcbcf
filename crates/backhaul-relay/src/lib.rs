//! Relay server: accepts dialed-out tunnel clients, keeps one live session
//! per client identity, and forwards requests to clients over multiplexed
//! streams.

pub mod pool;
pub mod server;

pub use pool::{ConnectionPool, PoolError};
pub use server::{Authenticator, RelayConfig, RelayError, RelayServer, TokenAuthenticator};
