//! Tunnel client configuration

use backhaul_connection::BackoffConfig;
use backhaul_proto::Tunnel;
use std::collections::HashMap;
use std::time::Duration;

/// Default timeout for a single dial attempt
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default window for treating repeated disconnects as the server cutting
/// the connection
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(5);

/// Configuration for a [`TunnelClient`](crate::TunnelClient)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay server address, e.g. `relay.example.com:7070`
    pub server_addr: String,
    /// Token presented during the handshake
    pub auth_token: String,
    /// Identity this client registers under
    pub name: String,
    /// Tunnels offered to the server, keyed by tunnel name
    pub tunnels: HashMap<String, Tunnel>,
    /// Reconnect pacing
    pub backoff: BackoffConfig,
    /// Timeout for a single TCP dial attempt
    pub dial_timeout: Duration,
    /// Two disconnects closer together than this are treated as the server
    /// cutting the connection, and the client stops retrying.
    pub grace_window: Duration,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            auth_token: auth_token.into(),
            name: String::new(),
            tunnels: HashMap::new(),
            backoff: BackoffConfig::default(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            grace_window: DEFAULT_GRACE_WINDOW,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn add_tunnel(mut self, name: impl Into<String>, tunnel: Tunnel) -> Self {
        self.tunnels.insert(name.into(), tunnel);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_grace_window(mut self, window: Duration) -> Self {
        self.grace_window = window;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.server_addr.is_empty() {
            return Err("server address must not be empty".to_string());
        }
        if self.auth_token.is_empty() {
            return Err("auth token must not be empty".to_string());
        }
        if self.name.is_empty() {
            return Err("client name must not be empty".to_string());
        }
        if self.tunnels.is_empty() {
            return Err("at least one tunnel must be configured".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ClientConfig {
        ClientConfig::new("127.0.0.1:7070", "secret")
            .with_name("node-1")
            .add_tunnel("web", Tunnel::tcp("127.0.0.1:8080"))
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = valid_config();
        assert_eq!(config.dial_timeout, DEFAULT_DIAL_TIMEOUT);
        assert_eq!(config.grace_window, DEFAULT_GRACE_WINDOW);
        assert_eq!(config.backoff.multiplier, 1.5);
    }

    #[test]
    fn test_rejects_missing_fields() {
        let no_addr = ClientConfig::new("", "secret")
            .with_name("node-1")
            .add_tunnel("web", Tunnel::tcp("127.0.0.1:8080"));
        assert!(no_addr.validate().is_err());

        let no_token = ClientConfig::new("127.0.0.1:7070", "")
            .with_name("node-1")
            .add_tunnel("web", Tunnel::tcp("127.0.0.1:8080"));
        assert!(no_token.validate().is_err());

        let no_name = ClientConfig::new("127.0.0.1:7070", "secret")
            .add_tunnel("web", Tunnel::tcp("127.0.0.1:8080"));
        assert!(no_name.validate().is_err());

        let no_tunnels = ClientConfig::new("127.0.0.1:7070", "secret").with_name("node-1");
        assert!(no_tunnels.validate().is_err());
    }

    #[test]
    fn test_builder_overrides() {
        let config = valid_config()
            .with_dial_timeout(Duration::from_secs(3))
            .with_grace_window(Duration::from_secs(1));
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.grace_window, Duration::from_secs(1));
    }
}
