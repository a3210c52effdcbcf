//! Relay server: accepts dialed-out clients, authenticates them, pools their
//! sessions, and opens proxy streams toward them on demand.

use crate::pool::{ConnectionPool, PoolError};
use async_trait::async_trait;
use backhaul_connection::{set_keepalive, MuxSession, MuxStream, SessionError, Side};
use backhaul_proto::{ControlMessage, Handshake, HandshakeReply, StreamReply};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("client {identity} has no tunnel named {tunnel}")]
    UnknownTunnel { identity: String, tunnel: String },

    #[error("client rejected stream: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Credential check performed during the handshake. The error string is sent
/// back to the client verbatim as the rejection reason.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str, name: &str) -> Result<(), String>;
}

/// Accepts any client presenting the configured token
pub struct TokenAuthenticator {
    token: String,
}

impl TokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, token: &str, _name: &str) -> Result<(), String> {
        if token == self.token {
            Ok(())
        } else {
            Err("invalid auth token".to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Time a new connection gets to complete its handshake before being
    /// dropped
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// The relay server. Owns the connection pool and the accept loop.
pub struct RelayServer {
    pool: Arc<ConnectionPool>,
    authenticator: Arc<dyn Authenticator>,
    config: RelayConfig,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new()),
            authenticator,
            config: RelayConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Accept clients until [`shutdown`](Self::shutdown) is called, then
    /// release every pooled session.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "relay listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tokio::spawn(self.clone().handle_connection(stream, peer));
                }
                _ = self.shutdown.cancelled() => {
                    info!("relay shutting down");
                    break;
                }
            }
        }
        self.pool.close_all().await;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Open a proxied stream toward `identity`'s tunnel `tunnel_name`. The
    /// returned stream is acknowledged by the client and ready for payload
    /// bytes. A transport failure evicts the broken session from the pool.
    pub async fn forward(
        &self,
        identity: &str,
        tunnel_name: &str,
        forwarded_for: &str,
    ) -> Result<MuxStream, RelayError> {
        let tunnels = self
            .pool
            .tunnels(identity)
            .await
            .ok_or(PoolError::NotConnected)?;
        let tunnel = tunnels
            .get(tunnel_name)
            .ok_or_else(|| RelayError::UnknownTunnel {
                identity: identity.to_string(),
                tunnel: tunnel_name.to_string(),
            })?;
        let session = self.pool.get(identity).await.ok_or(PoolError::NotConnected)?;

        let msg = ControlMessage::proxy(tunnel_name, &tunnel.protocol, forwarded_for);
        let result = open_proxy_stream(&session, &msg).await;

        if matches!(result, Err(RelayError::Session(_))) {
            self.pool.evict(&session).await;
        }
        result
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "inbound connection");
        if let Err(e) = set_keepalive(&stream) {
            warn!(%peer, "failed to enable keepalive: {}", e);
        }
        let session = Arc::new(MuxSession::new(stream, Side::Server));

        let handshake = tokio::time::timeout(self.config.handshake_timeout, async {
            let mut control = session.accept_stream().await?;
            let handshake = control.recv_message::<Handshake>().await.ok().flatten()?;
            Some((control, handshake))
        })
        .await;

        let (mut control, handshake) = match handshake {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                warn!(%peer, "connection closed before handshake");
                session.close().await;
                return;
            }
            Err(_) => {
                warn!(%peer, "handshake timed out");
                session.close().await;
                return;
            }
        };

        if let Err(e) = handshake.validate() {
            warn!(%peer, "invalid handshake: {}", e);
            reject(control, &session, e.to_string()).await;
            return;
        }

        if let Err(reason) = self
            .authenticator
            .authenticate(&handshake.auth_token, &handshake.client_name)
            .await
        {
            warn!(%peer, name = %handshake.client_name, "authentication failed: {}", reason);
            reject(control, &session, reason).await;
            return;
        }

        match self
            .pool
            .add_connection(&handshake.client_name, session.clone(), handshake.tunnels)
            .await
        {
            Ok(()) => {
                let _ = control.send_message(&HandshakeReply::Ok).await;
                let _ = control.finish().await;
            }
            Err(e) => {
                warn!(%peer, name = %handshake.client_name, "refusing connection: {}", e);
                reject(control, &session, e.to_string()).await;
            }
        }
    }
}

async fn open_proxy_stream(
    session: &MuxSession,
    msg: &ControlMessage,
) -> Result<MuxStream, RelayError> {
    let mut stream = session.open_stream().await?;
    stream.send_message(msg).await?;

    match stream.recv_message::<StreamReply>().await? {
        Some(StreamReply::Ok) => Ok(stream),
        Some(StreamReply::Error { reason }) => Err(RelayError::Rejected(reason)),
        None => Err(RelayError::Session(SessionError::ConnectionClosed)),
    }
}

async fn reject(mut control: MuxStream, session: &MuxSession, reason: String) {
    let _ = control
        .send_message(&HandshakeReply::Error { reason })
        .await;
    let _ = control.finish().await;
    session.close().await;
}
