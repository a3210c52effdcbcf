//! Tunnel client lifecycle: dial, handshake, serve, reconnect.

use crate::config::ClientConfig;
use crate::proxy;
use backhaul_connection::{
    set_keepalive, Backoff, ExponentialBackoff, MuxSession, MuxStream, SessionError, Side,
};
use backhaul_proto::{Action, ControlMessage, Handshake, HandshakeReply, StreamReply, Tunnel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("already connected")]
    AlreadyConnected,

    #[error("failed to connect to server: {0}")]
    BackoffExhausted(std::io::Error),

    #[error("server error: {0}")]
    Handshake(String),

    #[error("connection is being cut")]
    ConnectionCut,

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// A tunnel client. Dials out to the relay server, registers its tunnel set,
/// and serves proxied streams toward local services until stopped.
pub struct TunnelClient {
    config: ClientConfig,
    tunnels: Arc<HashMap<String, Tunnel>>,
    session: tokio::sync::Mutex<Option<Arc<MuxSession>>>,
    backoff: tokio::sync::Mutex<Option<Box<dyn Backoff + Send>>>,
    last_disconnect: Mutex<Option<Instant>>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate().map_err(ClientError::Config)?;
        let tunnels = Arc::new(config.tunnels.clone());
        let backoff: Box<dyn Backoff + Send> =
            Box::new(ExponentialBackoff::new(config.backoff.clone()));
        Ok(Self {
            config,
            tunnels,
            session: tokio::sync::Mutex::new(None),
            backoff: tokio::sync::Mutex::new(Some(backoff)),
            last_disconnect: Mutex::new(None),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Replace the reconnect pacing policy
    pub fn with_backoff(mut self, backoff: Box<dyn Backoff + Send>) -> Self {
        *self.backoff.get_mut() = Some(backoff);
        self
    }

    /// Disable dial retries entirely: every connect is a single attempt
    pub fn without_backoff(mut self) -> Self {
        *self.backoff.get_mut() = None;
        self
    }

    /// Connect and serve until stopped. Reconnects with backoff when the
    /// transport drops. Returns an error when the server rejects the
    /// handshake, the backoff budget runs out, or the server keeps cutting
    /// the connection.
    pub async fn start(&self) -> Result<(), ClientError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ClientError::AlreadyConnected);
        }
        let result = self.run().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Stop the client and close the active session. Safe to call from
    /// another task while `start` is running.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run(&self) -> Result<(), ClientError> {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }

            let stream = match self.dial().await {
                Ok(stream) => stream,
                Err(e) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    return Err(e);
                }
            };

            let session = Arc::new(MuxSession::new(stream, Side::Client));
            *self.session.lock().await = Some(session.clone());

            // stop() may have landed while the dial was in flight, finding
            // the session slot still empty. Re-check before serving.
            if self.stopped.load(Ordering::SeqCst) {
                session.close().await;
                self.session.lock().await.take();
                return Ok(());
            }

            let outcome = self.run_session(&session).await;

            session.close().await;
            self.session.lock().await.take();

            match outcome {
                Ok(Some(reason)) => return Err(ClientError::Handshake(reason)),
                Ok(None) => {}
                Err(e) => debug!("session ended: {}", e),
            }

            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }

            // Two disconnects in rapid succession mean the server is
            // deliberately cutting us, not a network hiccup.
            {
                let now = Instant::now();
                let mut last = self.last_disconnect.lock().unwrap();
                if let Some(prev) = *last {
                    if now.duration_since(prev) < self.config.grace_window {
                        return Err(ClientError::ConnectionCut);
                    }
                }
                *last = Some(now);
            }

            warn!(server = %self.config.server_addr, "disconnected, reconnecting");
        }
    }

    /// Dial the server, retrying with backoff until a connection is
    /// established or the backoff budget runs out.
    async fn dial(&self) -> Result<TcpStream, ClientError> {
        let mut backoff = self.backoff.lock().await;
        loop {
            let attempt = tokio::time::timeout(
                self.config.dial_timeout,
                TcpStream::connect(&self.config.server_addr),
            )
            .await;

            let err = match attempt {
                Ok(Ok(stream)) => {
                    if let Err(e) = set_keepalive(&stream) {
                        warn!("failed to enable keepalive: {}", e);
                    }
                    if let Some(backoff) = backoff.as_mut() {
                        backoff.reset();
                    }
                    info!(server = %self.config.server_addr, "connected");
                    return Ok(stream);
                }
                Ok(Err(e)) => e,
                Err(_) => std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
            };

            // No policy means a single attempt
            match backoff.as_mut().and_then(|b| b.next_back_off()) {
                Some(delay) => {
                    debug!(?delay, "dial failed: {}, retrying", err);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(ClientError::BackoffExhausted(err)),
            }

            if self.stopped.load(Ordering::SeqCst) {
                return Err(ClientError::BackoffExhausted(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "client stopped",
                )));
            }
        }
    }

    /// Drive one connected session: send the handshake, then serve inbound
    /// streams. Returns the server's rejection reason if the handshake was
    /// refused, or `None` once the transport drops.
    async fn run_session(&self, session: &MuxSession) -> Result<Option<String>, ClientError> {
        let mut control = session.open_stream().await?;
        control
            .send_message(&Handshake {
                auth_token: self.config.auth_token.clone(),
                client_name: self.config.name.clone(),
                tunnels: (*self.tunnels).clone(),
            })
            .await?;

        let mut control_open = true;
        loop {
            // Biased toward the control stream: when the server rejects us
            // and closes in one motion, the rejection reason must win the
            // race against the session teardown.
            tokio::select! {
                biased;

                reply = control.recv_message::<HandshakeReply>(), if control_open => {
                    match reply {
                        Ok(Some(HandshakeReply::Ok)) => {
                            info!(name = %self.config.name, "registered with server");
                        }
                        Ok(Some(HandshakeReply::Error { reason })) => {
                            return Ok(Some(reason));
                        }
                        Ok(None) => {
                            // Server is done with the control stream
                            control_open = false;
                        }
                        Err(e) => {
                            debug!("control stream error: {}", e);
                            control_open = false;
                        }
                    }
                }
                inbound = session.accept_stream() => {
                    match inbound {
                        Some(stream) => {
                            tokio::spawn(serve_stream(self.tunnels.clone(), stream));
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }
}

/// Serve one inbound stream: read and validate its control message, then
/// dispatch by action. Stream-level failures never touch the session.
async fn serve_stream(tunnels: Arc<HashMap<String, Tunnel>>, mut stream: MuxStream) {
    let msg = match stream.recv_message::<ControlMessage>().await {
        Ok(Some(msg)) => msg,
        Ok(None) => return,
        Err(e) => {
            warn!("failed to read control message: {}", e);
            let _ = stream
                .send_message(&StreamReply::Error {
                    reason: e.to_string(),
                })
                .await;
            let _ = stream.finish().await;
            return;
        }
    };

    if let Err(e) = msg.validate() {
        warn!("invalid control message: {}", e);
        let _ = stream
            .send_message(&StreamReply::Error {
                reason: e.to_string(),
            })
            .await;
        let _ = stream.finish().await;
        return;
    }

    match msg.action() {
        Ok(Action::Proxy) => match proxy::dispatch(&tunnels, &msg, stream).await {
            Ok((to_local, to_tunnel)) => {
                debug!(tunnel = %msg.tunnel_name, to_local, to_tunnel, "stream finished");
            }
            Err(e) => warn!(tunnel = %msg.tunnel_name, "proxy dispatch failed: {}", e),
        },
        Err(e) => {
            warn!("rejecting stream: {}", e);
            let _ = stream
                .send_message(&StreamReply::Error {
                    reason: e.to_string(),
                })
                .await;
            let _ = stream.finish().await;
        }
    }
}
