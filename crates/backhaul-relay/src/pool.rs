//! Connection pool: one live session per client identity.
//!
//! The pool is the server-side record of which clients are reachable. An
//! identity maps to exactly one session; a client that reconnects while its
//! old session still answers pings is refused, so a flapping network cannot
//! silently hijack an identity that is alive elsewhere.

use backhaul_connection::{MuxSession, SessionError, DEFAULT_PING_TIMEOUT};
use backhaul_proto::Tunnel;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client already connected")]
    AlreadyConnected,

    #[error("client not connected")]
    NotConnected,

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// Callback invoked with the identity whenever a pooled session is released,
/// so bookkeeping outside the pool (quotas, dashboards) can drop its state.
pub type ReleaseCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct ConnPair {
    session: Arc<MuxSession>,
    tunnels: HashMap<String, Tunnel>,
    connected_at: DateTime<Utc>,
}

/// Registry of connected clients, keyed by identity
pub struct ConnectionPool {
    conns: RwLock<HashMap<String, ConnPair>>,
    release: Option<ReleaseCallback>,
    ping_timeout: Duration,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            release: None,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    pub fn with_release_callback(mut self, callback: ReleaseCallback) -> Self {
        self.release = Some(callback);
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Register a session for `identity`. If the identity already has a
    /// session, that session is probed first: a live session wins and the new
    /// one is refused; a dead one is released and replaced. The registry lock
    /// is held across the probe so no third session can race in between.
    pub async fn add_connection(
        &self,
        identity: &str,
        session: Arc<MuxSession>,
        tunnels: HashMap<String, Tunnel>,
    ) -> Result<(), PoolError> {
        let mut conns = self.conns.write().await;

        if let Some(existing) = conns.get(identity) {
            match existing.session.ping(self.ping_timeout).await {
                Ok(_) => {
                    debug!(identity, "existing session is alive, refusing new one");
                    return Err(PoolError::AlreadyConnected);
                }
                Err(e) => {
                    warn!(identity, "existing session is dead ({}), replacing", e);
                    if let Some(old) = conns.remove(identity) {
                        self.release_pair(identity, old).await;
                    }
                }
            }
        }

        info!(identity, tunnels = tunnels.len(), "client connected");
        conns.insert(
            identity.to_string(),
            ConnPair {
                session,
                tunnels,
                connected_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Look up the live session for `identity`. A session found closed is
    /// released on the spot and `None` is returned.
    pub async fn get(&self, identity: &str) -> Option<Arc<MuxSession>> {
        {
            let conns = self.conns.read().await;
            match conns.get(identity) {
                Some(pair) if pair.session.is_open() => return Some(pair.session.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Stale entry: re-check under the write lock before releasing it
        let mut conns = self.conns.write().await;
        if let Some(pair) = conns.get(identity) {
            if pair.session.is_open() {
                return Some(pair.session.clone());
            }
            if let Some(old) = conns.remove(identity) {
                warn!(identity, "dropping closed session from pool");
                self.release_pair(identity, old).await;
            }
        }
        None
    }

    /// The tunnel set `identity` registered at handshake time
    pub async fn tunnels(&self, identity: &str) -> Option<HashMap<String, Tunnel>> {
        self.conns
            .read()
            .await
            .get(identity)
            .map(|pair| pair.tunnels.clone())
    }

    pub async fn connected_at(&self, identity: &str) -> Option<DateTime<Utc>> {
        self.conns
            .read()
            .await
            .get(identity)
            .map(|pair| pair.connected_at)
    }

    pub async fn identities(&self) -> Vec<String> {
        self.conns.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.is_empty()
    }

    /// Probe `identity` and return the measured round-trip time. A failed
    /// probe is reported but does not evict the session; eviction is the
    /// caller's decision.
    pub async fn ping(&self, identity: &str) -> Result<Duration, PoolError> {
        let conns = self.conns.write().await;
        let pair = conns.get(identity).ok_or(PoolError::NotConnected)?;
        Ok(pair.session.ping(self.ping_timeout).await?)
    }

    /// Release the session registered for `identity`
    pub async fn remove_connection(&self, identity: &str) -> Result<(), PoolError> {
        let pair = self
            .conns
            .write()
            .await
            .remove(identity)
            .ok_or(PoolError::NotConnected)?;
        info!(identity, "client disconnected");
        self.release_pair(identity, pair).await;
        Ok(())
    }

    /// Release whichever identity holds this exact session. Used when a
    /// serving path discovers the session is broken and only has the session
    /// handle, not the identity.
    pub async fn evict(&self, session: &Arc<MuxSession>) {
        let mut conns = self.conns.write().await;
        let identity = conns
            .iter()
            .find(|(_, pair)| Arc::ptr_eq(&pair.session, session))
            .map(|(identity, _)| identity.clone());

        if let Some(identity) = identity {
            if let Some(pair) = conns.remove(&identity) {
                warn!(identity = %identity, "evicting broken session");
                self.release_pair(&identity, pair).await;
            }
        }
    }

    /// Release every pooled session
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.conns.write().await.drain().collect();
        for (identity, pair) in drained {
            self.release_pair(&identity, pair).await;
        }
    }

    async fn release_pair(&self, identity: &str, pair: ConnPair) {
        if let Some(callback) = &self.release {
            callback(identity);
        }
        pair.session.close().await;
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_connection::Side;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};

    async fn session_pair() -> (Arc<MuxSession>, Arc<MuxSession>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(
            async { TcpStream::connect(addr).await.unwrap() },
            async { listener.accept().await.unwrap().0 },
        );
        (
            Arc::new(MuxSession::new(client, Side::Client)),
            Arc::new(MuxSession::new(server, Side::Server)),
        )
    }

    fn web_tunnels() -> HashMap<String, Tunnel> {
        HashMap::from([("web".to_string(), Tunnel::tcp("127.0.0.1:8080"))])
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let pool = ConnectionPool::new();
        let (_peer, session) = session_pair().await;

        pool.add_connection("node-1", session.clone(), web_tunnels())
            .await
            .unwrap();

        let found = pool.get("node-1").await.unwrap();
        assert!(Arc::ptr_eq(&found, &session));
        assert!(pool.get("node-2").await.is_none());
        assert_eq!(pool.len().await, 1);
        assert!(pool.connected_at("node-1").await.is_some());
        assert_eq!(pool.tunnels("node-1").await.unwrap(), web_tunnels());
    }

    #[tokio::test]
    async fn test_duplicate_identity_refused_while_alive() {
        let pool = ConnectionPool::new();
        let (_peer_a, first) = session_pair().await;
        let (_peer_b, second) = session_pair().await;

        pool.add_connection("node-1", first.clone(), web_tunnels())
            .await
            .unwrap();

        let result = pool
            .add_connection("node-1", second, web_tunnels())
            .await;
        assert!(matches!(result, Err(PoolError::AlreadyConnected)));

        // Original session retained
        let found = pool.get("node-1").await.unwrap();
        assert!(Arc::ptr_eq(&found, &first));
    }

    #[tokio::test]
    async fn test_dead_session_is_replaced() {
        let pool = ConnectionPool::new().with_ping_timeout(Duration::from_millis(200));
        let (peer_a, first) = session_pair().await;
        let (_peer_b, second) = session_pair().await;

        pool.add_connection("node-1", first, web_tunnels())
            .await
            .unwrap();

        // Kill the first session's peer so the probe fails
        peer_a.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.add_connection("node-1", second.clone(), web_tunnels())
            .await
            .unwrap();

        let found = pool.get("node-1").await.unwrap();
        assert!(Arc::ptr_eq(&found, &second));
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_ping_reports_liveness_without_evicting() {
        let pool = ConnectionPool::new().with_ping_timeout(Duration::from_millis(200));
        let (peer, session) = session_pair().await;

        pool.add_connection("node-1", session, web_tunnels())
            .await
            .unwrap();
        assert!(pool.ping("node-1").await.is_ok());

        peer.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(pool.ping("node-1").await.is_err());
        // Still pooled: a failed probe reports, it does not evict
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_ping_unknown_identity() {
        let pool = ConnectionPool::new();
        assert!(matches!(
            pool.ping("ghost").await,
            Err(PoolError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_get_releases_closed_session() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let pool = ConnectionPool::new()
            .with_release_callback(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        let (peer, session) = session_pair().await;

        pool.add_connection("node-1", session, web_tunnels())
            .await
            .unwrap();

        peer.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(pool.get("node-1").await.is_none());
        assert!(pool.is_empty().await);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_connection_fires_release_callback() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let pool = ConnectionPool::new()
            .with_release_callback(Arc::new(move |identity| {
                assert_eq!(identity, "node-1");
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        let (_peer, session) = session_pair().await;

        pool.add_connection("node-1", session.clone(), web_tunnels())
            .await
            .unwrap();
        pool.remove_connection("node-1").await.unwrap();

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!session.is_open());
        assert!(matches!(
            pool.remove_connection("node-1").await,
            Err(PoolError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_evict_by_session_handle() {
        let pool = ConnectionPool::new();
        let (_peer_a, first) = session_pair().await;
        let (_peer_b, second) = session_pair().await;

        pool.add_connection("node-1", first.clone(), web_tunnels())
            .await
            .unwrap();
        pool.add_connection("node-2", second.clone(), web_tunnels())
            .await
            .unwrap();

        pool.evict(&first).await;

        assert!(pool.get("node-1").await.is_none());
        assert!(pool.get("node-2").await.is_some());

        // Evicting a handle that is no longer pooled is a no-op
        pool.evict(&first).await;
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let pool = ConnectionPool::new()
            .with_release_callback(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        let (_peer_a, first) = session_pair().await;
        let (_peer_b, second) = session_pair().await;
        pool.add_connection("node-1", first.clone(), web_tunnels())
            .await
            .unwrap();
        pool.add_connection("node-2", second.clone(), web_tunnels())
            .await
            .unwrap();

        pool.close_all().await;

        assert!(pool.is_empty().await);
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert!(!first.is_open());
        assert!(!second.is_open());
    }
}
