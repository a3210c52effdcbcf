//! Multiplexed session over a single TCP connection.
//!
//! Either side may open logical streams; frames from all streams are
//! interleaved on the wire. A reader task routes inbound frames to per-stream
//! channels and answers liveness pings; a writer task serializes outbound
//! frames. There is no per-stream flow control: a stalled stream consumer
//! stalls the session reader, which is acceptable for the small number of
//! concurrent proxied streams a tunnel carries.

use backhaul_proto::{Frame, FrameCodec, FrameType, ProtocolError, MAX_FRAME_SIZE};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

/// Buffered frames per stream before the session reader stalls
const STREAM_BUFFER: usize = 32;

/// Outbound frame queue depth
const OUTGOING_BUFFER: usize = 64;

/// Pending not-yet-accepted inbound streams
const INCOMING_BUFFER: usize = 16;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which end of the connection this session is. Sides allocate stream IDs
/// from disjoint ranges (client odd, server even) so both may open streams
/// without negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

enum WriterCmd {
    Frame(Frame),
    Shutdown,
}

struct Shared {
    outgoing: mpsc::Sender<WriterCmd>,
    streams: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    pending_pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_stream_id: AtomicU32,
    next_ping_seq: AtomicU64,
    open: AtomicBool,
}

/// A multiplexed session over one TCP connection
pub struct MuxSession {
    shared: Arc<Shared>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl MuxSession {
    pub fn new(stream: TcpStream, side: Side) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BUFFER);

        let shared = Arc::new(Shared {
            outgoing: outgoing_tx,
            streams: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(match side {
                Side::Client => 1,
                Side::Server => 2,
            }),
            next_ping_seq: AtomicU64::new(1),
            open: AtomicBool::new(true),
        });

        let reader = tokio::spawn(read_loop(shared.clone(), read_half, incoming_tx));
        let writer = tokio::spawn(write_loop(outgoing_rx, write_half));

        Self {
            shared,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            tasks: Mutex::new(Some((reader, writer))),
        }
    }

    /// Whether the session can still carry new work
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst) && !self.shared.outgoing.is_closed()
    }

    /// Open a new outbound stream
    pub async fn open_stream(&self) -> Result<MuxStream, SessionError> {
        if !self.is_open() {
            return Err(SessionError::ConnectionClosed);
        }

        let id = self.shared.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.shared.streams.lock().unwrap().insert(id, tx);

        if self
            .shared
            .outgoing
            .send(WriterCmd::Frame(Frame::open(id)))
            .await
            .is_err()
        {
            self.shared.streams.lock().unwrap().remove(&id);
            return Err(SessionError::ConnectionClosed);
        }

        debug!(stream_id = id, "opened stream");
        Ok(MuxStream::new(id, self.shared.outgoing.clone(), rx))
    }

    /// Wait for the next stream opened by the peer. Returns `None` once the
    /// session has ended.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.incoming_rx.lock().await.recv().await
    }

    /// Liveness probe: sends a ping and waits for the matching pong, bounded
    /// by `timeout`. Returns the measured round-trip time.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, SessionError> {
        if !self.is_open() {
            return Err(SessionError::ConnectionClosed);
        }

        let seq = self.shared.next_ping_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending_pings.lock().unwrap().insert(seq, tx);

        let start = Instant::now();
        if self
            .shared
            .outgoing
            .send(WriterCmd::Frame(Frame::ping(seq)))
            .await
            .is_err()
        {
            self.shared.pending_pings.lock().unwrap().remove(&seq);
            return Err(SessionError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(_)) => Err(SessionError::ConnectionClosed),
            Err(_) => {
                self.shared.pending_pings.lock().unwrap().remove(&seq);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Close the session: flush queued frames, stop both IO tasks, and wake
    /// every pending stream and ping. Idempotent.
    pub async fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);

        let tasks = self.tasks.lock().unwrap().take();
        if let Some((reader, writer)) = tasks {
            reader.abort();

            // Let the writer drain what is already queued before forcing it.
            let _ = self.shared.outgoing.try_send(WriterCmd::Shutdown);
            let abort = writer.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), writer)
                .await
                .is_err()
            {
                abort.abort();
            }
        }

        self.shared.streams.lock().unwrap().clear();
        self.shared.pending_pings.lock().unwrap().clear();
        debug!("session closed");
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        if let Some((reader, writer)) = self.tasks.lock().unwrap().take() {
            reader.abort();
            writer.abort();
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    read_half: OwnedReadHalf,
    incoming_tx: mpsc::Sender<MuxStream>,
) {
    let mut frames = FramedRead::new(read_half, FrameCodec::new());

    while let Some(result) = frames.next().await {
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                debug!("frame decode failed: {}", e);
                break;
            }
        };

        match frame.frame_type {
            FrameType::Open => {
                let id = frame.stream_id;
                let (tx, rx) = mpsc::channel(STREAM_BUFFER);
                let duplicate = shared.streams.lock().unwrap().insert(id, tx).is_some();
                if duplicate {
                    warn!(stream_id = id, "peer reopened an existing stream");
                }
                let stream = MuxStream::new(id, shared.outgoing.clone(), rx);
                if incoming_tx.send(stream).await.is_err() {
                    break;
                }
            }
            FrameType::Data => {
                let tx = shared.streams.lock().unwrap().get(&frame.stream_id).cloned();
                match tx {
                    Some(tx) => {
                        if tx.send(frame.payload).await.is_err() {
                            // Receiver dropped; stop buffering for this stream
                            shared.streams.lock().unwrap().remove(&frame.stream_id);
                        }
                    }
                    None => debug!(stream_id = frame.stream_id, "data for unknown stream"),
                }
            }
            FrameType::Close => {
                if frame.flags.has_rst() {
                    debug!(stream_id = frame.stream_id, "stream reset by peer");
                }
                shared.streams.lock().unwrap().remove(&frame.stream_id);
            }
            FrameType::Ping => {
                let pong = Frame::pong(frame.payload);
                if shared.outgoing.send(WriterCmd::Frame(pong)).await.is_err() {
                    break;
                }
            }
            FrameType::Pong => match frame.payload.as_ref().try_into() {
                Ok(bytes) => {
                    let seq = u64::from_be_bytes(bytes);
                    if let Some(tx) = shared.pending_pings.lock().unwrap().remove(&seq) {
                        let _ = tx.send(());
                    }
                }
                Err(_) => warn!("pong with malformed sequence"),
            },
        }
    }

    shared.open.store(false, Ordering::SeqCst);
    shared.streams.lock().unwrap().clear();
    shared.pending_pings.lock().unwrap().clear();
    debug!("session reader stopped");
}

async fn write_loop(mut rx: mpsc::Receiver<WriterCmd>, write_half: OwnedWriteHalf) {
    let mut sink = FramedWrite::new(write_half, FrameCodec::new());

    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Frame(frame) => {
                if let Err(e) = sink.send(frame).await {
                    debug!("frame write failed: {}", e);
                    break;
                }
            }
            WriterCmd::Shutdown => {
                let _ = sink.close().await;
                break;
            }
        }
    }
    debug!("session writer stopped");
}

/// One logical stream within a session
#[derive(Debug)]
pub struct MuxStream {
    send: SendHalf,
    recv: RecvHalf,
}

impl MuxStream {
    fn new(id: u32, out: mpsc::Sender<WriterCmd>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            send: SendHalf {
                id,
                out,
                finished: false,
            },
            recv: RecvHalf { id, rx },
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.send.id
    }

    pub async fn send_data(&mut self, data: Bytes) -> Result<(), SessionError> {
        self.send.send_data(data).await
    }

    pub async fn recv_data(&mut self) -> Option<Bytes> {
        self.recv.recv_data().await
    }

    pub async fn send_message<T: Serialize>(&mut self, msg: &T) -> Result<(), SessionError> {
        self.send.send_message(msg).await
    }

    pub async fn recv_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>, SessionError> {
        self.recv.recv_message().await
    }

    /// Graceful half-close of the send direction
    pub async fn finish(&mut self) -> Result<(), SessionError> {
        self.send.finish().await
    }

    /// Split into independently owned send and receive halves
    pub fn split(self) -> (SendHalf, RecvHalf) {
        (self.send, self.recv)
    }
}

/// Send half of a [`MuxStream`]
#[derive(Debug)]
pub struct SendHalf {
    id: u32,
    out: mpsc::Sender<WriterCmd>,
    finished: bool,
}

impl SendHalf {
    pub async fn send_data(&mut self, data: Bytes) -> Result<(), SessionError> {
        if data.len() > MAX_FRAME_SIZE as usize {
            return Err(SessionError::MessageTooLarge(data.len()));
        }
        self.out
            .send(WriterCmd::Frame(Frame::data(self.id, data)))
            .await
            .map_err(|_| SessionError::ConnectionClosed)
    }

    /// Serialize a message and send it as a single data frame
    pub async fn send_message<T: Serialize>(&mut self, msg: &T) -> Result<(), SessionError> {
        let payload = bincode::serialize(msg).map_err(ProtocolError::Serialization)?;
        self.send_data(Bytes::from(payload)).await
    }

    /// Graceful half-close of the send direction
    pub async fn finish(&mut self) -> Result<(), SessionError> {
        self.finished = true;
        self.out
            .send(WriterCmd::Frame(Frame::close(self.id)))
            .await
            .map_err(|_| SessionError::ConnectionClosed)
    }
}

impl Drop for SendHalf {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.out.try_send(WriterCmd::Frame(Frame::reset(self.id)));
        }
    }
}

/// Receive half of a [`MuxStream`]
#[derive(Debug)]
pub struct RecvHalf {
    id: u32,
    rx: mpsc::Receiver<Bytes>,
}

impl RecvHalf {
    pub fn stream_id(&self) -> u32 {
        self.id
    }

    /// Next chunk of payload bytes; `None` once the peer closed the stream
    /// or the session ended.
    pub async fn recv_data(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Receive one data frame and deserialize it as a message
    pub async fn recv_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>, SessionError> {
        match self.recv_data().await {
            Some(payload) => {
                let msg = bincode::deserialize(&payload).map_err(ProtocolError::Serialization)?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, Deserialize)]
    enum TestMsg {
        Hello(String),
        Count(u64),
    }

    async fn session_pair() -> (MuxSession, MuxSession) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, server) = tokio::join!(
            async { TcpStream::connect(addr).await.unwrap() },
            async { listener.accept().await.unwrap().0 },
        );

        (
            MuxSession::new(client, Side::Client),
            MuxSession::new(server, Side::Server),
        )
    }

    #[tokio::test]
    async fn test_open_accept_and_message_roundtrip() {
        let (client, server) = session_pair().await;

        let mut outbound = client.open_stream().await.unwrap();
        outbound
            .send_message(&TestMsg::Hello("hi".to_string()))
            .await
            .unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        assert_eq!(inbound.stream_id(), outbound.stream_id());

        let msg: TestMsg = inbound.recv_message().await.unwrap().unwrap();
        assert_eq!(msg, TestMsg::Hello("hi".to_string()));

        // Reply on the same stream
        inbound.send_message(&TestMsg::Count(7)).await.unwrap();
        let reply: TestMsg = outbound.recv_message().await.unwrap().unwrap();
        assert_eq!(reply, TestMsg::Count(7));
    }

    #[tokio::test]
    async fn test_both_sides_can_open_streams() {
        let (client, server) = session_pair().await;

        let client_opened = client.open_stream().await.unwrap();
        let server_opened = server.open_stream().await.unwrap();

        // Disjoint ID ranges
        assert_eq!(client_opened.stream_id() % 2, 1);
        assert_eq!(server_opened.stream_id() % 2, 0);

        assert!(server.accept_stream().await.is_some());
        assert!(client.accept_stream().await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_streams_are_independent() {
        let (client, server) = session_pair().await;

        let mut first = client.open_stream().await.unwrap();
        let mut second = client.open_stream().await.unwrap();

        let mut first_in = server.accept_stream().await.unwrap();
        let mut second_in = server.accept_stream().await.unwrap();

        // Interleave sends in both orders
        second.send_data(Bytes::from("b")).await.unwrap();
        first.send_data(Bytes::from("a")).await.unwrap();

        assert_eq!(first_in.recv_data().await.unwrap(), Bytes::from("a"));
        assert_eq!(second_in.recv_data().await.unwrap(), Bytes::from("b"));
    }

    #[tokio::test]
    async fn test_finish_delivers_buffered_data_then_eof() {
        let (client, server) = session_pair().await;

        let mut outbound = client.open_stream().await.unwrap();
        outbound.send_data(Bytes::from("payload")).await.unwrap();
        outbound.finish().await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        assert_eq!(inbound.recv_data().await.unwrap(), Bytes::from("payload"));
        assert!(inbound.recv_data().await.is_none());
    }

    #[tokio::test]
    async fn test_ping_measures_roundtrip() {
        let (client, server) = session_pair().await;

        let rtt = client.ping(Duration::from_secs(1)).await.unwrap();
        assert!(rtt < Duration::from_secs(1));

        // Both directions work
        assert!(server.ping(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_ping_fails_after_peer_close() {
        let (client, server) = session_pair().await;

        server.close().await;

        // Give the client reader a moment to observe the closed connection
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.ping(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_returns_none_after_peer_close() {
        let (client, server) = session_pair().await;

        client.close().await;
        assert!(server.accept_stream().await.is_none());
        assert!(!server.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = session_pair().await;

        client.close().await;
        client.close().await;
        assert!(!client.is_open());
        assert!(matches!(
            client.open_stream().await,
            Err(SessionError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_after_session_close_fails() {
        let (client, server) = session_pair().await;

        let mut stream = client.open_stream().await.unwrap();
        client.close().await;
        drop(server);

        assert!(stream.send_data(Bytes::from("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (client, _server) = session_pair().await;

        let mut stream = client.open_stream().await.unwrap();
        let result = stream
            .send_data(Bytes::from(vec![0u8; MAX_FRAME_SIZE as usize + 1]))
            .await;
        assert!(matches!(result, Err(SessionError::MessageTooLarge(_))));
    }
}
