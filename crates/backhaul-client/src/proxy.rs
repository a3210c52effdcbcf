//! Proxy dispatch: connects an inbound tunnel stream to a local service and
//! pipes bytes both ways.

use backhaul_connection::{MuxStream, SessionError};
use backhaul_proto::{ControlMessage, StreamReply, Tunnel};
use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 16384;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown tunnel: {0}")]
    UnknownTunnel(String),

    #[error("failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serve one proxy request: look up the tunnel, connect to its local target,
/// acknowledge the stream, and relay bytes until either side closes. Returns
/// (bytes toward the local service, bytes toward the tunnel).
///
/// Failures before the acknowledgement are reported to the peer as a
/// [`StreamReply::Error`]; the carrying session is unaffected.
pub async fn dispatch(
    tunnels: &HashMap<String, Tunnel>,
    msg: &ControlMessage,
    mut stream: MuxStream,
) -> Result<(u64, u64), DispatchError> {
    let tunnel = match tunnels.get(&msg.tunnel_name) {
        Some(tunnel) => tunnel,
        None => {
            reject(&mut stream, format!("unknown tunnel: {}", msg.tunnel_name)).await;
            return Err(DispatchError::UnknownTunnel(msg.tunnel_name.clone()));
        }
    };

    let local = match TcpStream::connect(&tunnel.local_addr).await {
        Ok(local) => local,
        Err(source) => {
            reject(
                &mut stream,
                format!("failed to connect to {}: {}", tunnel.local_addr, source),
            )
            .await;
            return Err(DispatchError::ConnectionFailed {
                address: tunnel.local_addr.clone(),
                source,
            });
        }
    };

    stream.send_message(&StreamReply::Ok).await?;
    debug!(
        tunnel = %msg.tunnel_name,
        target = %tunnel.local_addr,
        forwarded_for = %msg.forwarded_for,
        "proxying stream"
    );

    copy_bidirectional(stream, local).await
}

async fn reject(stream: &mut MuxStream, reason: String) {
    let _ = stream.send_message(&StreamReply::Error { reason }).await;
    let _ = stream.finish().await;
}

/// Pipe bytes between a tunnel stream and a local TCP connection until both
/// directions see EOF.
async fn copy_bidirectional(
    stream: MuxStream,
    local: TcpStream,
) -> Result<(u64, u64), DispatchError> {
    let (mut send, mut recv) = stream.split();
    let (mut local_read, mut local_write) = local.into_split();

    let inbound = async {
        let mut total = 0u64;
        while let Some(chunk) = recv.recv_data().await {
            total += chunk.len() as u64;
            local_write.write_all(&chunk).await?;
        }
        let _ = local_write.shutdown().await;
        Ok::<u64, DispatchError>(total)
    };

    let outbound = async {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = local_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            send.send_data(Bytes::copy_from_slice(&buf[..n])).await?;
            total += n as u64;
        }
        let _ = send.finish().await;
        Ok::<u64, DispatchError>(total)
    };

    let (to_local, to_tunnel) = tokio::join!(inbound, outbound);
    Ok((to_local?, to_tunnel?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_connection::{MuxSession, Side};
    use tokio::net::TcpListener;

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

    /// Echo server that serves exactly one connection
    async fn spawn_echo() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n]).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_dispatch_pipes_to_local_service() {
        let echo_addr = spawn_echo().await;
        let tunnels = HashMap::from([("web".to_string(), Tunnel::tcp(echo_addr.as_str()))]);
        let (relay_side, client_side) = session_pair().await;

        let msg = ControlMessage::proxy("web", "tcp", "10.0.0.1:40000");
        let serve = tokio::spawn(async move {
            let stream = client_side.accept_stream().await.unwrap();
            let result = dispatch(&tunnels, &msg, stream).await;
            // Hold the session open until dispatch completes
            drop(client_side);
            result
        });

        let mut stream = relay_side.open_stream().await.unwrap();
        let reply: StreamReply = stream.recv_message().await.unwrap().unwrap();
        assert_eq!(reply, StreamReply::Ok);

        stream.send_data(Bytes::from("ping")).await.unwrap();
        assert_eq!(stream.recv_data().await.unwrap(), Bytes::from("ping"));
        stream.finish().await.unwrap();

        let (to_local, to_tunnel) = serve.await.unwrap().unwrap();
        assert_eq!(to_local, 4);
        assert_eq!(to_tunnel, 4);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tunnel_rejects_stream() {
        let tunnels = HashMap::from([("web".to_string(), Tunnel::tcp("127.0.0.1:8080"))]);
        let (relay_side, client_side) = session_pair().await;

        let msg = ControlMessage::proxy("db", "tcp", "");
        let serve = tokio::spawn(async move {
            let stream = client_side.accept_stream().await.unwrap();
            let result = dispatch(&tunnels, &msg, stream).await;
            client_side.close().await;
            result
        });

        let mut stream = relay_side.open_stream().await.unwrap();
        let reply: StreamReply = stream.recv_message().await.unwrap().unwrap();
        assert!(matches!(reply, StreamReply::Error { reason } if reason.contains("unknown tunnel")));

        assert!(matches!(
            serve.await.unwrap(),
            Err(DispatchError::UnknownTunnel(name)) if name == "db"
        ));
    }

    #[tokio::test]
    async fn test_dispatch_unreachable_target_rejects_stream() {
        // Bind and drop to get a port nothing listens on
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = unused.local_addr().unwrap().to_string();
        drop(unused);

        let tunnels = HashMap::from([("web".to_string(), Tunnel::tcp(dead_addr.as_str()))]);
        let (relay_side, client_side) = session_pair().await;

        let msg = ControlMessage::proxy("web", "tcp", "");
        let serve = tokio::spawn(async move {
            let stream = client_side.accept_stream().await.unwrap();
            let result = dispatch(&tunnels, &msg, stream).await;
            client_side.close().await;
            result
        });

        let mut stream = relay_side.open_stream().await.unwrap();
        let reply: StreamReply = stream.recv_message().await.unwrap().unwrap();
        assert!(matches!(reply, StreamReply::Error { reason } if reason.contains("failed to connect")));

        assert!(matches!(
            serve.await.unwrap(),
            Err(DispatchError::ConnectionFailed { .. })
        ));
    }
}
