//! `Tunnel`: the pre-established encrypted-transport collaborator, treated
//! as an external interface (`send_message`, `is_up`). This module also
//! supplies a minimal concrete `FramedTcpTunnel` so the binary has
//! something real to connect to and drive end-to-end; the transport's own
//! encryption is out of scope here.

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

/// Fire-and-forget, order-preserving message sink to a remote relay, plus
/// an up/down liveness check (queried before emitting a graceful `close`).
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn send_message(&self, action_tag: u8, payload: &[u8]);
    fn is_up(&self) -> bool;
}

/// `action:u8 | len:u32 | payload` framing over a plain `TcpStream`. A
/// background task owns the socket and serializes writes from an mpsc
/// queue so callers never interleave partial frames.
pub struct FramedTcpTunnel {
    tx: mpsc::UnboundedSender<(u8, Vec<u8>)>,
    up: Arc<AtomicBool>,
}

impl FramedTcpTunnel {
    /// Spawn the writer task over `stream` and return the handle plus a
    /// reader half the caller drives to decode inbound `ACT_SOCKS` frames.
    pub fn new(stream: TcpStream) -> (Self, TunnelReader) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let up = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::writer_loop(write_half, rx, up.clone()));

        (FramedTcpTunnel { tx, up: up.clone() }, TunnelReader { read_half, up })
    }

    async fn writer_loop(
        mut write_half: tokio::net::tcp::OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<(u8, Vec<u8>)>,
        up: Arc<AtomicBool>,
    ) {
        while let Some((action_tag, payload)) = rx.recv().await {
            let mut frame = BytesMut::with_capacity(5 + payload.len());
            frame.put_u8(action_tag);
            frame.put_u32(payload.len() as u32);
            frame.put_slice(&payload);
            if let Err(e) = write_half.write_all(&frame).await {
                warn!("tunnel write failed, marking down: {}", e);
                up.store(false, Ordering::SeqCst);
                break;
            }
        }
        up.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Tunnel for FramedTcpTunnel {
    async fn send_message(&self, action_tag: u8, payload: &[u8]) {
        let _ = self.tx.send((action_tag, payload.to_vec()));
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

/// Reader half: decodes `action:u8 | len:u32 | payload` frames off the
/// tunnel socket. Owned by whatever drives the listener's inbound dispatch
/// loop (`ListenerMultiplexer`).
pub struct TunnelReader {
    read_half: tokio::net::tcp::OwnedReadHalf,
    up: Arc<AtomicBool>,
}

impl TunnelReader {
    pub async fn read_frame(&mut self) -> std::io::Result<Option<(u8, bytes::Bytes)>> {
        let mut header = [0u8; 5];
        if let Err(e) = self.read_half.read_exact(&mut header).await {
            self.up.store(false, Ordering::SeqCst);
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e);
        }
        let action_tag = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut payload = vec![0u8; len];
        self.read_half.read_exact(&mut payload).await?;
        Ok(Some((action_tag, bytes::Bytes::from(payload))))
    }
}

/// Test double: an in-memory tunnel that records emitted frames and lets a
/// test enqueue inbound ones, without spawning sockets.
pub struct MockTunnel {
    pub sent: Arc<Mutex<Vec<(u8, Vec<u8>)>>>,
    up: Arc<AtomicBool>,
}

impl MockTunnel {
    pub fn new() -> Self {
        MockTunnel {
            sent: Arc::new(Mutex::new(Vec::new())),
            up: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl Tunnel for MockTunnel {
    async fn send_message(&self, action_tag: u8, payload: &[u8]) {
        self.sent.lock().await.push((action_tag, payload.to_vec()));
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_tunnel_records_order() {
        let t = MockTunnel::new();
        t.send_message(3, b"one").await;
        t.send_message(3, b"two").await;
        let sent = t.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, b"one");
        assert_eq!(sent[1].1, b"two");
    }

    #[tokio::test]
    async fn framed_tunnel_roundtrip_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();

        let (tunnel, mut reader) = FramedTcpTunnel::new(client);
        let (_server_tunnel, mut server_reader) = FramedTcpTunnel::new(server_stream);

        tunnel.send_message(3, b"hello").await;
        let (action_tag, payload) = server_reader.read_frame().await.unwrap().unwrap();
        assert_eq!(action_tag, 3);
        assert_eq!(payload.as_ref(), b"hello");

        drop(tunnel);
        let eof = server_reader.read_frame().await;
        assert!(eof.is_err() || matches!(eof, Ok(None)));
        let _ = reader;
    }
}
