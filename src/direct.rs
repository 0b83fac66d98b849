//! `DirectTcpEgress`: a direct (non-tunneled) outbound TCP connection to an
//! origin server, owned by one `SessionStateMachine`.

use bytes::Bytes;
use log::{debug, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const IDLE_RE_ARM: Duration = Duration::from_secs(10);

/// Event delivered from the egress actor up to the owning session.
#[derive(Debug)]
pub enum EgressEvent {
    /// `tell_socks_ok(local_addr, local_port)`.
    Connected(SocketAddr),
    /// `tell_error`.
    ConnectFailed(std::io::Error),
    /// Bytes read from the origin, forwarded to the owner raw.
    Data(Bytes),
    /// Idle timeout, or the origin closed; any already-buffered read data
    /// is delivered via a prior `Data` event before this, not bundled into
    /// `Closed` itself.
    Closed,
}

/// Command sent down to the egress actor from the owning session.
#[derive(Debug)]
pub enum EgressCmd {
    Write(Bytes),
    Shutdown,
}

/// Open a non-blocking TCP connection to `target` and spawn its actor loop.
/// Reports `Connected`/`ConnectFailed` as the first event.
pub fn spawn(target: SocketAddr) -> (mpsc::UnboundedSender<EgressCmd>, mpsc::UnboundedReceiver<EgressEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(target, cmd_rx, evt_tx));
    (cmd_tx, evt_rx)
}

async fn run(
    target: SocketAddr,
    mut cmd_rx: mpsc::UnboundedReceiver<EgressCmd>,
    evt_tx: mpsc::UnboundedSender<EgressEvent>,
) {
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _ = evt_tx.send(EgressEvent::ConnectFailed(e));
            return;
        }
        Err(_) => {
            let _ = evt_tx.send(EgressEvent::ConnectFailed(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )));
            return;
        }
    };
    let local_addr = match stream.local_addr() {
        Ok(a) => a,
        Err(e) => {
            let _ = evt_tx.send(EgressEvent::ConnectFailed(e));
            return;
        }
    };
    let _ = evt_tx.send(EgressEvent::Connected(local_addr));

    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; 16384];
    let mut idle_elapsed = Duration::ZERO;

    loop {
        tokio::select! {
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        let _ = evt_tx.send(EgressEvent::Closed);
                        break;
                    }
                    Ok(n) => {
                        idle_elapsed = Duration::ZERO;
                        let _ = evt_tx.send(EgressEvent::Data(Bytes::copy_from_slice(&buf[..n])));
                    }
                    Err(e) => {
                        // Flush-then-close: any error forwards whatever
                        // was already read before signaling close. No unread data
                        // survives a hard I/O error, so this is a direct Closed.
                        debug!("direct egress read error: {}", e);
                        let _ = evt_tx.send(EgressEvent::Closed);
                        break;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(EgressCmd::Write(data)) => {
                        idle_elapsed = Duration::ZERO;
                        if let Err(e) = write_half.write_all(&data).await {
                            warn!("direct egress write error: {}", e);
                            let _ = evt_tx.send(EgressEvent::Closed);
                            break;
                        }
                    }
                    Some(EgressCmd::Shutdown) | None => break,
                }
            }
            _ = tokio::time::sleep(IDLE_RE_ARM) => {
                idle_elapsed += IDLE_RE_ARM;
                if idle_elapsed >= IDLE_TIMEOUT {
                    let _ = evt_tx.send(EgressEvent::Closed);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_and_echoes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let (cmd_tx, mut evt_rx) = spawn(addr);
        match evt_rx.recv().await.unwrap() {
            EgressEvent::Connected(_) => {}
            other => panic!("expected Connected, got {:?}", other),
        }

        cmd_tx.send(EgressCmd::Write(Bytes::from_static(b"ping"))).unwrap();
        match evt_rx.recv().await.unwrap() {
            EgressEvent::Data(data) => assert_eq!(data.as_ref(), b"ping"),
            other => panic!("expected Data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn connect_failure_reports_error() {
        // Port 0 connect attempts fail immediately on most platforms; use an
        // address nothing listens on instead for a deterministic refusal.
        let (_, mut evt_rx) = spawn("127.0.0.1:1".parse().unwrap());
        match evt_rx.recv().await.unwrap() {
            EgressEvent::ConnectFailed(_) => {}
            other => panic!("expected ConnectFailed, got {:?}", other),
        }
    }
}
