//! `ListenerMultiplexer`: accepts dual-protocol TCP connections, owns the
//! shared `CookieTable`, and dispatches inbound tunnel frames to the
//! session they belong to.

use crate::config::ProxyConfig;
use crate::cookie::{CookieId, CookieTable, Dispatch};
use crate::host_match::HostMatch;
use crate::json_logger::JsonLogger;
use crate::session;
use crate::tunnel::{Tunnel, TunnelReader};
use crate::tunnel_codec::{TunnelFrame, ACT_SOCKS};
use log::{debug, warn};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, Mutex};

type SessionHandle = mpsc::UnboundedSender<TunnelFrame>;

/// Owns everything shared across sessions: the cookie table, the tunnel
/// collaborator, the host-match oracle, and the static config.
pub struct ListenerMultiplexer {
    pub config: ProxyConfig,
    pub tunnel: Arc<dyn Tunnel>,
    pub host_match: Arc<dyn HostMatch>,
    cookies: Mutex<CookieTable<SessionHandle>>,
}

impl ListenerMultiplexer {
    pub fn new(config: ProxyConfig, tunnel: Arc<dyn Tunnel>, host_match: Arc<dyn HostMatch>) -> Arc<Self> {
        Arc::new(ListenerMultiplexer {
            config,
            tunnel,
            host_match,
            cookies: Mutex::new(CookieTable::new()),
        })
    }

    /// Bind a fresh cookie id to `handle`.
    pub async fn bind_cookie(&self, handle: SessionHandle) -> Option<CookieId> {
        let id = self.cookies.lock().await.bind(handle);
        if let Some(id) = id {
            if self.config.logging.json {
                JsonLogger::cookie_event("cookie_bound", id);
            }
        }
        id
    }

    /// Local-origin immediate release: no remote ack is expected (either
    /// the tunnel is down, or the remote already initiated the teardown).
    pub async fn release_immediate(&self, id: CookieId) {
        self.cookies.lock().await.release_immediate(id);
        if self.config.logging.json {
            JsonLogger::cookie_event("cookie_released", id);
        }
    }

    /// Local-origin deferred release: a `close` frame was sent, reclaim the
    /// id only once the remote's ack comes back through `dispatch_inbound`.
    pub async fn release_deferred(&self, id: CookieId) {
        self.cookies.lock().await.release_deferred(id);
        if self.config.logging.json {
            JsonLogger::cookie_event("cookie_pending_close", id);
        }
    }

    /// Bind the dual-protocol TCP listener per `config.listen_addr`.
    /// Separated from `run` so callers (and tests) can inspect the bound
    /// address before the accept loop starts.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let socket = if self.config.listen_addr.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(self.config.listen_addr)?;
        socket.listen(1024)
    }

    /// Run both the accept loop and the tunnel inbound-dispatch loop until
    /// either one ends.
    pub async fn run(self: Arc<Self>, listener: TcpListener, tunnel_reader: TunnelReader) -> std::io::Result<()> {
        tokio::select! {
            r = self.clone().accept_loop(listener) => r,
            () = self.clone().dispatch_loop(tunnel_reader) => Ok(()),
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                session::run(stream, peer, this).await;
            });
        }
    }

    /// Drain `ACT_SOCKS` frames off the tunnel and route each by cookie id.
    /// Frames under any other action tag are out of scope and ignored.
    async fn dispatch_loop(self: Arc<Self>, mut reader: TunnelReader) {
        loop {
            let frame = match reader.read_frame().await {
                Ok(Some((action_tag, payload))) if action_tag == ACT_SOCKS => {
                    match TunnelFrame::parse(payload) {
                        Ok(f) => f,
                        Err(e) => {
                            debug!("dropped malformed tunnel frame: {}", e);
                            continue;
                        }
                    }
                }
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    warn!("tunnel reader error, shutting down dispatch loop: {}", e);
                    break;
                }
            };
            self.dispatch_inbound(frame).await;
        }
        self.shutdown().await;
    }

    async fn dispatch_inbound(&self, frame: TunnelFrame) {
        let id = frame.cookie_id();
        let is_close_ack = matches!(frame, TunnelFrame::Close { .. });
        let (dispatch, handle) = {
            let mut table = self.cookies.lock().await;
            let dispatch = table.route_inbound(id, is_close_ack);
            let handle = if dispatch == Dispatch::ToSession { table.handle(id).cloned() } else { None };
            (dispatch, handle)
        };
        match dispatch {
            Dispatch::ToSession => {
                if let Some(tx) = handle {
                    let _ = tx.send(frame);
                }
            }
            Dispatch::AckedClose => {
                if self.config.logging.json {
                    JsonLogger::cookie_event("cookie_close_acked", id);
                }
            }
            Dispatch::Unknown => {
                debug!("dropped inbound frame for unknown cookie id {}", id);
            }
        }
    }

    /// Listener teardown: drop every bound session handle, which closes
    /// each session's inbound receiver.
    async fn shutdown(&self) {
        let handles = self.cookies.lock().await.shutdown();
        drop(handles);
    }
}
