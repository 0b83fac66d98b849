//! `SessionStateMachine`: per-connection protocol discrimination,
//! handshake, routing decision, and data-phase relay.
//!
//! Runs as one tokio task per accepted connection. Per-cookie frame
//! ordering is preserved because a session never reads ahead of the point
//! a routing decision depends on, and falls out of task/channel ordering
//! rather than an explicit reordering buffer.

use crate::addr::Addr;
use crate::cookie::CookieId;
use crate::direct;
use crate::error::{FramingError, SessionError};
use crate::http;
use crate::json_logger::JsonLogger;
use crate::listener::ListenerMultiplexer;
use crate::socks5::{self, PrefixedStream};
use crate::socks_udp;
use crate::tunnel_codec::{Proto, TunnelFrame, ACT_SOCKS};
use bytes::{Bytes, BytesMut};
use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const IDLE_RE_ARM: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
enum ReplyKind {
    Socks5,
    HttpConnect,
}

/// Entry point: one task per accepted connection.
pub async fn run(stream: TcpStream, peer: SocketAddr, listener: Arc<ListenerMultiplexer>) {
    if listener.config.logging.json {
        JsonLogger::session_accept(&peer.to_string(), "pending");
    }
    match run_inner(stream, peer, listener.clone()).await {
        Ok(()) => debug!("session {} finished", peer),
        Err(e) => debug!("session {} ended: {}", peer, e),
    }
    if listener.config.logging.json {
        JsonLogger::session_teardown(&peer.to_string(), "closed");
    }
}

async fn run_inner(stream: TcpStream, peer: SocketAddr, listener: Arc<ListenerMultiplexer>) -> Result<(), SessionError> {
    let (is_socks5, pstream) = discriminate(stream).await?;
    if is_socks5 {
        handle_socks5(pstream, peer, listener).await
    } else {
        handle_http(pstream, peer, listener).await
    }
}

/// `byte[0] == 0x05` selects SOCKS5, anything else HTTP.
/// The probe bytes are replayed to the handshake reader via `PrefixedStream`
/// rather than consumed and lost.
async fn discriminate(mut stream: TcpStream) -> Result<(bool, PrefixedStream), SessionError> {
    let mut probe = [0u8; 4096];
    let n = stream.read(&mut probe).await.map_err(SessionError::Io)?;
    if n == 0 {
        return Err(SessionError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "client closed before sending any bytes",
        )));
    }
    let is_socks5 = probe[0] == 0x05;
    Ok((is_socks5, PrefixedStream::new(stream, BytesMut::from(&probe[..n]))))
}

async fn with_handshake_timeout<T, F>(listener: &ListenerMultiplexer, fut: F) -> Result<T, SessionError>
where
    F: std::future::Future<Output = Result<T, SessionError>>,
{
    match timeout(Duration::from_secs(listener.config.timeouts.handshake_secs), fut).await {
        Ok(r) => r,
        Err(_) => Err(SessionError::IdleTimeout),
    }
}

fn classify_host(host: String) -> Addr {
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        return Addr::V4(ip);
    }
    if let Ok(ip) = host.parse::<std::net::Ipv6Addr>() {
        return Addr::V6(ip);
    }
    Addr::Domain(host)
}

/// Only domain names are consulted; IP-literal destinations always go
/// direct (mirrors `UdpRelay::on_client_datagram`'s routing rule).
async fn route_for(addr: &Addr, listener: &ListenerMultiplexer) -> bool {
    match addr {
        Addr::Domain(h) => {
            let (matched, flags) = listener.host_match.lookup(h).await;
            matched && flags == 1
        }
        _ => false,
    }
}

async fn resolve_addr(addr: &Addr, port: u16) -> std::io::Result<SocketAddr> {
    match addr {
        Addr::V4(ip) => Ok(SocketAddr::new(std::net::IpAddr::V4(*ip), port)),
        Addr::V6(ip) => Ok(SocketAddr::new(std::net::IpAddr::V6(*ip), port)),
        Addr::Domain(host) => tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses for host")),
    }
}

async fn write_success_reply(pstream: &mut PrefixedStream, kind: ReplyKind, bind: SocketAddr) -> std::io::Result<()> {
    match kind {
        ReplyKind::Socks5 => socks5::write_reply_ok(pstream, bind).await,
        ReplyKind::HttpConnect => {
            pstream
                .write_all(b"HTTP/1.1 200 Connection Established\r\nServer: duomux\r\nConnection: Keep-Alive\r\n\r\n")
                .await
        }
    }
}

async fn write_failure_reply(pstream: &mut PrefixedStream, kind: ReplyKind) -> std::io::Result<()> {
    match kind {
        ReplyKind::Socks5 => socks5::write_reply_error(pstream, 0x05).await,
        ReplyKind::HttpConnect => Ok(()),
    }
}

// ---------------------------------------------------------------------
// SOCKS5 path
// ---------------------------------------------------------------------

async fn handle_socks5(mut pstream: PrefixedStream, peer: SocketAddr, listener: Arc<ListenerMultiplexer>) -> Result<(), SessionError> {
    let req = with_handshake_timeout(&listener, async {
        let mut head = [0u8; 2];
        pstream.read_exact(&mut head).await.map_err(SessionError::Io)?;
        socks5::negotiate_no_auth(&mut pstream, head[1]).await.map_err(SessionError::Io)?;
        Ok(socks5::read_request(&mut pstream).await?)
    })
    .await?;

    let Some(req) = req else {
        debug!("socks5 session {} sent an unsupported command; tearing down silently", peer);
        return Ok(());
    };

    match req.command {
        socks5::Command::Connect => {
            handle_connect_like(pstream, req.addr, req.port, listener, ReplyKind::Socks5, Bytes::new()).await
        }
        socks5::Command::UdpAssociate => handle_udp_associate(pstream, peer, req.addr, req.port, listener).await,
    }
}

// ---------------------------------------------------------------------
// HTTP path
// ---------------------------------------------------------------------

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn read_headers<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(String, Bytes), SessionError> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut tmp = [0u8; 4096];
    loop {
        if let Some(pos) = find_double_crlf(&buf) {
            let header_bytes = buf.split_to(pos + 4);
            let header_text: String = header_bytes.iter().map(|&b| b as char).collect();
            return Ok((header_text, buf.freeze()));
        }
        if buf.len() > http::MAX_HEADER_SIZE {
            return Err(SessionError::Framing(FramingError::HeaderTooLarge));
        }
        let n = stream.read(&mut tmp).await.map_err(SessionError::Io)?;
        if n == 0 {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client closed before headers completed",
            )));
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

async fn handle_http(mut pstream: PrefixedStream, _peer: SocketAddr, listener: Arc<ListenerMultiplexer>) -> Result<(), SessionError> {
    let (header_text, leftover) = with_handshake_timeout(&listener, read_headers(&mut pstream)).await?;
    let parsed = http::parse_request_header(&header_text)?;

    if parsed.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = http::parse_connect_target(&parsed.target)?;
        let addr = classify_host(host);
        handle_connect_like(pstream, addr, port, listener, ReplyKind::HttpConnect, leftover).await
    } else {
        let (host, port, path) = http::parse_absolute_uri(&parsed.target)?;
        let addr = classify_host(host);
        let tunneled = route_for(&addr, &listener).await;
        let rebuilt = http::rebuild_request_header(&parsed.method, &path, &parsed.headers);
        let mut outbound = BytesMut::from(rebuilt.as_bytes());
        outbound.extend_from_slice(&leftover);
        let outbound = outbound.freeze();

        if listener.config.logging.json {
            JsonLogger::route_decision(&addr.host_string(), tunneled);
        }
        if tunneled {
            handle_http_transparent_tunneled(pstream, addr, port, outbound, listener).await
        } else {
            handle_http_transparent_direct(pstream, addr, port, outbound, listener).await
        }
    }
}

async fn handle_http_transparent_direct(
    mut pstream: PrefixedStream,
    addr: Addr,
    port: u16,
    outbound: Bytes,
    listener: Arc<ListenerMultiplexer>,
) -> Result<(), SessionError> {
    let target = resolve_addr(&addr, port).await.map_err(SessionError::Io)?;
    let (cmd_tx, mut evt_rx) = direct::spawn(target);
    let event = with_handshake_timeout(&listener, async {
        evt_rx
            .recv()
            .await
            .ok_or_else(|| SessionError::ConnectFailed(std::io::Error::new(std::io::ErrorKind::Other, "egress actor died")))
    })
    .await?;

    match event {
        direct::EgressEvent::Connected(_) => {
            let _ = cmd_tx.send(direct::EgressCmd::Write(outbound));
            relay_http_response(pstream, cmd_tx, evt_rx, listener.config.timeouts.tcp_idle_secs).await
        }
        direct::EgressEvent::ConnectFailed(e) => {
            debug!("http transparent connect to {:?}:{} failed: {}", addr, port, e);
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn relay_http_response(
    mut pstream: PrefixedStream,
    cmd_tx: mpsc::UnboundedSender<direct::EgressCmd>,
    mut evt_rx: mpsc::UnboundedReceiver<direct::EgressEvent>,
    idle_secs: u64,
) -> Result<(), SessionError> {
    let mut framer = http::HttpResponseFramer::new();
    let idle_timeout = Duration::from_secs(idle_secs);
    let mut idle_elapsed = Duration::ZERO;
    let mut buf = [0u8; 16384];

    loop {
        tokio::select! {
            read = pstream.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => { let _ = cmd_tx.send(direct::EgressCmd::Shutdown); }
                    Ok(n) => {
                        idle_elapsed = Duration::ZERO;
                        let _ = cmd_tx.send(direct::EgressCmd::Write(Bytes::copy_from_slice(&buf[..n])));
                    }
                }
            }
            event = evt_rx.recv() => {
                match event {
                    Some(direct::EgressEvent::Data(data)) => {
                        idle_elapsed = Duration::ZERO;
                        if let Err(e) = framer.feed(&data) {
                            debug!("http response framing error: {}", e);
                            return Ok(());
                        }
                        let out = framer.drain();
                        if !out.is_empty() && pstream.write_all(&out).await.is_err() {
                            return Ok(());
                        }
                        if framer.finished() {
                            return Ok(());
                        }
                    }
                    Some(direct::EgressEvent::Closed) | None => {
                        framer.notify_egress_closed();
                        let out = framer.drain();
                        if !out.is_empty() {
                            let _ = pstream.write_all(&out).await;
                        }
                        return Ok(());
                    }
                    _ => {}
                }
            }
            _ = sleep(IDLE_RE_ARM) => {
                idle_elapsed += IDLE_RE_ARM;
                if idle_elapsed >= idle_timeout {
                    let _ = cmd_tx.send(direct::EgressCmd::Shutdown);
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_http_transparent_tunneled(
    mut pstream: PrefixedStream,
    addr: Addr,
    port: u16,
    outbound: Bytes,
    listener: Arc<ListenerMultiplexer>,
) -> Result<(), SessionError> {
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let Some(cookie_id) = listener.bind_cookie(inbound_tx).await else {
        return Err(SessionError::CookieExhausted);
    };
    listener
        .tunnel
        .send_message(ACT_SOCKS, &TunnelFrame::build_reqconn(cookie_id, Proto::Tcp, &addr, port))
        .await;

    let resp = with_handshake_timeout(&listener, async {
        inbound_rx.recv().await.ok_or(SessionError::TunnelDown)
    })
    .await;

    match resp {
        Ok(TunnelFrame::RespConn { status, .. }) if status == 2 => {
            listener
                .tunnel
                .send_message(ACT_SOCKS, &TunnelFrame::build_tcp_data(cookie_id, false, &outbound))
                .await;
        }
        _ => {
            listener.release_immediate(cookie_id).await;
            return Ok(());
        }
    }

    relay_http_response_tunneled(pstream, listener, cookie_id, inbound_rx).await
}

async fn relay_http_response_tunneled(
    mut pstream: PrefixedStream,
    listener: Arc<ListenerMultiplexer>,
    cookie_id: CookieId,
    mut inbound_rx: mpsc::UnboundedReceiver<TunnelFrame>,
) -> Result<(), SessionError> {
    let mut framer = http::HttpResponseFramer::new();
    let idle_timeout = Duration::from_secs(listener.config.timeouts.tcp_idle_secs);
    let mut idle_elapsed = Duration::ZERO;
    let mut buf = [0u8; 16384];

    loop {
        tokio::select! {
            read = pstream.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => {
                        teardown_tunneled(&listener, cookie_id).await;
                        return Ok(());
                    }
                    Ok(n) => {
                        idle_elapsed = Duration::ZERO;
                        listener.tunnel.send_message(ACT_SOCKS, &TunnelFrame::build_tcp_data(cookie_id, false, &buf[..n])).await;
                    }
                }
            }
            frame = inbound_rx.recv() => {
                match frame {
                    Some(TunnelFrame::TcpData { is_close, payload, .. }) => {
                        idle_elapsed = Duration::ZERO;
                        if !payload.is_empty() {
                            if let Err(e) = framer.feed(&payload) {
                                debug!("http response framing error over tunnel: {}", e);
                                listener.release_immediate(cookie_id).await;
                                return Ok(());
                            }
                        }
                        let out = framer.drain();
                        if !out.is_empty() && pstream.write_all(&out).await.is_err() {
                            listener.release_immediate(cookie_id).await;
                            return Ok(());
                        }
                        if is_close || framer.finished() {
                            framer.notify_egress_closed();
                            let out = framer.drain();
                            if !out.is_empty() {
                                let _ = pstream.write_all(&out).await;
                            }
                            listener.release_immediate(cookie_id).await;
                            return Ok(());
                        }
                    }
                    Some(TunnelFrame::Close { .. }) | None => {
                        framer.notify_egress_closed();
                        let out = framer.drain();
                        if !out.is_empty() {
                            let _ = pstream.write_all(&out).await;
                        }
                        listener.release_immediate(cookie_id).await;
                        return Ok(());
                    }
                    Some(_) => {}
                }
            }
            _ = sleep(IDLE_RE_ARM) => {
                idle_elapsed += IDLE_RE_ARM;
                if idle_elapsed >= idle_timeout {
                    teardown_tunneled(&listener, cookie_id).await;
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// Shared CONNECT-style opaque tunnel/direct relay (SOCKS5 CONNECT and
// HTTP CONNECT share this shape: a successful handshake turns the
// connection into an untouched byte pipe in both directions).
// ---------------------------------------------------------------------

async fn handle_connect_like(
    pstream: PrefixedStream,
    addr: Addr,
    port: u16,
    listener: Arc<ListenerMultiplexer>,
    reply_kind: ReplyKind,
    leftover: Bytes,
) -> Result<(), SessionError> {
    let tunneled = route_for(&addr, &listener).await;
    if listener.config.logging.json {
        JsonLogger::route_decision(&addr.host_string(), tunneled);
    }
    if tunneled {
        handle_connect_tunneled(pstream, addr, port, listener, reply_kind, leftover).await
    } else {
        handle_connect_direct(pstream, addr, port, listener, reply_kind, leftover).await
    }
}

async fn handle_connect_direct(
    mut pstream: PrefixedStream,
    addr: Addr,
    port: u16,
    listener: Arc<ListenerMultiplexer>,
    reply_kind: ReplyKind,
    leftover: Bytes,
) -> Result<(), SessionError> {
    let target = resolve_addr(&addr, port).await.map_err(SessionError::Io)?;
    let (cmd_tx, mut evt_rx) = direct::spawn(target);
    let event = with_handshake_timeout(&listener, async {
        evt_rx
            .recv()
            .await
            .ok_or_else(|| SessionError::ConnectFailed(std::io::Error::new(std::io::ErrorKind::Other, "egress actor died")))
    })
    .await?;

    match event {
        direct::EgressEvent::Connected(local) => {
            write_success_reply(&mut pstream, reply_kind, local).await.map_err(SessionError::Io)?;
            if listener.config.logging.json {
                JsonLogger::egress_connect(&addr.host_string(), true);
            }
            if !leftover.is_empty() {
                let _ = cmd_tx.send(direct::EgressCmd::Write(leftover));
            }
            pipe_direct_raw(pstream, cmd_tx, evt_rx, listener.config.timeouts.tcp_idle_secs).await
        }
        direct::EgressEvent::ConnectFailed(e) => {
            debug!("direct connect to {:?}:{} failed: {}", addr, port, e);
            if listener.config.logging.json {
                JsonLogger::egress_connect(&addr.host_string(), false);
            }
            write_failure_reply(&mut pstream, reply_kind).await.map_err(SessionError::Io)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn pipe_direct_raw(
    mut pstream: PrefixedStream,
    cmd_tx: mpsc::UnboundedSender<direct::EgressCmd>,
    mut evt_rx: mpsc::UnboundedReceiver<direct::EgressEvent>,
    idle_secs: u64,
) -> Result<(), SessionError> {
    let idle_timeout = Duration::from_secs(idle_secs);
    let mut idle_elapsed = Duration::ZERO;
    let mut buf = [0u8; 16384];

    loop {
        tokio::select! {
            read = pstream.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => { let _ = cmd_tx.send(direct::EgressCmd::Shutdown); return Ok(()); }
                    Ok(n) => {
                        idle_elapsed = Duration::ZERO;
                        let _ = cmd_tx.send(direct::EgressCmd::Write(Bytes::copy_from_slice(&buf[..n])));
                    }
                }
            }
            event = evt_rx.recv() => {
                match event {
                    Some(direct::EgressEvent::Data(data)) => {
                        idle_elapsed = Duration::ZERO;
                        if pstream.write_all(&data).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(direct::EgressEvent::Closed) | None => return Ok(()),
                    _ => {}
                }
            }
            _ = sleep(IDLE_RE_ARM) => {
                idle_elapsed += IDLE_RE_ARM;
                if idle_elapsed >= idle_timeout {
                    let _ = cmd_tx.send(direct::EgressCmd::Shutdown);
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connect_tunneled(
    mut pstream: PrefixedStream,
    addr: Addr,
    port: u16,
    listener: Arc<ListenerMultiplexer>,
    reply_kind: ReplyKind,
    leftover: Bytes,
) -> Result<(), SessionError> {
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let Some(cookie_id) = listener.bind_cookie(inbound_tx).await else {
        write_failure_reply(&mut pstream, reply_kind).await.map_err(SessionError::Io)?;
        return Err(SessionError::CookieExhausted);
    };
    listener
        .tunnel
        .send_message(ACT_SOCKS, &TunnelFrame::build_reqconn(cookie_id, Proto::Tcp, &addr, port))
        .await;

    let resp = with_handshake_timeout(&listener, async {
        inbound_rx.recv().await.ok_or(SessionError::TunnelDown)
    })
    .await;

    match resp {
        Ok(TunnelFrame::RespConn { status, .. }) if status == 2 => {
            let local = pstream.local_addr().map_err(SessionError::Io)?;
            write_success_reply(&mut pstream, reply_kind, local).await.map_err(SessionError::Io)?;
            if !leftover.is_empty() {
                listener
                    .tunnel
                    .send_message(ACT_SOCKS, &TunnelFrame::build_tcp_data(cookie_id, false, &leftover))
                    .await;
            }
            pipe_tunneled_raw(pstream, listener, cookie_id, inbound_rx).await
        }
        Ok(_) => {
            write_failure_reply(&mut pstream, reply_kind).await.map_err(SessionError::Io)?;
            listener.release_immediate(cookie_id).await;
            Ok(())
        }
        Err(_) => {
            write_failure_reply(&mut pstream, reply_kind).await.map_err(SessionError::Io)?;
            teardown_tunneled(&listener, cookie_id).await;
            Ok(())
        }
    }
}

async fn pipe_tunneled_raw(
    mut pstream: PrefixedStream,
    listener: Arc<ListenerMultiplexer>,
    cookie_id: CookieId,
    mut inbound_rx: mpsc::UnboundedReceiver<TunnelFrame>,
) -> Result<(), SessionError> {
    let idle_timeout = Duration::from_secs(listener.config.timeouts.tcp_idle_secs);
    let mut idle_elapsed = Duration::ZERO;
    let mut buf = [0u8; 16384];

    loop {
        tokio::select! {
            read = pstream.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => {
                        teardown_tunneled(&listener, cookie_id).await;
                        return Ok(());
                    }
                    Ok(n) => {
                        idle_elapsed = Duration::ZERO;
                        listener.tunnel.send_message(ACT_SOCKS, &TunnelFrame::build_tcp_data(cookie_id, false, &buf[..n])).await;
                    }
                }
            }
            frame = inbound_rx.recv() => {
                match frame {
                    Some(TunnelFrame::TcpData { is_close, payload, .. }) => {
                        idle_elapsed = Duration::ZERO;
                        if !payload.is_empty() && pstream.write_all(&payload).await.is_err() {
                            listener.release_immediate(cookie_id).await;
                            return Ok(());
                        }
                        if is_close {
                            listener.release_immediate(cookie_id).await;
                            return Ok(());
                        }
                    }
                    Some(TunnelFrame::Close { .. }) | None => {
                        listener.release_immediate(cookie_id).await;
                        return Ok(());
                    }
                    Some(_) => {}
                }
            }
            _ = sleep(IDLE_RE_ARM) => {
                idle_elapsed += IDLE_RE_ARM;
                if idle_elapsed >= idle_timeout {
                    teardown_tunneled(&listener, cookie_id).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Local-origin teardown: emit `close` if the tunnel is up and wait for the
/// remote's ack before reclaiming the id; otherwise reclaim immediately
/// since no ack will ever arrive.
async fn teardown_tunneled(listener: &ListenerMultiplexer, cookie_id: CookieId) {
    if listener.tunnel.is_up() {
        listener.tunnel.send_message(ACT_SOCKS, &TunnelFrame::build_close(cookie_id)).await;
        listener.release_deferred(cookie_id).await;
    } else {
        listener.release_immediate(cookie_id).await;
    }
}

// ---------------------------------------------------------------------
// SOCKS5 UDP ASSOCIATE (C6 glue)
// ---------------------------------------------------------------------

async fn recv_inbound(rx: &mut Option<mpsc::UnboundedReceiver<TunnelFrame>>) -> Option<TunnelFrame> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

/// The UDP ASSOCIATE control connection stays open only to detect client
/// disconnect (RFC 1928 §7); the relay's cookie id is bound lazily, the
/// first time a client datagram needs tunnel routing.
async fn handle_udp_associate(
    mut pstream: PrefixedStream,
    peer: SocketAddr,
    req_addr: Addr,
    req_port: u16,
    listener: Arc<ListenerMultiplexer>,
) -> Result<(), SessionError> {
    let is_ipv6 = matches!(req_addr, Addr::V6(_)) || peer.is_ipv6();
    let source_binding = SocketAddr::new(peer.ip(), req_port);
    let (relay_cmd_tx, mut relay_evt_rx) = socks_udp::UdpRelay::spawn(source_binding, is_ipv6, listener.host_match.clone())
        .await
        .map_err(SessionError::Io)?;

    let bound_addr = with_handshake_timeout(&listener, async {
        match relay_evt_rx.recv().await {
            Some(socks_udp::UdpRelayEvent::Bound(a)) => Ok(a),
            _ => Err(SessionError::Io(std::io::Error::new(std::io::ErrorKind::Other, "udp relay failed to bind"))),
        }
    })
    .await?;
    socks5::write_reply_ok(&mut pstream, bound_addr).await.map_err(SessionError::Io)?;

    let mut cookie_id: Option<CookieId> = None;
    let mut inbound_rx: Option<mpsc::UnboundedReceiver<TunnelFrame>> = None;
    let idle_timeout = Duration::from_secs(listener.config.timeouts.udp_idle_secs);
    let mut idle_elapsed = Duration::ZERO;
    let mut ctrl_buf = [0u8; 256];

    loop {
        tokio::select! {
            read = pstream.read(&mut ctrl_buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            evt = relay_evt_rx.recv() => {
                match evt {
                    Some(socks_udp::UdpRelayEvent::TunnelSend { addr, port, payload }) => {
                        idle_elapsed = Duration::ZERO;
                        let id = if let Some(id) = cookie_id {
                            id
                        } else {
                            let (tx, rx) = mpsc::unbounded_channel();
                            match listener.bind_cookie(tx).await {
                                Some(id) => {
                                    let placeholder = if is_ipv6 {
                                        Addr::V6(std::net::Ipv6Addr::UNSPECIFIED)
                                    } else {
                                        Addr::V4(std::net::Ipv4Addr::UNSPECIFIED)
                                    };
                                    listener.tunnel.send_message(ACT_SOCKS, &TunnelFrame::build_reqconn(id, Proto::Udp, &placeholder, 0)).await;
                                    cookie_id = Some(id);
                                    inbound_rx = Some(rx);
                                    id
                                }
                                None => {
                                    debug!("udp associate for {} dropped datagram: cookie ids exhausted", peer);
                                    continue;
                                }
                            }
                        };
                        listener.tunnel.send_message(ACT_SOCKS, &TunnelFrame::build_udp_data(id, &addr, port, &payload)).await;
                    }
                    Some(socks_udp::UdpRelayEvent::Bound(_)) => {}
                    Some(socks_udp::UdpRelayEvent::Closed) | None => break,
                }
            }
            frame = recv_inbound(&mut inbound_rx) => {
                match frame {
                    Some(TunnelFrame::UdpData { addr, port, payload, .. }) => {
                        idle_elapsed = Duration::ZERO;
                        let _ = relay_cmd_tx.send(socks_udp::UdpRelayCmd::DeliverTunnelReply { addr, port, payload });
                    }
                    Some(TunnelFrame::Close { .. }) => break,
                    Some(_) => {}
                    None => {}
                }
            }
            _ = sleep(IDLE_RE_ARM) => {
                idle_elapsed += IDLE_RE_ARM;
                if idle_elapsed >= idle_timeout {
                    break;
                }
            }
        }
    }

    let _ = relay_cmd_tx.send(socks_udp::UdpRelayCmd::Shutdown);
    if let Some(id) = cookie_id {
        teardown_tunneled(&listener, id).await;
    }
    Ok(())
}
