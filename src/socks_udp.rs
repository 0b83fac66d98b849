//! SOCKS5 UDP ASSOCIATE support (RFC 1928 §7): the per-packet header codec
//! (`Socks5UdpCodec`) and the per-session UDP relay actor (`UdpRelay`).
//! Domain names (ATYP=3) are accepted in the header, not just IP literals.

use crate::addr::{Addr, Atyp};
use crate::error::ProtocolError;
use crate::host_match::HostMatch;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Idle timeout for a UDP relay.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(180);
const UDP_TIMER_TICK: Duration = Duration::from_secs(10);

/// `RSV(2) | FRAG(1) | ATYP(1) | DST.ADDR | DST.PORT(2) | DATA`.
pub struct Socks5UdpCodec;

impl Socks5UdpCodec {
    /// Returns the decoded `(frag, addr, port, payload)`.
    pub fn decode(data: &[u8]) -> Result<(u8, Addr, u16, Bytes), ProtocolError> {
        if data.len() < 8 {
            return Err(ProtocolError::TruncatedFrame);
        }
        let mut buf = Bytes::copy_from_slice(data);
        let rsv = buf.get_u16();
        if rsv != 0 {
            return Err(ProtocolError::NonZeroReserved);
        }
        let frag = buf.get_u8();
        let atyp = Atyp::from_u8(buf.get_u8())?;
        let addr = Addr::decode(atyp, &mut buf)?;
        if buf.remaining() < 2 {
            return Err(ProtocolError::TruncatedFrame);
        }
        let port = buf.get_u16();
        Ok((frag, addr, port, buf))
    }

    pub fn encode(frag: u8, addr: &Addr, port: u16, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(10 + payload.len());
        buf.put_u16(0);
        buf.put_u8(frag);
        addr.encode(&mut buf);
        buf.put_u16(port);
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// Event delivered from the relay actor up to the owning session.
#[derive(Debug)]
pub enum UdpRelayEvent {
    /// The relay's UDP socket is bound; equivalent to `tell_socks_ok`.
    Bound(SocketAddr),
    /// A client-origin domain datagram matched `HostMatch` and should be
    /// dispatched via the tunnel (`udp_tunnel_send`).
    TunnelSend { addr: Addr, port: u16, payload: Bytes },
    /// Idle timeout elapsed; equivalent to `tell_close`.
    Closed,
}

/// Command sent down to the relay actor from the owning session.
#[derive(Debug)]
pub enum UdpRelayCmd {
    /// A `udp_data` tunnel frame was unwrapped for this session; re-encode
    /// and forward it to the client.
    DeliverTunnelReply { addr: Addr, port: u16, payload: Bytes },
    Shutdown,
}

/// Per-session UDP relay (component C6).
pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    source_binding: SocketAddr,
    is_ipv6: bool,
    admitted_reply_ports: HashSet<u16>,
    last_activity: Instant,
    host_match: Arc<dyn HostMatch>,
}

impl UdpRelay {
    /// Bind an ephemeral UDP socket of `is_ipv6`'s family and spawn the
    /// relay's event loop. `source_binding` is the sole client endpoint
    /// allowed to originate datagrams; datagrams from anywhere else are dropped.
    pub async fn spawn(
        source_binding: SocketAddr,
        is_ipv6: bool,
        host_match: Arc<dyn HostMatch>,
    ) -> std::io::Result<(mpsc::UnboundedSender<UdpRelayCmd>, mpsc::UnboundedReceiver<UdpRelayEvent>)> {
        let bind_addr: SocketAddr = if is_ipv6 {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();

        let relay = UdpRelay {
            socket,
            source_binding,
            is_ipv6,
            admitted_reply_ports: HashSet::new(),
            last_activity: Instant::now(),
            host_match,
        };

        let _ = evt_tx.send(UdpRelayEvent::Bound(local_addr));
        tokio::spawn(relay.run(cmd_rx, evt_tx));

        Ok((cmd_tx, evt_rx))
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<UdpRelayCmd>,
        evt_tx: mpsc::UnboundedSender<UdpRelayEvent>,
    ) {
        let mut buf = vec![0u8; 65535];
        let mut ticker = interval(UDP_TIMER_TICK);

        loop {
            tokio::select! {
                recvd = self.socket.recv_from(&mut buf) => {
                    match recvd {
                        Ok((n, src)) => self.on_datagram(&buf[..n], src, &evt_tx).await,
                        Err(e) => {
                            warn!("udp relay recv error: {}", e);
                            break;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(UdpRelayCmd::DeliverTunnelReply { addr, port, payload }) => {
                            self.deliver_tunnel_reply(addr, port, &payload).await;
                        }
                        Some(UdpRelayCmd::Shutdown) | None => break,
                    }
                }
                _ = ticker.tick() => {
                    // Re-arm discipline mirrors DirectTcpEgress: only a stale
                    // lastActivity past the full idle window tears down.
                    if self.last_activity.elapsed() >= UDP_IDLE_TIMEOUT {
                        let _ = evt_tx.send(UdpRelayEvent::Closed);
                        break;
                    }
                }
            }
        }
    }

    async fn on_datagram(&mut self, data: &[u8], src: SocketAddr, evt_tx: &mpsc::UnboundedSender<UdpRelayEvent>) {
        if src == self.source_binding {
            self.on_client_datagram(data, evt_tx).await;
        } else if self.admitted_reply_ports.contains(&src.port()) {
            self.on_reply_datagram(data, src).await;
        } else {
            trace!("udp relay dropped datagram from unadmitted source {}", src);
        }
    }

    async fn on_client_datagram(&mut self, data: &[u8], evt_tx: &mpsc::UnboundedSender<UdpRelayEvent>) {
        let (frag, addr, port, payload) = match Socks5UdpCodec::decode(data) {
            Ok(v) => v,
            Err(e) => {
                trace!("udp relay dropped malformed client datagram: {}", e);
                return;
            }
        };
        if frag != 0 {
            // Fragmentation is not supported.
            return;
        }
        let atyp = addr.atyp();
        let family_ok = if self.is_ipv6 {
            matches!(atyp, Atyp::Domain | Atyp::V6)
        } else {
            matches!(atyp, Atyp::Domain | Atyp::V4)
        };
        if !family_ok {
            trace!("udp relay dropped atyp {:?} inconsistent with family", atyp);
            return;
        }

        self.last_activity = Instant::now();
        self.admitted_reply_ports.insert(port);

        if let Addr::Domain(ref host) = addr {
            let (matched, flags) = self.host_match.lookup(host).await;
            if matched && flags == 1 {
                let _ = evt_tx.send(UdpRelayEvent::TunnelSend { addr, port, payload });
                return;
            }
        }

        let dest: SocketAddr = match &addr {
            Addr::V4(ip) => SocketAddr::new(IpAddr::V4(*ip), port),
            Addr::V6(ip) => SocketAddr::new(IpAddr::V6(*ip), port),
            Addr::Domain(host) => match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(mut it) => match it.next() {
                    Some(a) => a,
                    None => return,
                },
                Err(_) => return,
            },
        };
        if let Err(e) = self.socket.send_to(&payload, dest).await {
            debug!("udp relay direct send failed: {}", e);
        }
    }

    async fn on_reply_datagram(&mut self, data: &[u8], src: SocketAddr) {
        self.last_activity = Instant::now();
        let addr = match src.ip() {
            IpAddr::V4(ip) => Addr::V4(ip),
            IpAddr::V6(ip) => Addr::V6(ip),
        };
        let encoded = Socks5UdpCodec::encode(0, &addr, src.port(), data);
        if let Err(e) = self.socket.send_to(&encoded, self.source_binding).await {
            debug!("udp relay reply-to-client send failed: {}", e);
        }
    }

    /// A `udp_data` frame arrived via the tunnel; re-encode and deliver to
    /// the client. Not subject to `admittedReplyPorts` — the tunnel is
    /// already the trusted transport for this cookie id.
    async fn deliver_tunnel_reply(&mut self, addr: Addr, port: u16, payload: &[u8]) {
        self.last_activity = Instant::now();
        let encoded = Socks5UdpCodec::encode(0, &addr, port, payload);
        if let Err(e) = self.socket.send_to(&encoded, self.source_binding).await {
            debug!("udp relay tunnel-reply send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn udp_header_roundtrip() {
        let addr = Addr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let encoded = Socks5UdpCodec::encode(0, &addr, 80, b"Hello");
        let (frag, decoded_addr, port, payload) = Socks5UdpCodec::decode(&encoded).unwrap();
        assert_eq!(frag, 0);
        assert_eq!(decoded_addr, addr);
        assert_eq!(port, 80);
        assert_eq!(payload.as_ref(), b"Hello");
    }

    #[test]
    fn rejects_nonzero_rsv() {
        let mut data = Socks5UdpCodec::encode(0, &Addr::V4(Ipv4Addr::new(1, 2, 3, 4)), 1, b"x").to_vec();
        data[0] = 0xFF;
        assert!(Socks5UdpCodec::decode(&data).is_err());
    }

    #[test]
    fn rejects_truncated() {
        assert!(Socks5UdpCodec::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn domain_header_roundtrip() {
        let addr = Addr::Domain("ex.test".to_string());
        let encoded = Socks5UdpCodec::encode(0, &addr, 53, b"\x00\x01");
        let (_, decoded_addr, port, payload) = Socks5UdpCodec::decode(&encoded).unwrap();
        assert_eq!(decoded_addr, addr);
        assert_eq!(port, 53);
        assert_eq!(payload.as_ref(), b"\x00\x01");
    }
}
