//! SOCKS5 negotiation (RFC 1928): method selection (step 1) and the
//! CONNECT/UDP-ASSOCIATE request (step 2), plus `PrefixedStream`, the
//! peek-then-replay wrapper `SessionStateMachine` uses for protocol
//! discrimination.
//!
//! Only NO AUTH is ever offered or accepted, and only `CMD ∈ {1,3}` is
//! supported; anything else tears the connection down silently.

use crate::addr::{Addr, Atyp};
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use std::io::Error;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Wrapper that prepends buffered data before reading from the underlying stream
pub struct PrefixedStream {
    stream: TcpStream,
    prefix: Option<BytesMut>,
}

impl PrefixedStream {
    pub fn new(stream: TcpStream, prefix: BytesMut) -> Self {
        Self {
            stream,
            prefix: if prefix.is_empty() { None } else { Some(prefix) },
        }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        // If we have buffered data, read from that first
        if let Some(prefix) = &mut self.prefix {
            let to_copy = std::cmp::min(buf.remaining(), prefix.len());
            buf.put_slice(&prefix[..to_copy]);
            prefix.advance(to_copy);

            if prefix.is_empty() {
                self.prefix = None;
            }

            return Poll::Ready(Ok(()));
        }

        // Otherwise read from the underlying stream
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl PrefixedStream {
    pub fn split(self) -> (tokio::io::ReadHalf<Self>, tokio::io::WriteHalf<Self>) {
        tokio::io::split(self)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;

/// SOCKS5 command byte, restricted to what this proxy supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
}

impl Command {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Command::Connect),
            3 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// A fully parsed SOCKS5 request (step 2).
#[derive(Debug, Clone, PartialEq)]
pub struct Socks5Request {
    pub command: Command,
    pub addr: Addr,
    pub port: u16,
}

/// Step 1, post-discrimination: the caller has already peeked `(VER,
/// NMETHODS)` off the wire. This reads the `NMETHODS` method bytes and
/// replies `0x05 0x00` (NO AUTH) — no other method is ever selected.
pub async fn negotiate_no_auth<S>(stream: &mut S, nmethods: u8) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Step 2: `VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT`. Returns `None`
/// (caller tears down, no reply) on unsupported `CMD`; malformed bytes
/// become a `ProtocolError`.
pub async fn read_request<S>(stream: &mut S) -> Result<Option<Socks5Request>, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.map_err(|_| ProtocolError::MalformedRequestLine)?;
    let (version, cmd, _rsv, atyp) = (head[0], head[1], head[2], head[3]);
    if version != SOCKS5_VERSION {
        return Err(ProtocolError::UnsupportedSocksVersion(version));
    }
    let Some(command) = Command::from_u8(cmd) else {
        return Ok(None);
    };
    let atyp = Atyp::from_u8(atyp)?;
    let addr = match atyp {
        Atyp::V4 => {
            let mut raw = [0u8; 4];
            stream.read_exact(&mut raw).await.map_err(|_| ProtocolError::TruncatedFrame)?;
            Addr::decode(atyp, &mut &raw[..])?
        }
        Atyp::V6 => {
            let mut raw = [0u8; 16];
            stream.read_exact(&mut raw).await.map_err(|_| ProtocolError::TruncatedFrame)?;
            Addr::decode(atyp, &mut &raw[..])?
        }
        Atyp::Domain => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(|_| ProtocolError::TruncatedFrame)?;
            let mut raw = vec![0u8; 1 + len[0] as usize];
            raw[0] = len[0];
            stream
                .read_exact(&mut raw[1..])
                .await
                .map_err(|_| ProtocolError::TruncatedFrame)?;
            Addr::decode(atyp, &mut &raw[..])?
        }
    };
    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await.map_err(|_| ProtocolError::TruncatedFrame)?;
    let port = u16::from_be_bytes(port_bytes);

    Ok(Some(Socks5Request { command, addr, port }))
}

/// `VER=5, REP=0, RSV=0, ATYP=(1|4), BND.ADDR, BND.PORT` success reply.
pub async fn write_reply_ok<S>(stream: &mut S, bind: SocketAddr) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    write_reply(stream, 0x00, bind).await
}

/// `REP != 0` on `tell_error`; caller tears down after this.
pub async fn write_reply_error<S>(stream: &mut S, rep: u8) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    write_reply(stream, rep, SocketAddr::from(([0, 0, 0, 0], 0))).await
}

async fn write_reply<S>(stream: &mut S, rep: u8, bind: SocketAddr) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(rep);
    buf.put_u8(0x00);
    let addr = match bind.ip() {
        std::net::IpAddr::V4(ip) => Addr::V4(ip),
        std::net::IpAddr::V6(ip) => Addr::V6(ip),
    };
    addr.encode(&mut buf);
    buf.put_u16(bind.port());
    stream.write_all(&buf).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::BufStream;

    #[tokio::test]
    async fn negotiates_no_auth() {
        let (client, server) = tokio::io::duplex(64);
        let mut server = server;
        let client_task = tokio::spawn(async move {
            let mut client = client;
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut reply = [0u8; 2];
            client.read_exact(&mut reply).await.unwrap();
            reply
        });
        negotiate_no_auth(&mut server, 1).await.unwrap();
        let reply = client_task.await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn reads_connect_request_ipv4() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            client
                .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB])
                .await
                .unwrap();
        });
        let req = read_request(&mut server).await.unwrap().unwrap();
        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.addr, Addr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(req.port, 443);
    }

    #[tokio::test]
    async fn rejects_unsupported_command() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            client
                .write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        let req = read_request(&mut server).await.unwrap();
        assert!(req.is_none());
    }

    #[tokio::test]
    async fn writes_ok_reply() {
        let buf = Vec::new();
        let mut stream = BufStream::new(std::io::Cursor::new(buf));
        write_reply_ok(&mut stream, "127.0.0.1:8080".parse().unwrap()).await.unwrap();
        tokio::io::AsyncWriteExt::flush(&mut stream).await.unwrap();
        let written = stream.into_inner().into_inner();
        assert_eq!(written[0], 0x05);
        assert_eq!(written[1], 0x00);
        assert_eq!(written[3], 0x01);
    }
}
