//! `ACT_SOCKS` tunnel frame codec: the five frame kinds multiplexed over
//! one shared tunnel connection (`reqconn`, `respconn`, `tcp_data`,
//! `udp_data`, `close`), each big-endian and cookie-id-prefixed.

use crate::addr::{Addr, Atyp};
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// All tunnel messages in this system are carried under this action tag.
pub const ACT_SOCKS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp = 1,
    Udp = 3,
}

impl Proto {
    fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        match b {
            1 => Ok(Proto::Tcp),
            3 => Ok(Proto::Udp),
            _ => Err(ProtocolError::MalformedTunnelFrame),
        }
    }
}

/// One decoded/to-be-encoded `ACT_SOCKS` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelFrame {
    ReqConn {
        cookie_id: u16,
        proto: Proto,
        addr: Addr,
        port: u16,
    },
    /// `status == 2` is success; anything else is failure.
    RespConn {
        cookie_id: u16,
        status: u8,
    },
    TcpData {
        cookie_id: u16,
        is_close: bool,
        payload: Bytes,
    },
    UdpData {
        cookie_id: u16,
        addr: Addr,
        port: u16,
        payload: Bytes,
    },
    /// The session's own teardown notify (distinct from a peer-initiated
    /// close, which arrives as `TcpData { is_close: true, .. }`).
    Close {
        cookie_id: u16,
    },
}

impl TunnelFrame {
    pub fn cookie_id(&self) -> u16 {
        match self {
            TunnelFrame::ReqConn { cookie_id, .. }
            | TunnelFrame::RespConn { cookie_id, .. }
            | TunnelFrame::TcpData { cookie_id, .. }
            | TunnelFrame::UdpData { cookie_id, .. }
            | TunnelFrame::Close { cookie_id } => *cookie_id,
        }
    }

    pub fn build_reqconn(cookie_id: u16, proto: Proto, addr: &Addr, port: u16) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u16(cookie_id);
        buf.put_u8(1);
        buf.put_u8(proto as u8);
        addr.encode(&mut buf);
        buf.put_u16(port);
        buf.freeze()
    }

    pub fn build_respconn(cookie_id: u16, status: u8) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u16(cookie_id);
        buf.put_u8(2);
        buf.put_u8(status);
        buf.freeze()
    }

    pub fn build_tcp_data(cookie_id: u16, is_close: bool, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u16(cookie_id);
        buf.put_u8(3);
        buf.put_u8(is_close as u8);
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn build_udp_data(cookie_id: u16, addr: &Addr, port: u16, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + payload.len());
        buf.put_u16(cookie_id);
        buf.put_u8(4);
        let atyp = addr.atyp();
        buf.put_u8(atyp.as_u8());
        buf.put_u8((atyp == Atyp::V6) as u8);
        buf.put_u8((atyp == Atyp::Domain) as u8);
        // addr.encode() would re-emit the ATYP byte; write just the address body.
        match addr {
            Addr::V4(ip) => buf.put_slice(&ip.octets()),
            Addr::V6(ip) => buf.put_slice(&ip.octets()),
            Addr::Domain(d) => {
                buf.put_u8(d.len() as u8);
                buf.put_slice(d.as_bytes());
            }
        }
        buf.put_u16(port);
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn build_close(cookie_id: u16) -> Bytes {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u16(cookie_id);
        buf.put_u8(1);
        buf.freeze()
    }

    /// Parse a full `ACT_SOCKS` payload (cookie id + code + body).
    pub fn parse(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.remaining() < 3 {
            return Err(ProtocolError::TruncatedFrame);
        }
        let cookie_id = data.get_u16();
        let code = data.get_u8();

        match code {
            1 if data.remaining() == 0 => Ok(TunnelFrame::Close { cookie_id }),
            1 => {
                // reqconn: proto | atyp | addr | port
                if data.remaining() < 2 {
                    return Err(ProtocolError::TruncatedFrame);
                }
                let proto = Proto::from_u8(data.get_u8())?;
                let atyp = Atyp::from_u8(data.get_u8())?;
                let addr = Addr::decode(atyp, &mut data)?;
                if data.remaining() < 2 {
                    return Err(ProtocolError::TruncatedFrame);
                }
                let port = data.get_u16();
                Ok(TunnelFrame::ReqConn {
                    cookie_id,
                    proto,
                    addr,
                    port,
                })
            }
            2 => {
                if data.remaining() < 1 {
                    return Err(ProtocolError::TruncatedFrame);
                }
                Ok(TunnelFrame::RespConn {
                    cookie_id,
                    status: data.get_u8(),
                })
            }
            3 => {
                if data.remaining() < 1 {
                    return Err(ProtocolError::TruncatedFrame);
                }
                let is_close = data.get_u8() != 0;
                Ok(TunnelFrame::TcpData {
                    cookie_id,
                    is_close,
                    payload: data,
                })
            }
            4 => {
                if data.remaining() < 3 {
                    return Err(ProtocolError::TruncatedFrame);
                }
                let atyp = Atyp::from_u8(data.get_u8())?;
                let _is_ipv6 = data.get_u8();
                let _is_domain = data.get_u8();
                let addr = Addr::decode(atyp, &mut data)?;
                if data.remaining() < 2 {
                    return Err(ProtocolError::TruncatedFrame);
                }
                let port = data.get_u16();
                Ok(TunnelFrame::UdpData {
                    cookie_id,
                    addr,
                    port,
                    payload: data,
                })
            }
            other => Err(ProtocolError::UnknownFrameCode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn reqconn_roundtrip() {
        let addr = Addr::Domain("example.com".to_string());
        let built = TunnelFrame::build_reqconn(1, Proto::Tcp, &addr, 443);
        assert_eq!(
            built.as_ref(),
            &[0x00, 0x01, 0x01, 0x01, 0x03, 0x0B, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.',
              b'c', b'o', b'm', 0x01, 0xBB][..]
        );
        let parsed = TunnelFrame::parse(built).unwrap();
        assert_eq!(
            parsed,
            TunnelFrame::ReqConn {
                cookie_id: 1,
                proto: Proto::Tcp,
                addr,
                port: 443,
            }
        );
    }

    #[test]
    fn respconn_roundtrip() {
        let built = TunnelFrame::build_respconn(1, 2);
        assert_eq!(built.as_ref(), &[0x00, 0x01, 0x02, 0x02]);
        assert_eq!(
            TunnelFrame::parse(built).unwrap(),
            TunnelFrame::RespConn { cookie_id: 1, status: 2 }
        );
    }

    #[test]
    fn tcp_data_roundtrip() {
        let built = TunnelFrame::build_tcp_data(7, false, b"hello");
        assert_eq!(
            TunnelFrame::parse(built).unwrap(),
            TunnelFrame::TcpData {
                cookie_id: 7,
                is_close: false,
                payload: Bytes::from_static(b"hello"),
            }
        );
    }

    #[test]
    fn udp_data_roundtrip() {
        let addr = Addr::V4(Ipv4Addr::new(8, 8, 8, 8));
        let built = TunnelFrame::build_udp_data(3, &addr, 53, b"\x00\x01");
        assert_eq!(
            TunnelFrame::parse(built).unwrap(),
            TunnelFrame::UdpData {
                cookie_id: 3,
                addr,
                port: 53,
                payload: Bytes::from_static(b"\x00\x01"),
            }
        );
    }

    #[test]
    fn close_is_distinguished_from_reqconn_by_length() {
        let built = TunnelFrame::build_close(9);
        assert_eq!(built.len(), 3);
        assert_eq!(TunnelFrame::parse(built).unwrap(), TunnelFrame::Close { cookie_id: 9 });
    }

    #[test]
    fn unknown_code_rejected() {
        let data = Bytes::from_static(&[0x00, 0x01, 0xFF]);
        assert!(TunnelFrame::parse(data).is_err());
    }

    #[test]
    fn truncated_rejected() {
        let data = Bytes::from_static(&[0x00]);
        assert!(TunnelFrame::parse(data).is_err());
    }
}
