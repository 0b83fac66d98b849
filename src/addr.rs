//! Address-type (ATYP) encoding shared by the SOCKS5 TCP/UDP codecs and the
//! tunnel frame codec; `reqconn`/`udp_data` addresses use the same ATYP
//! conventions as the SOCKS5 wire format.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut};
use std::net::{Ipv4Addr, Ipv6Addr};

/// SOCKS5 address-type byte (RFC 1928 §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atyp {
    V4 = 0x01,
    Domain = 0x03,
    V6 = 0x04,
}

impl Atyp {
    pub fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x01 => Ok(Atyp::V4),
            0x03 => Ok(Atyp::Domain),
            0x04 => Ok(Atyp::V6),
            other => Err(ProtocolError::UnsupportedAddressType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded destination/source address: either a concrete IP or a domain
/// name awaiting resolution by whoever opens the egress connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl Addr {
    pub fn atyp(&self) -> Atyp {
        match self {
            Addr::V4(_) => Atyp::V4,
            Addr::V6(_) => Atyp::V6,
            Addr::Domain(_) => Atyp::Domain,
        }
    }

    /// Render as a `host:port`-joinable string for `ToSocketAddrs`/logging.
    pub fn host_string(&self) -> String {
        match self {
            Addr::V4(ip) => ip.to_string(),
            Addr::V6(ip) => ip.to_string(),
            Addr::Domain(d) => d.clone(),
        }
    }

    /// Encode `ATYP | addr` (caller appends the big-endian port separately).
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Addr::V4(ip) => {
                buf.put_u8(Atyp::V4.as_u8());
                buf.put_slice(&ip.octets());
            }
            Addr::V6(ip) => {
                buf.put_u8(Atyp::V6.as_u8());
                buf.put_slice(&ip.octets());
            }
            Addr::Domain(d) => {
                buf.put_u8(Atyp::Domain.as_u8());
                buf.put_u8(d.len() as u8);
                buf.put_slice(d.as_bytes());
            }
        }
    }

    /// Decode `addr` given an already-consumed ATYP byte. Does not read the
    /// port; caller reads the trailing 2 bytes.
    pub fn decode(atyp: Atyp, buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        match atyp {
            Atyp::V4 => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::TruncatedFrame);
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                Ok(Addr::V4(Ipv4Addr::from(octets)))
            }
            Atyp::V6 => {
                if buf.remaining() < 16 {
                    return Err(ProtocolError::TruncatedFrame);
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                Ok(Addr::V6(Ipv6Addr::from(octets)))
            }
            Atyp::Domain => {
                if buf.remaining() < 1 {
                    return Err(ProtocolError::TruncatedFrame);
                }
                let len = buf.get_u8() as usize;
                if buf.remaining() < len {
                    return Err(ProtocolError::TruncatedFrame);
                }
                let mut raw = vec![0u8; len];
                buf.copy_to_slice(&mut raw);
                // ISO-8859-1: every byte value is a valid code point.
                let domain: String = raw.iter().map(|&b| b as char).collect();
                Ok(Addr::Domain(domain))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn roundtrip_v4() {
        let a = Addr::V4(Ipv4Addr::new(93, 184, 216, 34));
        let mut buf = BytesMut::new();
        a.encode(&mut buf);
        let atyp = Atyp::from_u8(buf[0]).unwrap();
        let mut rest = buf.split_off(1);
        assert_eq!(Addr::decode(atyp, &mut rest).unwrap(), a);
    }

    #[test]
    fn roundtrip_domain() {
        let a = Addr::Domain("example.com".to_string());
        let mut buf = BytesMut::new();
        a.encode(&mut buf);
        let atyp = Atyp::from_u8(buf[0]).unwrap();
        let mut rest = buf.split_off(1);
        assert_eq!(Addr::decode(atyp, &mut rest).unwrap(), a);
    }

    #[test]
    fn roundtrip_v6() {
        let a = Addr::V6(Ipv6Addr::LOCALHOST);
        let mut buf = BytesMut::new();
        a.encode(&mut buf);
        let atyp = Atyp::from_u8(buf[0]).unwrap();
        let mut rest = buf.split_off(1);
        assert_eq!(Addr::decode(atyp, &mut rest).unwrap(), a);
    }
}
