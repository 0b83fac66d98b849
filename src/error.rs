//! Typed error boundaries for every codec and component.
//!
//! Each wire-format boundary gets its own `thiserror` type so a session can
//! match on `Err(_)` and decide its disposition per the error table in the
//! design notes, rather than stringly-matching an `anyhow::Error`.

use thiserror::Error;

/// Malformed SOCKS5, HTTP, or tunnel-frame bytes. Always results in an
/// immediate teardown with no reply bytes sent.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version: {0}")]
    UnsupportedSocksVersion(u8),
    #[error("unsupported SOCKS command: {0}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),
    #[error("malformed domain name")]
    MalformedDomain,
    #[error("malformed HTTP request line")]
    MalformedRequestLine,
    #[error("absolute-URI proxy requests require http:// (got: {0})")]
    UnsupportedScheme(String),
    #[error("malformed tunnel frame")]
    MalformedTunnelFrame,
    #[error("unknown tunnel frame code: {0}")]
    UnknownFrameCode(u8),
    #[error("truncated tunnel frame payload")]
    TruncatedFrame,
    #[error("non-zero RSV field")]
    NonZeroReserved,
}

/// `HttpChunkedReader` failures.
#[derive(Debug, Error)]
pub enum ChunkEncodingError {
    #[error("invalid chunk size hex digits")]
    InvalidChunkSize,
    #[error("truncated chunk data or terminator")]
    Truncated,
}

/// `HttpResponseFramer` failures.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("response header exceeded 8192 bytes without CRLFCRLF")]
    HeaderTooLarge,
    #[error("response declared both Content-Length and chunked Transfer-Encoding")]
    ConflictingLengthEncoding,
    #[error("Content-Length value is not a valid integer")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding: {0}")]
    UnsupportedTransferEncoding(String),
    #[error("malformed status line")]
    MalformedStatusLine,
    #[error(transparent)]
    Chunk(#[from] ChunkEncodingError),
}

/// Top-level per-session error, used to choose a teardown disposition.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("direct egress connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),
    #[error("cookie id space exhausted")]
    CookieExhausted,
    #[error("idle timeout")]
    IdleTimeout,
    #[error("tunnel is down")]
    TunnelDown,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
