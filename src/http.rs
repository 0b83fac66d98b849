//! HTTP/1.1 support: the chunked-body reader, the response framer, and the
//! absolute-URI / `CONNECT`-target parsing used by `SessionStateMachine`'s
//! HTTP paths.

use crate::error::{ChunkEncodingError, FramingError, ProtocolError};
use bytes::{Bytes, BytesMut};

pub const MAX_HEADER_SIZE: usize = 8192;

// ---------------------------------------------------------------------
// C1: HttpChunkedReader
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
    Done,
}

/// Parses `hex-len CRLF data CRLF` records out of a chunked body stream.
/// Restartable across partial feeds: unparsed bytes stay in the internal
/// buffer between calls.
pub struct HttpChunkedReader {
    buf: BytesMut,
    state: ChunkState,
}

impl HttpChunkedReader {
    pub fn new() -> Self {
        HttpChunkedReader {
            buf: BytesMut::new(),
            state: ChunkState::Size,
        }
    }

    pub fn finished(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Feed more bytes and drain as many complete chunk bodies as are now
    /// available. Call repeatedly as more data arrives.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Bytes>, ChunkEncodingError> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            match self.state {
                ChunkState::Done => break,
                ChunkState::Size => {
                    let Some(pos) = find_crlf(&self.buf) else { break };
                    let line = self.buf.split_to(pos);
                    let _crlf = self.buf.split_to(2);
                    let line = std::str::from_utf8(&line).map_err(|_| ChunkEncodingError::InvalidChunkSize)?;
                    // Strip chunk extensions (";name=value") before the hex length.
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| ChunkEncodingError::InvalidChunkSize)?;
                    self.state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { remaining } => {
                    if self.buf.len() < remaining {
                        break;
                    }
                    let chunk = self.buf.split_to(remaining).freeze();
                    out.push(chunk);
                    self.state = ChunkState::DataCrlf;
                }
                ChunkState::DataCrlf => {
                    if self.buf.len() < 2 {
                        break;
                    }
                    if &self.buf[0..2] != b"\r\n" {
                        return Err(ChunkEncodingError::Truncated);
                    }
                    let _ = self.buf.split_to(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(pos) = find_double_crlf(&self.buf) else { break };
                    let _ = self.buf.split_to(pos + 4);
                    self.state = ChunkState::Done;
                }
            }
        }

        Ok(out)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

// ---------------------------------------------------------------------
// C2: HttpResponseFramer
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    ContentLength(usize),
    Chunked,
    CloseDelimited,
}

enum FramerState {
    Headers,
    Body { mode: BodyMode, delivered: usize },
    Done,
}

/// Consumes a forwarded HTTP response byte stream, detects header end,
/// discriminates length- vs. chunked- vs. close-delimited framing, and
/// surfaces bounded data to the caller.
pub struct HttpResponseFramer {
    raw: BytesMut,
    state: FramerState,
    out: BytesMut,
    chunk_reader: HttpChunkedReader,
    finished: bool,
}

impl HttpResponseFramer {
    pub fn new() -> Self {
        HttpResponseFramer {
            raw: BytesMut::new(),
            state: FramerState::Headers,
            out: BytesMut::new(),
            chunk_reader: HttpChunkedReader::new(),
            finished: false,
        }
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Drain bytes ready to forward to the client.
    pub fn drain(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    /// The egress closed; finalizes close-delimited framing.
    pub fn notify_egress_closed(&mut self) {
        if let FramerState::Body { mode: BodyMode::CloseDelimited, .. } = self.state {
            self.finished = true;
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<(), FramingError> {
        self.raw.extend_from_slice(data);

        loop {
            match self.state {
                FramerState::Done => break,
                FramerState::Headers => {
                    if !self.try_parse_headers()? {
                        if self.raw.len() > MAX_HEADER_SIZE {
                            return Err(FramingError::HeaderTooLarge);
                        }
                        break;
                    }
                }
                FramerState::Body { .. } => {
                    self.feed_body()?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Attempt to consume one status-line+headers block. Returns `Ok(true)`
    /// if a block was consumed (caller loops again in case body parsing is
    /// now possible or another informational block follows), `Ok(false)`
    /// if more bytes are needed.
    fn try_parse_headers(&mut self) -> Result<bool, FramingError> {
        let Some(pos) = find_double_crlf(&self.raw) else {
            return Ok(false);
        };
        let header_bytes = self.raw.split_to(pos + 4);
        let header_text = header_bytes
            .iter()
            .map(|&b| b as char)
            .collect::<String>();
        let mut lines = header_text.split("\r\n");
        let status_line = lines.next().ok_or(FramingError::MalformedStatusLine)?;
        if status_line.len() < 12 {
            return Err(FramingError::MalformedStatusLine);
        }
        let code: u16 = status_line[9..12]
            .parse()
            .map_err(|_| FramingError::MalformedStatusLine)?;

        if code < 200 {
            // Informational: forward as-is, stay in Headers state for the
            // real status line that follows.
            self.out.extend_from_slice(&header_bytes);
            return Ok(true);
        }

        let _ = lines;
        let mut content_length_val: Option<usize> = None;
        let mut transfer_encoding_val: Option<String> = None;
        for line in header_text.split("\r\n").skip(1) {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else { continue };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            match name.as_str() {
                "content-length" => content_length_val = Some(value.parse().map_err(|_| FramingError::InvalidContentLength)?),
                "transfer-encoding" => transfer_encoding_val = Some(value.to_ascii_lowercase()),
                _ => {}
            }
        }
        if content_length_val.is_some() && transfer_encoding_val.is_some() {
            return Err(FramingError::ConflictingLengthEncoding);
        }
        if let Some(te) = &transfer_encoding_val {
            if te != "chunked" {
                return Err(FramingError::UnsupportedTransferEncoding(te.clone()));
            }
        }

        let mode = if transfer_encoding_val.is_some() {
            BodyMode::Chunked
        } else if let Some(len) = content_length_val {
            BodyMode::ContentLength(len)
        } else {
            BodyMode::CloseDelimited
        };

        self.out.extend_from_slice(&header_bytes);
        self.state = FramerState::Body { mode, delivered: 0 };
        if mode == BodyMode::ContentLength(0) {
            self.finished = true;
            self.state = FramerState::Done;
        }
        Ok(true)
    }

    fn feed_body(&mut self) -> Result<(), FramingError> {
        let FramerState::Body { mode, ref mut delivered } = self.state else {
            return Ok(());
        };
        match mode {
            BodyMode::ContentLength(total) => {
                let take = std::cmp::min(self.raw.len(), total - *delivered);
                let chunk = self.raw.split_to(take);
                self.out.extend_from_slice(&chunk);
                *delivered += take;
                if *delivered >= total {
                    self.finished = true;
                    self.state = FramerState::Done;
                }
            }
            BodyMode::Chunked => {
                let raw = self.raw.split();
                let chunks = self.chunk_reader.feed(&raw)?;
                for c in chunks {
                    self.out.extend_from_slice(&c);
                }
                if self.chunk_reader.finished() {
                    self.finished = true;
                    self.state = FramerState::Done;
                }
            }
            BodyMode::CloseDelimited => {
                let raw = self.raw.split();
                self.out.extend_from_slice(&raw);
                // finished() only flips true via notify_egress_closed.
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Request-line / URI parsing
// ---------------------------------------------------------------------

/// Parse `CONNECT host:port` target.
pub fn parse_connect_target(target: &str) -> Result<(String, u16), ProtocolError> {
    let (host, port) = target.rsplit_once(':').ok_or(ProtocolError::MalformedRequestLine)?;
    if host.is_empty() {
        return Err(ProtocolError::MalformedRequestLine);
    }
    let port: u16 = port.parse().map_err(|_| ProtocolError::MalformedRequestLine)?;
    Ok((host.to_string(), port))
}

/// Parse an absolute-URI request target `http://host[:port]/path...`.
pub fn parse_absolute_uri(target: &str) -> Result<(String, u16, String), ProtocolError> {
    let rest = target
        .strip_prefix("http://")
        .ok_or_else(|| ProtocolError::UnsupportedScheme(target.to_string()))?;
    let slash = rest.find('/').ok_or(ProtocolError::MalformedRequestLine)?;
    let authority = &rest[..slash];
    let path = &rest[slash..];

    let (host, port) = if let Some((h, p)) = authority.rsplit_once(':') {
        let port: u16 = p.parse().map_err(|_| ProtocolError::MalformedRequestLine)?;
        (h.to_string(), port)
    } else {
        (authority.to_string(), 80)
    };
    if host.is_empty() {
        return Err(ProtocolError::MalformedRequestLine);
    }
    Ok((host, port, path.to_string()))
}

/// A parsed request line plus its header lines, verbatim order preserved.
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

/// Parse one HTTP/1.1 request header block (request line + headers, no
/// trailing blank line expected in `block`).
pub fn parse_request_header(block: &str) -> Result<ParsedRequest, ProtocolError> {
    let mut lines = block.split("\r\n");
    let request_line = lines.next().ok_or(ProtocolError::MalformedRequestLine)?;
    let mut parts = request_line.split(' ');
    let method = parts.next().ok_or(ProtocolError::MalformedRequestLine)?.to_string();
    let target = parts.next().ok_or(ProtocolError::MalformedRequestLine)?.to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else { continue };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(ParsedRequest { method, target, version, headers })
}

/// Strip `Proxy-Connection` and rebuild the request line with a bare path.
pub fn rebuild_request_header(method: &str, path: &str, headers: &[(String, String)]) -> String {
    let mut out = format!("{} {} HTTP/1.1\r\n", method, path);
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("proxy-connection") {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_reader_single_feed() {
        let mut r = HttpChunkedReader::new();
        let data = b"5\r\nhello\r\n0\r\n\r\n";
        let chunks = r.feed(data).unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"hello")]);
        assert!(r.finished());
    }

    #[test]
    fn chunked_reader_partial_feeds() {
        let mut r = HttpChunkedReader::new();
        assert!(r.feed(b"5\r\nhel").unwrap().is_empty());
        let chunks = r.feed(b"lo\r\n0\r\n\r\n").unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"hello")]);
        assert!(r.finished());
    }

    #[test]
    fn chunked_reader_multiple_chunks() {
        let mut r = HttpChunkedReader::new();
        let chunks = r.feed(b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n").unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"foo"), Bytes::from_static(b"bar")]);
    }

    #[test]
    fn chunked_reader_rejects_bad_hex() {
        let mut r = HttpChunkedReader::new();
        assert!(r.feed(b"zz\r\ndata\r\n").is_err());
    }

    #[test]
    fn framer_content_length() {
        let mut f = HttpResponseFramer::new();
        f.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").unwrap();
        assert!(f.finished());
        let out = f.drain();
        assert!(out.ends_with(b"hello"));
    }

    #[test]
    fn framer_chunked() {
        let mut f = HttpResponseFramer::new();
        f.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n")
            .unwrap();
        assert!(f.finished());
        let out = f.drain();
        assert!(out.ends_with(b"hello"));
    }

    #[test]
    fn framer_close_delimited() {
        let mut f = HttpResponseFramer::new();
        f.feed(b"HTTP/1.1 200 OK\r\n\r\nsome body").unwrap();
        assert!(!f.finished());
        f.notify_egress_closed();
        assert!(f.finished());
    }

    #[test]
    fn framer_conflicting_headers_rejected() {
        let mut f = HttpResponseFramer::new();
        let err = f
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, FramingError::ConflictingLengthEncoding));
    }

    #[test]
    fn framer_informational_then_final() {
        let mut f = HttpResponseFramer::new();
        f.feed(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
            .unwrap();
        assert!(f.finished());
        assert!(f.drain().ends_with(b"hi"));
    }

    #[test]
    fn parses_connect_target() {
        assert_eq!(
            parse_connect_target("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn parses_absolute_uri() {
        let (host, port, path) = parse_absolute_uri("http://example.com:8080/a/b?x=1").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8080);
        assert_eq!(path, "/a/b?x=1");
    }

    #[test]
    fn parses_absolute_uri_default_port() {
        let (host, port, path) = parse_absolute_uri("http://example.com/").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/");
    }

    #[test]
    fn rebuilds_header_strips_proxy_connection() {
        let headers = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("Proxy-Connection".to_string(), "keep-alive".to_string()),
        ];
        let rebuilt = rebuild_request_header("GET", "/", &headers);
        assert!(!rebuilt.to_lowercase().contains("proxy-connection"));
        assert!(rebuilt.starts_with("GET / HTTP/1.1\r\n"));
    }
}
