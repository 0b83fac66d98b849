//! duomux: a dual-protocol (SOCKS5 + HTTP) client-side proxy front-end.
//!
//! Accepts SOCKS5 and HTTP/1.1 proxy connections on a single listener,
//! decides per-destination whether to connect directly or relay through a
//! pre-established encrypted tunnel, and multiplexes tunneled sessions over
//! that one tunnel connection using 16-bit cookie ids.
//!
//! ## As a library
//!
//! ```rust,no_run
//! use duomux::config::ProxyConfig;
//! use duomux::host_match::SuffixHostMatcher;
//! use duomux::listener::ListenerMultiplexer;
//! use duomux::tunnel::FramedTcpTunnel;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProxyConfig::default();
//!     let tunnel_stream = tokio::net::TcpStream::connect(config.tunnel_addr).await?;
//!     let (tunnel, reader) = FramedTcpTunnel::new(tunnel_stream);
//!     let host_match = Arc::new(SuffixHostMatcher::new(config.host_match.tunnel_suffixes.clone()));
//!     let listener = ListenerMultiplexer::new(config, Arc::new(tunnel), host_match);
//!     let front = listener.bind().await?;
//!     listener.run(front, reader).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## As a command-line tool
//!
//! ```bash
//! duomux run --config duomux.toml
//! duomux check-config --config duomux.toml
//! ```

pub mod addr;
pub mod config;
pub mod cookie;
pub mod direct;
pub mod error;
pub mod host_match;
pub mod http;
pub mod json_logger;
pub mod listener;
pub mod session;
pub mod socks5;
pub mod socks_udp;
pub mod tunnel;
pub mod tunnel_codec;

pub use config::ProxyConfig;
pub use cookie::{CookieId, CookieTable};
pub use error::SessionError;
pub use host_match::{HostMatch, SuffixHostMatcher};
pub use listener::ListenerMultiplexer;
pub use tunnel::{FramedTcpTunnel, Tunnel, TunnelReader};
