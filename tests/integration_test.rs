//! End-to-end scenarios against loopback sockets, driving the real
//! `ListenerMultiplexer` accept/dispatch loops and the wire-level
//! `ACT_SOCKS` tunnel codec. Covers scenario 1 (SOCKS5 CONNECT direct) and
//! scenario 3 (HTTP CONNECT tunneled) from the spec's testable properties.

use duomux::config::ProxyConfig;
use duomux::host_match::SuffixHostMatcher;
use duomux::listener::ListenerMultiplexer;
use duomux::tunnel::{FramedTcpTunnel, Tunnel};
use duomux::tunnel_codec::{Proto, TunnelFrame, ACT_SOCKS};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn ipv4_octets(addr: SocketAddr) -> [u8; 4] {
    match addr.ip() {
        IpAddr::V4(ip) => ip.octets(),
        IpAddr::V6(_) => panic!("test origin must be bound on IPv4 loopback"),
    }
}

#[tokio::test]
async fn socks5_connect_direct_relays_bytes() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 32];
        let n = sock.read(&mut buf).await.unwrap();
        sock.write_all(&buf[..n]).await.unwrap();
    });

    // A direct-routed session never touches the tunnel, but `run` still
    // wires one up; a loopback-connected pair stands in unused.
    let bridge_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge_addr = bridge_listener.local_addr().unwrap();
    let accept_task = tokio::spawn(async move { bridge_listener.accept().await.unwrap().0 });
    let proxy_side = TcpStream::connect(bridge_addr).await.unwrap();
    let remote_side = accept_task.await.unwrap();
    let (proxy_tunnel, proxy_reader) = FramedTcpTunnel::new(proxy_side);
    let (_remote_tunnel, _remote_reader) = FramedTcpTunnel::new(remote_side);

    let config = ProxyConfig::default();
    let host_match = Arc::new(SuffixHostMatcher::new(vec![]));
    let tunnel: Arc<dyn Tunnel> = Arc::new(proxy_tunnel);
    let listener = ListenerMultiplexer::new(config, tunnel, host_match);

    let front = listener.bind().await.unwrap();
    let front_addr = front.local_addr().unwrap();
    let listener_clone = listener.clone();
    tokio::spawn(async move {
        let _ = listener_clone.run(front, proxy_reader).await;
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&ipv4_octets(origin_addr));
    req.extend_from_slice(&origin_addr.port().to_be_bytes());
    client.write_all(&req).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00, "expected SOCKS5 success reply");

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn http_connect_tunneled_relays_bytes() {
    let bridge_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge_addr = bridge_listener.local_addr().unwrap();
    let remote_side = tokio::spawn(async move { bridge_listener.accept().await.unwrap().0 });
    let proxy_side = TcpStream::connect(bridge_addr).await.unwrap();
    let remote_side = remote_side.await.unwrap();

    let (proxy_tunnel, proxy_reader) = FramedTcpTunnel::new(proxy_side);
    let (remote_tunnel, mut remote_reader) = FramedTcpTunnel::new(remote_side);

    let mut config = ProxyConfig::default();
    config.host_match.tunnel_suffixes = vec!["example.test".to_string()];
    let host_match = Arc::new(SuffixHostMatcher::new(config.host_match.tunnel_suffixes.clone()));
    let tunnel: Arc<dyn Tunnel> = Arc::new(proxy_tunnel);
    let listener = ListenerMultiplexer::new(config, tunnel, host_match);

    let front = listener.bind().await.unwrap();
    let front_addr = front.local_addr().unwrap();
    let listener_clone = listener.clone();
    tokio::spawn(async move {
        let _ = listener_clone.run(front, proxy_reader).await;
    });

    let remote_task = tokio::spawn(async move {
        let (action_tag, payload) = remote_reader.read_frame().await.unwrap().unwrap();
        assert_eq!(action_tag, ACT_SOCKS);
        let frame = TunnelFrame::parse(payload).unwrap();
        let cookie_id = match frame {
            TunnelFrame::ReqConn { cookie_id, proto, port, .. } => {
                assert_eq!(proto, Proto::Tcp);
                assert_eq!(port, 443);
                cookie_id
            }
            other => panic!("expected ReqConn, got {:?}", other),
        };

        remote_tunnel
            .send_message(ACT_SOCKS, &TunnelFrame::build_respconn(cookie_id, 2))
            .await;

        let (action_tag, payload) = remote_reader.read_frame().await.unwrap().unwrap();
        assert_eq!(action_tag, ACT_SOCKS);
        match TunnelFrame::parse(payload).unwrap() {
            TunnelFrame::TcpData { cookie_id: id, payload, .. } => {
                assert_eq!(id, cookie_id);
                assert_eq!(payload.as_ref(), b"hello-through-tunnel");
            }
            other => panic!("expected TcpData, got {:?}", other),
        }

        remote_tunnel
            .send_message(ACT_SOCKS, &TunnelFrame::build_tcp_data(cookie_id, true, b"echo-reply"))
            .await;
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client
        .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
        .await
        .unwrap();

    let mut buf = vec![0u8; 256];
    let n = client.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);

    client.write_all(b"hello-through-tunnel").await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"echo-reply");

    remote_task.await.unwrap();
}
