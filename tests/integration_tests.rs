//! End-to-end tests: a real relay server, a real proxy, real TLS.

mod common;

use proxy_tunnel::config::{ConnectOptions, ProxyOptions, ServerConfig};
use proxy_tunnel::provider::ChannelProvider;
use proxy_tunnel::session::Session;
use proxy_tunnel::{proxy, server, tls, transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

const TEST_AUTH_KEY: &str = "integration-test-key";

/// Start a relay server on a free port.
async fn start_relay(auth_key: &str) -> u16 {
    let (cert_path, key_path) = common::generate_test_certs();
    let port = common::get_available_port();

    let config = ServerConfig {
        bind_addr: "127.0.0.1".to_string(),
        bind_port: port,
        auth_key: auth_key.to_string(),
        cert_path: Some(cert_path.clone()),
        key_path: Some(key_path.clone()),
        connect_timeout_secs: 5,
    };

    let tls_config = tls::load_server_config(&cert_path, &key_path).unwrap();
    let acceptor = TlsAcceptor::from(tls_config);
    tokio::spawn(async move {
        let _ = server::run_server(config, acceptor).await;
    });

    common::wait_for_listener(port).await;
    port
}

/// Build a channel provider pointed at the relay.
fn build_provider(relay_port: u16, secret: &str) -> (Arc<ChannelProvider>, tokio::sync::mpsc::Receiver<proxy_tunnel::SessionEvent>) {
    let options = Arc::new(ConnectOptions {
        server_addr: "127.0.0.1".to_string(),
        server_port: relay_port,
        user: None,
        secret: secret.to_string(),
        keepalive: None,
        ca_cert_path: None,
        skip_verify: true,
    });

    let tls_config = tls::load_client_config(None, true).unwrap();
    let connector = tokio_rustls::TlsConnector::from(tls_config);
    let client = transport::create_transport_client(&options, connector);

    let (session, events) = Session::new(options, client);
    (Arc::new(ChannelProvider::new(session)), events)
}

/// Start the full stack (relay + proxy) and return the proxy port.
async fn start_stack(idle_timeout: Option<Duration>) -> u16 {
    let relay_port = start_relay(TEST_AUTH_KEY).await;
    let (provider, events) = build_provider(relay_port, TEST_AUTH_KEY);
    provider.spawn_auto_reconnect(events);
    provider.connect().await.unwrap();

    let proxy_port = common::get_available_port();
    let options = ProxyOptions {
        bind_addr: "127.0.0.1".to_string(),
        bind_port: proxy_port,
        idle_timeout,
    };
    tokio::spawn(async move {
        let _ = proxy::run_proxy(options, provider).await;
    });

    common::wait_for_listener(proxy_port).await;
    proxy_port
}

fn random_payload(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

/// Issue an HTTP CONNECT and read the response status line.
async fn http_connect(proxy_port: u16, dest: SocketAddr) -> (TcpStream, String) {
    let mut socket = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    socket
        .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", dest).as_bytes())
        .await
        .unwrap();

    // Read up to the blank line terminating the response header
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        socket.read_exact(&mut byte).await.unwrap();
        response.push(byte[0]);
        assert!(response.len() < 4096, "response header too large");
    }
    let status = String::from_utf8_lossy(&response)
        .lines()
        .next()
        .unwrap()
        .to_string();
    (socket, status)
}

#[tokio::test]
async fn test_http_connect_echo_round_trip() {
    let echo = common::start_echo_server().await;
    let proxy_port = start_stack(None).await;

    let (mut socket, status) = http_connect(proxy_port, echo).await;
    assert!(status.contains("200"), "unexpected status: {}", status);

    let payload = random_payload(64 * 1024);
    socket.write_all(&payload).await.unwrap();

    let mut received = vec![0u8; payload.len()];
    socket.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_http_connect_to_unreachable_destination() {
    let proxy_port = start_stack(None).await;

    // Nothing listens on this port
    let dead_port = common::get_available_port();
    let dest: SocketAddr = format!("127.0.0.1:{}", dead_port).parse().unwrap();
    let (_socket, status) = http_connect(proxy_port, dest).await;
    assert!(status.contains("502"), "unexpected status: {}", status);
}

#[tokio::test]
async fn test_socks5_echo_round_trip() {
    let echo = common::start_echo_server().await;
    let proxy_port = start_stack(None).await;

    let mut socket = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();

    // Greeting: version 5, one method (no auth)
    socket.write_all(&[5, 1, 0]).await.unwrap();
    let mut method_reply = [0u8; 2];
    socket.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [5, 0]);

    // CONNECT to the echo server by IPv4 address
    let mut request = vec![5u8, 1, 0, 1];
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(&echo.port().to_be_bytes());
    socket.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    socket.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 5);
    assert_eq!(reply[1], 0, "SOCKS5 reply code {}", reply[1]);

    let payload = random_payload(16 * 1024);
    socket.write_all(&payload).await.unwrap();
    let mut received = vec![0u8; payload.len()];
    socket.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_socks5_unreachable_destination_reply() {
    let proxy_port = start_stack(None).await;
    let dead_port = common::get_available_port();

    let mut socket = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    socket.write_all(&[5, 1, 0]).await.unwrap();
    let mut method_reply = [0u8; 2];
    socket.read_exact(&mut method_reply).await.unwrap();

    let mut request = vec![5u8, 1, 0, 1];
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(&dead_port.to_be_bytes());
    socket.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    socket.read_exact(&mut reply).await.unwrap();
    // Host unreachable
    assert_eq!(reply[1], 4, "SOCKS5 reply code {}", reply[1]);
}

#[tokio::test]
async fn test_socks4_echo_round_trip() {
    let echo = common::start_echo_server().await;
    let proxy_port = start_stack(None).await;

    let mut socket = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();

    let mut request = vec![4u8, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(b"tester\0");
    socket.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    socket.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0);
    assert_eq!(reply[1], 90, "SOCKS4 reply code {}", reply[1]);

    let payload = random_payload(8 * 1024);
    socket.write_all(&payload).await.unwrap();
    let mut received = vec![0u8; payload.len()];
    socket.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_authentication_rejected_by_relay() {
    let relay_port = start_relay(TEST_AUTH_KEY).await;
    let (provider, _events) = build_provider(relay_port, "wrong-secret");

    let err = provider.connect().await.unwrap_err();
    assert!(err.is_auth_failed(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_concurrent_clients_share_one_session() {
    let echo = common::start_echo_server().await;
    let proxy_port = start_stack(None).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        tasks.push(tokio::spawn(async move {
            let (mut socket, status) = http_connect(proxy_port, echo).await;
            assert!(status.contains("200"));

            let payload = random_payload(4096);
            socket.write_all(&payload).await.unwrap();
            let mut received = vec![0u8; payload.len()];
            socket.read_exact(&mut received).await.unwrap();
            assert_eq!(received, payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_idle_timeout_closes_client_connection() {
    let echo = common::start_echo_server().await;
    let proxy_port = start_stack(Some(Duration::from_millis(200))).await;

    let (mut socket, status) = http_connect(proxy_port, echo).await;
    assert!(status.contains("200"));

    // Exchange once to prove the tunnel works, then go quiet
    socket.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // The proxy must close the connection once the timer fires
    let mut probe = [0u8; 1];
    let result = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut probe))
        .await
        .expect("connection was not closed after idle timeout");
    assert_eq!(result.unwrap(), 0);
}
