//! Shared helpers for integration tests.
#![allow(dead_code)]

use proxy_tunnel::tls;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};

static CERT_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Grab a free TCP port from the OS.
pub fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let port = listener.local_addr().expect("no local addr").port();
    drop(listener);
    port
}

/// Generate a throwaway self-signed certificate for localhost.
///
/// Each call writes into a unique directory so parallel tests never
/// step on each other's files.
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .subsec_nanos();
    let counter = CERT_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "proxy-tunnel-test-{}-{}-{}",
        std::process::id(),
        nanos,
        counter
    ));
    std::fs::create_dir_all(&dir).expect("failed to create cert dir");

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    tls::generate_self_signed_cert(
        "localhost",
        &["localhost".to_string(), "127.0.0.1".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("failed to generate test certs");

    (cert_path, key_path)
}

/// Start a TCP echo server, returning its address.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Wait until something is listening on the port.
pub async fn wait_for_listener(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on port {} after 2s", port);
}
