/// 连接调度循环
///
/// 代理协议引擎与通道提供者之间的粘合层：接受客户端连接、
/// 嗅探协议、提取通道请求、应用空闲超时，并上报生命周期事件
pub mod http;
pub mod socks;

use crate::error::{Result, TunnelError};
use crate::io_util::relay_with_idle_timeout;
use crate::provider::ChannelProvider;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::ProxyOptions;

/// 嗅探得到的客户端协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientProtocol {
    Http,
    Socks4,
    Socks5,
}

impl ClientProtocol {
    fn name(&self) -> &'static str {
        match self {
            ClientProtocol::Http => "http-connect",
            ClientProtocol::Socks4 => "socks4",
            ClientProtocol::Socks5 => "socks5",
        }
    }
}

/// 运行本地代理服务器
///
/// 绑定失败是致命错误并立即上抛；单个连接的失败只影响该连接
pub async fn run_proxy(options: ProxyOptions, provider: Arc<ChannelProvider>) -> Result<()> {
    let addr = format!("{}:{}", options.bind_addr, options.bind_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| TunnelError::ListenFailed {
            addr: addr.clone(),
            source: e,
        })?;

    info!("Proxy server listening on {} (HTTP-CONNECT + SOCKS)", addr);

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let provider = provider.clone();
                let idle_timeout = options.idle_timeout;
                tokio::spawn(async move {
                    if let Err(e) = handle_client(socket, peer, provider, idle_timeout).await {
                        debug!("Connection from {} ended with error: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// 处理单个代理客户端连接
async fn handle_client(
    mut socket: TcpStream,
    peer: SocketAddr,
    provider: Arc<ChannelProvider>,
    idle_timeout: Option<Duration>,
) -> Result<()> {
    debug!("Connection from {}", peer);

    let protocol = sniff_protocol(&socket).await?;

    // 协商并提取通道请求；HTTP 可能带有头部之后的早到字节
    let (request, leftover) = match protocol {
        ClientProtocol::Http => http::negotiate(&mut socket, peer).await?,
        ClientProtocol::Socks4 => (socks::negotiate_v4(&mut socket, peer).await?, Vec::new()),
        ClientProtocol::Socks5 => (socks::negotiate_v5(&mut socket, peer).await?, Vec::new()),
    };

    info!(
        "Proxy request {} -> {} ({})",
        peer,
        request.dest(),
        protocol.name()
    );

    let mut channel = match provider.obtain_channel(&request).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Failed to obtain channel to {}: {}", request.dest(), e);
            // 在任何载荷字节被转发之前以协议级错误关闭客户端
            let _ = send_failure_reply(&mut socket, protocol, &e).await;
            return Err(e);
        }
    };

    send_success_reply(&mut socket, protocol).await?;

    if !leftover.is_empty() {
        channel.write_all(&leftover).await?;
    }

    match relay_with_idle_timeout(&mut socket, &mut channel, idle_timeout).await {
        Ok((sent, received)) => {
            debug!(
                "Connection {} -> {} closed (sent: {} bytes, received: {} bytes)",
                peer,
                request.dest(),
                sent,
                received
            );
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
            info!("Connection {} idle timeout, closing", peer);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// 通过首字节嗅探客户端协议（不消费数据）
async fn sniff_protocol(socket: &TcpStream) -> Result<ClientProtocol> {
    let mut first = [0u8; 1];
    let n = socket.peek(&mut first).await?;
    if n == 0 {
        return Err(TunnelError::protocol_error(
            "Connection closed before any data",
        ));
    }

    Ok(match first[0] {
        socks::SOCKS4_VERSION => ClientProtocol::Socks4,
        socks::SOCKS5_VERSION => ClientProtocol::Socks5,
        _ => ClientProtocol::Http,
    })
}

async fn send_success_reply(
    socket: &mut TcpStream,
    protocol: ClientProtocol,
) -> Result<()> {
    match protocol {
        ClientProtocol::Http => http::reply_success(socket).await,
        ClientProtocol::Socks4 => socks::reply_success_v4(socket).await,
        ClientProtocol::Socks5 => socks::reply_success_v5(socket).await,
    }
}

async fn send_failure_reply(
    socket: &mut TcpStream,
    protocol: ClientProtocol,
    err: &TunnelError,
) -> Result<()> {
    match protocol {
        ClientProtocol::Http => http::reply_failure(socket).await,
        ClientProtocol::Socks4 => socks::reply_failure_v4(socket).await,
        ClientProtocol::Socks5 => socks::reply_failure_v5(socket, err).await,
    }
}
