/// 中继服务器
///
/// 接受 TLS 连接、校验认证帧，然后以 yamux 服务端模式运行：
/// 每个入站流对应一条通道请求（首帧），拨号目标后回贴应答并搬运字节
use crate::config::ServerConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::{self, AuthRequest, ChannelRequest, PROTOCOL_VERSION};
use futures::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode as YamuxMode};

/// 运行中继服务器；监听失败是致命错误
pub async fn run_server(config: ServerConfig, acceptor: TlsAcceptor) -> Result<()> {
    let addr = format!("{}:{}", config.bind_addr, config.bind_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| TunnelError::ListenFailed {
            addr: addr.clone(),
            source: e,
        })?;

    info!("Relay server listening on {}", addr);
    let config = Arc::new(config);

    loop {
        let (tcp_stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        info!("Accepted connection from {}", peer);
        let acceptor = acceptor.clone();
        let config = config.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_session(tcp_stream, peer, acceptor, config).await {
                warn!("Session from {} ended with error: {}", peer, e);
            }
        });
    }
}

/// 处理一个客户端会话：TLS 握手、认证、yamux 流循环
async fn handle_session(
    tcp_stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    config: Arc<ServerConfig>,
) -> Result<()> {
    let mut tls_stream = acceptor.accept(tcp_stream).await?;

    let auth: AuthRequest = protocol::read_frame(&mut tls_stream).await?;

    if auth.version != PROTOCOL_VERSION {
        protocol::write_reply_err(&mut tls_stream, "unsupported protocol version").await?;
        return Err(TunnelError::auth_failed(format!(
            "unsupported protocol version {} from {}",
            auth.version, peer
        )));
    }
    if auth.secret != config.auth_key {
        protocol::write_reply_err(&mut tls_stream, "invalid credentials").await?;
        return Err(TunnelError::auth_failed(format!(
            "invalid credentials from {}",
            peer
        )));
    }
    protocol::write_reply_ok(&mut tls_stream).await?;

    match &auth.user {
        Some(user) => info!("Authenticated session from {} (user: {})", peer, user),
        None => info!("Authenticated session from {}", peer),
    }

    let mut yamux_conn = YamuxConnection::new(
        tls_stream.compat(),
        YamuxConfig::default(),
        YamuxMode::Server,
    );

    loop {
        match poll_fn(|cx| yamux_conn.poll_next_inbound(cx)).await {
            Some(Ok(stream)) => {
                let connect_timeout = config.connect_timeout();
                tokio::spawn(async move {
                    if let Err(e) = handle_channel(stream, connect_timeout).await {
                        debug!("Channel ended with error: {}", e);
                    }
                });
            }
            Some(Err(e)) => {
                warn!("Session from {} failed: {}", peer, e);
                break;
            }
            None => {
                info!("Session from {} closed", peer);
                break;
            }
        }
    }

    Ok(())
}

/// 处理一条通道：读取请求首帧、拨号目标、应答、搬运字节
async fn handle_channel(stream: yamux::Stream, connect_timeout: Duration) -> Result<()> {
    let mut channel = stream.compat();
    let request: ChannelRequest = protocol::read_frame(&mut channel).await?;

    debug!(
        "Channel request {}:{} -> {}",
        request.source_host,
        request.source_port,
        request.dest()
    );

    let mut target = match timeout(connect_timeout, TcpStream::connect(request.dest())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            protocol::write_reply_err(&mut channel, &e.to_string()).await?;
            return Err(TunnelError::channel_open_failed(
                request.dest(),
                e.to_string(),
            ));
        }
        Err(_) => {
            protocol::write_reply_err(&mut channel, "connection timed out").await?;
            return Err(TunnelError::channel_open_failed(
                request.dest(),
                "connection timed out",
            ));
        }
    };

    protocol::write_reply_ok(&mut channel).await?;
    info!(
        "Channel established: {}:{} -> {}",
        request.source_host,
        request.source_port,
        request.dest()
    );

    let (sent, received) = tokio::io::copy_bidirectional(&mut target, &mut channel).await?;
    debug!(
        "Channel to {} closed (sent: {} bytes, received: {} bytes)",
        request.dest(),
        sent,
        received
    );

    Ok(())
}
