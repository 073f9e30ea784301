/// 传输层抽象
///
/// 会话状态机只消费本模块的契约：connect 挂起直到就绪或失败，
/// 返回的流承载认证握手与 yamux 多路复用
use crate::config::ConnectOptions;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

/// 传输层连接抽象
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 传输层客户端接口
///
/// 测试通过替换该接口注入内存传输，无需真实网络
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// 连接到服务器并返回传输层连接
    async fn connect(&self) -> Result<Pin<Box<dyn Transport>>>;

    /// 远端地址描述（用于日志与错误消息）
    fn remote_addr(&self) -> String;
}

/// TLS 传输客户端
pub struct TlsTransportClient {
    server_addr: String,
    server_port: u16,
    keepalive: Option<Duration>,
    connector: TlsConnector,
}

impl TlsTransportClient {
    pub fn new(options: &ConnectOptions, connector: TlsConnector) -> Self {
        Self {
            server_addr: options.server_addr.clone(),
            server_port: options.server_port,
            keepalive: options.keepalive,
            connector,
        }
    }
}

#[async_trait]
impl TransportClient for TlsTransportClient {
    async fn connect(&self) -> Result<Pin<Box<dyn Transport>>> {
        let addr = format!("{}:{}", self.server_addr, self.server_port);
        info!("Connecting to {} via TLS", addr);

        let tcp_stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;

        apply_keepalive(&tcp_stream, self.keepalive);

        let server_name = ServerName::try_from(self.server_addr.clone())
            .context("Invalid server name")?
            .to_owned();

        let tls_stream = self
            .connector
            .connect(server_name, tcp_stream)
            .await
            .context("TLS handshake failed")?;

        info!("TLS connection established to {}", addr);
        Ok(Box::pin(tls_stream))
    }

    fn remote_addr(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }
}

/// 在传输套接字上设置 TCP keepalive（探测间隔取首次时间的一半）
fn apply_keepalive(stream: &TcpStream, keepalive: Option<Duration>) {
    let Some(time) = keepalive else {
        return;
    };

    let params = TcpKeepalive::new()
        .with_time(time)
        .with_interval(Duration::from_secs((time.as_secs() / 2).max(1)));

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&params) {
        warn!("Failed to set TCP keepalive: {}", e);
    }
}

/// 从连接选项构造 TLS 传输客户端
pub fn create_transport_client(
    options: &ConnectOptions,
    connector: TlsConnector,
) -> Arc<dyn TransportClient> {
    Arc::new(TlsTransportClient::new(options, connector))
}
