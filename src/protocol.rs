/// 客户端与中继服务器之间的协议消息定义
///
/// 所有控制消息均为 u32 大端长度前缀 + JSON 正文；
/// 应答为单字节结果码，失败时跟随 u16 长度前缀的错误消息
use crate::error::{Result, TunnelError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 协议版本
pub const PROTOCOL_VERSION: u8 = 1;

/// 控制帧的最大长度（防御畸形长度前缀）
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// 应答结果码：成功
pub const REPLY_OK: u8 = 1;
/// 应答结果码：失败
pub const REPLY_ERR: u8 = 0;

/// 会话认证请求（在 TLS 流上、yamux 启动之前发送）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    /// 协议版本
    pub version: u8,
    /// 远端用户名（可选，来自 [user@]host 形式的目标）
    #[serde(default)]
    pub user: Option<String>,
    /// 共享密钥
    pub secret: String,
}

impl AuthRequest {
    pub fn new(user: Option<String>, secret: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            user,
            secret: secret.into(),
        }
    }
}

/// 通道请求：描述一个代理客户端期望的隧道
///
/// 每个被接受的客户端连接恰好生成一个，作为新 yamux 流的首帧发送
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequest {
    /// 目标主机（域名或 IP 字面量，由远端解析）
    pub dest_host: String,
    /// 目标端口
    pub dest_port: u16,
    /// 发起方（代理客户端）地址
    pub source_host: String,
    /// 发起方端口
    pub source_port: u16,
}

impl ChannelRequest {
    pub fn new(
        dest_host: impl Into<String>,
        dest_port: u16,
        source_host: impl Into<String>,
        source_port: u16,
    ) -> Self {
        Self {
            dest_host: dest_host.into(),
            dest_port,
            source_host: source_host.into(),
            source_port,
        }
    }

    /// 目标地址的 host:port 形式
    pub fn dest(&self) -> String {
        format!("{}:{}", self.dest_host, self.dest_port)
    }
}

/// 写入一个长度前缀的 JSON 帧
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(msg)
        .map_err(|e| TunnelError::protocol_error(format!("Failed to encode frame: {}", e)))?;
    let len = json.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

/// 读取一个长度前缀的 JSON 帧
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(TunnelError::protocol_error(format!(
            "Invalid frame length: {}",
            len
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    serde_json::from_slice(&body)
        .map_err(|e| TunnelError::protocol_error(format!("Failed to decode frame: {}", e)))
}

/// 发送成功应答
pub async fn write_reply_ok<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[REPLY_OK]).await?;
    writer.flush().await?;
    Ok(())
}

/// 发送失败应答及错误消息
pub async fn write_reply_err<W>(writer: &mut W, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let msg_bytes = message.as_bytes();
    let truncated = &msg_bytes[..msg_bytes.len().min(u16::MAX as usize)];
    writer.write_all(&[REPLY_ERR]).await?;
    writer.write_all(&(truncated.len() as u16).to_be_bytes()).await?;
    writer.write_all(truncated).await?;
    writer.flush().await?;
    Ok(())
}

/// 读取应答；成功返回 Ok(())，失败返回远端错误消息
pub async fn read_reply<R>(reader: &mut R) -> Result<std::result::Result<(), String>>
where
    R: AsyncRead + Unpin,
{
    let mut result = [0u8; 1];
    reader.read_exact(&mut result).await?;

    if result[0] == REPLY_OK {
        return Ok(Ok(()));
    }

    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut msg = vec![0u8; len];
    reader.read_exact(&mut msg).await?;

    Ok(Err(String::from_utf8_lossy(&msg).into_owned()))
}
