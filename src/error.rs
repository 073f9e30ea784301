/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，便于调用者区分
/// 可自动恢复的会话失效（NotConnected）与必须上报的失败
use std::io;
use thiserror::Error;

/// Proxy Tunnel 的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 传输会话建立失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: anyhow::Error,
    },

    /// 认证失败
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// 会话句柄已失效（传输层已断开但状态机尚未观察到）
    #[error("Transport session is not connected")]
    NotConnected,

    /// 通道打开被远端拒绝（目标不可达等，不影响会话本身）
    #[error("Failed to open channel to {dest}: {reason}")]
    ChannelOpenFailed { dest: String, reason: String },

    /// 本地监听失败（对代理服务器是致命错误）
    #[error("Failed to listen on {addr}: {source}")]
    ListenFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 协议错误（代理握手或帧格式非法）
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connect_failed(addr: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::ConnectFailed {
            addr: addr.into(),
            source: source.into(),
        }
    }

    /// 创建认证失败错误
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// 创建通道打开失败错误
    pub fn channel_open_failed(dest: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ChannelOpenFailed {
            dest: dest.into(),
            reason: reason.into(),
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建协议错误
    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// 检查是否为会话失效错误（通道提供者据此触发一次重启）
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }

    /// 检查是否为认证失败
    pub fn is_auth_failed(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_))
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TunnelError::auth_failed("Invalid secret");
        assert!(err.is_auth_failed());
        assert_eq!(err.to_string(), "Authentication failed: Invalid secret");
    }

    #[test]
    fn test_not_connected() {
        let err = TunnelError::NotConnected;
        assert!(err.is_not_connected());
        assert!(!err.is_auth_failed());
        assert_eq!(err.to_string(), "Transport session is not connected");
    }

    #[test]
    fn test_channel_open_failed() {
        let err = TunnelError::channel_open_failed("10.0.0.5:80", "connection refused");
        assert!(!err.is_not_connected());
        assert_eq!(
            err.to_string(),
            "Failed to open channel to 10.0.0.5:80: connection refused"
        );
    }

    #[test]
    fn test_connect_failed() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = TunnelError::connect_failed("127.0.0.1:7443", io_err);
        assert!(err.to_string().contains("Failed to connect"));
        assert!(err.to_string().contains("127.0.0.1:7443"));
    }

    #[test]
    fn test_error_is_checks() {
        let auth_err = TunnelError::auth_failed("test");
        let config_err = TunnelError::config_error("test");
        let stale_err = TunnelError::NotConnected;

        assert!(auth_err.is_auth_failed());
        assert!(!auth_err.is_config_error());
        assert!(!auth_err.is_not_connected());

        assert!(config_err.is_config_error());
        assert!(!config_err.is_auth_failed());

        assert!(stale_err.is_not_connected());
    }
}
