/// 配置解析
///
/// 连接选项在进程启动时一次性解析，之后不可变；
/// 会话在每次（重新）连接时引用同一份选项
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 中继服务器默认端口
pub const DEFAULT_SERVER_PORT: u16 = 7443;

/// 本地代理默认绑定端口
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// 传输会话连接选项（进程生命周期内不可变）
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// 中继服务器地址
    pub server_addr: String,
    /// 中继服务器端口
    pub server_port: u16,
    /// 远端用户名（可选）
    pub user: Option<String>,
    /// 共享密钥（来自 --password 或 --identity-file）
    pub secret: String,
    /// 传输套接字 TCP keepalive 间隔（None 禁用）
    pub keepalive: Option<Duration>,
    /// 自定义 CA 证书路径
    pub ca_cert_path: Option<PathBuf>,
    /// 跳过证书验证（仅用于测试）
    pub skip_verify: bool,
}

/// 本地代理监听选项
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// 代理监听地址
    pub bind_addr: String,
    /// 代理监听端口
    pub bind_port: u16,
    /// 空闲超时（None 禁用）：超过该间隔无流量则强制关闭客户端连接
    pub idle_timeout: Option<Duration>,
}

/// 解析后的目标描述 `[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
}

/// 解析 `[user@]host[:port]` 形式的目标
pub fn parse_destination(input: &str) -> Result<Destination> {
    let input = input.trim();
    if input.is_empty() {
        bail!("Destination must not be empty");
    }

    let (user, rest) = match input.split_once('@') {
        Some((user, rest)) => {
            if user.is_empty() {
                bail!("Empty user in destination '{}'", input);
            }
            (Some(user.to_string()), rest)
        }
        None => (None, input),
    };

    // IPv6 字面量使用 [addr]:port 形式
    let (host, port) = if let Some(rest) = rest.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .with_context(|| format!("Unclosed '[' in destination '{}'", input))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse::<u16>()
                .with_context(|| format!("Invalid port in destination '{}'", input))?,
            None => DEFAULT_SERVER_PORT,
        };
        (host.to_string(), port)
    } else {
        match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("Invalid port in destination '{}'", input))?;
                (host.to_string(), port)
            }
            None => (rest.to_string(), DEFAULT_SERVER_PORT),
        }
    };

    if host.is_empty() {
        bail!("Empty host in destination '{}'", input);
    }

    Ok(Destination { user, host, port })
}

/// 从身份文件读取共享密钥（首个非空行）
pub fn load_secret_file(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let content = std::fs::read_to_string(expanded.as_ref())
        .with_context(|| format!("Failed to read identity file: {}", path))?;

    let secret = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .with_context(|| format!("Identity file is empty: {}", path))?;

    Ok(secret.to_string())
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// 中继服务器配置（TOML）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 服务器监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 服务器监听端口
    #[serde(default = "default_server_port")]
    pub bind_port: u16,
    /// 认证密钥（用于客户端认证）
    pub auth_key: String,
    /// TLS 证书路径（与 key_path 同时留空则运行时自动生成）
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// 目标 TCP 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl ServerConfig {
    /// 从 TOML 文件加载服务器配置
    pub fn load(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path);
        let content = std::fs::read_to_string(expanded.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.auth_key.len() < 8 {
            bail!("auth_key must be at least 8 characters");
        }
        if self.bind_port == 0 {
            bail!("bind_port must not be 0");
        }
        match (&self.cert_path, &self.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("cert_path and key_path must both be set, or both omitted to auto-generate"),
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
