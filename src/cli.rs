use crate::config::DEFAULT_PROXY_PORT;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "proxy-tunnel")]
#[command(author, version, about = "Local HTTP-CONNECT/SOCKS proxy over a single TLS session", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志详细程度（-v debug，-vv trace）
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行本地代理，经单一 TLS 会话转发所有连接
    Proxy {
        /// 中继目标，[user@]host[:port] 形式
        destination: String,

        /// 本地代理绑定地址
        #[arg(long, default_value = "127.0.0.1")]
        bind_addr: String,

        /// 本地代理绑定端口
        #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
        bind_port: u16,

        /// 共享密钥
        #[arg(long, conflicts_with = "identity_file")]
        password: Option<String>,

        /// 包含共享密钥的身份文件
        #[arg(long, value_name = "PATH")]
        identity_file: Option<String>,

        /// 传输套接字 TCP keepalive 间隔（秒，0 禁用）
        #[arg(long, default_value_t = 30)]
        keepalive: u64,

        /// 空闲超时（秒，0 禁用）：超过该间隔无流量则关闭客户端连接
        #[arg(long, default_value_t = 0)]
        idle_timeout: u64,

        /// 自定义 CA 证书路径
        #[arg(long, value_name = "PATH")]
        ca_cert: Option<String>,

        /// 跳过证书验证（仅用于测试）
        #[arg(long)]
        skip_verify: bool,
    },
    /// 运行中继服务器
    Server {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },
    /// 校验服务器配置文件
    Check {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },
    /// 生成自签名证书
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "cert.pem", value_name = "PATH")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, default_value = "key.pem", value_name = "PATH")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 附加的 SAN 列表（逗号分隔）
        #[arg(long, value_delimiter = ',')]
        alt_names: Vec<String>,
    },
}
