/// Proxy Tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod config;
pub mod error;
pub mod io_util;
pub mod protocol;
pub mod provider;
pub mod proxy;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use config::{ConnectOptions, ProxyOptions, ServerConfig};
pub use error::{Result, TunnelError};
pub use protocol::{AuthRequest, ChannelRequest};
pub use provider::ChannelProvider;
pub use session::{Session, SessionEvent, SessionState, TunnelChannel};
pub use transport::{create_transport_client, Transport, TransportClient};
