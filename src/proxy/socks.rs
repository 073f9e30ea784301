/// SOCKS4/4a/5 协议协商
///
/// 仅支持 CONNECT 命令与无认证模式；目标地址不做解析或校验，
/// 域名原样交给远端处理（等价于 SOCKS4a/5 的远端解析语义）
use crate::error::{Result, TunnelError};
use crate::protocol::ChannelRequest;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS4_VERSION: u8 = 4;
pub const SOCKS5_VERSION: u8 = 5;

// SOCKS5 命令
const CONNECT: u8 = 1;

// SOCKS5 地址类型
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

// SOCKS5 应答码
const REP_SUCCEEDED: u8 = 0;
const REP_GENERAL_FAILURE: u8 = 1;
const REP_HOST_UNREACHABLE: u8 = 4;
const REP_COMMAND_NOT_SUPPORTED: u8 = 7;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 8;

// SOCKS5 认证方法
const NO_AUTH: u8 = 0;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

// SOCKS4 应答码
const V4_GRANTED: u8 = 90;
const V4_REJECTED: u8 = 91;

/// SOCKS5 协商：问候 + 认证选择 + 连接请求
pub async fn negotiate_v5<S>(socket: &mut S, peer: SocketAddr) -> Result<ChannelRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 问候：VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    socket.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(TunnelError::protocol_error("Invalid SOCKS5 version"));
    }

    let mut methods = vec![0u8; head[1] as usize];
    socket.read_exact(&mut methods).await?;

    if !methods.contains(&NO_AUTH) {
        socket
            .write_all(&[SOCKS5_VERSION, NO_ACCEPTABLE_METHODS])
            .await?;
        return Err(TunnelError::protocol_error(
            "No acceptable SOCKS5 auth methods",
        ));
    }
    socket.write_all(&[SOCKS5_VERSION, NO_AUTH]).await?;

    // 请求：VER CMD RSV ATYP
    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;

    if request[0] != SOCKS5_VERSION {
        return Err(TunnelError::protocol_error("Invalid SOCKS5 request version"));
    }
    if request[1] != CONNECT {
        write_v5_reply(socket, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(TunnelError::protocol_error(format!(
            "SOCKS5 command not supported: {}",
            request[1]
        )));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            socket.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            socket.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| TunnelError::protocol_error("SOCKS5 domain is not valid UTF-8"))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            socket.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        other => {
            write_v5_reply(socket, REP_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(TunnelError::protocol_error(format!(
                "SOCKS5 address type not supported: {}",
                other
            )));
        }
    };

    let mut port = [0u8; 2];
    socket.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    Ok(ChannelRequest::new(
        host,
        port,
        peer.ip().to_string(),
        peer.port(),
    ))
}

/// SOCKS4/4a 协商
pub async fn negotiate_v4<S>(socket: &mut S, peer: SocketAddr) -> Result<ChannelRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VN CD DSTPORT(2) DSTIP(4)
    let mut request = [0u8; 8];
    socket.read_exact(&mut request).await?;

    if request[0] != SOCKS4_VERSION {
        return Err(TunnelError::protocol_error("Invalid SOCKS4 version"));
    }
    if request[1] != CONNECT {
        reply_failure_v4(socket).await?;
        return Err(TunnelError::protocol_error(format!(
            "SOCKS4 command not supported: {}",
            request[1]
        )));
    }

    let port = u16::from_be_bytes([request[2], request[3]]);
    let ip = [request[4], request[5], request[6], request[7]];

    // USERID，NUL 结尾（忽略内容）
    read_until_nul(socket).await?;

    // SOCKS4a：IP 为 0.0.0.x (x != 0) 时目标为 NUL 结尾的域名
    let host = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
        let domain = read_until_nul(socket).await?;
        String::from_utf8(domain)
            .map_err(|_| TunnelError::protocol_error("SOCKS4a domain is not valid UTF-8"))?
    } else {
        Ipv4Addr::from(ip).to_string()
    };

    Ok(ChannelRequest::new(
        host,
        port,
        peer.ip().to_string(),
        peer.port(),
    ))
}

/// SOCKS5 成功应答（绑定地址填零）
pub async fn reply_success_v5<S>(socket: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_v5_reply(socket, REP_SUCCEEDED).await
}

/// SOCKS5 失败应答，根据错误种类选择应答码
pub async fn reply_failure_v5<S>(socket: &mut S, err: &TunnelError) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let code = match err {
        TunnelError::ChannelOpenFailed { .. } => REP_HOST_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    };
    write_v5_reply(socket, code).await
}

/// SOCKS4 成功应答
pub async fn reply_success_v4<S>(socket: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_v4_reply(socket, V4_GRANTED).await
}

/// SOCKS4 失败应答
pub async fn reply_failure_v4<S>(socket: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_v4_reply(socket, V4_REJECTED).await
}

async fn write_v5_reply<S>(socket: &mut S, code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    // VER REP RSV ATYP BND.ADDR(4) BND.PORT(2)
    socket
        .write_all(&[SOCKS5_VERSION, code, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    socket.flush().await?;
    Ok(())
}

async fn write_v4_reply<S>(socket: &mut S, code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    // VN REP DSTPORT(2) DSTIP(4)
    socket.write_all(&[0, code, 0, 0, 0, 0, 0, 0]).await?;
    socket.flush().await?;
    Ok(())
}

async fn read_until_nul<S>(socket: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    // 域名与用户标识都很短；上限防御畸形输入
    const MAX_LEN: usize = 512;
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        socket.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            return Ok(out);
        }
        out.push(byte[0]);
        if out.len() > MAX_LEN {
            return Err(TunnelError::protocol_error("SOCKS4 field too long"));
        }
    }
}
