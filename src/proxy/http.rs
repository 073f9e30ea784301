/// HTTP-CONNECT 协议协商
///
/// 仅支持 CONNECT 方法；请求体之后的多余字节被保留，
/// 在通道建立后先于任何中继数据转发
use crate::error::{Result, TunnelError};
use crate::protocol::ChannelRequest;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 请求头最大长度
const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// 读取并解析 CONNECT 请求；返回通道请求与头部之后的剩余字节
pub async fn negotiate<S>(socket: &mut S, peer: SocketAddr) -> Result<(ChannelRequest, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (header, leftover) = read_header(socket).await?;

    let (host, port) = match parse_connect(&header) {
        Ok(target) => target,
        Err(e) => {
            let status = match &e {
                TunnelError::ProtocolError(msg) if msg.starts_with("Method") => {
                    "405 Method Not Allowed"
                }
                _ => "400 Bad Request",
            };
            let _ = socket
                .write_all(format!("HTTP/1.1 {}\r\nConnection: close\r\n\r\n", status).as_bytes())
                .await;
            return Err(e);
        }
    };

    let request = ChannelRequest::new(host, port, peer.ip().to_string(), peer.port());
    Ok((request, leftover))
}

/// 发送隧道建立成功应答
pub async fn reply_success<S>(socket: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    socket.flush().await?;
    Ok(())
}

/// 通道获取失败：以协议级错误关闭
pub async fn reply_failure<S>(socket: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket
        .write_all(b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n")
        .await?;
    socket.flush().await?;
    Ok(())
}

/// 读取到头部结束符为止，超过上限视为协议错误
async fn read_header<S>(socket: &mut S) -> Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(pos) = find_terminator(&buf) {
            let leftover = buf.split_off(pos + HEADER_TERMINATOR.len());
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEADER_SIZE {
            return Err(TunnelError::protocol_error("HTTP request header too large"));
        }

        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(TunnelError::protocol_error(
                "Connection closed before request header completed",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// 解析 CONNECT 请求行，返回 (host, port)
fn parse_connect(header: &[u8]) -> Result<(String, u16)> {
    let text = std::str::from_utf8(header)
        .map_err(|_| TunnelError::protocol_error("Request header is not valid UTF-8"))?;

    let request_line = text
        .lines()
        .next()
        .ok_or_else(|| TunnelError::protocol_error("Empty request"))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| TunnelError::protocol_error("Malformed request line"))?;

    if !method.eq_ignore_ascii_case("CONNECT") {
        return Err(TunnelError::protocol_error(format!(
            "Method not supported: {}",
            method
        )));
    }

    let target = parts
        .next()
        .ok_or_else(|| TunnelError::protocol_error("Missing CONNECT target"))?;

    // CONNECT 目标必须是 host:port（IPv6 用方括号）
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| TunnelError::protocol_error("Unclosed '[' in CONNECT target"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| TunnelError::protocol_error("Missing port in CONNECT target"))?;
        (host.to_string(), port)
    } else {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::protocol_error("Missing port in CONNECT target"))?;
        (host.to_string(), port)
    };

    let port: u16 = port
        .parse()
        .map_err(|_| TunnelError::protocol_error("Invalid port in CONNECT target"))?;

    if host.is_empty() {
        return Err(TunnelError::protocol_error("Empty host in CONNECT target"));
    }

    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::duplex;

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 52100)
    }

    #[tokio::test]
    async fn test_negotiate_connect() {
        let (mut client, mut server) = duplex(4096);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let (request, leftover) = negotiate(&mut server, peer()).await.unwrap();
        assert_eq!(request.dest_host, "example.com");
        assert_eq!(request.dest_port, 443);
        assert_eq!(request.source_host, "127.0.0.1");
        assert_eq!(request.source_port, 52100);
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_negotiate_preserves_leftover_bytes() {
        let (mut client, mut server) = duplex(4096);
        client
            .write_all(b"CONNECT 10.0.0.5:80 HTTP/1.1\r\n\r\nearly-data")
            .await
            .unwrap();

        let (request, leftover) = negotiate(&mut server, peer()).await.unwrap();
        assert_eq!(request.dest(), "10.0.0.5:80");
        assert_eq!(leftover, b"early-data");
    }

    #[tokio::test]
    async fn test_negotiate_rejects_get() {
        let (mut client, mut server) = duplex(4096);
        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let err = negotiate(&mut server, peer()).await.unwrap_err();
        assert!(matches!(err, TunnelError::ProtocolError(_)));

        let mut response = vec![0u8; 128];
        let n = client.read(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response[..n]).starts_with("HTTP/1.1 405"));
    }

    #[tokio::test]
    async fn test_negotiate_rejects_missing_port() {
        let (mut client, mut server) = duplex(4096);
        client
            .write_all(b"CONNECT example.com HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let err = negotiate(&mut server, peer()).await.unwrap_err();
        assert!(matches!(err, TunnelError::ProtocolError(_)));
    }

    #[test]
    fn test_parse_connect_ipv6() {
        let (host, port) = parse_connect(b"CONNECT [2001:db8::1]:443 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(host, "2001:db8::1");
        assert_eq!(port, 443);
    }
}
