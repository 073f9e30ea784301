/// 双向转发辅助
///
/// 调度循环用它在客户端套接字与通道之间搬运字节，
/// 并执行每连接的空闲超时策略
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const RELAY_BUF_SIZE: usize = 8192;

/// 双向拷贝，支持半关闭与可选空闲超时
///
/// 返回 (a→b, b→a) 字节数。配置了空闲超时且两个方向在该间隔内
/// 均无字节流动时返回 ErrorKind::TimedOut，由调用者强制关闭连接；
/// 任一方向的流量都会重置计时
pub async fn relay_with_idle_timeout<A, B>(
    a: &mut A,
    b: &mut B,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let Some(idle) = idle_timeout else {
        return tokio::io::copy_bidirectional(a, b).await;
    };

    let mut a_buf = vec![0u8; RELAY_BUF_SIZE];
    let mut b_buf = vec![0u8; RELAY_BUF_SIZE];
    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;
    let mut a_open = true;
    let mut b_open = true;

    while a_open || b_open {
        tokio::select! {
            result = a.read(&mut a_buf), if a_open => {
                match result? {
                    0 => {
                        a_open = false;
                        let _ = b.shutdown().await;
                    }
                    n => {
                        b.write_all(&a_buf[..n]).await?;
                        b.flush().await?;
                        a_to_b += n as u64;
                    }
                }
            }
            result = b.read(&mut b_buf), if b_open => {
                match result? {
                    0 => {
                        b_open = false;
                        let _ = a.shutdown().await;
                    }
                    n => {
                        a.write_all(&b_buf[..n]).await?;
                        a.flush().await?;
                        b_to_a += n as u64;
                    }
                }
            }
            _ = tokio::time::sleep(idle) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connection idle timeout"));
            }
        }
    }

    Ok((a_to_b, b_to_a))
}
