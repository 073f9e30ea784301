/// 弹性通道提供者
///
/// 公共入口 obtain_channel：对调用者隐藏会话的失效与重启。
/// 策略是乐观的：不主动探测存活，首次使用发现失效时惰性修复，
/// 且重试恰好一次，避免在永久损坏的会话上无限递归
use crate::error::{Result, TunnelError};
use crate::protocol::ChannelRequest;
use crate::session::{Session, SessionEvent, SessionHandle, SessionState, TunnelChannel};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

pub struct ChannelProvider {
    // 会话是唯一的共享可变资源；所有访问都经由该锁串行化，
    // 打开通道本身通过句柄快照进行，不占用锁
    session: Mutex<Session>,
}

impl ChannelProvider {
    pub fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
        }
    }

    /// 建立初始连接
    ///
    /// 失败不致命：监听照常开始，后续通道请求会触发惰性修复
    pub async fn connect(&self) -> Result<()> {
        self.session.lock().await.connect().await
    }

    pub async fn state(&self) -> SessionState {
        self.session.lock().await.state()
    }

    /// 获取一条到目标的通道
    ///
    /// 1. 用当前句柄尝试打开；
    /// 2. 失败且为 NotConnected：串行化重启会话后恰好重试一次；
    /// 3. 其他失败或重试后仍 NotConnected，原样向调用者传播
    pub async fn obtain_channel(&self, request: &ChannelRequest) -> Result<TunnelChannel> {
        let (observed_epoch, first_handle) = {
            let session = self.session.lock().await;
            (session.epoch(), session.current_handle())
        };

        match first_handle {
            Ok(handle) => match handle.open_channel(request).await {
                Ok(channel) => return Ok(channel),
                Err(e) if e.is_not_connected() => {}
                Err(e) => return Err(e),
            },
            Err(e) if e.is_not_connected() => {}
            Err(e) => return Err(e),
        }

        let handle = self.restart_from(observed_epoch).await?;
        handle.open_channel(request).await
    }

    /// 从观察到代数 observed_epoch 的失效中恢复，返回可用句柄
    ///
    /// 持有会话锁执行重启，因此并发的失效观察者在锁上排队；
    /// 若排到时代数已前进，说明先行者（或自动重连任务）已完成修复，
    /// 直接复用新句柄而不再发起冗余重启
    async fn restart_from(&self, observed_epoch: u64) -> Result<SessionHandle> {
        let mut session = self.session.lock().await;

        if session.epoch() > observed_epoch {
            if let Ok(handle) = session.current_handle() {
                return Ok(handle);
            }
            // 修复已发生但又失效（或修复失败）：继续走自己的重启
        }

        session.restart().await?;
        session.current_handle()
    }

    /// 启动自动重连任务：消费会话关闭通知
    ///
    /// 每个属于当前代数的通知恰好触发一次 connect 尝试；
    /// 尝试失败时会话保持 Disconnected，由后续请求惰性修复
    pub fn spawn_auto_reconnect(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<SessionEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(SessionEvent::Closed { epoch }) = events.recv().await {
                let mut session = provider.session.lock().await;
                if !session.mark_disconnected_if_current(epoch) {
                    // 过期通知：句柄已被重启替换
                    continue;
                }
                warn!("Transport session lost, reconnecting");
                if let Err(e) = session.connect().await {
                    error!("Automatic reconnect failed: {}", e);
                }
            }
        })
    }

    /// 关闭会话（进程退出路径）
    pub async fn shutdown(&self) {
        self.session.lock().await.destroy();
    }
}
