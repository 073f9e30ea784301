/// 会话状态机
///
/// 独占持有唯一的传输会话句柄及其连接状态。句柄由一个驱动任务
/// 独占轮询（yamux 连接），状态机通过消息传递请求新的出站流，
/// 因此任何并发请求路径都不会直接触碰句柄
use crate::config::ConnectOptions;
use crate::error::{Result, TunnelError};
use crate::protocol::{self, AuthRequest, ChannelRequest};
use crate::transport::{Transport, TransportClient};
use futures::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode as YamuxMode};

/// 一条转发通道：绑定单一目标的双向字节流
pub type TunnelChannel = Compat<yamux::Stream>;

/// 会话连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
}

/// 会话生命周期事件（旁路通知，不参与控制流）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// 传输会话被对端关闭或因网络故障终止；携带所属句柄代数
    Closed { epoch: u64 },
}

type StreamRequest = oneshot::Sender<std::result::Result<yamux::Stream, yamux::ConnectionError>>;

/// 当前句柄的轻量视图，可跨任务克隆
///
/// 通过它打开通道不需要持有会话锁，因此多个通道请求可以并发进行
#[derive(Clone)]
pub struct SessionHandle {
    stream_tx: mpsc::Sender<StreamRequest>,
    epoch: u64,
}

impl SessionHandle {
    /// 句柄代数：每次成功连接递增，用于识别冗余重启与过期关闭通知
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 打开一条到目标的通道
    ///
    /// yamux 层打开失败或首帧交换中的 I/O 失败都意味着会话已失效，
    /// 归类为 NotConnected；远端的显式拒绝归类为 ChannelOpenFailed
    pub async fn open_channel(&self, request: &ChannelRequest) -> Result<TunnelChannel> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.stream_tx
            .send(reply_tx)
            .await
            .map_err(|_| TunnelError::NotConnected)?;

        let stream = reply_rx
            .await
            .map_err(|_| TunnelError::NotConnected)?
            .map_err(|e| {
                debug!("Failed to open outbound stream: {}", e);
                TunnelError::NotConnected
            })?;

        let mut channel = stream.compat();

        protocol::write_frame(&mut channel, request)
            .await
            .map_err(io_means_stale)?;

        match protocol::read_reply(&mut channel).await.map_err(io_means_stale)? {
            Ok(()) => Ok(channel),
            Err(reason) => Err(TunnelError::channel_open_failed(request.dest(), reason)),
        }
    }
}

/// 首帧交换期间的 I/O 错误意味着流所属的会话已经死亡
fn io_means_stale(err: TunnelError) -> TunnelError {
    match err {
        TunnelError::Io(_) => TunnelError::NotConnected,
        other => other,
    }
}

/// 会话状态机
///
/// 状态转移：Disconnected --connect--> Connecting --成功--> Ready；
/// 连接失败回到 Disconnected；对端关闭或 restart 回到 Disconnected
pub struct Session {
    options: Arc<ConnectOptions>,
    transport: Arc<dyn TransportClient>,
    state: SessionState,
    handle: Option<SessionHandle>,
    epoch: u64,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl Session {
    /// 创建会话，返回会话本体与生命周期事件接收端
    pub fn new(
        options: Arc<ConnectOptions>,
        transport: Arc<dyn TransportClient>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(16);
        (
            Self {
                options,
                transport,
                state: SessionState::Disconnected,
                handle: None,
                epoch: 0,
                events_tx,
            },
            events_rx,
        )
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 当前句柄快照；非 Ready 状态返回 NotConnected
    pub fn current_handle(&self) -> Result<SessionHandle> {
        if self.state != SessionState::Ready {
            return Err(TunnelError::NotConnected);
        }
        self.handle.clone().ok_or(TunnelError::NotConnected)
    }

    /// 建立传输会话：拨号、认证握手、启动 yamux 驱动任务
    ///
    /// 挂起直到会话就绪或失败；失败时状态回到 Disconnected，调用者可重试
    pub async fn connect(&mut self) -> Result<()> {
        self.state = SessionState::Connecting;
        let addr = self.transport.remote_addr();

        let mut stream = match self.transport.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(TunnelError::connect_failed(addr, e));
            }
        };

        if let Err(e) = self.authenticate(&mut stream).await {
            self.state = SessionState::Disconnected;
            return Err(match e {
                TunnelError::AuthenticationFailed(_) => e,
                other => TunnelError::connect_failed(addr, other),
            });
        }

        // yamux 客户端模式；连接本体移交给驱动任务独占
        let yamux_conn =
            YamuxConnection::new(stream.compat(), YamuxConfig::default(), YamuxMode::Client);

        self.epoch += 1;
        let (stream_tx, stream_rx) = mpsc::channel(64);
        tokio::spawn(drive_connection(
            yamux_conn,
            stream_rx,
            self.events_tx.clone(),
            self.epoch,
        ));

        self.handle = Some(SessionHandle {
            stream_tx,
            epoch: self.epoch,
        });
        self.state = SessionState::Ready;
        info!("Transport session ready (epoch {})", self.epoch);
        Ok(())
    }

    /// 认证握手：发送认证帧，等待单字节结果
    async fn authenticate(&self, stream: &mut Pin<Box<dyn Transport>>) -> Result<()> {
        let auth = AuthRequest::new(self.options.user.clone(), self.options.secret.clone());
        protocol::write_frame(stream, &auth).await?;

        match protocol::read_reply(stream).await? {
            Ok(()) => {
                info!("Authentication successful");
                Ok(())
            }
            Err(msg) => Err(TunnelError::auth_failed(msg)),
        }
    }

    /// 重启：无条件销毁当前句柄（幂等），重新初始化并重连
    pub async fn restart(&mut self) -> Result<()> {
        self.destroy();
        info!("Restarting transport session");
        self.connect().await
    }

    /// 释放句柄而不重连（进程关闭时使用）
    ///
    /// 丢弃流请求发送端即可令驱动任务退出并回收 yamux 连接
    pub fn destroy(&mut self) {
        self.handle = None;
        self.state = SessionState::Disconnected;
    }

    /// 处理对端关闭通知；仅当通知属于当前代数时回退状态并返回 true
    pub fn mark_disconnected_if_current(&mut self, epoch: u64) -> bool {
        if self.epoch == epoch && self.state == SessionState::Ready {
            self.handle = None;
            self.state = SessionState::Disconnected;
            true
        } else {
            false
        }
    }
}

/// yamux 连接驱动任务
///
/// 独占轮询连接：服务出站流请求，同时观察入站方向以发现会话终止。
/// 会话被对端关闭时发出 Closed 事件；句柄被主动丢弃时静默退出
async fn drive_connection(
    mut conn: YamuxConnection<Compat<Pin<Box<dyn Transport>>>>,
    mut requests: mpsc::Receiver<StreamRequest>,
    events: mpsc::Sender<SessionEvent>,
    epoch: u64,
) {
    loop {
        tokio::select! {
            inbound = poll_fn(|cx| conn.poll_next_inbound(cx)) => {
                match inbound {
                    Some(Ok(stream)) => {
                        // 本端从不接受远端发起的流
                        warn!("Dropping unexpected inbound stream");
                        drop(stream);
                    }
                    Some(Err(e)) => {
                        warn!("Transport session error: {}", e);
                        break;
                    }
                    None => {
                        info!("Transport session closed by peer");
                        break;
                    }
                }
            }
            request = requests.recv() => {
                match request {
                    Some(reply_tx) => {
                        let result = poll_fn(|cx| conn.poll_new_outbound(cx)).await;
                        let failed = result.is_err();
                        let _ = reply_tx.send(result);
                        if failed {
                            break;
                        }
                    }
                    None => {
                        debug!("Session handle dropped, closing transport (epoch {})", epoch);
                        return;
                    }
                }
            }
        }
    }

    let _ = events.send(SessionEvent::Closed { epoch }).await;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport and fake relay used by session and provider tests.
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    pub const MOCK_SECRET: &str = "mock-secret";
    /// Channel requests to this port are rejected by the fake relay.
    pub const REFUSED_PORT: u16 = 9;

    /// Transport client backed by in-process duplex pipes. Every connect
    /// spawns a fake relay speaking the real auth + yamux protocol.
    pub struct MockTransportClient {
        connects: AtomicUsize,
        fail_connects: AtomicBool,
        relays: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    }

    impl MockTransportClient {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                fail_connects: AtomicBool::new(false),
                relays: Mutex::new(Vec::new()),
            })
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn set_fail_connects(&self, fail: bool) {
            self.fail_connects.store(fail, Ordering::SeqCst);
        }

        /// Kill the live relay ends, simulating a silently dropped session.
        pub fn kill_relays(&self) {
            for handle in self.relays.lock().unwrap().drain(..) {
                handle.abort();
            }
        }

        pub fn options() -> Arc<ConnectOptions> {
            Arc::new(ConnectOptions {
                server_addr: "mock".to_string(),
                server_port: 0,
                user: None,
                secret: MOCK_SECRET.to_string(),
                keepalive: None,
                ca_cert_path: None,
                skip_verify: false,
            })
        }
    }

    #[async_trait]
    impl TransportClient for Arc<MockTransportClient> {
        async fn connect(&self) -> anyhow::Result<Pin<Box<dyn Transport>>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connects.load(Ordering::SeqCst) {
                anyhow::bail!("mock connect refused");
            }
            let (client_end, relay_end) = tokio::io::duplex(64 * 1024);
            let handle = tokio::spawn(run_fake_relay(relay_end));
            self.relays.lock().unwrap().push(handle);
            Ok(Box::pin(client_end))
        }

        fn remote_addr(&self) -> String {
            "mock:0".to_string()
        }
    }

    /// Fake relay: real auth handshake, yamux server mode, echo channels.
    async fn run_fake_relay(mut io: DuplexStream) {
        let auth: AuthRequest = match protocol::read_frame(&mut io).await {
            Ok(auth) => auth,
            Err(_) => return,
        };
        if auth.secret != MOCK_SECRET {
            let _ = protocol::write_reply_err(&mut io, "invalid credentials").await;
            return;
        }
        if protocol::write_reply_ok(&mut io).await.is_err() {
            return;
        }

        let mut conn = YamuxConnection::new(io.compat(), YamuxConfig::default(), YamuxMode::Server);
        loop {
            match poll_fn(|cx| conn.poll_next_inbound(cx)).await {
                Some(Ok(stream)) => {
                    tokio::spawn(handle_fake_channel(stream));
                }
                _ => break,
            }
        }
    }

    /// Per-channel behavior: reject REFUSED_PORT, otherwise echo.
    async fn handle_fake_channel(stream: yamux::Stream) {
        let mut channel = stream.compat();
        let request: ChannelRequest = match protocol::read_frame(&mut channel).await {
            Ok(request) => request,
            Err(_) => return,
        };
        if request.dest_port == REFUSED_PORT {
            let _ = protocol::write_reply_err(&mut channel, "connection refused").await;
            return;
        }
        if protocol::write_reply_ok(&mut channel).await.is_err() {
            return;
        }
        let (mut reader, mut writer) = tokio::io::split(channel);
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    }

    pub fn mock_session(
        transport: Arc<MockTransportClient>,
    ) -> (Session, mpsc::Receiver<SessionEvent>) {
        Session::new(MockTransportClient::options(), Arc::new(transport))
    }
}
