use crate::error::ConnError;
use crate::events::{self, ConnectEvent, EventSender};
use crate::handle::ConnectionHandle;
use crate::timer::{ConnectTimer, TimerId};
use nix::errno::Errno;
use nix::sys::socket::{
    bind, connect, socket, AddressFamily, SockFlag, SockProtocol, SockType, SockaddrStorage,
};
use std::future::pending;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream as StdTcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

/// 轮询兜底时限在定时器截止时间之后的余量
const POLL_GRACE: Duration = Duration::from_secs(1);

/// 连接尝试状态
///
/// `Init -> SocketOpen -> Connecting -> {Connected | TimedOut | Failed}`，
/// 立即完成的连接跳过 `Connecting`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Init,
    SocketOpen,
    Connecting,
    Connected,
    TimedOut,
    Failed,
}

impl ConnectState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectState::Connected | ConnectState::TimedOut | ConnectState::Failed
        )
    }
}

/// 一次连接尝试的上下文，仅在一次 connect 调用期间存在
#[derive(Debug)]
pub struct ConnectionAttempt {
    target: SocketAddr,
    bind_addr: SocketAddr,
    timeout_secs: u64,
    deadline: Option<Instant>,
    timer: Option<TimerId>,
    state: ConnectState,
}

impl ConnectionAttempt {
    /// `timeout_secs` 为 0 表示不设超时
    pub fn new(target: SocketAddr, bind_addr: SocketAddr, timeout_secs: u64) -> Self {
        Self {
            target,
            bind_addr,
            timeout_secs,
            deadline: None,
            timer: None,
            state: ConnectState::Init,
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 本次尝试注册过的定时器
    pub fn timer_id(&self) -> Option<TimerId> {
        self.timer
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    fn advance(&mut self, next: ConnectState) {
        debug_assert!(
            !self.state.is_terminal(),
            "attempt already terminal: {:?}",
            self.state
        );
        trace!(
            "连接 {} -> {}: {:?} -> {:?}",
            self.bind_addr,
            self.target,
            self.state,
            next
        );
        self.state = next;
    }

    fn fail(&mut self, err: &ConnError) {
        let next = match err {
            ConnError::ConnectTimeout { .. } => ConnectState::TimedOut,
            _ => ConnectState::Failed,
        };
        self.advance(next);
    }
}

/// 等待连接完成时关注的就绪事件
///
/// 需要先发送 PROXY 协议头时等待可写，否则等待后端发来欢迎信息（可读）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Readiness {
    #[default]
    Readable,
    Writable,
}

impl Readiness {
    fn interest(self) -> Interest {
        match self {
            Readiness::Readable => Interest::READABLE,
            Readiness::Writable => Interest::WRITABLE,
        }
    }
}

/// 非阻塞连接器
#[derive(Debug, Clone, Default)]
pub struct ConnectionEstablisher {
    readiness: Readiness,
    events: Option<EventSender>,
}

impl ConnectionEstablisher {
    pub fn new(readiness: Readiness) -> Self {
        Self {
            readiness,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// 从 `bind_addr` 连接到 `target`
    pub async fn connect(
        &self,
        target: SocketAddr,
        bind_addr: SocketAddr,
        timeout_secs: u64,
    ) -> Result<ConnectionHandle, ConnError> {
        let mut attempt = ConnectionAttempt::new(target, bind_addr, timeout_secs);
        self.run(&mut attempt).await
    }

    /// 驱动一次连接尝试直到终止状态
    ///
    /// 每个终止分支都会先取消定时器再关闭套接字
    pub async fn run(
        &self,
        attempt: &mut ConnectionAttempt,
    ) -> Result<ConnectionHandle, ConnError> {
        let target = attempt.target;
        let bind_addr = attempt.bind_addr;

        let socket = match open_socket(bind_addr) {
            Ok(socket) => socket,
            Err(e) => {
                error!("创建连接失败（绑定 {}）: {}", bind_addr, e);
                let err = ConnError::BindFailure {
                    bind_addr,
                    source: e,
                };
                attempt.fail(&err);
                return Err(err);
            }
        };
        attempt.advance(ConnectState::SocketOpen);

        debug!("从 {} 连接后端地址 {}", bind_addr, target);

        match start_connect(&socket, bind_addr, target) {
            Ok(true) => {
                debug!("连接 {} 立即完成", target);
                return self.finish(socket, attempt);
            }
            Ok(false) => {}
            Err(e) => {
                error!("开始连接 {} 失败（绑定 {}）: {}", target, bind_addr, e);
                let err = ConnError::from_connect_io(target, bind_addr, e);
                attempt.fail(&err);
                return Err(err);
            }
        }
        attempt.advance(ConnectState::Connecting);

        let socket = match AsyncFd::with_interest(socket, self.readiness.interest()) {
            Ok(socket) => socket,
            Err(e) => {
                error!("注册 {} 的套接字失败（绑定 {}）: {}", target, bind_addr, e);
                let err = ConnError::ConnectError {
                    target,
                    bind_addr,
                    source: e,
                };
                attempt.fail(&err);
                return Err(err);
            }
        };

        let timer = if attempt.timeout_secs > 0 {
            let timeout = Duration::from_secs(attempt.timeout_secs);
            attempt.deadline = Some(Instant::now() + timeout);
            let timer = self.start_timer(target, attempt.timeout_secs);
            attempt.timer = Some(timer.id());
            Some(timer)
        } else {
            None
        };

        let polled = self
            .poll_connected(&socket, timer.as_ref(), attempt.deadline)
            .await;

        if let Some(timer) = &timer {
            timer.cancel();
        }

        match polled {
            Ok(()) => self.finish(socket.into_inner(), attempt),
            Err(e) => {
                error!("连接 {} 失败（绑定 {}）: {}", target, bind_addr, e);
                let err = ConnError::from_connect_io(target, bind_addr, e);
                attempt.fail(&err);
                drop(socket);
                Err(err)
            }
        }
    }

    fn start_timer(&self, target: SocketAddr, timeout_secs: u64) -> ConnectTimer {
        let events = self.events.clone();
        ConnectTimer::start(timeout_secs, move |elapsed| {
            warn!(
                "连接 {} 超时，已等待 {} 秒",
                target,
                elapsed.as_secs()
            );
            events::emit(
                events.as_ref(),
                ConnectEvent::TimeoutConnect { target, elapsed },
            );
        })
    }

    async fn poll_connected(
        &self,
        socket: &AsyncFd<StdTcpStream>,
        timer: Option<&ConnectTimer>,
        deadline: Option<Instant>,
    ) -> io::Result<()> {
        loop {
            let ready = tokio::select! {
                biased;
                _ = timer_expired(timer) => {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                _ = poll_deadline(deadline) => {
                    // 定时器应当先触发
                    warn!("轮询等待超过截止时间");
                    return Err(io::ErrorKind::TimedOut.into());
                }
                ready = self.wait_ready(socket) => ready,
            };

            let mut guard = match ready {
                Ok(guard) => guard,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            if let Some(e) = socket.get_ref().take_error()? {
                return Err(e);
            }

            if self.readiness == Readiness::Writable {
                return Ok(());
            }

            let mut peek_buf = [0u8; 1];
            match socket.get_ref().peek(&mut peek_buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => guard.clear_ready(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn wait_ready<'a>(
        &self,
        socket: &'a AsyncFd<StdTcpStream>,
    ) -> io::Result<AsyncFdReadyGuard<'a, StdTcpStream>> {
        match self.readiness {
            Readiness::Readable => socket.readable().await,
            Readiness::Writable => socket.writable().await,
        }
    }

    /// 刷新本地地址并建立双向流，成功后进入 `Connected`
    fn finish(
        &self,
        socket: StdTcpStream,
        attempt: &mut ConnectionAttempt,
    ) -> Result<ConnectionHandle, ConnError> {
        let target = attempt.target;
        let bind_addr = attempt.bind_addr;

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("获取 fd {} 的本地套接字信息失败: {}", socket.as_raw_fd(), e);
                let err = ConnError::ConnectError {
                    target,
                    bind_addr,
                    source: e,
                };
                attempt.fail(&err);
                return Err(err);
            }
        };

        match TcpStream::from_std(socket) {
            Ok(stream) => {
                attempt.advance(ConnectState::Connected);
                info!("成功从 {} 连接到 {}", local_addr, target);
                Ok(ConnectionHandle::new(stream, local_addr, target))
            }
            Err(e) => {
                error!("无法打开到 {} 的控制连接: {}", target, e);
                let err = ConnError::HandshakeOpenFailure { target, source: e };
                attempt.fail(&err);
                Err(err)
            }
        }
    }
}

async fn timer_expired(timer: Option<&ConnectTimer>) {
    match timer {
        Some(timer) => timer.expired().await,
        None => pending().await,
    }
}

async fn poll_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline + POLL_GRACE).await,
        None => pending().await,
    }
}

/// 创建绑定到 `bind_addr`（任意端口）的非阻塞 TCP 套接字
fn open_socket(bind_addr: SocketAddr) -> io::Result<StdTcpStream> {
    let family = match bind_addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };

    let fd = socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )?;
    bind(fd.as_raw_fd(), &SockaddrStorage::from(bind_addr))?;

    Ok(StdTcpStream::from(fd))
}

/// 发起非阻塞连接，返回是否已立即完成
fn start_connect(
    socket: &StdTcpStream,
    bind_addr: SocketAddr,
    target: SocketAddr,
) -> io::Result<bool> {
    // IPv6 套接字连接 IPv4 后端时使用映射地址
    let addr = match (bind_addr, target.ip()) {
        (SocketAddr::V6(_), IpAddr::V4(v4)) => {
            SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), target.port())
        }
        _ => target,
    };

    match connect(socket.as_raw_fd(), &SockaddrStorage::from(addr)) {
        Ok(()) | Err(Errno::EISCONN) => Ok(true),
        Err(Errno::EINPROGRESS) | Err(Errno::EINTR) => Ok(false),
        Err(errno) => Err(errno.into()),
    }
}
