use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;

/// 连接超时事件名
pub const TIMEOUT_CONNECT_EVENT: &str = "proxy.timeout-connect";

/// 供外部观察者（统计、日志）订阅的连接事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectEvent {
    TimeoutConnect { target: SocketAddr, elapsed: Duration },
}

impl ConnectEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectEvent::TimeoutConnect { .. } => TIMEOUT_CONNECT_EVENT,
        }
    }
}

pub type EventSender = broadcast::Sender<ConnectEvent>;

/// 创建事件通道
pub fn channel(capacity: usize) -> (EventSender, broadcast::Receiver<ConnectEvent>) {
    broadcast::channel(capacity)
}

/// 发送事件，没有订阅者时静默丢弃
pub(crate) fn emit(sender: Option<&EventSender>, event: ConnectEvent) {
    if let Some(sender) = sender {
        let _ = sender.send(event);
    }
}
