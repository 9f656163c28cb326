use std::future::pending;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::trace;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// 一次性、可取消的连接超时定时器
///
/// 最多触发一次；触发后只负责通知与回调，不会终止会话。
/// 对已触发或已取消的定时器再次取消是空操作。
/// 定时器被丢弃时自动取消，不会比所属的连接尝试活得更久。
#[derive(Debug)]
pub struct ConnectTimer {
    id: TimerId,
    state: Arc<AtomicU8>,
    expired_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl ConnectTimer {
    /// 启动定时器，`deadline_secs` 秒后调用 `on_timeout`
    ///
    /// 需要在 tokio 运行时中调用
    pub fn start<F>(deadline_secs: u64, on_timeout: F) -> Self
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        let id = TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(AtomicU8::new(ARMED));
        let (expired_tx, expired_rx) = watch::channel(false);

        let task_state = state.clone();
        let task = tokio::spawn(async move {
            let started = Instant::now();
            sleep(Duration::from_secs(deadline_secs)).await;

            if task_state
                .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            let _ = expired_tx.send(true);
            on_timeout(started.elapsed());
            // 不重新启动
        });

        trace!("定时器 {:?} 已启动（{} 秒）", id, deadline_secs);

        Self {
            id,
            state,
            expired_rx,
            task,
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn cancel(&self) {
        if self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.task.abort();
            trace!("定时器 {:?} 已取消", self.id);
        }
    }

    pub fn is_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// 等待定时器触发；已取消的定时器永远不会返回
    pub async fn expired(&self) {
        let mut rx = self.expired_rx.clone();
        if rx.wait_for(|fired| *fired).await.is_err() {
            pending::<()>().await;
        }
    }
}

impl Drop for ConnectTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
