use crate::common::{closed_port_addr, loopback_bind, TestBackend};
use ftp_proxy::connect::{ConnectState, ConnectionAttempt, ConnectionEstablisher, Readiness};
use ftp_proxy::events::{self, ConnectEvent, TIMEOUT_CONNECT_EVENT};
use ftp_proxy::ConnError;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::time::{timeout, Duration};

/// 后端先发送欢迎信息时，等待可读即连接成功
#[tokio::test]
async fn test_connect_readable_backend() {
    let backend = TestBackend::greeting().await;
    let establisher = ConnectionEstablisher::new(Readiness::Readable);
    let mut attempt = ConnectionAttempt::new(backend.addr(), loopback_bind(), 5);

    let mut conn = establisher
        .run(&mut attempt)
        .await
        .expect("connect should succeed");

    assert_eq!(attempt.state(), ConnectState::Connected);
    assert_eq!(conn.remote_addr(), backend.addr());
    assert_eq!(conn.local_addr().ip(), loopback_bind().ip());
    assert_ne!(conn.local_addr().port(), 0);

    // 欢迎信息仍留在流中，没有被探测读取消耗
    let mut greeting = [0u8; 11];
    conn.stream_mut().read_exact(&mut greeting).await.unwrap();
    assert_eq!(&greeting, b"220 ready\r\n");
}

/// 等待可写时不需要后端先发送数据
#[tokio::test]
async fn test_connect_writable_silent_backend() {
    let backend = TestBackend::silent().await;
    let establisher = ConnectionEstablisher::new(Readiness::Writable);

    let conn = timeout(
        Duration::from_secs(5),
        establisher.connect(backend.addr(), loopback_bind(), 5),
    )
    .await
    .expect("connect should not hang")
    .expect("connect should succeed");

    assert_eq!(conn.remote_addr(), backend.addr());
    assert!(!conn.proxy_header_sent());
}

/// 后端不发送数据且等待可读时，定时器触发后连接超时
#[tokio::test]
async fn test_connect_timeout_fires_event() {
    let backend = TestBackend::silent().await;
    let (events_tx, mut events_rx) = events::channel(4);
    let establisher = ConnectionEstablisher::new(Readiness::Readable).with_events(events_tx);
    let mut attempt = ConnectionAttempt::new(backend.addr(), loopback_bind(), 1);

    let err = establisher
        .run(&mut attempt)
        .await
        .expect_err("connect should time out");

    assert!(matches!(err, ConnError::ConnectTimeout { target, .. } if target == backend.addr()));
    assert_eq!(attempt.state(), ConnectState::TimedOut);
    assert!(attempt.timer_id().is_some());

    let event = timeout(Duration::from_secs(1), events_rx.recv())
        .await
        .expect("timeout event should be emitted")
        .unwrap();
    assert_eq!(event.name(), TIMEOUT_CONNECT_EVENT);
    match event {
        ConnectEvent::TimeoutConnect { target, elapsed } => {
            assert_eq!(target, backend.addr());
            assert!(elapsed >= Duration::from_secs(1));
        }
    }

    // 定时器不会再次触发
    assert!(timeout(Duration::from_millis(1500), events_rx.recv())
        .await
        .is_err());
}

/// 超时为 0 时不注册定时器，一直等待
#[tokio::test]
async fn test_zero_timeout_waits_without_timer() {
    let backend = TestBackend::silent().await;
    let establisher = ConnectionEstablisher::new(Readiness::Readable);
    let mut attempt = ConnectionAttempt::new(backend.addr(), loopback_bind(), 0);

    let waited = timeout(Duration::from_millis(1500), establisher.run(&mut attempt)).await;
    assert!(waited.is_err(), "connect without timeout should keep waiting");
    assert!(attempt.timer_id().is_none());
    assert!(attempt.deadline().is_none());
}

/// 超时为 0 时仍能正常连接
#[tokio::test]
async fn test_zero_timeout_connects() {
    let backend = TestBackend::greeting().await;
    let establisher = ConnectionEstablisher::new(Readiness::Readable);
    let mut attempt = ConnectionAttempt::new(backend.addr(), loopback_bind(), 0);

    establisher.run(&mut attempt).await.unwrap();
    assert_eq!(attempt.state(), ConnectState::Connected);
    assert!(attempt.timer_id().is_none());
}

/// 端口未监听时报告连接被拒绝
#[tokio::test]
async fn test_connect_refused() {
    let addr = closed_port_addr().await;

    for readiness in [Readiness::Readable, Readiness::Writable] {
        let establisher = ConnectionEstablisher::new(readiness);
        let mut attempt = ConnectionAttempt::new(addr, loopback_bind(), 5);

        let err = establisher.run(&mut attempt).await.unwrap_err();
        assert_eq!(err.kind(), "connect_refused", "{:?}: {}", readiness, err);
        assert_eq!(attempt.state(), ConnectState::Failed);
    }
}

/// 绑定非本机地址失败
#[tokio::test]
async fn test_bind_failure() {
    let backend = TestBackend::greeting().await;
    let bind: SocketAddr = "192.0.2.1:0".parse().unwrap();
    let establisher = ConnectionEstablisher::new(Readiness::Readable);
    let mut attempt = ConnectionAttempt::new(backend.addr(), bind, 5);

    let err = establisher.run(&mut attempt).await.unwrap_err();
    match err {
        ConnError::BindFailure { bind_addr, .. } => assert_eq!(bind_addr, bind),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(attempt.state(), ConnectState::Failed);
    assert!(attempt.timer_id().is_none());
}
