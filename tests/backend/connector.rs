use crate::common::{closed_port_addr, TestBackend};
use ftp_proxy::proxy_protocol::{self, V2_SIGNATURE};
use ftp_proxy::target::Scheme;
use ftp_proxy::{
    BackendConnector, BackendTarget, ConnError, ConnectOptions, ProxyProtocolMode,
    SessionEndpoints,
};
use std::net::{IpAddr, SocketAddr};
use tokio::time::Duration;

fn endpoints() -> SessionEndpoints {
    SessionEndpoints::new(
        "203.0.113.5:51000".parse().unwrap(),
        "203.0.113.1:21".parse().unwrap(),
    )
}

fn options(mode: ProxyProtocolMode) -> ConnectOptions {
    ConnectOptions {
        connect_timeout: 5,
        proxy_protocol: mode,
        // 会话地址是文档地址，连接测试后端时从回环地址出发
        source_addr: Some("127.0.0.1".parse().unwrap()),
    }
}

fn target_for(addr: SocketAddr) -> BackendTarget {
    BackendTarget::new(Scheme::Ftp, "127.0.0.1", addr.port(), vec![addr.ip()]).unwrap()
}

/// 配置 v1 时先发送文本头
#[tokio::test]
async fn test_connector_sends_v1_header() {
    let mut backend = TestBackend::silent().await;
    let connector = BackendConnector::new(options(ProxyProtocolMode::V1));
    let target = target_for(backend.addr());

    let conn = connector.connect(&target, &endpoints()).await.unwrap();
    assert!(conn.proxy_header_sent());

    let expected = b"PROXY TCP4 203.0.113.5 203.0.113.1 51000 21\r\n";
    assert_eq!(backend.read_exact(expected.len()).await, expected);
}

/// 配置 v2 时发送 28 字节的二进制头
#[tokio::test]
async fn test_connector_sends_v2_header() {
    let mut backend = TestBackend::silent().await;
    let connector = BackendConnector::new(options(ProxyProtocolMode::V2));
    let target = target_for(backend.addr());

    let _conn = connector.connect(&target, &endpoints()).await.unwrap();

    let header = backend.read_exact(28).await;
    assert_eq!(&header[..12], &V2_SIGNATURE);
    assert_eq!(header[12], 0x21);
    assert_eq!(header[13], 0x11);
    assert_eq!(&header[14..16], &[0x00, 0x0C]);
    assert_eq!(&header[16..20], &[203, 0, 113, 5]);
    assert_eq!(&header[20..24], &[203, 0, 113, 1]);
}

/// 同一连接第二次发送头部被拒绝，后端只收到一个头
#[tokio::test]
async fn test_second_header_rejected() {
    let mut backend = TestBackend::silent().await;
    let connector = BackendConnector::new(options(ProxyProtocolMode::V1));
    let target = target_for(backend.addr());
    let ep = endpoints();

    let mut conn = connector.connect(&target, &ep).await.unwrap();

    let err = proxy_protocol::send_v1(&mut conn, &ep).await.unwrap_err();
    assert!(matches!(err, ConnError::ProxyHeaderAlreadySent { .. }));
    let err = proxy_protocol::send_v2(&mut conn, &ep).await.unwrap_err();
    assert_eq!(err.kind(), "proxy_header_already_sent");

    let first = b"PROXY TCP4 203.0.113.5 203.0.113.1 51000 21\r\n";
    assert_eq!(backend.read_exact(first.len()).await, first);
    backend.assert_idle(Duration::from_millis(200)).await;
}

/// 未启用 PROXY 协议时不写入任何数据
#[tokio::test]
async fn test_connector_without_proxy_protocol() {
    let mut backend = TestBackend::greeting().await;
    let connector = BackendConnector::new(options(ProxyProtocolMode::None));
    let target = target_for(backend.addr());

    let conn = connector.connect(&target, &endpoints()).await.unwrap();
    assert!(!conn.proxy_header_sent());
    backend.assert_idle(Duration::from_millis(200)).await;
}

/// 调用方可以指定备用地址连接
#[tokio::test]
async fn test_connect_alternate_address() {
    let backend = TestBackend::silent().await;
    let connector = BackendConnector::new(options(ProxyProtocolMode::V2));

    // 主地址不可用，直接连接备用地址
    let target = BackendTarget::new(
        Scheme::Ftp,
        "backend.test",
        backend.addr().port(),
        vec![IpAddr::from([127, 0, 0, 2]), backend.addr().ip()],
    )
    .unwrap();

    let addrs: Vec<SocketAddr> = target.all_addrs().collect();
    assert_eq!(addrs.len(), 2);
    assert_eq!(target.alternate_addrs(), &[backend.addr()]);

    let conn = connector
        .connect_addr(&target, target.alternate_addrs()[0], &endpoints())
        .await
        .unwrap();
    assert_eq!(conn.remote_addr(), backend.addr());
}

/// 连接失败不会影响前端，错误带有目标地址
#[tokio::test]
async fn test_connector_refused() {
    let addr = closed_port_addr().await;
    let connector = BackendConnector::new(options(ProxyProtocolMode::V1));
    let target = target_for(addr);

    let err = connector.connect(&target, &endpoints()).await.unwrap_err();
    match err {
        ConnError::ConnectRefused { target, .. } => assert_eq!(target, addr),
        other => panic!("unexpected error: {}", other),
    }
}
