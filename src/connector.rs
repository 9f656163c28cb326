use crate::addr::{AddressSelector, HostnameResolver, LocalAddrResolver};
use crate::connect::{ConnectionEstablisher, Readiness};
use crate::error::ConnError;
use crate::events::EventSender;
use crate::handle::ConnectionHandle;
use crate::proxy_protocol::{self, ProxyProtocolMode, SessionEndpoints};
use crate::target::BackendTarget;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info};

/// 后端连接参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectOptions {
    /// 连接超时（秒），0 表示不限
    pub connect_timeout: u64,
    pub proxy_protocol: ProxyProtocolMode,
    /// 指定的源地址
    pub source_addr: Option<IpAddr>,
}

/// 后端连接器
///
/// 负责选择本地绑定地址、连接后端，并按配置发送 PROXY 协议头
#[derive(Debug, Clone)]
pub struct BackendConnector<R = HostnameResolver> {
    options: ConnectOptions,
    selector: AddressSelector<R>,
    establisher: ConnectionEstablisher,
}

impl BackendConnector<HostnameResolver> {
    pub fn new(options: ConnectOptions) -> Self {
        Self::with_selector(options, AddressSelector::new())
    }
}

impl<R: LocalAddrResolver> BackendConnector<R> {
    pub fn with_selector(options: ConnectOptions, selector: AddressSelector<R>) -> Self {
        // 需要先发送 PROXY 头时等待可写，而不是等后端先说话
        let readiness = if options.proxy_protocol.is_enabled() {
            Readiness::Writable
        } else {
            Readiness::Readable
        };

        Self {
            options,
            selector,
            establisher: ConnectionEstablisher::new(readiness),
        }
    }

    /// 订阅连接事件（如连接超时）
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.establisher = self.establisher.with_events(events);
        self
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// 连接到目标的主地址
    pub async fn connect(
        &self,
        target: &BackendTarget,
        endpoints: &SessionEndpoints,
    ) -> Result<ConnectionHandle, ConnError> {
        self.connect_addr(target, target.addr(), endpoints).await
    }

    /// 连接到目标的某个已解析地址
    ///
    /// 失败时不会自动尝试其他地址，由调用方决定
    pub async fn connect_addr(
        &self,
        target: &BackendTarget,
        remote_addr: SocketAddr,
        endpoints: &SessionEndpoints,
    ) -> Result<ConnectionHandle, ConnError> {
        let bind_ip = self
            .selector
            .select_bind_address(
                endpoints.local.ip(),
                remote_addr.ip(),
                self.options.source_addr,
            )
            .await;
        let bind_addr = SocketAddr::new(bind_ip, 0);

        debug!(
            "[{}] 连接后端 {} ({})，绑定 {}",
            endpoints.client,
            target.hostport(),
            remote_addr,
            bind_ip
        );

        let mut conn = self
            .establisher
            .connect(remote_addr, bind_addr, self.options.connect_timeout)
            .await?;

        let written =
            proxy_protocol::send_header(&mut conn, endpoints, self.options.proxy_protocol).await?;
        if written > 0 {
            debug!(
                "[{}] 已向 {} 发送 {} 字节 PROXY 协议头",
                endpoints.client, remote_addr, written
            );
        }

        info!(
            "[{}] 成功连接到后端 {} ({})",
            endpoints.client,
            target.hostport(),
            remote_addr
        );

        Ok(conn)
    }
}
