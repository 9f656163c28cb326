use async_trait::async_trait;
use nix::unistd::gethostname;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::net::lookup_host;
use tracing::{debug, trace};

/// 本机非回环地址解析器
///
/// 回环修正时需要查找本机可路由的地址，测试中可替换实现
#[async_trait]
pub trait LocalAddrResolver: Send + Sync {
    async fn resolve_local_addr(&self) -> io::Result<IpAddr>;
}

/// 通过主机名解析本机地址
#[derive(Debug, Clone, Copy, Default)]
pub struct HostnameResolver;

#[async_trait]
impl LocalAddrResolver for HostnameResolver {
    async fn resolve_local_addr(&self) -> io::Result<IpAddr> {
        let hostname = gethostname()?;
        let hostname = hostname.to_string_lossy().into_owned();

        lookup_host((hostname.clone(), 0))
            .await?
            .map(|addr| addr.ip())
            .find(|ip| !is_loopback(*ip))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("主机名 {} 没有非回环地址", hostname),
                )
            })
    }
}

/// 绑定地址选择器
#[derive(Debug, Clone, Default)]
pub struct AddressSelector<R = HostnameResolver> {
    resolver: R,
}

impl AddressSelector<HostnameResolver> {
    pub fn new() -> Self {
        Self {
            resolver: HostnameResolver,
        }
    }
}

impl<R: LocalAddrResolver> AddressSelector<R> {
    pub fn with_resolver(resolver: R) -> Self {
        Self { resolver }
    }

    /// 选择连接后端时使用的本地绑定地址
    ///
    /// # 参数
    /// * `local_addr` - 前端会话的本地地址
    /// * `remote_addr` - 后端地址
    /// * `explicit_bind` - 配置中指定的源地址，优先于推导结果
    ///
    /// 若绑定地址是回环地址而后端不是，则改用本机可路由地址，
    /// 否则 connect 通常会以网络不可达失败。
    pub async fn select_bind_address(
        &self,
        local_addr: IpAddr,
        remote_addr: IpAddr,
        explicit_bind: Option<IpAddr>,
    ) -> IpAddr {
        let candidate = if same_family(local_addr, remote_addr) {
            local_addr
        } else {
            translate_family(local_addr).unwrap_or_else(|| {
                trace!(
                    "无法将本地地址 {} 转换为后端 {} 的地址族，保持不变",
                    local_addr,
                    remote_addr
                );
                local_addr
            })
        };

        let bind_addr = explicit_bind.unwrap_or(candidate);

        if !is_loopback(bind_addr) || is_loopback(remote_addr) {
            return bind_addr;
        }

        match self.resolver.resolve_local_addr().await {
            Ok(mut new_addr) => {
                if !same_family(new_addr, remote_addr) {
                    if let Some(translated) = translate_family(new_addr) {
                        new_addr = translated;
                    }
                }

                debug!(
                    "{} 是回环地址，无法到达 {}，改用 {}",
                    bind_addr, remote_addr, new_addr
                );
                new_addr
            }
            Err(e) => {
                debug!("解析本机地址失败，继续使用 {}: {}", bind_addr, e);
                bind_addr
            }
        }
    }
}

fn same_family(a: IpAddr, b: IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

/// IPv4 转为 IPv4 映射的 IPv6，IPv6 仅在是映射地址时投影回 IPv4
fn translate_family(addr: IpAddr) -> Option<IpAddr> {
    match addr {
        IpAddr::V4(v4) => Some(IpAddr::V6(v4_to_v6(v4))),
        IpAddr::V6(v6) => v6_to_v4(v6).map(IpAddr::V4),
    }
}

/// `a.b.c.d` -> `::ffff:a.b.c.d`
pub fn v4_to_v6(addr: Ipv4Addr) -> Ipv6Addr {
    addr.to_ipv6_mapped()
}

pub fn v6_to_v4(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    addr.to_ipv4_mapped()
}

/// 回环判断，IPv4 映射的回环地址同样视为回环
pub fn is_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6_to_v4(v6).is_some_and(|v4| v4.is_loopback()),
    }
}
