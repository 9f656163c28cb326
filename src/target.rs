use crate::error::ConnError;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{compiler_fence, Ordering};
use tokio::net::lookup_host;
use tracing::{debug, error, trace};
use url::{Host, Url};

/// 后端协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ftp,
    Ftps,
    Sftp,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Ftp => "ftp",
            Scheme::Ftps => "ftps",
            Scheme::Sftp => "sftp",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Ftp | Scheme::Ftps => 21,
            Scheme::Sftp => 22,
        }
    }

    /// ftps 必须使用 TLS，sftp 是 SSH 不能使用 TLS
    pub fn tls_policy(&self) -> TlsPolicy {
        match self {
            Scheme::Ftp => TlsPolicy::Auto,
            Scheme::Ftps => TlsPolicy::On,
            Scheme::Sftp => TlsPolicy::Off,
        }
    }
}

impl FromStr for Scheme {
    type Err = ConnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ftp" => Ok(Scheme::Ftp),
            "ftps" => Ok(Scheme::Ftps),
            "sftp" => Ok(Scheme::Sftp),
            other => Err(ConnError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    Auto,
    On,
    Off,
}

/// 凭据缓冲区
///
/// 清除时先逐字节覆写为零再释放，丢弃时同样会清除
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().into_bytes())
    }

    pub fn expose(&self) -> &str {
        // 只能由 String 构造，内容始终是合法 UTF-8
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        for byte in self.0.iter_mut() {
            // SAFETY: `byte` 是指向 Vec 内已初始化元素的有效可变引用
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
        compiler_fence(Ordering::SeqCst);
        self.0.clear();
    }

    #[cfg(test)]
    fn raw(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// 已解析的后端目标
pub struct BackendTarget {
    uri: String,
    scheme: Scheme,
    host: String,
    port: u16,
    hostport: String,
    addr: SocketAddr,
    addrs: Vec<SocketAddr>,
    tls: TlsPolicy,
    username: Option<Secret>,
    password: Option<Secret>,
}

impl BackendTarget {
    /// 由已解析的地址创建目标，第一个地址为主地址，其余用于故障切换
    pub fn new(
        scheme: Scheme,
        host: impl Into<String>,
        port: u16,
        addrs: Vec<IpAddr>,
    ) -> Result<Self, ConnError> {
        let host = host.into();
        if host.is_empty() {
            return Err(ConnError::InvalidInput("empty host".to_string()));
        }

        let mut addrs = addrs.into_iter().map(|ip| SocketAddr::new(ip, port));
        let addr = addrs.next().ok_or_else(|| ConnError::ResolutionFailure {
            host: host.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        })?;

        let hostport = format!("{}:{}", host, port);
        Ok(Self {
            uri: format!("{}://{}", scheme, hostport),
            scheme,
            host,
            port,
            hostport,
            addr,
            addrs: addrs.collect(),
            tls: scheme.tls_policy(),
            username: None,
            password: None,
        })
    }

    /// 解析 `scheme://[user[:pass]@]host[:port]` 并解析主机地址
    pub async fn from_uri(uri: &str) -> Result<Self, ConnError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(ConnError::InvalidInput("empty URI".to_string()));
        }

        // URI 可能带有凭据，错误和日志中不回显
        let url = Url::parse(uri)
            .map_err(|e| ConnError::InvalidInput(format!("unable to parse URI: {}", e)))?;

        let scheme: Scheme = url.scheme().parse().map_err(|e| {
            trace!("URI 协议 '{}' 不受支持", url.scheme());
            e
        })?;

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(ConnError::InvalidInput("URI 缺少主机名".to_string())),
        };
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        // 保存的 URI 不含凭据
        let mut sanitized = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(&host));
        if let Some(port) = url.port() {
            sanitized.push_str(&format!(":{}", port));
        }

        let username = (!url.username().is_empty()).then(|| Secret::new(url.username()));
        let password = url.password().map(Secret::new);
        // 解析结果的序列化缓冲区含有明文凭据，释放前覆写
        drop(Secret::new(String::from(url)));

        let resolved = lookup_host((host.clone(), port)).await;
        let addrs: Vec<IpAddr> = match resolved {
            Ok(resolved) => resolved.map(|addr| addr.ip()).collect(),
            Err(e) => {
                error!("无法解析后端主机 '{}': {}", host, e);
                return Err(ConnError::ResolutionFailure { host, source: e });
            }
        };

        let mut target = Self::new(scheme, host, port, addrs)?;
        target.uri = sanitized;
        target.username = username;
        target.password = password;

        debug!(
            "后端 {} 解析为 {}（另有 {} 个备用地址）",
            target.hostport,
            target.addr,
            target.addrs.len()
        );

        Ok(target)
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(Secret::new(username));
        self.password = Some(Secret::new(password));
        self
    }

    /// 去除凭据后的 URI
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn hostport(&self) -> &str {
        &self.hostport
    }

    /// 主地址
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 备用地址，按解析顺序排列
    pub fn alternate_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// 主地址在前的全部地址
    pub fn all_addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        std::iter::once(self.addr).chain(self.addrs.iter().copied())
    }

    pub fn tls(&self) -> TlsPolicy {
        self.tls
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_ref().map(Secret::expose)
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(Secret::expose)
    }

    /// 后端认证完成后清除用户名
    pub fn clear_username(&mut self) {
        if let Some(mut secret) = self.username.take() {
            secret.clear();
        }
    }

    /// 后端认证完成后清除密码
    pub fn clear_password(&mut self) {
        if let Some(mut secret) = self.password.take() {
            secret.clear();
        }
    }
}

impl fmt::Debug for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendTarget")
            .field("uri", &self.uri)
            .field("scheme", &self.scheme)
            .field("hostport", &self.hostport)
            .field("addr", &self.addr)
            .field("addrs", &self.addrs)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &self.password)
            .finish()
    }
}
