//! PROXY protocol 头部生成与发送
//!
//! 在向后端发送任何应用层数据之前，先告知后端原始客户端的地址。
//!
//! v1（文本）:
//! `PROXY <TCP4|TCP6|UNKNOWN> <源IP> <目的IP> <源端口> <目的端口>\r\n`
//!
//! v2（二进制）:
//! - 12 字节签名
//! - 1 字节版本与命令
//! - 1 字节地址族与传输协议
//! - 2 字节地址块长度（大端）
//! - 地址块：源地址、目的地址、源端口、目的端口

use crate::error::ConnError;
use crate::handle::ConnectionHandle;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::{self, IoSlice};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, trace};

/// v2 签名
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// 签名 + 版本命令 + 地址族 + 长度
pub const V2_HEADER_LEN: usize = 16;

/// 版本 2，PROXY 命令
const V2_VERSION_COMMAND_PROXY: u8 = 0x20 | 0x01;

const V2_TRANSPORT_STREAM: u8 = 0x01;
const V2_FAMILY_INET: u8 = 0x10;
const V2_FAMILY_INET6: u8 = 0x20;

/// 4 + 4 + 2 + 2
const V2_ADDR_LEN_INET: u16 = 12;
/// 16 + 16 + 2 + 2
const V2_ADDR_LEN_INET6: u16 = 36;

/// 前端会话的端点快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEndpoints {
    /// 原始客户端地址
    pub client: SocketAddr,
    /// 客户端连接到的本地地址
    pub local: SocketAddr,
}

impl SessionEndpoints {
    pub fn new(client: SocketAddr, local: SocketAddr) -> Self {
        Self { client, local }
    }
}

/// 配置的 PROXY 协议模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyProtocolMode {
    #[default]
    None,
    V1,
    V2,
}

impl ProxyProtocolMode {
    pub fn is_enabled(self) -> bool {
        self != ProxyProtocolMode::None
    }
}

impl std::str::FromStr for ProxyProtocolMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(ProxyProtocolMode::None),
            "v1" | "1" => Ok(ProxyProtocolMode::V1),
            "v2" | "2" => Ok(ProxyProtocolMode::V2),
            other => Err(format!("未知的 PROXY 协议版本: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFamily {
    Tcp4,
    Tcp6,
    Unknown,
}

impl fmt::Display for TransportFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self {
            TransportFamily::Tcp4 => "TCP4",
            TransportFamily::Tcp6 => "TCP6",
            TransportFamily::Unknown => "UNKNOWN",
        };
        f.write_str(proto)
    }
}

/// 每个连接新建的 PROXY 协议头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: ProxyVersion,
    pub family: TransportFamily,
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl ProxyHeader {
    /// v1 头
    ///
    /// 两端都是 IPv4 时为 TCP4，否则为 TCP6，IPv4 一端提升为映射地址。
    /// 前端两端都是 IPv6 而后端解析为 IPv4 时使用 UNKNOWN，地址仍按 TCP6 写出，
    /// 由后端决定如何处理。
    pub fn v1(endpoints: &SessionEndpoints, backend: SocketAddr) -> Self {
        let (family, source, destination) = select_family(endpoints);
        let family = if endpoints.client.is_ipv6()
            && endpoints.local.is_ipv6()
            && backend.is_ipv4()
        {
            trace!(
                "客户端地址 {} 与本地地址 {} 都是 IPv6，但后端 {} 是 IPv4，使用 UNKNOWN",
                endpoints.client.ip(),
                endpoints.local.ip(),
                backend.ip()
            );
            TransportFamily::Unknown
        } else {
            family
        };

        Self {
            version: ProxyVersion::V1,
            family,
            source,
            destination,
        }
    }

    /// v2 头，地址族选择与 v1 相同（v2 不使用 UNKNOWN）
    pub fn v2(endpoints: &SessionEndpoints) -> Self {
        let (family, source, destination) = select_family(endpoints);
        Self {
            version: ProxyVersion::V2,
            family,
            source,
            destination,
        }
    }

    /// 编码后的完整头部
    pub fn encode(&self) -> Bytes {
        match self.version {
            ProxyVersion::V1 => Bytes::from(self.v1_line()),
            ProxyVersion::V2 => {
                let parts = self.v2_parts();
                let mut buf = BytesMut::with_capacity(parts.len());
                for part in parts.slices() {
                    buf.put_slice(part);
                }
                buf.freeze()
            }
        }
    }

    /// 编码后的长度
    pub fn encoded_len(&self) -> usize {
        match self.version {
            ProxyVersion::V1 => self.v1_line().len(),
            ProxyVersion::V2 => self.v2_parts().len(),
        }
    }

    fn v1_line(&self) -> String {
        format!(
            "PROXY {} {} {} {} {}\r\n",
            self.family,
            self.source.ip(),
            self.destination.ip(),
            self.source.port(),
            self.destination.port()
        )
    }

    fn v2_parts(&self) -> V2Parts {
        let (family, length, source, destination) = match (self.source.ip(), self.destination.ip())
        {
            (IpAddr::V4(src), IpAddr::V4(dst)) => (
                V2_FAMILY_INET,
                V2_ADDR_LEN_INET,
                src.octets().to_vec(),
                dst.octets().to_vec(),
            ),
            (src, dst) => (
                V2_FAMILY_INET6,
                V2_ADDR_LEN_INET6,
                to_v6(src).octets().to_vec(),
                to_v6(dst).octets().to_vec(),
            ),
        };

        V2Parts {
            version_command: [V2_VERSION_COMMAND_PROXY],
            family: [family | V2_TRANSPORT_STREAM],
            length: length.to_be_bytes(),
            source,
            destination,
            source_port: self.source.port().to_be_bytes(),
            destination_port: self.destination.port().to_be_bytes(),
        }
    }
}

/// v2 头的各个字段，按线上顺序排列
struct V2Parts {
    version_command: [u8; 1],
    family: [u8; 1],
    length: [u8; 2],
    source: Vec<u8>,
    destination: Vec<u8>,
    source_port: [u8; 2],
    destination_port: [u8; 2],
}

impl V2Parts {
    fn slices(&self) -> [&[u8]; 8] {
        [
            &V2_SIGNATURE[..],
            &self.version_command[..],
            &self.family[..],
            &self.length[..],
            &self.source[..],
            &self.destination[..],
            &self.source_port[..],
            &self.destination_port[..],
        ]
    }

    fn len(&self) -> usize {
        self.slices().iter().map(|s| s.len()).sum()
    }
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn select_family(endpoints: &SessionEndpoints) -> (TransportFamily, SocketAddr, SocketAddr) {
    match (endpoints.client, endpoints.local) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) => {
            (TransportFamily::Tcp4, endpoints.client, endpoints.local)
        }
        (client, local) => (
            TransportFamily::Tcp6,
            SocketAddr::new(IpAddr::V6(to_v6(client.ip())), client.port()),
            SocketAddr::new(IpAddr::V6(to_v6(local.ip())), local.port()),
        ),
    }
}

/// 发送 PROXY 协议 v1 头，返回写入的字节数
pub async fn send_v1(
    conn: &mut ConnectionHandle,
    endpoints: &SessionEndpoints,
) -> Result<usize, ConnError> {
    let header = ProxyHeader::v1(endpoints, conn.remote_addr());
    let line = header.v1_line();

    debug!(
        "向后端发送 PROXY 协议 V1 消息: '{}'",
        line.trim_end()
    );

    write_header(conn, &[IoSlice::new(line.as_bytes())]).await
}

/// 发送 PROXY 协议 v2 头，返回写入的字节数
pub async fn send_v2(
    conn: &mut ConnectionHandle,
    endpoints: &SessionEndpoints,
) -> Result<usize, ConnError> {
    let header = ProxyHeader::v2(endpoints);
    let parts = header.v2_parts();

    debug!(
        "向后端发送 PROXY 协议 V2 消息: {} {} -> {}",
        header.family, header.source, header.destination
    );

    let slices = parts.slices().map(IoSlice::new);
    write_header(conn, &slices).await
}

/// 按配置的模式发送头部，未启用时不写入
pub async fn send_header(
    conn: &mut ConnectionHandle,
    endpoints: &SessionEndpoints,
    mode: ProxyProtocolMode,
) -> Result<usize, ConnError> {
    match mode {
        ProxyProtocolMode::None => Ok(0),
        ProxyProtocolMode::V1 => send_v1(conn, endpoints).await,
        ProxyProtocolMode::V2 => send_v2(conn, endpoints).await,
    }
}

/// 单次向量写入整个头部
///
/// 短写视为失败，不续写残留部分
async fn write_header(
    conn: &mut ConnectionHandle,
    slices: &[IoSlice<'_>],
) -> Result<usize, ConnError> {
    let target = conn.remote_addr();
    let local = conn.local_addr();
    if conn.proxy_header_sent() {
        error!("已从 {} 向 {} 发送过 PROXY 协议头", local, target);
        return Err(ConnError::ProxyHeaderAlreadySent { target });
    }

    let expected: usize = slices.iter().map(|s| s.len()).sum();

    let written = match write_once(conn.stream_mut(), slices).await {
        Ok(n) => n,
        Err(e) => {
            error!("从 {} 向 {} 写入 PROXY 协议头失败: {}", local, target, e);
            return Err(ConnError::ProtocolWriteFailure { target, source: e });
        }
    };

    // 无论是否完整写出，这个连接上都不能再发送头部
    conn.mark_proxy_header_sent();

    if written != expected {
        error!(
            "从 {} 向 {} 写入 PROXY 协议头不完整: {}/{} 字节",
            local, target, written, expected
        );
    }
    check_complete(target, written, expected)
}

/// 仅在被中断时重试
async fn write_once<W>(stream: &mut W, slices: &[IoSlice<'_>]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match stream.write_vectored(slices).await {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                trace!("写入 PROXY 协议头被中断，重试");
                continue;
            }
            result => return result,
        }
    }
}

fn check_complete(target: SocketAddr, written: usize, expected: usize) -> Result<usize, ConnError> {
    if written == expected {
        return Ok(written);
    }
    Err(ConnError::ProtocolWriteFailure {
        target,
        source: io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {} of {} bytes", written, expected),
        ),
    })
}
