use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// 后端连接错误
///
/// 所有错误都只属于本次连接尝试，是否换用其他地址重试由调用方决定
#[derive(Debug, Error)]
pub enum ConnError {
    /// 目标为空或格式错误
    #[error("invalid backend target: {0}")]
    InvalidInput(String),

    /// 不支持的协议（仅支持 ftp、ftps、sftp）
    #[error("unsupported protocol '{0}'")]
    UnsupportedScheme(String),

    /// 主机解析或端口设置失败
    #[error("unable to resolve '{host}': {source}")]
    ResolutionFailure {
        host: String,
        #[source]
        source: io::Error,
    },

    /// 创建或绑定本地套接字失败
    #[error("error creating connection from {bind_addr}: {source}")]
    BindFailure {
        bind_addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 连接超时
    #[error("timed out connecting to {target} from {bind_addr}")]
    ConnectTimeout {
        target: SocketAddr,
        bind_addr: SocketAddr,
    },

    /// 连接被拒绝
    #[error("connection to {target} from {bind_addr} refused: {source}")]
    ConnectRefused {
        target: SocketAddr,
        bind_addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 其他系统错误
    #[error("error connecting to {target} from {bind_addr}: {source}")]
    ConnectError {
        target: SocketAddr,
        bind_addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 原始连接成功后无法建立双向流
    #[error("unable to open control connection to {target}: {source}")]
    HandshakeOpenFailure {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 发送 PROXY 协议头失败
    #[error("error sending PROXY protocol header to {target}: {source}")]
    ProtocolWriteFailure {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 同一连接上重复发送 PROXY 协议头
    #[error("PROXY protocol header already sent to {target}")]
    ProxyHeaderAlreadySent { target: SocketAddr },
}

impl ConnError {
    /// 稳定的错误原因码，用于日志和统计
    pub fn kind(&self) -> &'static str {
        match self {
            ConnError::InvalidInput(_) => "invalid_input",
            ConnError::UnsupportedScheme(_) => "unsupported_scheme",
            ConnError::ResolutionFailure { .. } => "resolution_failure",
            ConnError::BindFailure { .. } => "bind_failure",
            ConnError::ConnectTimeout { .. } => "connect_timeout",
            ConnError::ConnectRefused { .. } => "connect_refused",
            ConnError::ConnectError { .. } => "connect_error",
            ConnError::HandshakeOpenFailure { .. } => "handshake_open_failure",
            ConnError::ProtocolWriteFailure { .. } => "protocol_write_failure",
            ConnError::ProxyHeaderAlreadySent { .. } => "proxy_header_already_sent",
        }
    }

    /// 将轮询/连接阶段的系统错误归类
    ///
    /// EOF 视为连接被拒绝，中断视为超时，其余原样上报
    pub(crate) fn from_connect_io(
        target: SocketAddr,
        bind_addr: SocketAddr,
        err: io::Error,
    ) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                ConnError::ConnectTimeout { target, bind_addr }
            }
            io::ErrorKind::UnexpectedEof => ConnError::ConnectRefused {
                target,
                bind_addr,
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            },
            io::ErrorKind::ConnectionRefused => ConnError::ConnectRefused {
                target,
                bind_addr,
                source: err,
            },
            _ => ConnError::ConnectError {
                target,
                bind_addr,
                source: err,
            },
        }
    }
}
