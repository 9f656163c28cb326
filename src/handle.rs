use std::net::SocketAddr;
use tokio::net::TcpStream;

/// 已建立的后端连接
///
/// 由调用方独占；丢弃即关闭底层描述符
#[derive(Debug)]
pub struct ConnectionHandle {
    stream: TcpStream,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    proxy_header_sent: bool,
}

impl ConnectionHandle {
    pub(crate) fn new(stream: TcpStream, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            stream,
            local_addr,
            remote_addr,
            proxy_header_sent: false,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn proxy_header_sent(&self) -> bool {
        self.proxy_header_sent
    }

    pub(crate) fn mark_proxy_header_sent(&mut self) {
        self.proxy_header_sent = true;
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}
