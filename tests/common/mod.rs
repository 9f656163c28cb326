use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

/// 测试用后端服务器
///
/// 接受连接后可选地先发送欢迎信息，然后把收到的数据转交给测试
#[allow(dead_code)]
pub struct TestBackend {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    _handle: JoinHandle<()>,
}

#[allow(dead_code)]
impl TestBackend {
    /// 像 FTP 服务器一样先发送 220
    pub async fn greeting() -> Self {
        Self::start(Some(b"220 ready\r\n")).await
    }

    /// 从不主动发送数据
    pub async fn silent() -> Self {
        Self::start(None).await
    }

    async fn start(greeting: Option<&'static [u8]>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test backend");
        let addr = listener.local_addr().unwrap();
        let (tx, received) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(greeting) = greeting {
                        if stream.write_all(greeting).await.is_err() {
                            return;
                        }
                    }
                    let mut buffer = [0u8; 4096];
                    loop {
                        match stream.read(&mut buffer).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if tx.send(buffer[..n].to_vec()).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        TestBackend {
            addr,
            received,
            pending: Vec::new(),
            _handle: handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 读取恰好 `len` 字节
    pub async fn read_exact(&mut self, len: usize) -> Vec<u8> {
        while self.pending.len() < len {
            let chunk = timeout(Duration::from_secs(5), self.received.recv())
                .await
                .expect("Timed out waiting for backend data")
                .expect("Backend channel closed");
            self.pending.extend_from_slice(&chunk);
        }
        self.pending.drain(..len).collect()
    }

    /// 在给定时间内没有更多数据到达
    pub async fn assert_idle(&mut self, wait: Duration) {
        assert!(self.pending.is_empty(), "unexpected data: {:?}", self.pending);
        if let Ok(Some(chunk)) = timeout(wait, self.received.recv()).await {
            panic!("unexpected data: {:?}", chunk);
        }
    }
}

/// 已经关闭的本地端口
#[allow(dead_code)]
pub async fn closed_port_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[allow(dead_code)]
pub fn loopback_bind() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}
