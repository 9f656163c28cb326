use ftp_proxy::config::Config;
use ftp_proxy::{BackendConnector, BackendTarget, ConnectionHandle, SessionEndpoints};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn std_main() -> Result<(), Box<dyn Error + Send + Sync>> {
    // 初始化日志
    tracing_subscriber::fmt::init();

    // 解析命令行参数
    let config = Config::from_args();

    // 解析后端地址
    let target = Arc::new(BackendTarget::from_uri(&config.backend).await?);
    let connector = Arc::new(BackendConnector::new(config.connect_options()));

    let addr = SocketAddr::new(config.ip, config.port);
    // 绑定监听端口
    let listener = TcpListener::bind(addr).await?;

    info!(
        "FTP代理服务器: {} -> {} (最大连接数: {}, PROXY协议: {:?})",
        addr,
        target.hostport(),
        config.max_connections,
        config.proxy_protocol
    );

    // 创建信号量来限制并发连接数
    let semaphore = Arc::new(Semaphore::new(config.max_connections));

    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                info!("接受新连接来自: {}", remote_addr);

                // 获取信号量许可
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("获取连接许可失败: {}", e);
                        continue;
                    }
                };

                let target = target.clone();
                let connector = connector.clone();
                tokio::spawn(async move {
                    handle_client(stream, remote_addr, &target, &connector).await;
                    // 释放许可
                    drop(permit);
                });
            }
            Err(e) => {
                error!("接受连接失败: {}", e);
            }
        }
    }
}

async fn handle_client(
    mut client: TcpStream,
    client_addr: SocketAddr,
    target: &BackendTarget,
    connector: &BackendConnector,
) {
    let local_addr = match client.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("[{}] 获取本地地址失败: {}", client_addr, e);
            return;
        }
    };
    let endpoints = SessionEndpoints::new(client_addr, local_addr);

    let Some(backend) = connect_any(target, connector, &endpoints).await else {
        error!("[{}] 无法连接到任何后端地址 {}", client_addr, target.hostport());
        return;
    };

    let mut backend = backend.into_stream();
    match copy_bidirectional(&mut client, &mut backend).await {
        Ok((up, down)) => {
            debug!(
                "[{}] 会话结束，上行 {} 字节，下行 {} 字节",
                client_addr, up, down
            );
        }
        Err(e) => {
            debug!("[{}] 转发结束: {}", client_addr, e);
        }
    }
}

/// 依次尝试主地址和备用地址
async fn connect_any(
    target: &BackendTarget,
    connector: &BackendConnector,
    endpoints: &SessionEndpoints,
) -> Option<ConnectionHandle> {
    for addr in target.all_addrs() {
        match connector.connect_addr(target, addr, endpoints).await {
            Ok(conn) => return Some(conn),
            Err(e) => {
                warn!("[{}] 连接后端 {} 失败 ({}): {}", endpoints.client, addr, e.kind(), e);
            }
        }
    }
    None
}

fn main() {
    if let Err(e) = std_main() {
        eprintln!("服务器启动失败: {}", e);
        std::process::exit(1);
    }
}
