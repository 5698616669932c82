// 本地端口转发
//
// 在回环地址上监听，每个本地连接经隧道打开一个 direct-tcpip 通道，
// 双向转发直到任一端关闭。每对中继是独立任务，停止时统一取消。

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::error::TunnelError;
use super::transport::ChannelOpener;
use crate::constants::{timeouts, LOOPBACK_HOST};

/// 远端转发目标
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
}

/// 正在运行的转发监听
///
/// drop 时取消所有任务；需要确认端口已释放时调用 `stop`。
pub struct ForwardHandle {
    local_addr: SocketAddr,
    target: ForwardTarget,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// 启动转发监听，等到 accept 循环就绪后才返回
pub async fn start<O>(
    local_port: u16,
    target: ForwardTarget,
    opener: Arc<O>,
) -> Result<ForwardHandle, TunnelError>
where
    O: ChannelOpener + ?Sized + 'static,
{
    let listener = TcpListener::bind((LOOPBACK_HOST, local_port))
        .await
        .map_err(|e| {
            TunnelError::Resource(format!(
                "Failed to bind {}:{}: {}",
                LOOPBACK_HOST, local_port, e
            ))
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| TunnelError::Resource(format!("Failed to read local address: {}", e)))?;

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let (ready_tx, ready_rx) = oneshot::channel();

    tracker.spawn(accept_loop(
        listener,
        target.clone(),
        opener,
        cancel.clone(),
        tracker.clone(),
        ready_tx,
    ));

    if ready_rx.await.is_err() {
        cancel.cancel();
        return Err(TunnelError::Resource(
            "Forward listener exited before becoming ready".to_string(),
        ));
    }

    info!(
        "[Forward] Listening on {} -> {}:{}",
        local_addr, target.host, target.port
    );

    Ok(ForwardHandle {
        local_addr,
        target,
        cancel,
        tracker,
    })
}

impl ForwardHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }

    /// 当前中继数（不含 accept 任务）
    pub fn active_relays(&self) -> usize {
        self.tracker.len().saturating_sub(1)
    }

    /// 关闭监听和所有中继，等待任务退出（有上限）
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        if timeout(timeouts::FORWARD_STOP_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "[Forward] {} relay tasks still running after stop",
                self.tracker.len()
            );
        }
        debug!("[Forward] Stopped listener on {}", self.local_addr);
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop<O>(
    listener: TcpListener,
    target: ForwardTarget,
    opener: Arc<O>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    ready: oneshot::Sender<()>,
) where
    O: ChannelOpener + ?Sized + 'static,
{
    let _ = ready.send(());

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("[Forward] Accept failed: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(timeouts::ACCEPT_RETRY) => continue,
                }
            }
        };

        let _ = stream.set_nodelay(true);
        tracker.spawn(relay(
            stream,
            peer,
            target.clone(),
            opener.clone(),
            cancel.clone(),
        ));
    }

    // listener 在这里释放，端口随即可重新绑定
    drop(listener);
}

async fn relay<O>(
    mut local: TcpStream,
    peer: SocketAddr,
    target: ForwardTarget,
    opener: Arc<O>,
    cancel: CancellationToken,
) where
    O: ChannelOpener + ?Sized + 'static,
{
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = timeout(
            timeouts::CHANNEL_OPEN,
            opener.open_channel(&target.host, target.port, peer),
        ) => opened,
    };

    let mut remote = match opened {
        Ok(Ok(remote)) => remote,
        Ok(Err(e)) => {
            warn!(
                "[Forward] Failed to open channel for {} -> {}:{}: {}",
                peer, target.host, target.port, e
            );
            return;
        }
        Err(_) => {
            warn!(
                "[Forward] Opening channel for {} timed out after {}s",
                peer,
                timeouts::CHANNEL_OPEN.as_secs()
            );
            return;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => debug!("[Forward] Relay for {} cancelled", peer),
        result = copy_bidirectional(&mut local, &mut remote) => match result {
            Ok((up, down)) => debug!(
                "[Forward] Relay for {} closed ({} bytes up, {} bytes down)",
                peer, up, down
            ),
            Err(e) => debug!("[Forward] Relay for {} ended: {}", peer, e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::testing::{echo_roundtrip, spawn_echo_server, EchoOpener};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn target() -> ForwardTarget {
        ForwardTarget {
            host: "127.0.0.1".into(),
            port: 80,
        }
    }

    #[tokio::test]
    async fn relays_bytes_once_ready() {
        let echo = spawn_echo_server().await;
        let opener = Arc::new(EchoOpener::new(echo));
        let handle = start(0, target(), opener.clone()).await.unwrap();

        // start 返回时端口已在监听
        assert_eq!(
            echo_roundtrip(handle.local_addr(), b"ping").await,
            b"ping".to_vec()
        );
        assert_eq!(opener.opened.load(Ordering::SeqCst), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn relays_are_independent() {
        let echo = spawn_echo_server().await;
        let handle = start(0, target(), Arc::new(EchoOpener::new(echo)))
            .await
            .unwrap();

        // 一个连接保持空闲，不影响另一个
        let mut idle = TcpStream::connect(handle.local_addr()).await.unwrap();
        assert_eq!(
            echo_roundtrip(handle.local_addr(), b"second").await,
            b"second".to_vec()
        );
        idle.write_all(b"late").await.unwrap();
        let mut buf = [0u8; 4];
        idle.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late");
        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_relays_and_frees_port() {
        let echo = spawn_echo_server().await;
        let handle = start(0, target(), Arc::new(EchoOpener::new(echo)))
            .await
            .unwrap();
        let addr = handle.local_addr();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        client.read_exact(&mut one).await.unwrap();

        timeout(Duration::from_secs(5), handle.stop()).await.unwrap();
        assert_eq!(handle.active_relays(), 0);

        // 中继已关闭，本地连接读到 EOF
        let mut rest = Vec::new();
        let n = timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        // 端口可以重新绑定
        let rebound = start(addr.port(), target(), Arc::new(EchoOpener::new(echo)))
            .await
            .unwrap();
        assert_eq!(rebound.local_addr(), addr);
        rebound.stop().await;
    }

    #[tokio::test]
    async fn bind_conflict_is_resource_error() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let echo = spawn_echo_server().await;

        let err = start(port, target(), Arc::new(EchoOpener::new(echo)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Resource(_)));
    }
}
