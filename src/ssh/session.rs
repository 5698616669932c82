// SSH 会话
// 认证完成后的连接对象，为转发监听打开 direct-tcpip 通道

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use russh::client::Handle;
use tokio::time::timeout;
use tracing::{debug, info};

use super::config::SshConfig;
use super::error::TunnelError;
use super::handler::SshClientHandler;
use super::transport::{BoxedStream, ChannelOpener, TunnelLink};
use crate::constants::timeouts;

/// SSH 会话（连接成功后）
pub struct SshSession {
    handle: Handle<SshClientHandler>,
    /// `user@host:port`，用于日志
    label: String,
    closed: AtomicBool,
}

impl SshSession {
    pub fn new(handle: Handle<SshClientHandler>, config: &SshConfig) -> Self {
        Self {
            handle,
            label: format!("{}@{}:{}", config.username, config.host, config.port),
            closed: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn ensure_open(&self) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Network(format!(
                "SSH connection to {} is closed",
                self.label
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelOpener for SshSession {
    async fn open_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, TunnelError> {
        self.ensure_open()?;

        let channel = self
            .handle
            .channel_open_direct_tcpip(
                remote_host,
                u32::from(remote_port),
                originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await?;

        debug!(
            "[SSH] direct-tcpip {} -> {}:{} via {}",
            originator, remote_host, remote_port, self.label
        );
        Ok(Box::new(Box::pin(channel.into_stream())))
    }
}

#[async_trait]
impl TunnelLink for SshSession {
    /// 打开并关闭一个 session 通道，验证连接仍在往返
    async fn probe(&self) -> Result<(), TunnelError> {
        self.ensure_open()?;
        let channel = self.handle.channel_open_session().await?;
        channel.close().await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.handle.is_closed() {
            return;
        }

        let disconnect = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "English");
        match timeout(timeouts::TRANSPORT_CLOSE, disconnect).await {
            Ok(Ok(())) => info!("[SSH] Disconnected from {}", self.label),
            Ok(Err(e)) => debug!("[SSH] Disconnect from {} failed: {}", self.label, e),
            Err(_) => debug!("[SSH] Disconnect from {} timed out", self.label),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }
}
