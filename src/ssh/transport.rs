// 传输层抽象
//
// 控制器、转发监听和健康监控只依赖这里的 trait，
// 真实实现是基于 russh 的 SshConnector / SshSession。

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::Zeroizing;

use super::config::SshConfig;
use super::error::TunnelError;
use super::verifier::HostKeyVerifier;

/// 转发通道上的双向字节流
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelStream for T {}

pub type BoxedStream = Box<dyn ChannelStream>;

/// 在已认证的连接上打开转发通道
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, TunnelError>;
}

/// 一条已认证的隧道连接
#[async_trait]
pub trait TunnelLink: ChannelOpener {
    /// 存活探测，调用方负责施加超时
    async fn probe(&self) -> Result<(), TunnelError>;

    /// 关闭连接，可重复调用
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// 建立连接所需的全部输入
pub struct ConnectRequest {
    pub config: SshConfig,
    /// 解密后的私钥文本，用完即清零
    pub private_key: Zeroizing<String>,
    pub verifier: HostKeyVerifier,
}

/// 建立连接：TCP + 握手（含主机身份校验）+ 认证
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn TunnelLink>, TunnelError>;
}
