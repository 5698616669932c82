// SSH 隧道模块
//
// 模块结构:
// - config: 连接配置 (SshConfig, KeepaliveConfig)
// - error: 错误类型 (TunnelError)
// - event: 会话状态与事件 (SessionState, SessionStatus, HostKeyPrompt)
// - identity: 主机身份编码 (KeyAlgorithm, HostIdentity)
// - verifier: 握手期间的主机身份校验 (HostKeyVerifier)
// - handler: russh Handler 实现
// - proxy: HTTP / SOCKS5 代理
// - client: SSH 客户端核心 (SshClient, SshConnector)
// - session: 认证后的 SSH 会话 (SshSession)
// - transport: 传输层 trait (TunnelConnector, TunnelLink, ChannelOpener)
// - forward: 本地端口转发
// - health: 健康监控与退避重连
// - controller: 隧道会话控制器

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod forward;
pub mod handler;
pub mod health;
pub mod identity;
pub mod proxy;
pub mod session;
pub mod transport;
pub mod verifier;

#[cfg(test)]
pub(crate) mod testing;

// 公开导出
pub use client::{SshClient, SshConnector};
pub use config::{KeepaliveConfig, SshConfig};
pub use controller::{ControllerDeps, TunnelController};
pub use error::{ErrorKind, TunnelError};
pub use event::{
    ConnectionStage, HostKeyAction, HostKeyPrompt, SessionState, SessionStatus, StatusError,
};
pub use forward::{ForwardHandle, ForwardTarget};
pub use health::{HealthActions, HealthMonitor, HealthSnapshot, MonitorConfig, MonitorState};
pub use identity::{EcdsaCurve, HostIdentity, KeyAlgorithm};
pub use session::SshSession;
pub use transport::{BoxedStream, ChannelOpener, ConnectRequest, TunnelConnector, TunnelLink};
pub use verifier::HostKeyVerifier;
