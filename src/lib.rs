// ShellMaster Tunnel
//
// 经 SSH direct-tcpip 通道把本地回环端口转发到远端固定目标，
// 附带主机身份信任库、私钥加密存储与自动重连。

pub mod constants;
pub mod models;
pub mod services;
pub mod ssh;

pub use models::{Endpoint, SessionRequest, TunnelSettings};
pub use ssh::{
    ControllerDeps, HostKeyAction, HostKeyPrompt, SessionState, SessionStatus, SshConnector,
    TunnelController, TunnelError,
};
