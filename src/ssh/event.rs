// 隧道会话事件与状态定义

use std::fmt;

use chrono::{DateTime, Local};
use tokio::sync::oneshot;

use super::error::{ErrorKind, TunnelError};
use crate::models::Endpoint;

/// 会话状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Stopping,
    Failed,
}

impl SessionState {
    /// 处于这些状态时拒绝新的 start 请求
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Active | Self::Reconnecting | Self::Stopping
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状态流中携带的错误信息
#[derive(Clone, Debug)]
pub struct StatusError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TunnelError> for StatusError {
    fn from(e: &TunnelError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// 会话状态快照（通过 watch 通道对外发布）
#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub state: SessionState,
    /// 进入当前状态的时间
    pub since: DateTime<Local>,
    pub endpoint: Option<Endpoint>,
    /// 重连尝试次数（仅 Reconnecting 时有值，从 1 开始）
    pub attempt: Option<u32>,
    pub last_error: Option<StatusError>,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            since: Local::now(),
            endpoint: None,
            attempt: None,
            last_error: None,
        }
    }
}

/// 连接阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionStage {
    /// 解密凭据
    LoadingCredential = 0,
    /// 连接代理（如果配置了代理）
    ConnectingProxy = 1,
    /// TCP 连接目标主机
    ConnectingHost = 2,
    /// SSH 握手（密钥交换 + 主机身份校验）
    Handshaking = 3,
    /// 身份认证
    Authenticating = 4,
    /// 启动本地转发监听
    StartingForward = 5,
    /// 隧道可用
    Ready = 6,
}

impl ConnectionStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::LoadingCredential => "Loading credential",
            Self::ConnectingProxy => "Connecting to proxy",
            Self::ConnectingHost => "Connecting to host",
            Self::Handshaking => "SSH handshake",
            Self::Authenticating => "Authenticating",
            Self::StartingForward => "Starting local forward",
            Self::Ready => "Tunnel ready",
        }
    }
}

/// 主机身份变化时的处理决定
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKeyAction {
    /// 接受新指纹并写入信任库
    Accept,
    /// 拒绝并中止连接
    Reject,
}

/// 主机身份变化确认请求
///
/// 控制器挂起握手，直到通过 `respond` 收到决定或等待超时（超时视为拒绝）。
#[derive(Debug)]
pub struct HostKeyPrompt {
    pub host: String,
    pub port: u16,
    /// 信任库中的主机键（`host` 或 `[host]:port`）
    pub host_key: String,
    pub expected_fingerprint: String,
    pub actual_fingerprint: String,
    pub respond: oneshot::Sender<HostKeyAction>,
}
