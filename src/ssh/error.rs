// 隧道错误类型定义

use thiserror::Error;

use super::event::SessionState;
use crate::services::VaultError;

/// 错误分类（用于状态流上报）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Authentication,
    Credential,
    IdentityMismatch,
    Resource,
    Config,
    Busy,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::Credential => "credential",
            Self::IdentityMismatch => "identity-mismatch",
            Self::Resource => "resource",
            Self::Config => "config",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
        }
    }
}

/// 隧道错误类型
#[derive(Clone, Debug, Error)]
pub enum TunnelError {
    /// 网络错误（DNS、连接拒绝、超时），健康监控可重试
    #[error("Network error: {0}")]
    Network(String),

    /// 远端拒绝凭据，不会自动重试
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// 凭据解密或解析失败
    #[error("Credential error: {0}")]
    Credential(String),

    /// 主机身份发生变化且未被确认
    #[error("Host identity changed for {host_key}: expected {expected}, got {actual}")]
    IdentityMismatch {
        host_key: String,
        expected: String,
        actual: String,
    },

    /// 本地资源错误（端口绑定等）
    #[error("Local resource error: {0}")]
    Resource(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 已有会话在运行
    #[error("A session is already {0}")]
    Busy(SessionState),

    /// 操作被取消
    #[error("Operation cancelled")]
    Cancelled,
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Credential(_) => ErrorKind::Credential,
            Self::IdentityMismatch { .. } => ErrorKind::IdentityMismatch,
            Self::Resource(_) => ErrorKind::Resource,
            Self::Config(_) => ErrorKind::Config,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// 只有网络错误会进入退避重连
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// 超时统一归类为网络错误
    pub fn timeout(what: &str, after: std::time::Duration) -> Self {
        Self::Network(format!("{} timed out after {}ms", what, after.as_millis()))
    }
}

impl From<russh::Error> for TunnelError {
    fn from(e: russh::Error) -> Self {
        TunnelError::Network(e.to_string())
    }
}

impl From<russh::keys::Error> for TunnelError {
    fn from(e: russh::keys::Error) -> Self {
        TunnelError::Credential(e.to_string())
    }
}

impl From<VaultError> for TunnelError {
    fn from(e: VaultError) -> Self {
        TunnelError::Credential(e.to_string())
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(e: std::io::Error) -> Self {
        TunnelError::Network(e.to_string())
    }
}
