// 全局常量

/// SSH 默认端口
pub const DEFAULT_SSH_PORT: u16 = 22;

/// 本地转发只绑定回环地址
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// 退避倍数下限（不含）
pub const MIN_BACKOFF_MULTIPLIER: f64 = 1.0;

/// 配置目录名
pub const APP_DIR_NAME: &str = "shellmaster-tunnel";

pub mod files {
    pub const SETTINGS: &str = "settings.json";
    pub const CREDENTIALS: &str = "credentials.json";
    pub const KNOWN_HOSTS: &str = "known_hosts";
    pub const KEYS_DIR: &str = "keys";
}

pub mod timeouts {
    use std::time::Duration;

    /// 停止转发时等待中继任务退出的上限
    pub const FORWARD_STOP_GRACE: Duration = Duration::from_secs(2);
    /// 等待健康监控任务退出的上限
    pub const MONITOR_STOP_GRACE: Duration = Duration::from_secs(2);
    /// 凭据解密（平台密钥库调用）上限
    pub const CREDENTIAL_DECRYPT: Duration = Duration::from_secs(10);
    /// 为单个本地连接打开转发通道的上限
    pub const CHANNEL_OPEN: Duration = Duration::from_secs(15);
    /// 本地 accept 出错后的退让时间
    pub const ACCEPT_RETRY: Duration = Duration::from_millis(100);
    /// 关闭 SSH 连接时发送 disconnect 的上限
    pub const TRANSPORT_CLOSE: Duration = Duration::from_secs(3);
}
