// Settings 配置数据结构

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{LOOPBACK_HOST, MIN_BACKOFF_MULTIPLIER};

// ======================== 主配置结构 ========================

/// 隧道设置（持久化用）
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunnelSettings {
    pub connection: ConnectionSettings,
    pub reconnect: ReconnectSettings,
    pub forward: ForwardSettings,
}

impl TunnelSettings {
    /// 校验所有配置项
    pub fn validate(&self) -> Result<(), String> {
        self.connection.validate()?;
        self.reconnect.validate()?;
        self.forward.validate()?;
        Ok(())
    }
}

// ======================== 连接设置 ========================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum ProxyType {
    #[default]
    Http,
    Socks5,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProxySettings {
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connection_timeout_secs: u32,
    pub keepalive_interval_secs: u32,
    pub keepalive_max: u32,
    /// 等待用户确认主机身份变化的最长时间
    pub host_key_confirm_timeout_secs: u32,
    pub proxy: Option<ProxySettings>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 30,
            keepalive_interval_secs: 60,
            keepalive_max: 3,
            host_key_confirm_timeout_secs: 120,
            proxy: None,
        }
    }
}

impl ConnectionSettings {
    fn validate(&self) -> Result<(), String> {
        if self.connection_timeout_secs == 0 {
            return Err("connection_timeout_secs must be greater than 0".to_string());
        }
        if let Some(proxy) = &self.proxy {
            if proxy.host.trim().is_empty() || proxy.port == 0 {
                return Err("proxy host and port must be set".to_string());
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs as u64)
    }

    pub fn host_key_confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.host_key_confirm_timeout_secs as u64)
    }
}

// ======================== 自动重连设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub auto_reconnect_enabled: bool,
    pub health_check_interval_ms: u64,
    /// 单次探测超时，必须小于检查间隔
    pub probe_timeout_ms: u64,
    /// 单次重连动作超时
    pub reconnect_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            auto_reconnect_enabled: true,
            health_check_interval_ms: 30_000,
            probe_timeout_ms: 10_000,
            reconnect_timeout_ms: 60_000,
            max_reconnect_attempts: 10,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectSettings {
    fn validate(&self) -> Result<(), String> {
        if self.health_check_interval_ms == 0 {
            return Err("health_check_interval_ms must be greater than 0".to_string());
        }
        if self.probe_timeout_ms == 0 || self.probe_timeout_ms >= self.health_check_interval_ms {
            return Err(format!(
                "probe_timeout_ms ({}) must be in (0, health_check_interval_ms = {})",
                self.probe_timeout_ms, self.health_check_interval_ms
            ));
        }
        if self.reconnect_timeout_ms == 0 {
            return Err("reconnect_timeout_ms must be greater than 0".to_string());
        }
        self.policy().validate()
    }

    /// 提取退避策略
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            multiplier: self.backoff_multiplier,
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }
}

/// 指数退避重连策略
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectSettings::default().policy()
    }
}

impl ReconnectPolicy {
    /// `0 < initial <= max` 且 `multiplier > 1.0`
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_backoff_ms == 0 || self.initial_backoff_ms > self.max_backoff_ms {
            return Err(format!(
                "backoff must satisfy 0 < initial ({}) <= max ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            ));
        }
        if !(self.multiplier > MIN_BACKOFF_MULTIPLIER) || !self.multiplier.is_finite() {
            return Err(format!(
                "backoff multiplier must be a finite value > {}, got {}",
                MIN_BACKOFF_MULTIPLIER, self.multiplier
            ));
        }
        Ok(())
    }

    /// 第 `attempt` 次（从 0 开始）重连前的等待时间
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff_ms as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = delay_ms.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// 是否还能继续尝试
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

// ======================== 端口转发设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForwardSettings {
    /// 本地监听端口（仅绑定回环地址），0 表示由系统分配
    pub local_port: u16,
    /// 远端转发目标（从远端主机视角可达）
    pub remote_host: String,
    pub remote_port: u16,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            local_port: 0,
            remote_host: LOOPBACK_HOST.to_string(),
            remote_port: 80,
        }
    }
}

impl ForwardSettings {
    fn validate(&self) -> Result<(), String> {
        if self.remote_host.trim().is_empty() {
            return Err("forward remote_host must not be empty".to_string());
        }
        if self.remote_port == 0 {
            return Err("forward remote_port must be non-zero".to_string());
        }
        Ok(())
    }
}
