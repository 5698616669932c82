// SSH 连接配置

use std::time::Duration;

use crate::models::{ConnectionSettings, Endpoint, ProxySettings};

/// SSH 连接配置
#[derive(Clone, Debug)]
pub struct SshConfig {
    /// 目标主机
    pub host: String,
    /// 端口
    pub port: u16,
    /// 用户名
    pub username: String,
    /// 连接超时（TCP + 握手 + 认证，各阶段分别计时）
    pub connect_timeout: Duration,
    /// 代理配置
    pub proxy: Option<ProxySettings>,
    /// 心跳配置
    pub keepalive: KeepaliveConfig,
}

/// 心跳配置
#[derive(Clone, Debug)]
pub struct KeepaliveConfig {
    /// 是否启用心跳
    pub enabled: bool,
    /// 心跳间隔
    pub interval: Duration,
    /// 最大未响应次数
    pub max_retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

impl SshConfig {
    pub fn new(endpoint: &Endpoint, settings: &ConnectionSettings) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            username: endpoint.user.clone(),
            connect_timeout: settings.connect_timeout(),
            proxy: settings.proxy.clone(),
            keepalive: KeepaliveConfig {
                enabled: settings.keepalive_interval_secs > 0,
                interval: Duration::from_secs(u64::from(settings.keepalive_interval_secs)),
                max_retries: settings.keepalive_max,
            },
        }
    }

    /// 构建 russh 配置
    pub fn to_russh_config(&self) -> russh::client::Config {
        let mut config = russh::client::Config::default();
        // 没有心跳时用不活动超时兜底；有心跳时由 keepalive_max 判定断线
        if self.keepalive.enabled {
            config.inactivity_timeout = None;
            config.keepalive_interval = Some(self.keepalive.interval);
            config.keepalive_max = self.keepalive.max_retries as usize;
        } else {
            config.inactivity_timeout = Some(self.connect_timeout);
        }
        config
    }
}
