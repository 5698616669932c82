// 健康监控与退避重连
//
// 单个后台任务完成周期探测和重连循环，因此同一时间最多只有一个重连循环。
// Connected -> (探测失败) -> Reconnecting -> (成功) -> Connected
// Reconnecting -> (次数用尽或不可重试的错误) -> Failed
// 任意状态 -> Disconnected（stop）

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::TunnelError;
use crate::constants::timeouts;
use crate::models::{ReconnectPolicy, ReconnectSettings};

/// 监控状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    Connected,
    /// 第几次重连（从 1 开始）
    Reconnecting { attempt: u32 },
    Failed,
    Disconnected,
}

/// 健康快照，每次探测成功或重新连接后清零
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub consecutive_failures: u32,
    /// 最近一次成功的时间（Unix 毫秒），尚未成功过为 0
    pub last_success_timestamp: i64,
}

impl HealthSnapshot {
    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_success_timestamp = chrono::Local::now().timestamp_millis();
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

/// 被监控的一方提供的动作
#[async_trait]
pub trait HealthActions: Send + Sync {
    /// 存活探测
    async fn probe(&self) -> Result<(), TunnelError>;

    /// 重新建立连接，可重复调用
    async fn reconnect(&self) -> Result<(), TunnelError>;

    /// 状态变化通知（Reconnecting / Connected / Failed）
    async fn on_transition(&self, state: MonitorState, cause: Option<TunnelError>);
}

/// 监控参数
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub auto_reconnect: bool,
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub reconnect_timeout: Duration,
    pub policy: ReconnectPolicy,
}

impl MonitorConfig {
    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            auto_reconnect: settings.auto_reconnect_enabled,
            interval: settings.health_check_interval(),
            probe_timeout: settings.probe_timeout(),
            reconnect_timeout: settings.reconnect_timeout(),
            policy: settings.policy(),
        }
    }
}

struct Shared {
    config: MonitorConfig,
    actions: Arc<dyn HealthActions>,
    cancel: CancellationToken,
    loss: Notify,
    state: watch::Sender<MonitorState>,
    snapshot: Mutex<HealthSnapshot>,
}

impl Shared {
    fn snapshot_mut<R>(&self, f: impl FnOnce(&mut HealthSnapshot) -> R) -> R {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut snapshot)
    }

    async fn transition(&self, state: MonitorState, cause: Option<TunnelError>) {
        self.state.send_replace(state);
        self.actions.on_transition(state, cause).await;
    }
}

enum Recovery {
    Recovered,
    Exhausted(TunnelError),
    Cancelled,
}

/// 健康监控
pub struct HealthMonitor {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// 以 Connected 状态启动监控任务，需要在 tokio 运行时中调用
    pub fn start(config: MonitorConfig, actions: Arc<dyn HealthActions>) -> Self {
        let (state, _) = watch::channel(MonitorState::Connected);
        let mut snapshot = HealthSnapshot::default();
        snapshot.record_success();

        let shared = Arc::new(Shared {
            config,
            actions,
            cancel: CancellationToken::new(),
            loss: Notify::new(),
            state,
            snapshot: Mutex::new(snapshot),
        });

        let task = tokio::spawn(Self::run(shared.clone()));
        Self {
            shared,
            task: Some(task),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.shared.state.subscribe()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.shared.snapshot_mut(|s| *s)
    }

    /// 立即触发一次探测；重连期间忽略
    pub fn report_loss(&self) {
        if self.state() == MonitorState::Connected {
            self.shared.loss.notify_one();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// 取消探测和进行中的重连，等待任务退出
    pub async fn stop(&mut self) {
        self.shared.cancel.cancel();
        if let Some(mut task) = self.task.take() {
            if timeout(timeouts::MONITOR_STOP_GRACE, &mut task).await.is_err() {
                warn!("[Health] Monitor task did not exit in time, aborting");
                task.abort();
            }
        }
        self.shared.state.send_replace(MonitorState::Disconnected);
        debug!("[Health] Monitor stopped");
    }

    async fn run(shared: Arc<Shared>) {
        let config = shared.config.clone();
        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => return,
                _ = tokio::time::sleep(config.interval) => {}
                _ = shared.loss.notified() => debug!("[Health] Loss reported, probing now"),
            }

            let probed = tokio::select! {
                _ = shared.cancel.cancelled() => return,
                probed = timeout(config.probe_timeout, shared.actions.probe()) => probed,
            };
            let error = match probed {
                Ok(Ok(())) => {
                    shared.snapshot_mut(HealthSnapshot::record_success);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => TunnelError::timeout("Liveness probe", config.probe_timeout),
            };
            shared.snapshot_mut(HealthSnapshot::record_failure);
            warn!("[Health] Probe failed: {}", error);

            if !config.auto_reconnect {
                shared.transition(MonitorState::Failed, Some(error)).await;
                return;
            }

            match Self::recover(&shared, error).await {
                Recovery::Recovered => {
                    shared.snapshot_mut(HealthSnapshot::record_success);
                    info!("[Health] Connection restored");
                    shared.transition(MonitorState::Connected, None).await;
                }
                Recovery::Exhausted(error) => {
                    warn!("[Health] Giving up: {}", error);
                    shared.transition(MonitorState::Failed, Some(error)).await;
                    return;
                }
                Recovery::Cancelled => return,
            }
        }
    }

    /// 退避重连循环
    async fn recover(shared: &Shared, mut last_error: TunnelError) -> Recovery {
        let config = &shared.config;
        let policy = &config.policy;
        let mut attempt = 0u32;

        while policy.should_retry(attempt) {
            let delay = policy.delay_for_attempt(attempt);
            info!(
                "[Health] Reconnect attempt {}/{} in {}ms",
                attempt + 1,
                policy.max_attempts,
                delay.as_millis()
            );
            shared
                .transition(
                    MonitorState::Reconnecting {
                        attempt: attempt + 1,
                    },
                    Some(last_error.clone()),
                )
                .await;

            tokio::select! {
                _ = shared.cancel.cancelled() => return Recovery::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = shared.cancel.cancelled() => return Recovery::Cancelled,
                result = timeout(config.reconnect_timeout, shared.actions.reconnect()) => result,
            };

            match result {
                Ok(Ok(())) => return Recovery::Recovered,
                Ok(Err(e)) if !e.is_retryable() => return Recovery::Exhausted(e),
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = TunnelError::timeout("Reconnect", config.reconnect_timeout),
            }
            shared.snapshot_mut(HealthSnapshot::record_failure);
            warn!(
                "[Health] Reconnect attempt {} failed: {}",
                attempt + 1,
                last_error
            );
            attempt += 1;
        }

        Recovery::Exhausted(last_error)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
