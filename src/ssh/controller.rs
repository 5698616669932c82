// 隧道会话控制器
//
// 持有唯一的会话状态：解密凭据、建立 SSH 连接（含主机身份校验）、
// 启动本地转发，然后把连接交给健康监控。状态变化通过 watch 通道发布。
//
// 状态迁移都在会话锁内完成，监控回调与 start/stop 串行执行。

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::Local;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::config::SshConfig;
use super::error::TunnelError;
use super::event::{ConnectionStage, HostKeyPrompt, SessionState, SessionStatus, StatusError};
use super::forward::{self, ForwardHandle, ForwardTarget};
use super::health::{HealthActions, HealthMonitor, HealthSnapshot, MonitorConfig, MonitorState};
use super::transport::{ConnectRequest, TunnelConnector, TunnelLink};
use super::verifier::HostKeyVerifier;
use crate::constants::timeouts;
use crate::models::{Endpoint, SessionRequest, TunnelSettings};
use crate::services::{CredentialSource, KeyVault, KnownHostsStore};

/// 控制器依赖的外部组件
pub struct ControllerDeps {
    pub vault: Arc<KeyVault>,
    pub credentials: Arc<dyn CredentialSource>,
    pub known_hosts: Arc<KnownHostsStore>,
    pub connector: Arc<dyn TunnelConnector>,
    /// 主机身份变化时的确认通道；为 None 时一律拒绝
    pub host_key_prompts: Option<mpsc::Sender<HostKeyPrompt>>,
}

/// 当前会话占用的资源
#[derive(Default)]
struct Slot {
    request: Option<SessionRequest>,
    link: Option<Arc<dyn TunnelLink>>,
    forward: Option<ForwardHandle>,
    /// 实际绑定的本地端口，重连时沿用
    local_port: u16,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.request.is_none() && self.link.is_none() && self.forward.is_none()
    }

    /// 先停转发再关连接，两步互不影响
    async fn release(&mut self) {
        let forward = self.forward.take();
        let link = self.link.take();
        if let Some(forward) = forward {
            forward.stop().await;
        }
        if let Some(link) = link {
            link.close().await;
        }
    }
}

struct Inner {
    settings: TunnelSettings,
    deps: ControllerDeps,
    status: watch::Sender<SessionStatus>,
    slot: tokio::sync::Mutex<Slot>,
    monitor: Mutex<Option<HealthMonitor>>,
    /// stop 时取消，打断进行中的 start
    lifecycle: Mutex<CancellationToken>,
}

impl Inner {
    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    fn set_status(
        &self,
        state: SessionState,
        endpoint: Option<Endpoint>,
        attempt: Option<u32>,
        last_error: Option<&TunnelError>,
    ) {
        let previous = self.state();
        if previous != state {
            debug!("[Tunnel] {} -> {}", previous, state);
        }
        self.status.send_replace(SessionStatus {
            state,
            since: Local::now(),
            endpoint,
            attempt,
            last_error: last_error.map(StatusError::from),
        });
    }

    fn current_endpoint(&self) -> Option<Endpoint> {
        self.status.borrow().endpoint.clone()
    }

    fn take_monitor(&self) -> Option<HealthMonitor> {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn put_monitor(&self, monitor: HealthMonitor) {
        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(monitor);
        // 旧监控 drop 时自行取消
        drop(previous);
    }

    fn lifecycle_token(&self) -> CancellationToken {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn cancel_lifecycle(&self) {
        let previous = {
            let mut token = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *token, CancellationToken::new())
        };
        previous.cancel();
    }

    /// 交互式 start 可以请求确认，其余路径严格拒绝
    fn start_verifier(&self) -> HostKeyVerifier {
        match &self.deps.host_key_prompts {
            Some(prompts) => HostKeyVerifier::interactive(
                self.deps.known_hosts.clone(),
                prompts.clone(),
                self.settings.connection.host_key_confirm_timeout(),
            ),
            None => HostKeyVerifier::strict(self.deps.known_hosts.clone()),
        }
    }

    /// 在阻塞线程池中解密私钥
    async fn decrypt_credential(&self, credential_id: &str) -> Result<Zeroizing<String>, TunnelError> {
        let credential = self
            .deps
            .credentials
            .credential(credential_id)
            .ok_or_else(|| {
                TunnelError::Credential(format!("Unknown credential '{}'", credential_id))
            })?;

        let vault = self.deps.vault.clone();
        let task = tokio::task::spawn_blocking(move || {
            vault.unprotect(
                &credential.id,
                &credential.encrypted_private_key,
                &credential.iv,
            )
        });

        let plaintext = timeout(timeouts::CREDENTIAL_DECRYPT, task)
            .await
            .map_err(|_| TunnelError::Credential("Credential decryption timed out".to_string()))?
            .map_err(|e| TunnelError::Credential(format!("Credential decryption aborted: {}", e)))??;

        let text = std::str::from_utf8(&plaintext).map_err(|_| {
            TunnelError::Credential("Decrypted credential is not valid UTF-8".to_string())
        })?;
        Ok(Zeroizing::new(text.to_owned()))
    }

    /// 解密凭据 -> 连接并认证 -> 启动转发并等待就绪
    ///
    /// 任一步失败都不会遗留已创建的连接或监听。
    async fn establish(
        &self,
        request: &SessionRequest,
        local_port: u16,
        verifier: HostKeyVerifier,
    ) -> Result<(Arc<dyn TunnelLink>, ForwardHandle), TunnelError> {
        let endpoint = request.endpoint();

        debug!("[Tunnel] {}: {}", endpoint, ConnectionStage::LoadingCredential.label());
        let private_key = self.decrypt_credential(&request.credential_id).await?;

        let config = SshConfig::new(&endpoint, &self.settings.connection);
        let link = self
            .deps
            .connector
            .connect(ConnectRequest {
                config,
                private_key,
                verifier,
            })
            .await?;

        debug!("[Tunnel] {}: {}", endpoint, ConnectionStage::StartingForward.label());
        let target = ForwardTarget {
            host: self.settings.forward.remote_host.clone(),
            port: self.settings.forward.remote_port,
        };
        match forward::start(local_port, target, link.clone()).await {
            Ok(handle) => Ok((link, handle)),
            Err(e) => {
                link.close().await;
                Err(e)
            }
        }
    }

    /// 经 Stopping 回到 Idle，释放所有资源
    async fn teardown_locked(&self, slot: &mut Slot) {
        self.set_status(SessionState::Stopping, self.current_endpoint(), None, None);
        drop(self.take_monitor());
        slot.release().await;
        slot.request = None;
        slot.local_port = 0;
        self.set_status(SessionState::Idle, None, None, None);
    }
}

/// 隧道会话控制器（同一时间只有一个会话）
#[derive(Clone)]
pub struct TunnelController {
    inner: Arc<Inner>,
}

impl TunnelController {
    pub fn new(settings: TunnelSettings, deps: ControllerDeps) -> Result<Self, TunnelError> {
        settings.validate().map_err(TunnelError::Config)?;
        let (status, _) = watch::channel(SessionStatus::idle());

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                deps,
                status,
                slot: tokio::sync::Mutex::new(Slot::default()),
                monitor: Mutex::new(None),
                lifecycle: Mutex::new(CancellationToken::new()),
            }),
        })
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.inner.settings
    }

    /// 当前状态快照
    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// 健康快照，仅在会话运行时存在
    pub fn health(&self) -> Option<HealthSnapshot> {
        self.inner
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(HealthMonitor::snapshot)
    }

    /// 外部发现连接中断时调用，立即触发一次探测
    pub fn report_loss(&self) {
        if let Some(monitor) = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            monitor.report_loss();
        }
    }

    /// 启动会话，返回本地转发地址
    ///
    /// 已有会话处于 Connecting/Active/Reconnecting/Stopping 时返回 `Busy`；
    /// 处于 Failed 时先经 Stopping 清理再启动。
    pub async fn start(&self, request: SessionRequest) -> Result<SocketAddr, TunnelError> {
        request.validate().map_err(TunnelError::Config)?;
        let inner = &self.inner;

        let current = inner.state();
        if current.is_busy() {
            return Err(TunnelError::Busy(current));
        }
        if current == SessionState::Failed {
            // 监控任务可能在等待会话锁，先在锁外停掉
            if let Some(mut monitor) = inner.take_monitor() {
                monitor.stop().await;
            }
        }
        let cancel = inner.lifecycle_token();

        let mut slot = inner.slot.lock().await;
        let current = inner.state();
        if current.is_busy() {
            return Err(TunnelError::Busy(current));
        }
        if current == SessionState::Failed || !slot.is_empty() {
            inner.teardown_locked(&mut slot).await;
        }

        let endpoint = request.endpoint();
        info!("[Tunnel] Starting session to {}", endpoint);
        inner.set_status(SessionState::Connecting, Some(endpoint.clone()), None, None);

        let established = tokio::select! {
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            established = inner.establish(
                &request,
                inner.settings.forward.local_port,
                inner.start_verifier(),
            ) => established,
        };

        let (link, forward) = match established {
            Ok(parts) => parts,
            Err(TunnelError::Cancelled) => {
                // 状态由 stop 负责迁移
                info!("[Tunnel] Start of {} cancelled", endpoint);
                return Err(TunnelError::Cancelled);
            }
            Err(e) => {
                error!("[Tunnel] Failed to start session to {}: {}", endpoint, e);
                inner.set_status(SessionState::Failed, Some(endpoint), None, Some(&e));
                return Err(e);
            }
        };

        let local_addr = forward.local_addr();
        slot.link = Some(link);
        slot.forward = Some(forward);
        slot.request = Some(request);
        slot.local_port = local_addr.port();

        if cancel.is_cancelled() {
            slot.release().await;
            return Err(TunnelError::Cancelled);
        }

        inner.set_status(SessionState::Active, Some(endpoint.clone()), None, None);
        inner.put_monitor(HealthMonitor::start(
            MonitorConfig::from_settings(&inner.settings.reconnect),
            Arc::new(MonitorBridge {
                inner: Arc::downgrade(&self.inner),
            }),
        ));

        info!(
            "[Tunnel] {} - forwarding {} -> {}:{} via {}",
            ConnectionStage::Ready.label(),
            local_addr,
            inner.settings.forward.remote_host,
            inner.settings.forward.remote_port,
            endpoint
        );
        Ok(local_addr)
    }

    /// 停止会话，任何状态下都可调用；已是 Idle 时什么也不做
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.cancel_lifecycle();

        if let Some(mut monitor) = inner.take_monitor() {
            monitor.stop().await;
        }

        let mut slot = inner.slot.lock().await;
        if inner.state() == SessionState::Idle && slot.is_empty() {
            debug!("[Tunnel] Stop requested while idle");
            return;
        }

        info!("[Tunnel] Stopping session");
        inner.teardown_locked(&mut slot).await;
        info!("[Tunnel] Session stopped");
    }
}

/// 健康监控回调到控制器
///
/// 只持有弱引用，控制器释放后回调直接失效。
struct MonitorBridge {
    inner: Weak<Inner>,
}

impl MonitorBridge {
    fn inner(&self) -> Result<Arc<Inner>, TunnelError> {
        self.inner.upgrade().ok_or(TunnelError::Cancelled)
    }
}

#[async_trait]
impl HealthActions for MonitorBridge {
    async fn probe(&self) -> Result<(), TunnelError> {
        let inner = self.inner()?;
        let link = inner.slot.lock().await.link.clone();
        match link {
            Some(link) => link.probe().await,
            None => Err(TunnelError::Network("No active connection".to_string())),
        }
    }

    /// 释放旧连接和监听后，以严格校验重新建立
    async fn reconnect(&self) -> Result<(), TunnelError> {
        let inner = self.inner()?;
        let mut slot = inner.slot.lock().await;
        if inner.state() != SessionState::Reconnecting {
            return Err(TunnelError::Cancelled);
        }
        let request = slot
            .request
            .clone()
            .ok_or_else(|| TunnelError::Config("No session to reconnect".to_string()))?;

        slot.release().await;
        let verifier = HostKeyVerifier::strict(inner.deps.known_hosts.clone());
        let (link, forward) = inner.establish(&request, slot.local_port, verifier).await?;
        slot.link = Some(link);
        slot.forward = Some(forward);
        Ok(())
    }

    async fn on_transition(&self, state: MonitorState, cause: Option<TunnelError>) {
        let Ok(inner) = self.inner() else {
            return;
        };
        let mut slot = inner.slot.lock().await;
        // stop 已经接管时忽略
        if !matches!(
            inner.state(),
            SessionState::Active | SessionState::Reconnecting
        ) {
            return;
        }
        let endpoint = slot.request.as_ref().map(SessionRequest::endpoint);

        match state {
            MonitorState::Reconnecting { attempt } => {
                warn!(
                    "[Tunnel] Connection to {} lost, reconnect attempt {}",
                    endpoint.as_ref().map(ToString::to_string).unwrap_or_default(),
                    attempt
                );
                inner.set_status(
                    SessionState::Reconnecting,
                    endpoint,
                    Some(attempt),
                    cause.as_ref(),
                );
            }
            MonitorState::Connected => {
                info!("[Tunnel] Session restored");
                inner.set_status(SessionState::Active, endpoint, None, None);
            }
            MonitorState::Failed => {
                // 监控任务随后自行退出，健康快照随之失效
                drop(inner.take_monitor());
                slot.release().await;
                error!(
                    "[Tunnel] Session failed: {}",
                    cause
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "unknown".to_string())
                );
                inner.set_status(SessionState::Failed, endpoint, None, cause.as_ref());
            }
            MonitorState::Disconnected => {}
        }
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
