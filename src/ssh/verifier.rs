// 握手期间的主机身份校验
//
// NewHost 记录后继续，Valid 直接继续，Changed 默认拒绝。
// 只有交互式校验器会通过 HostKeyPrompt 通道请求外部确认。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::error::TunnelError;
use super::event::{HostKeyAction, HostKeyPrompt};
use super::identity::HostIdentity;
use crate::models::known_hosts::host_key;
use crate::services::{HostKeyStatus, KnownHostsStore};

#[derive(Clone)]
enum Confirmation {
    /// 自动重连等无人值守路径：身份变化一律拒绝
    Strict,
    /// 交互路径：身份变化时发出确认请求
    Interactive {
        prompts: mpsc::Sender<HostKeyPrompt>,
        wait: Duration,
    },
}

/// 主机身份校验器
#[derive(Clone)]
pub struct HostKeyVerifier {
    store: Arc<KnownHostsStore>,
    confirmation: Confirmation,
}

impl HostKeyVerifier {
    pub fn strict(store: Arc<KnownHostsStore>) -> Self {
        Self {
            store,
            confirmation: Confirmation::Strict,
        }
    }

    /// `wait` 内没有收到回复视为拒绝
    pub fn interactive(
        store: Arc<KnownHostsStore>,
        prompts: mpsc::Sender<HostKeyPrompt>,
        wait: Duration,
    ) -> Self {
        Self {
            store,
            confirmation: Confirmation::Interactive { prompts, wait },
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self.confirmation, Confirmation::Interactive { .. })
    }

    /// 等待外部确认的最长时间，严格模式为零
    pub fn confirmation_window(&self) -> Duration {
        match &self.confirmation {
            Confirmation::Strict => Duration::ZERO,
            Confirmation::Interactive { wait, .. } => *wait,
        }
    }

    pub fn store(&self) -> &Arc<KnownHostsStore> {
        &self.store
    }

    /// 校验远端身份，返回 Ok 表示可以继续握手
    pub async fn verify(
        &self,
        host: &str,
        port: u16,
        identity: &HostIdentity,
    ) -> Result<(), TunnelError> {
        let actual = identity.fingerprint();

        match self.store.validate(host, port, identity.as_bytes()) {
            HostKeyStatus::Valid => Ok(()),
            HostKeyStatus::NewHost => {
                info!(
                    "[SSH] New host {} ({}), trusting on first use",
                    host_key(host, port),
                    actual
                );
                // 落盘失败不影响本次连接，内存中的记录已更新
                if let Err(e) = self.store.store(host, port, identity.as_bytes()) {
                    warn!("[SSH] Failed to persist host key: {:#}", e);
                }
                Ok(())
            }
            HostKeyStatus::Changed { expected } => {
                let mismatch = TunnelError::IdentityMismatch {
                    host_key: host_key(host, port),
                    expected: expected.clone(),
                    actual: actual.clone(),
                };
                warn!("[SSH] {}", mismatch);

                let Confirmation::Interactive { prompts, wait } = &self.confirmation else {
                    return Err(mismatch);
                };

                match self.ask(prompts, *wait, host, port, expected, actual).await {
                    HostKeyAction::Accept => {
                        info!("[SSH] Changed host key for {} accepted", host_key(host, port));
                        self.store
                            .store(host, port, identity.as_bytes())
                            .map_err(|e| TunnelError::Resource(format!("{:#}", e)))?;
                        Ok(())
                    }
                    HostKeyAction::Reject => Err(mismatch),
                }
            }
        }
    }

    async fn ask(
        &self,
        prompts: &mpsc::Sender<HostKeyPrompt>,
        wait: Duration,
        host: &str,
        port: u16,
        expected: String,
        actual: String,
    ) -> HostKeyAction {
        let (respond, response) = oneshot::channel();
        let prompt = HostKeyPrompt {
            host: host.to_string(),
            port,
            host_key: host_key(host, port),
            expected_fingerprint: expected,
            actual_fingerprint: actual,
            respond,
        };

        if prompts.send(prompt).await.is_err() {
            warn!("[SSH] No one is listening for host key prompts, rejecting");
            return HostKeyAction::Reject;
        }

        match tokio::time::timeout(wait, response).await {
            Ok(Ok(action)) => action,
            Ok(Err(_)) => HostKeyAction::Reject,
            Err(_) => {
                warn!(
                    "[SSH] Host key confirmation timed out after {}s, rejecting",
                    wait.as_secs()
                );
                HostKeyAction::Reject
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::identity::tests::ed25519_blob;
    use crate::ssh::identity::KeyAlgorithm;

    fn identity(seed: u8) -> HostIdentity {
        HostIdentity::new(KeyAlgorithm::Ed25519, ed25519_blob(seed)).unwrap()
    }

    #[tokio::test]
    async fn new_host_is_stored_and_valid_passes() {
        let store = Arc::new(KnownHostsStore::in_memory());
        let verifier = HostKeyVerifier::strict(store.clone());

        verifier.verify("h1", 22, &identity(1)).await.unwrap();
        assert_eq!(store.lookup("h1", 22), Some(identity(1).fingerprint()));

        verifier.verify("h1", 22, &identity(1)).await.unwrap();
    }

    #[tokio::test]
    async fn strict_mode_rejects_changed_identity() {
        let store = Arc::new(KnownHostsStore::in_memory());
        store.store("h1", 22, identity(1).as_bytes()).unwrap();
        let verifier = HostKeyVerifier::strict(store.clone());

        let err = verifier.verify("h1", 22, &identity(2)).await.unwrap_err();
        assert!(matches!(err, TunnelError::IdentityMismatch { .. }));
        assert_eq!(store.lookup("h1", 22), Some(identity(1).fingerprint()));
    }

    #[tokio::test]
    async fn interactive_accept_updates_store() {
        let store = Arc::new(KnownHostsStore::in_memory());
        store.store("h1", 2222, identity(1).as_bytes()).unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let verifier = HostKeyVerifier::interactive(store.clone(), tx, Duration::from_secs(5));

        let responder = tokio::spawn(async move {
            let prompt = rx.recv().await.unwrap();
            assert_eq!(prompt.host_key, "[h1]:2222");
            assert_eq!(prompt.expected_fingerprint, identity(1).fingerprint());
            assert_eq!(prompt.actual_fingerprint, identity(2).fingerprint());
            prompt.respond.send(HostKeyAction::Accept).unwrap();
        });

        verifier.verify("h1", 2222, &identity(2)).await.unwrap();
        responder.await.unwrap();
        assert_eq!(store.lookup("h1", 2222), Some(identity(2).fingerprint()));
    }

    #[tokio::test]
    async fn interactive_reject_keeps_original_record() {
        let store = Arc::new(KnownHostsStore::in_memory());
        store.store("h1", 22, identity(1).as_bytes()).unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let verifier = HostKeyVerifier::interactive(store.clone(), tx, Duration::from_secs(5));

        tokio::spawn(async move {
            let prompt = rx.recv().await.unwrap();
            let _ = prompt.respond.send(HostKeyAction::Reject);
        });

        let err = verifier.verify("h1", 22, &identity(2)).await.unwrap_err();
        assert!(matches!(err, TunnelError::IdentityMismatch { .. }));
        assert_eq!(store.lookup("h1", 22), Some(identity(1).fingerprint()));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_prompt_times_out_as_reject() {
        let store = Arc::new(KnownHostsStore::in_memory());
        store.store("h1", 22, identity(1).as_bytes()).unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let verifier = HostKeyVerifier::interactive(store.clone(), tx, Duration::from_secs(30));

        // 持有请求但不回复
        let holder = tokio::spawn(async move {
            let prompt = rx.recv().await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(prompt);
        });

        let err = verifier.verify("h1", 22, &identity(2)).await.unwrap_err();
        assert!(matches!(err, TunnelError::IdentityMismatch { .. }));
        holder.abort();
    }
}
