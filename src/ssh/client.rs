// SSH 客户端核心实现

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use russh::client::AuthResult;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::config::SshConfig;
use super::error::TunnelError;
use super::event::ConnectionStage;
use super::handler::{RejectSlot, SshClientHandler};
use super::proxy;
use super::session::SshSession;
use super::transport::{ConnectRequest, TunnelConnector, TunnelLink};

/// SSH 客户端
/// 负责建立 SSH 连接并返回 SshSession
pub struct SshClient {
    request: ConnectRequest,
}

impl SshClient {
    pub fn new(request: ConnectRequest) -> Self {
        Self { request }
    }

    fn config(&self) -> &SshConfig {
        &self.request.config
    }

    fn stage(&self, stage: ConnectionStage) {
        debug!(
            "[SSH] {}@{}:{} - {}",
            self.config().username,
            self.config().host,
            self.config().port,
            stage.label()
        );
    }

    /// 执行连接
    pub async fn connect(self) -> Result<SshSession, TunnelError> {
        let config = self.config().clone();
        let connect_timeout = config.connect_timeout;

        // 先解析私钥，失败时不触网
        let key = russh::keys::decode_secret_key(&self.request.private_key, None)
            .map_err(|e| TunnelError::Credential(format!("Failed to decode private key: {}", e)))?;

        // TCP 连接（直连或经代理）
        let tcp_stream = match &config.proxy {
            Some(proxy_settings) => {
                self.stage(ConnectionStage::ConnectingProxy);
                proxy::connect_via_proxy(proxy_settings, &config.host, config.port, connect_timeout)
                    .await?
            }
            None => {
                self.stage(ConnectionStage::ConnectingHost);
                let addr = proxy::resolve(&config.host, config.port).await?;
                timeout(connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| TunnelError::timeout("TCP connect", connect_timeout))?
                    .map_err(|e| {
                        TunnelError::Network(format!("Failed to connect to {}: {}", addr, e))
                    })?
            }
        };
        // 转发流量以小包为主
        let _ = tcp_stream.set_nodelay(true);

        // SSH 握手，check_server_key 中完成主机身份校验
        self.stage(ConnectionStage::Handshaking);
        let rejection: RejectSlot = Arc::new(Mutex::new(None));
        let handler = SshClientHandler::new(
            config.host.clone(),
            config.port,
            self.request.verifier.clone(),
            rejection.clone(),
        );

        // 交互确认可能需要等待用户，握手超时要覆盖确认时间
        let handshake_timeout = connect_timeout + self.request.verifier.confirmation_window();
        let handshake = russh::client::connect_stream(
            Arc::new(config.to_russh_config()),
            tcp_stream,
            handler,
        );

        let mut handle = match timeout(handshake_timeout, handshake).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let recorded = rejection.lock().unwrap_or_else(|p| p.into_inner()).take();
                return Err(recorded.unwrap_or_else(|| TunnelError::from(e)));
            }
            Err(_) => return Err(TunnelError::timeout("SSH handshake", handshake_timeout)),
        };

        // 认证
        self.stage(ConnectionStage::Authenticating);
        let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(
            Arc::new(key),
            handle.best_supported_rsa_hash().await.ok().flatten().flatten(),
        );
        let auth_result = timeout(
            connect_timeout,
            handle.authenticate_publickey(&config.username, key_with_alg),
        )
        .await
        .map_err(|_| TunnelError::timeout("Authentication", connect_timeout))??;

        authentication_outcome(auth_result)?;

        info!(
            "[SSH] Authenticated as {}@{}:{}",
            config.username, config.host, config.port
        );

        Ok(SshSession::new(handle, &config))
    }
}

fn authentication_outcome(result: AuthResult) -> Result<(), TunnelError> {
    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            partial_success: true,
            ..
        } => Err(TunnelError::Authentication(
            "Partial authentication - additional auth required".to_string(),
        )),
        AuthResult::Failure {
            remaining_methods, ..
        } => Err(TunnelError::Authentication(format!(
            "Public key authentication failed. Server suggests: {:?}",
            remaining_methods
        ))),
    }
}

/// 基于 russh 的连接器
#[derive(Default)]
pub struct SshConnector;

#[async_trait]
impl TunnelConnector for SshConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn TunnelLink>, TunnelError> {
        let session = SshClient::new(request).connect().await?;
        Ok(Arc::new(session))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionSettings, Endpoint};
    use crate::services::credentials::tests::TEST_PRIVATE_KEY;
    use crate::services::KnownHostsStore;
    use crate::ssh::forward::{self, ForwardTarget};
    use crate::ssh::identity::tests::ed25519_blob;
    use crate::ssh::identity::{HostIdentity, KeyAlgorithm};
    use crate::ssh::testing::{echo_roundtrip, spawn_echo_server, spawn_ssh_server};
    use crate::ssh::verifier::HostKeyVerifier;
    use zeroize::Zeroizing;

    fn request(port: u16, store: &Arc<KnownHostsStore>, private_key: &str) -> ConnectRequest {
        let endpoint = Endpoint {
            host: "127.0.0.1".into(),
            port,
            user: "alice".into(),
        };
        ConnectRequest {
            config: SshConfig::new(&endpoint, &ConnectionSettings::default()),
            private_key: Zeroizing::new(private_key.to_string()),
            verifier: HostKeyVerifier::strict(store.clone()),
        }
    }

    #[tokio::test]
    async fn new_host_is_trusted_and_channels_reach_target() {
        let echo = spawn_echo_server().await;
        let server = spawn_ssh_server(echo, true).await;
        let port = server.addr.port();
        let store = Arc::new(KnownHostsStore::in_memory());

        let link = SshConnector
            .connect(request(port, &store, TEST_PRIVATE_KEY))
            .await
            .unwrap();
        assert_eq!(
            store.lookup("127.0.0.1", port),
            Some(server.identity.fingerprint())
        );
        link.probe().await.unwrap();

        let target = ForwardTarget {
            host: echo.ip().to_string(),
            port: echo.port(),
        };
        let handle = forward::start(0, target, link.clone()).await.unwrap();
        assert_eq!(
            echo_roundtrip(handle.local_addr(), b"ping").await,
            b"ping".to_vec()
        );
        handle.stop().await;

        link.close().await;
        assert!(link.is_closed());
        assert!(link.probe().await.is_err());
        // 重复关闭无副作用
        link.close().await;
    }

    #[tokio::test]
    async fn changed_host_key_aborts_handshake_with_identity_mismatch() {
        let echo = spawn_echo_server().await;
        let server = spawn_ssh_server(echo, true).await;
        let port = server.addr.port();
        let store = Arc::new(KnownHostsStore::in_memory());
        let pinned = HostIdentity::new(KeyAlgorithm::Ed25519, ed25519_blob(1)).unwrap();
        store.store("127.0.0.1", port, pinned.as_bytes()).unwrap();

        let err = SshConnector
            .connect(request(port, &store, TEST_PRIVATE_KEY))
            .await
            .err()
            .unwrap();
        match err {
            TunnelError::IdentityMismatch {
                host_key,
                expected,
                actual,
            } => {
                assert_eq!(host_key, format!("[127.0.0.1]:{}", port));
                assert_eq!(expected, pinned.fingerprint());
                assert_eq!(actual, server.identity.fingerprint());
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(store.lookup("127.0.0.1", port), Some(pinned.fingerprint()));
    }

    #[tokio::test]
    async fn rejected_public_key_is_authentication_error() {
        let echo = spawn_echo_server().await;
        let server = spawn_ssh_server(echo, false).await;
        let store = Arc::new(KnownHostsStore::in_memory());

        let err = SshConnector
            .connect(request(server.addr.port(), &store, TEST_PRIVATE_KEY))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Authentication(_)), "{:?}", err);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn undecodable_key_fails_before_connecting() {
        let store = Arc::new(KnownHostsStore::in_memory());
        // 端口 1 上没有服务，若先连网会得到网络错误
        let err = SshConnector
            .connect(request(1, &store, "not a key"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Credential(_)), "{:?}", err);
        assert!(store.list().is_empty());
    }
}
