// SSH 客户端 Handler 实现
// 实现 russh::client::Handler trait，在握手阶段校验服务器身份

use std::future::Future;
use std::sync::{Arc, Mutex};

use russh::keys::PublicKey;
use tracing::debug;

use super::error::TunnelError;
use super::identity::HostIdentity;
use super::verifier::HostKeyVerifier;

/// 握手被拒绝时记录的具体原因，供 client 返回给调用方
pub type RejectSlot = Arc<Mutex<Option<TunnelError>>>;

/// SSH 客户端 Handler
pub struct SshClientHandler {
    host: String,
    port: u16,
    verifier: HostKeyVerifier,
    rejection: RejectSlot,
}

impl SshClientHandler {
    pub fn new(host: String, port: u16, verifier: HostKeyVerifier, rejection: RejectSlot) -> Self {
        Self {
            host,
            port,
            verifier,
            rejection,
        }
    }
}

impl russh::client::Handler for SshClientHandler {
    type Error = russh::Error;

    /// 检查服务器公钥
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let identity = HostIdentity::from_public_key(server_public_key);
        let verifier = self.verifier.clone();
        let host = self.host.clone();
        let port = self.port;
        let rejection = self.rejection.clone();

        async move {
            let result = match identity {
                Ok(identity) => {
                    debug!(
                        "[SSH] Server key {} {}",
                        identity.algorithm(),
                        identity.fingerprint()
                    );
                    verifier.verify(&host, port, &identity).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => Ok(true),
                Err(e) => {
                    *rejection.lock().unwrap_or_else(|p| p.into_inner()) = Some(e);
                    Ok(false)
                }
            }
        }
    }
}
