// 测试用的进程内传输实现
//
// 转发通道直连本地 echo 服务器，探测和连接结果可以按需编排。
// 另有一个真实的 russh 服务器，用于覆盖握手、认证和 direct-tcpip。

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{Auth, Msg, Session};
use russh::Channel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use super::error::TunnelError;
use super::identity::tests::ed25519_blob;
use super::identity::{HostIdentity, KeyAlgorithm};
use super::transport::{BoxedStream, ChannelOpener, ConnectRequest, TunnelConnector, TunnelLink};
use crate::services::credentials::tests::TEST_PRIVATE_KEY;

/// 启动 echo 服务器，返回监听地址
pub(crate) async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// 发送一段数据并读取回显
pub(crate) async fn echo_roundtrip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

/// 把转发通道接到 echo 服务器
pub(crate) struct EchoOpener {
    target: SocketAddr,
    pub opened: AtomicUsize,
}

impl EchoOpener {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            opened: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChannelOpener for EchoOpener {
    async fn open_channel(
        &self,
        _remote_host: &str,
        _remote_port: u16,
        _originator: SocketAddr,
    ) -> Result<BoxedStream, TunnelError> {
        let stream = TcpStream::connect(self.target).await?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(stream))
    }
}

/// 可控的隧道连接
pub(crate) struct FakeLink {
    opener: EchoOpener,
    pub healthy: AtomicBool,
    pub closed: AtomicBool,
    pub probes: AtomicUsize,
}

impl FakeLink {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            opener: EchoOpener::new(target),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChannelOpener for FakeLink {
    async fn open_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Network("link closed".into()));
        }
        self.opener
            .open_channel(remote_host, remote_port, originator)
            .await
    }
}

#[async_trait]
impl TunnelLink for FakeLink {
    async fn probe(&self) -> Result<(), TunnelError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) && !self.is_closed() {
            Ok(())
        } else {
            Err(TunnelError::Network("probe failed".into()))
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// 连接器：按主机身份种子生成 host key，走真实的校验流程
pub(crate) struct FakeConnector {
    echo: SocketAddr,
    identity_seed: AtomicU8,
    /// 预先编排的连接结果，队列为空时连接成功
    script: Mutex<VecDeque<TunnelError>>,
    /// 队列为空后是否一直失败
    fail_always: Mutex<Option<TunnelError>>,
    pub attempts: Mutex<Vec<Instant>>,
    pub links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeConnector {
    pub fn new(echo: SocketAddr) -> Self {
        Self {
            echo,
            identity_seed: AtomicU8::new(1),
            script: Mutex::new(VecDeque::new()),
            fail_always: Mutex::new(None),
            attempts: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        }
    }

    pub fn set_identity(&self, seed: u8) {
        self.identity_seed.store(seed, Ordering::SeqCst);
    }

    pub fn identity(&self) -> HostIdentity {
        let seed = self.identity_seed.load(Ordering::SeqCst);
        HostIdentity::new(KeyAlgorithm::Ed25519, ed25519_blob(seed)).unwrap()
    }

    pub fn fail_next(&self, error: TunnelError) {
        self.script.lock().unwrap().push_back(error);
    }

    pub fn fail_always(&self, error: Option<TunnelError>) {
        *self.fail_always.lock().unwrap() = error;
    }

    pub fn last_link(&self) -> Arc<FakeLink> {
        self.links.lock().unwrap().last().cloned().unwrap()
    }

    pub fn connect_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl TunnelConnector for FakeConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn TunnelLink>, TunnelError> {
        self.attempts.lock().unwrap().push(Instant::now());

        if request.private_key.is_empty() {
            return Err(TunnelError::Credential("empty private key".into()));
        }
        let scripted = self.script.lock().unwrap().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        let always = self.fail_always.lock().unwrap().clone();
        if let Some(error) = always {
            return Err(error);
        }

        request
            .verifier
            .verify(&request.config.host, request.config.port, &self.identity())
            .await?;

        let link = Arc::new(FakeLink::new(self.echo));
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

/// 进程内 SSH 服务器
pub(crate) struct SshTestServer {
    pub addr: SocketAddr,
    /// 服务器的 host key
    pub identity: HostIdentity,
}

/// 服务端 handler：公钥认证按配置放行，direct-tcpip 通道一律接到 echo 服务器
#[derive(Clone)]
struct EchoSshHandler {
    echo: SocketAddr,
    accept_auth: bool,
}

impl russh::server::Handler for EchoSshHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.accept_auth {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let echo = self.echo;
        tokio::spawn(async move {
            let Ok(mut remote) = TcpStream::connect(echo).await else {
                return;
            };
            let mut local = Box::pin(channel.into_stream());
            let _ = tokio::io::copy_bidirectional(&mut local, &mut remote).await;
        });
        Ok(true)
    }
}

/// 启动 SSH 服务器，host key 使用测试私钥
pub(crate) async fn spawn_ssh_server(echo: SocketAddr, accept_auth: bool) -> SshTestServer {
    let key = russh::keys::decode_secret_key(TEST_PRIVATE_KEY, None).unwrap();
    let identity = HostIdentity::from_public_key(key.public_key()).unwrap();

    let mut config = russh::server::Config::default();
    config.keys.push(key);
    config.auth_rejection_time = Duration::from_millis(10);
    config.auth_rejection_time_initial = Some(Duration::ZERO);
    let config = Arc::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = EchoSshHandler { echo, accept_auth };

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let config = config.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Ok(session) = russh::server::run_stream(config, stream, handler).await {
                    let _ = session.await;
                }
            });
        }
    });

    SshTestServer { addr, identity }
}
