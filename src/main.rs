// ShellMaster Tunnel - 命令行入口

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use zeroize::Zeroizing;

use shellmaster_tunnel::constants::DEFAULT_SSH_PORT;
use shellmaster_tunnel::services::{
    storage, CredentialCatalog, FileKeyStore, KeyVault, KnownHostsStore,
};
use shellmaster_tunnel::ssh::{
    ControllerDeps, HostKeyAction, HostKeyPrompt, SessionState, SessionStatus, SshConnector,
    TunnelController,
};
use shellmaster_tunnel::SessionRequest;

#[derive(Parser, Debug)]
#[command(name = "shellmaster-tunnel")]
#[command(version, about = "SSH port forwarding with host key pinning and auto-reconnect", long_about = None)]
struct Cli {
    /// Configuration directory (defaults to the platform config directory)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a tunnel and keep it running until Ctrl-C
    Run {
        /// Remote SSH host
        #[arg(long)]
        host: String,

        /// Remote SSH port
        #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
        port: u16,

        /// SSH user name
        #[arg(short, long)]
        user: String,

        /// Id of an imported credential
        #[arg(short, long)]
        credential: String,

        /// Local loopback port (overrides settings.json)
        #[arg(long)]
        local_port: Option<u16>,

        /// Forward target host as seen from the remote side
        #[arg(long)]
        remote_host: Option<String>,

        /// Forward target port
        #[arg(long)]
        remote_port: Option<u16>,

        /// Reject changed host keys without asking
        #[arg(long)]
        non_interactive: bool,
    },

    /// Import an unencrypted OpenSSH private key
    ImportKey {
        /// Credential id
        id: String,
        /// Path to the private key file
        path: PathBuf,
    },

    /// Delete a credential and destroy its vault key
    DeleteKey {
        /// Credential id
        id: String,
    },

    /// List imported credentials
    ListKeys,

    /// Inspect or edit the trusted host keys
    KnownHosts {
        #[command(subcommand)]
        action: KnownHostsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum KnownHostsCommand {
    /// List trusted host keys
    List,
    /// Forget a trusted host key
    Remove {
        host: String,
        #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
        port: u16,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // 可以通过 RUST_LOG 环境变量控制日志级别，例如：RUST_LOG=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_dir = match cli.config_dir {
        Some(dir) => {
            storage::ensure_dir(&dir)?;
            dir
        }
        None => storage::get_config_dir()?,
    };

    match cli.command {
        Command::Run {
            host,
            port,
            user,
            credential,
            local_port,
            remote_host,
            remote_port,
            non_interactive,
        } => {
            let mut settings = storage::load_settings(&config_dir)?;
            if !storage::settings_file(&config_dir).exists() {
                storage::save_settings(&config_dir, &settings)?;
            }
            if let Some(port) = local_port {
                settings.forward.local_port = port;
            }
            if let Some(host) = remote_host {
                settings.forward.remote_host = host;
            }
            if let Some(port) = remote_port {
                settings.forward.remote_port = port;
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("tunnel-worker")
                .build()
                .context("无法创建 Tokio 运行时")?;

            let request = SessionRequest::new(host, port, user, credential);
            runtime.block_on(run_tunnel(
                &config_dir,
                settings,
                request,
                !non_interactive,
            ))
        }
        Command::ImportKey { id, path } => {
            let pem = Zeroizing::new(
                std::fs::read_to_string(&path)
                    .with_context(|| format!("无法读取私钥文件 {}", path.display()))?,
            );
            let vault = open_vault(&config_dir);
            let catalog = CredentialCatalog::load(storage::credentials_file(&config_dir))?;
            let credential = catalog.import(&id, &pem, &vault)?;
            println!("{}  {}", credential.id, credential.public_fingerprint);
            Ok(())
        }
        Command::DeleteKey { id } => {
            let vault = open_vault(&config_dir);
            let catalog = CredentialCatalog::load(storage::credentials_file(&config_dir))?;
            if !catalog.delete(&id, &vault)? {
                bail!("凭据 '{}' 不存在", id);
            }
            println!("Deleted {}", id);
            Ok(())
        }
        Command::ListKeys => {
            let catalog = CredentialCatalog::load(storage::credentials_file(&config_dir))?;
            for credential in catalog.list() {
                println!(
                    "{}  {}  {}",
                    credential.id, credential.public_fingerprint, credential.created_at
                );
            }
            Ok(())
        }
        Command::KnownHosts { action } => {
            let known_hosts = KnownHostsStore::load(storage::known_hosts_file(&config_dir));
            match action {
                KnownHostsCommand::List => {
                    for record in known_hosts.list() {
                        println!("{}", record.to_line());
                    }
                }
                KnownHostsCommand::Remove { host, port } => {
                    if !known_hosts.remove(&host, port)? {
                        bail!("{}:{} 不在信任库中", host, port);
                    }
                    println!("Removed {}:{}", host, port);
                }
            }
            Ok(())
        }
    }
}

fn open_vault(config_dir: &Path) -> KeyVault {
    KeyVault::new(Arc::new(FileKeyStore::new(storage::keys_dir(config_dir))))
}

async fn run_tunnel(
    config_dir: &Path,
    settings: shellmaster_tunnel::TunnelSettings,
    request: SessionRequest,
    interactive: bool,
) -> Result<()> {
    let catalog = Arc::new(CredentialCatalog::load(storage::credentials_file(
        config_dir,
    ))?);
    let known_hosts = Arc::new(KnownHostsStore::load(storage::known_hosts_file(
        config_dir,
    )));

    let (prompt_tx, prompt_rx) = mpsc::channel(1);
    let controller = TunnelController::new(
        settings,
        ControllerDeps {
            vault: Arc::new(open_vault(config_dir)),
            credentials: catalog,
            known_hosts,
            connector: Arc::new(SshConnector),
            host_key_prompts: interactive.then_some(prompt_tx),
        },
    )?;

    tokio::spawn(answer_host_key_prompts(prompt_rx));
    tokio::spawn(print_status(controller.subscribe()));

    let started = tokio::select! {
        started = controller.start(request) => Some(started),
        _ = tokio::signal::ctrl_c() => None,
    };
    let local_addr = match started {
        Some(Ok(addr)) => addr,
        Some(Err(e)) => {
            controller.stop().await;
            return Err(e).context("无法建立隧道");
        }
        None => {
            controller.stop().await;
            return Ok(());
        }
    };

    let forward = &controller.settings().forward;
    println!(
        "Forwarding {} -> {}:{} (Ctrl-C to stop)",
        local_addr, forward.remote_host, forward.remote_port
    );

    let mut status_rx = controller.subscribe();
    let failure = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("[Tunnel] Interrupted");
            None
        }
        failed = wait_for_failure(&mut status_rx) => Some(failed),
    };

    controller.stop().await;

    match failure {
        Some(status) => {
            let reason = status
                .last_error
                .map(|e| e.message)
                .unwrap_or_else(|| "unknown error".to_string());
            bail!("隧道已失败: {}", reason)
        }
        None => Ok(()),
    }
}

async fn wait_for_failure(rx: &mut watch::Receiver<SessionStatus>) -> SessionStatus {
    loop {
        {
            let status = rx.borrow_and_update();
            if status.state == SessionState::Failed {
                return status.clone();
            }
        }
        if rx.changed().await.is_err() {
            // 控制器已释放，不会再有变化
            std::future::pending::<()>().await;
        }
    }
}

async fn print_status(mut rx: watch::Receiver<SessionStatus>) {
    while rx.changed().await.is_ok() {
        let status = rx.borrow_and_update().clone();
        let mut line = format!(
            "[{}] {}",
            status.since.format("%H:%M:%S"),
            status.state
        );
        if let Some(endpoint) = &status.endpoint {
            line.push_str(&format!(" {}", endpoint));
        }
        if let Some(attempt) = status.attempt {
            line.push_str(&format!(" (attempt {})", attempt));
        }
        if let Some(error) = &status.last_error {
            line.push_str(&format!(" - {}: {}", error.kind.as_str(), error.message));
        }
        eprintln!("{}", line);
    }
}

/// 在终端询问是否接受变化后的主机身份，只有输入 yes 才接受
async fn answer_host_key_prompts(mut prompts: mpsc::Receiver<HostKeyPrompt>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(prompt) = prompts.recv().await {
        eprintln!();
        eprintln!("WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED for {}", prompt.host_key);
        eprintln!("  expected: {}", prompt.expected_fingerprint);
        eprintln!("  actual:   {}", prompt.actual_fingerprint);
        eprintln!("Someone could be intercepting the connection.");
        eprint!("Accept the new host key and update known_hosts? (yes/no): ");

        let action = match lines.next_line().await {
            Ok(Some(answer)) if answer.trim().eq_ignore_ascii_case("yes") => HostKeyAction::Accept,
            Ok(_) => HostKeyAction::Reject,
            Err(e) => {
                warn!("[Tunnel] Failed to read answer: {}", e);
                HostKeyAction::Reject
            }
        };
        if prompt.respond.send(action).is_err() {
            warn!("[Tunnel] Host key prompt expired before it was answered");
        }
    }
}
