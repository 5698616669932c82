// 代理连接模块
// 支持 HTTP CONNECT 和 SOCKS5 代理（单跳）

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::TunnelError;
use crate::models::{ProxySettings, ProxyType};

/// 通过代理连接到目标主机
pub async fn connect_via_proxy(
    proxy: &ProxySettings,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    let proxy_addr = resolve(&proxy.host, proxy.port).await?;

    match proxy.proxy_type {
        ProxyType::Socks5 => {
            connect_socks5(proxy_addr, proxy, target_host, target_port, connect_timeout).await
        }
        ProxyType::Http => {
            connect_http(proxy_addr, proxy, target_host, target_port, connect_timeout).await
        }
    }
}

/// DNS 解析，取第一个地址
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TunnelError> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TunnelError::Network(format!("Failed to resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| TunnelError::Network(format!("No address found for {}:{}", host, port)))
}

fn credentials(proxy: &ProxySettings) -> Option<(&str, &str)> {
    match (&proxy.username, &proxy.password) {
        (Some(user), Some(pass)) if !user.is_empty() => Some((user.as_str(), pass.as_str())),
        (Some(user), None) if !user.is_empty() => Some((user.as_str(), "")),
        _ => None,
    }
}

/// 通过 SOCKS5 代理连接
async fn connect_socks5(
    proxy_addr: SocketAddr,
    proxy: &ProxySettings,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    use tokio_socks::tcp::Socks5Stream;

    let target = (target_host, target_port);

    let stream = if let Some((username, password)) = credentials(proxy) {
        timeout(
            connect_timeout,
            Socks5Stream::connect_with_password(proxy_addr, target, username, password),
        )
        .await
        .map_err(|_| TunnelError::timeout("SOCKS5 proxy connection", connect_timeout))?
        .map_err(socks5_error)?
    } else {
        timeout(connect_timeout, Socks5Stream::connect(proxy_addr, target))
            .await
            .map_err(|_| TunnelError::timeout("SOCKS5 proxy connection", connect_timeout))?
            .map_err(socks5_error)?
    };

    Ok(stream.into_inner())
}

/// 通过 HTTP CONNECT 代理连接
async fn connect_http(
    proxy_addr: SocketAddr,
    proxy: &ProxySettings,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    use async_http_proxy::{http_connect_tokio, http_connect_tokio_with_basic_auth};

    let mut stream = timeout(connect_timeout, TcpStream::connect(proxy_addr))
        .await
        .map_err(|_| TunnelError::timeout("HTTP proxy connection", connect_timeout))?
        .map_err(|e| TunnelError::Network(format!("Failed to connect to HTTP proxy: {}", e)))?;

    if let Some((username, password)) = credentials(proxy) {
        timeout(
            connect_timeout,
            http_connect_tokio_with_basic_auth(
                &mut stream,
                target_host,
                target_port,
                username,
                password,
            ),
        )
        .await
        .map_err(|_| TunnelError::timeout("HTTP CONNECT tunnel", connect_timeout))?
        .map_err(http_connect_error)?;
    } else {
        timeout(
            connect_timeout,
            http_connect_tokio(&mut stream, target_host, target_port),
        )
        .await
        .map_err(|_| TunnelError::timeout("HTTP CONNECT tunnel", connect_timeout))?
        .map_err(http_connect_error)?;
    }

    Ok(stream)
}

/// 代理拒绝凭据属于认证错误，不参与自动重试
fn socks5_error(e: tokio_socks::Error) -> TunnelError {
    match e {
        tokio_socks::Error::PasswordAuthFailure(code) => TunnelError::Authentication(format!(
            "SOCKS5 proxy rejected credentials (code {})",
            code
        )),
        tokio_socks::Error::NoAcceptableAuthMethods => TunnelError::Authentication(
            "SOCKS5 proxy accepted none of the offered auth methods".to_string(),
        ),
        e => TunnelError::Network(format!("SOCKS5 proxy connection failed: {}", e)),
    }
}

fn http_connect_error(e: async_http_proxy::HttpError) -> TunnelError {
    match e {
        async_http_proxy::HttpError::HttpCode200(407) => TunnelError::Authentication(
            "HTTP proxy authentication failed (407)".to_string(),
        ),
        e => TunnelError::Network(format!("HTTP CONNECT tunnel failed: {}", e)),
    }
}
