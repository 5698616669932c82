// 远端主机身份
//
// 按算法标签选择有限的几种密钥类型，所有类型都使用 SSH wire 格式的公钥 blob
// 作为规范字节，交给指纹函数计算。

use std::fmt;

use russh::keys::PublicKey;

use super::error::TunnelError;
use crate::services::known_hosts::fingerprint;

/// ECDSA 曲线
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EcdsaCurve {
    NistP256,
    NistP384,
    NistP521,
}

/// 支持的主机密钥算法
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Ed25519,
    Rsa,
    Ecdsa(EcdsaCurve),
}

impl KeyAlgorithm {
    /// 根据 SSH 算法标签解析
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ssh-ed25519" => Some(Self::Ed25519),
            "ssh-rsa" | "rsa-sha2-256" | "rsa-sha2-512" => Some(Self::Rsa),
            "ecdsa-sha2-nistp256" => Some(Self::Ecdsa(EcdsaCurve::NistP256)),
            "ecdsa-sha2-nistp384" => Some(Self::Ecdsa(EcdsaCurve::NistP384)),
            "ecdsa-sha2-nistp521" => Some(Self::Ecdsa(EcdsaCurve::NistP521)),
            _ => None,
        }
    }

    /// 公钥 blob 中的算法名
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ed25519 => "ssh-ed25519",
            Self::Rsa => "ssh-rsa",
            Self::Ecdsa(EcdsaCurve::NistP256) => "ecdsa-sha2-nistp256",
            Self::Ecdsa(EcdsaCurve::NistP384) => "ecdsa-sha2-nistp384",
            Self::Ecdsa(EcdsaCurve::NistP521) => "ecdsa-sha2-nistp521",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// 主机身份：算法 + 规范字节
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostIdentity {
    algorithm: KeyAlgorithm,
    blob: Vec<u8>,
}

impl HostIdentity {
    /// 由规范字节构造，校验 blob 开头的算法名与声明一致
    pub fn new(algorithm: KeyAlgorithm, blob: Vec<u8>) -> Result<Self, TunnelError> {
        let declared = read_ssh_string(&blob).ok_or_else(|| {
            TunnelError::Network("malformed host key blob".to_string())
        })?;
        if declared != algorithm.tag().as_bytes() {
            return Err(TunnelError::Network(format!(
                "host key blob declares {:?}, expected {}",
                String::from_utf8_lossy(declared),
                algorithm
            )));
        }
        Ok(Self { algorithm, blob })
    }

    /// 从 russh 提供的服务器公钥构造
    pub fn from_public_key(key: &PublicKey) -> Result<Self, TunnelError> {
        let tag = key.algorithm();
        let algorithm = KeyAlgorithm::from_tag(tag.as_str()).ok_or_else(|| {
            TunnelError::Network(format!("unsupported host key algorithm: {}", tag.as_str()))
        })?;
        let blob = key
            .to_bytes()
            .map_err(|e| TunnelError::Network(format!("failed to encode host key: {}", e)))?;
        Self::new(algorithm, blob)
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// 规范字节（SSH wire 格式公钥）
    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.blob)
    }
}

/// 读取 SSH string（4 字节大端长度 + 内容）
fn read_ssh_string(buf: &[u8]) -> Option<&[u8]> {
    let len_bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    buf.get(4..4usize.checked_add(len)?)
}
