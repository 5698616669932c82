// 私钥加密存储（Key Vault）
//
// 使用 AES-256-GCM 加密凭据私钥，主密钥按 key id 隔离保存在平台密钥库中。
// 删除凭据时必须同时调用 `invalidate` 销毁主密钥，使密文永久不可恢复。

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// AES-GCM IV 长度
pub const IV_SIZE: usize = 12;

/// 主密钥长度（256 位）
pub const MASTER_KEY_SIZE: usize = 32;

pub type MasterKey = Zeroizing<[u8; MASTER_KEY_SIZE]>;

/// Key Vault 错误
#[derive(Debug, Error)]
pub enum VaultError {
    /// 密钥库不可用或已损坏
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// 密文、IV 或认证标签不匹配
    #[error("Decryption failed: {0}")]
    Decryption(String),
}

/// 加密结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
}

/// 平台主密钥存储
pub trait MasterKeyStore: Send + Sync {
    /// 读取主密钥，不存在时返回 `None`
    fn load(&self, key_id: &str) -> Result<Option<MasterKey>, VaultError>;
    /// 生成并保存新的主密钥
    fn create(&self, key_id: &str) -> Result<MasterKey, VaultError>;
    /// 销毁主密钥（不存在时视为成功）
    fn delete(&self, key_id: &str) -> Result<(), VaultError>;
}

/// Key Vault
pub struct KeyVault {
    store: Arc<dyn MasterKeyStore>,
    /// 串行化 "读取或创建" 主密钥，避免并发创建互相覆盖
    provision_lock: Mutex<()>,
}

impl KeyVault {
    pub fn new(store: Arc<dyn MasterKeyStore>) -> Self {
        Self {
            store,
            provision_lock: Mutex::new(()),
        }
    }

    /// 加密明文，每次调用生成新的随机 IV
    pub fn protect(&self, key_id: &str, plaintext: &[u8]) -> Result<EncryptedBlob, VaultError> {
        let master_key = self.load_or_create(key_id)?;
        let cipher = Aes256Gcm::new_from_slice(&master_key[..])
            .map_err(|e| VaultError::Encryption(format!("invalid master key: {}", e)))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        debug!("[Vault] Protected {} bytes for key '{}'", plaintext.len(), key_id);
        Ok(EncryptedBlob {
            ciphertext,
            iv: nonce.to_vec(),
        })
    }

    /// 解密密文；任何不匹配都返回 `Decryption`，绝不返回垃圾数据
    pub fn unprotect(
        &self,
        key_id: &str,
        ciphertext: &[u8],
        iv: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        if iv.len() != IV_SIZE {
            return Err(VaultError::Decryption(format!(
                "invalid IV length: expected {}, got {}",
                IV_SIZE,
                iv.len()
            )));
        }

        let master_key = self
            .store
            .load(key_id)?
            .ok_or_else(|| VaultError::Decryption(format!("no master key for '{}'", key_id)))?;
        let cipher = Aes256Gcm::new_from_slice(&master_key[..])
            .map_err(|e| VaultError::Decryption(format!("invalid master key: {}", e)))?;

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: ciphertext,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Decryption("authentication tag mismatch".to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }

    /// 销毁 key id 对应的主密钥
    pub fn invalidate(&self, key_id: &str) -> Result<(), VaultError> {
        let _guard = self.provision_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.store.delete(key_id)?;
        info!("[Vault] Master key for '{}' destroyed", key_id);
        Ok(())
    }

    fn load_or_create(&self, key_id: &str) -> Result<MasterKey, VaultError> {
        let _guard = self.provision_lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.store.load(key_id)? {
            Some(key) => Ok(key),
            None => {
                info!("[Vault] Creating master key for '{}'", key_id);
                self.store.create(key_id)
            }
        }
    }
}

fn random_master_key() -> MasterKey {
    let mut key = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
    rand::rngs::OsRng.fill_bytes(&mut key[..]);
    key
}

// ======================== 文件主密钥存储 ========================

/// 基于文件的主密钥存储
///
/// 每个 key id 一个文件，文件名为 key id 的 SHA-256 十六进制摘要，Unix 下权限 0600。
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, key_id: &str) -> PathBuf {
        let digest = Sha256::digest(key_id.as_bytes());
        let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.key", name))
    }
}

impl MasterKeyStore for FileKeyStore {
    fn load(&self, key_id: &str) -> Result<Option<MasterKey>, VaultError> {
        let path = self.key_path(key_id);
        if !path.exists() {
            return Ok(None);
        }

        let bytes = Zeroizing::new(fs::read(&path).map_err(|e| {
            VaultError::Encryption(format!("key store unavailable ({}): {}", path.display(), e))
        })?);
        if bytes.len() != MASTER_KEY_SIZE {
            warn!("[Vault] Corrupted master key file {}", path.display());
            return Err(VaultError::Encryption(format!(
                "corrupted master key for '{}' ({} bytes)",
                key_id,
                bytes.len()
            )));
        }

        let mut key = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
        key.copy_from_slice(&bytes);
        Ok(Some(key))
    }

    fn create(&self, key_id: &str) -> Result<MasterKey, VaultError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            VaultError::Encryption(format!("key store unavailable ({}): {}", self.dir.display(), e))
        })?;

        let key = random_master_key();
        write_private_file(&self.key_path(key_id), &key[..])
            .map_err(|e| VaultError::Encryption(format!("failed to persist master key: {}", e)))?;
        Ok(key)
    }

    fn delete(&self, key_id: &str) -> Result<(), VaultError> {
        let path = self.key_path(key_id);
        if !path.exists() {
            return Ok(());
        }
        // 先覆盖再删除
        let _ = fs::write(&path, [0u8; MASTER_KEY_SIZE]);
        fs::remove_file(&path)
            .map_err(|e| VaultError::Encryption(format!("failed to delete master key: {}", e)))
    }
}

/// 以 0600 权限写入临时文件后 rename
fn write_private_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let result = (|| {
        let mut file = options.open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

// ======================== 内存主密钥存储 ========================

/// 进程内主密钥存储（测试或临时会话使用）
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, [u8; MASTER_KEY_SIZE]>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MasterKeyStore for MemoryKeyStore {
    fn load(&self, key_id: &str) -> Result<Option<MasterKey>, VaultError> {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys.get(key_id).map(|k| Zeroizing::new(*k)))
    }

    fn create(&self, key_id: &str) -> Result<MasterKey, VaultError> {
        let key = random_master_key();
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key_id.to_string(), *key);
        Ok(key)
    }

    fn delete(&self, key_id: &str) -> Result<(), VaultError> {
        if let Some(mut key) = self
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key_id)
        {
            zeroize::Zeroize::zeroize(&mut key);
        }
        Ok(())
    }
}
