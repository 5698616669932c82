// 主机身份信任库（Known Hosts）
//
// 持久化 (host, port) → 指纹 映射，判断远端身份是新主机、匹配还是发生变化。
// 本模块从不自行接受变化后的身份，`store` 只在 NewHost 或用户明确确认后调用。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::models::known_hosts::{host_key, FINGERPRINT_PREFIX};
use crate::models::TrustRecord;
use crate::services::storage;

/// 校验结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// 信任库中没有该主机
    NewHost,
    /// 指纹匹配
    Valid,
    /// 指纹不匹配（可能遭受中间人攻击）
    Changed { expected: String },
}

/// 计算身份字节的指纹：`SHA256:` + 无填充 base64
pub fn fingerprint(identity: &[u8]) -> String {
    let digest = Sha256::digest(identity);
    format!("{}{}", FINGERPRINT_PREFIX, STANDARD_NO_PAD.encode(digest))
}

/// 信任库
///
/// 查询与写入在同一把锁下互斥；写入后立即原子保存到磁盘。
pub struct KnownHostsStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, String>>,
}

impl KnownHostsStore {
    /// 从文件加载；文件不存在或损坏时得到空信任库（记录日志，不报错）
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match Self::read_entries(&path) {
            Ok(entries) => {
                debug!(
                    "[KnownHosts] Loaded {} entries from {}",
                    entries.len(),
                    path.display()
                );
                entries
            }
            Err(e) => {
                warn!(
                    "[KnownHosts] Ignoring unreadable known hosts file {}: {:#}",
                    path.display(),
                    e
                );
                BTreeMap::new()
            }
        };

        Self {
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    /// 不落盘的信任库
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read_entries(path: &Path) -> Result<BTreeMap<String, String>> {
        let mut entries = BTreeMap::new();
        if !path.exists() {
            return Ok(entries);
        }

        let content = fs::read_to_string(path).context("无法读取 known_hosts 文件")?;
        for (index, line) in content.lines().enumerate() {
            let record = TrustRecord::parse_line(line)
                .map_err(|e| anyhow::anyhow!("line {}: {}", index + 1, e))?;
            if let Some(record) = record {
                entries.insert(record.host_key, record.fingerprint);
            }
        }
        Ok(entries)
    }

    /// 校验远端身份
    pub fn validate(&self, host: &str, port: u16, identity: &[u8]) -> HostKeyStatus {
        let actual = fingerprint(identity);
        let key = host_key(host, port);
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        match entries.get(&key) {
            None => HostKeyStatus::NewHost,
            Some(expected) if *expected == actual => HostKeyStatus::Valid,
            Some(expected) => HostKeyStatus::Changed {
                expected: expected.clone(),
            },
        }
    }

    /// 无条件写入指纹并保存
    ///
    /// 内存中的记录总是更新；落盘失败返回错误，由调用方决定是否继续。
    pub fn store(&self, host: &str, port: u16, identity: &[u8]) -> Result<()> {
        let record = TrustRecord::new(host, port, fingerprint(identity));
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let previous = entries.insert(record.host_key.clone(), record.fingerprint.clone());
        match previous {
            Some(old) if old == record.fingerprint => return Ok(()),
            Some(old) => info!(
                "[KnownHosts] Replaced fingerprint for {}: {} -> {}",
                record.host_key, old, record.fingerprint
            ),
            None => info!(
                "[KnownHosts] Added {} {}",
                record.host_key, record.fingerprint
            ),
        }

        self.save_locked(&entries)
    }

    /// 查询已保存的指纹
    pub fn lookup(&self, host: &str, port: u16) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&host_key(host, port)).cloned()
    }

    /// 删除记录，返回是否存在
    pub fn remove(&self, host: &str, port: u16) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let key = host_key(host, port);
        if entries.remove(&key).is_none() {
            return Ok(false);
        }
        info!("[KnownHosts] Removed {}", key);
        self.save_locked(&entries)?;
        Ok(true)
    }

    /// 列出所有记录
    pub fn list(&self) -> Vec<TrustRecord> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .map(|(host_key, fingerprint)| TrustRecord {
                host_key: host_key.clone(),
                fingerprint: fingerprint.clone(),
            })
            .collect()
    }

    fn save_locked(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut content = String::from("# shellmaster-tunnel known hosts\n");
        for (host_key, fingerprint) in entries {
            content.push_str(&format!("{} {}\n", host_key, fingerprint));
        }
        storage::write_atomic(path, content.as_bytes())
            .with_context(|| format!("无法保存 known_hosts 文件 {}", path.display()))
    }
}
