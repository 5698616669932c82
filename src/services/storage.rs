// 本地数据持久化服务

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::constants::{files, APP_DIR_NAME};
use crate::models::TunnelSettings;

/// 获取配置目录路径
/// macOS: ~/Library/Application Support/shellmaster-tunnel
/// Linux: ~/.config/shellmaster-tunnel
/// Windows: C:\Users\<用户名>\AppData\Roaming\shellmaster-tunnel
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("无法获取系统配置目录")?
        .join(APP_DIR_NAME);
    ensure_dir(&config_dir)?;
    Ok(config_dir)
}

/// 确保目录存在
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).with_context(|| format!("无法创建目录 {}", dir.display()))?;
    }
    Ok(())
}

pub fn settings_file(config_dir: &Path) -> PathBuf {
    config_dir.join(files::SETTINGS)
}

pub fn credentials_file(config_dir: &Path) -> PathBuf {
    config_dir.join(files::CREDENTIALS)
}

pub fn known_hosts_file(config_dir: &Path) -> PathBuf {
    config_dir.join(files::KNOWN_HOSTS)
}

pub fn keys_dir(config_dir: &Path) -> PathBuf {
    config_dir.join(files::KEYS_DIR)
}

/// 原子写入：先写同目录临时文件并 fsync，再 rename 覆盖
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    ensure_dir(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("无效的文件路径")?;
    let tmp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("无法创建临时文件 {}", tmp_path.display()))?;
        file.write_all(content).context("无法写入临时文件")?;
        file.sync_all().context("无法同步临时文件")?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("无法替换文件 {}", path.display()))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

// ======================== Settings 配置持久化 ========================

/// 加载隧道设置（文件不存在时返回默认值）
pub fn load_settings(config_dir: &Path) -> Result<TunnelSettings> {
    let path = settings_file(config_dir);
    if !path.exists() {
        return Ok(TunnelSettings::default());
    }
    let content = fs::read_to_string(&path).context("无法读取设置配置文件")?;
    let settings: TunnelSettings =
        serde_json::from_str(&content).context("无法解析设置配置文件")?;
    Ok(settings)
}

/// 保存隧道设置
pub fn save_settings(config_dir: &Path, settings: &TunnelSettings) -> Result<()> {
    let content = serde_json::to_string_pretty(settings).context("无法序列化设置配置")?;
    write_atomic(&settings_file(config_dir), content.as_bytes())
}
