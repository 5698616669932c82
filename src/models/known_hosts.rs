// Known Hosts 数据模型
// 每行一条 `<hostkey> <fingerprint>` 记录

use crate::constants::DEFAULT_SSH_PORT;

/// 已知主机条目
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustRecord {
    /// 默认端口时为 `host`，否则为 `[host]:port`
    pub host_key: String,
    /// SHA256 指纹
    pub fingerprint: String,
}

impl TrustRecord {
    pub fn new(host: &str, port: u16, fingerprint: impl Into<String>) -> Self {
        Self {
            host_key: host_key(host, port),
            fingerprint: fingerprint.into(),
        }
    }

    /// 解析一行记录；空行与 `#` 注释返回 `Ok(None)`
    pub fn parse_line(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut parts = line.split_whitespace();
        let (Some(host_key), Some(fingerprint), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("expected `<hostkey> <fingerprint>`, got {:?}", line));
        };

        if !fingerprint.starts_with(FINGERPRINT_PREFIX) {
            return Err(format!("unsupported fingerprint format: {}", fingerprint));
        }

        Ok(Some(Self {
            host_key: host_key.to_string(),
            fingerprint: fingerprint.to_string(),
        }))
    }

    pub fn to_line(&self) -> String {
        format!("{} {}", self.host_key, self.fingerprint)
    }
}

/// 指纹文本前缀
pub const FINGERPRINT_PREFIX: &str = "SHA256:";

/// 生成信任库主机键
pub fn host_key(host: &str, port: u16) -> String {
    let host = host.to_ascii_lowercase();
    if port == DEFAULT_SSH_PORT {
        host
    } else {
        format!("[{}]:{}", host, port)
    }
}
