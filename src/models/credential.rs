// 凭据记录（私钥始终以密文形式存储）

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 一对非对称密钥，私钥部分只保存 AES-GCM 密文
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub encrypted_private_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    /// 公钥 SHA256 指纹
    pub public_fingerprint: String,
    #[serde(default)]
    pub created_at: String,
}

/// 凭据目录文件结构
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub credentials: Vec<Credential>,
}

/// 字节数组以 base64 文本持久化
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
