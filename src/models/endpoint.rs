// Endpoint 与会话启动请求

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_SSH_PORT;

/// 远端目标（会话期间不可变）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// 会话启动请求
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub credential_id: String,
}

impl SessionRequest {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        credential_id: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            credential_id: credential_id.into(),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
        }
    }

    /// 基本字段校验
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.user.trim().is_empty() {
            return Err("user must not be empty".to_string());
        }
        if self.credential_id.trim().is_empty() {
            return Err("credential id must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must be non-zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_defaults_to_22() {
        let req: SessionRequest =
            serde_json::from_str(r#"{"host":"h1","user":"alice","credential_id":"k1"}"#).unwrap();
        assert_eq!(req.port, 22);
        assert_eq!(req.endpoint().to_string(), "alice@h1:22");
    }

    #[test]
    fn rejects_empty_fields() {
        assert!(SessionRequest::new("", 22, "alice", "k1").validate().is_err());
        assert!(SessionRequest::new("h1", 22, " ", "k1").validate().is_err());
        assert!(SessionRequest::new("h1", 0, "alice", "k1").validate().is_err());
        assert!(SessionRequest::new("h1", 2222, "alice", "k1").validate().is_ok());
    }
}
