// 数据模型模块

pub mod credential;
pub mod endpoint;
pub mod known_hosts;
pub mod settings;

pub use credential::{Credential, CredentialsConfig};
pub use endpoint::{Endpoint, SessionRequest};
pub use known_hosts::TrustRecord;
pub use settings::{
    ConnectionSettings, ForwardSettings, ProxySettings, ProxyType, ReconnectPolicy,
    ReconnectSettings, TunnelSettings,
};
