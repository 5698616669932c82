// 服务层：持久化、凭据目录、信任库与 Key Vault

pub mod credentials;
pub mod known_hosts;
pub mod storage;
pub mod vault;

pub use credentials::{CredentialCatalog, CredentialSource};
pub use known_hosts::{fingerprint, HostKeyStatus, KnownHostsStore};
pub use vault::{EncryptedBlob, FileKeyStore, KeyVault, MasterKeyStore, MemoryKeyStore, VaultError};
