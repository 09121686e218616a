//! Credential Storage
//!
//! The engine never owns persistent state itself. It reads and writes the
//! pairing code, the paired address and the long-lived derived secret
//! through a [`CredentialStore`].
//!
//! Two stores are provided:
//! - [`MemoryCredentialStore`] for tests and hosts with their own persistence
//! - [`FileCredentialStore`], a JSON file rewritten on every change

use crate::transport::PumpAddress;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Size of the derived secret in bytes
pub const DERIVED_SECRET_LEN: usize = 32;

/// Long-lived secret produced by a bootstrap handshake
///
/// Replayed in confirmation mode so the pump does not need to show its
/// pairing screen again. The `Debug` output never reveals the bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DerivedSecret([u8; DERIVED_SECRET_LEN]);

impl DerivedSecret {
    pub fn new(bytes: [u8; DERIVED_SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DERIVED_SECRET_LEN] {
        &self.0
    }

    /// Parse a hex-encoded secret
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Configuration` if the string is not 64 hex
    /// characters.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded)
            .map_err(|e| ProtocolError::Configuration(format!("Invalid derived secret: {}", e)))?;
        let bytes: [u8; DERIVED_SECRET_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            ProtocolError::Configuration(format!(
                "Derived secret must be {} bytes, got {}",
                DERIVED_SECRET_LEN,
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Debug for DerivedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedSecret(<redacted>)")
    }
}

impl TryFrom<String> for DerivedSecret {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<DerivedSecret> for String {
    fn from(secret: DerivedSecret) -> Self {
        secret.to_hex()
    }
}

/// Persistent pairing state the engine depends on
#[async_trait]
pub trait CredentialStore: Send + Sync + Debug {
    /// Pairing code entered by the user, if any
    async fn pairing_code(&self) -> Result<Option<String>>;

    /// Whether a pairing has been completed and saved
    async fn is_paired(&self) -> Result<bool>;

    async fn derived_secret(&self) -> Result<Option<DerivedSecret>>;

    async fn save_derived_secret(&self, secret: &DerivedSecret) -> Result<()>;

    async fn clear_derived_secret(&self) -> Result<()>;

    async fn paired_address(&self) -> Result<Option<PumpAddress>>;

    /// Record a completed pairing
    async fn save_pairing(&self, address: &PumpAddress, pairing_code: &str) -> Result<()>;

    /// Forget the pairing, including the derived secret
    async fn clear_pairing(&self) -> Result<()>;
}

/// On-disk and in-memory representation of the stored credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub pairing_code: Option<String>,
    #[serde(default)]
    pub derived_secret: Option<DerivedSecret>,
}

impl StoredCredentials {
    fn paired_address(&self) -> Result<Option<PumpAddress>> {
        self.address.as_deref().map(PumpAddress::parse).transpose()
    }
}

/// Credentials held in memory only
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    state: RwLock<StoredCredentials>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing pairing
    pub fn with_pairing(address: &PumpAddress, pairing_code: &str) -> Self {
        Self {
            state: RwLock::new(StoredCredentials {
                address: Some(address.to_string()),
                pairing_code: Some(pairing_code.to_string()),
                derived_secret: None,
            }),
        }
    }

    pub async fn snapshot(&self) -> StoredCredentials {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn pairing_code(&self) -> Result<Option<String>> {
        Ok(self.state.read().await.pairing_code.clone())
    }

    async fn is_paired(&self) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.address.is_some() && state.pairing_code.is_some())
    }

    async fn derived_secret(&self) -> Result<Option<DerivedSecret>> {
        Ok(self.state.read().await.derived_secret.clone())
    }

    async fn save_derived_secret(&self, secret: &DerivedSecret) -> Result<()> {
        self.state.write().await.derived_secret = Some(secret.clone());
        Ok(())
    }

    async fn clear_derived_secret(&self) -> Result<()> {
        self.state.write().await.derived_secret = None;
        Ok(())
    }

    async fn paired_address(&self) -> Result<Option<PumpAddress>> {
        self.state.read().await.paired_address()
    }

    async fn save_pairing(&self, address: &PumpAddress, pairing_code: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.address = Some(address.to_string());
        state.pairing_code = Some(pairing_code.to_string());
        Ok(())
    }

    async fn clear_pairing(&self) -> Result<()> {
        *self.state.write().await = StoredCredentials::default();
        Ok(())
    }
}

/// Credentials persisted as a JSON file
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    cache: RwLock<StoredCredentials>,
}

impl FileCredentialStore {
    /// Open (or lazily create) the credential file at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cache = if fs::try_exists(&path).await? {
            let json = fs::read_to_string(&path).await?;
            let stored: StoredCredentials = serde_json::from_str(&json)?;
            info!("Loaded pump credentials from {}", path.display());
            stored
        } else {
            debug!("No credential file at {}, starting unpaired", path.display());
            StoredCredentials::default()
        };

        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    /// Default location under the user's data directory
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("pumplink")
            .join("credentials.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut StoredCredentials),
    {
        let mut cache = self.cache.write().await;
        let mut next = cache.clone();
        change(&mut next);
        self.persist(&next).await?;
        *cache = next;
        Ok(())
    }

    async fn persist(&self, stored: &StoredCredentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(stored)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!("Persisted pump credentials to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn pairing_code(&self) -> Result<Option<String>> {
        Ok(self.cache.read().await.pairing_code.clone())
    }

    async fn is_paired(&self) -> Result<bool> {
        let cache = self.cache.read().await;
        Ok(cache.address.is_some() && cache.pairing_code.is_some())
    }

    async fn derived_secret(&self) -> Result<Option<DerivedSecret>> {
        Ok(self.cache.read().await.derived_secret.clone())
    }

    async fn save_derived_secret(&self, secret: &DerivedSecret) -> Result<()> {
        let secret = secret.clone();
        self.update(move |s| s.derived_secret = Some(secret)).await
    }

    async fn clear_derived_secret(&self) -> Result<()> {
        self.update(|s| s.derived_secret = None).await
    }

    async fn paired_address(&self) -> Result<Option<PumpAddress>> {
        self.cache.read().await.paired_address()
    }

    async fn save_pairing(&self, address: &PumpAddress, pairing_code: &str) -> Result<()> {
        let address = address.to_string();
        let pairing_code = pairing_code.to_string();
        self.update(move |s| {
            s.address = Some(address);
            s.pairing_code = Some(pairing_code);
        })
        .await
    }

    async fn clear_pairing(&self) -> Result<()> {
        self.update(|s| *s = StoredCredentials::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn address() -> PumpAddress {
        PumpAddress::parse("00:11:22:33:44:55").unwrap()
    }

    #[test]
    fn test_derived_secret_hex_and_redaction() {
        let secret = DerivedSecret::new([0xab; DERIVED_SECRET_LEN]);
        let parsed = DerivedSecret::from_hex(&secret.to_hex()).unwrap();
        assert_eq!(parsed, secret);
        assert_eq!(format!("{:?}", secret), "DerivedSecret(<redacted>)");

        assert!(DerivedSecret::from_hex("abcd").is_err());
        assert!(DerivedSecret::from_hex("not hex").is_err());
    }

    #[tokio::test]
    async fn test_memory_store_lifecycle() {
        let store = MemoryCredentialStore::new();
        assert!(!store.is_paired().await.unwrap());

        store.save_pairing(&address(), "482913").await.unwrap();
        store
            .save_derived_secret(&DerivedSecret::new([1; DERIVED_SECRET_LEN]))
            .await
            .unwrap();
        assert!(store.is_paired().await.unwrap());
        assert_eq!(store.paired_address().await.unwrap(), Some(address()));

        store.clear_derived_secret().await.unwrap();
        assert!(store.derived_secret().await.unwrap().is_none());
        assert!(store.is_paired().await.unwrap());

        store.clear_pairing().await.unwrap();
        assert_eq!(store.snapshot().await, StoredCredentials::default());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("credentials.json");
        let secret = DerivedSecret::new([7; DERIVED_SECRET_LEN]);

        {
            let store = FileCredentialStore::open(&path).await.unwrap();
            assert!(!store.is_paired().await.unwrap());
            store.save_pairing(&address(), "482913").await.unwrap();
            store.save_derived_secret(&secret).await.unwrap();
        }

        {
            let store = FileCredentialStore::open(&path).await.unwrap();
            assert!(store.is_paired().await.unwrap());
            assert_eq!(store.pairing_code().await.unwrap().as_deref(), Some("482913"));
            assert_eq!(store.derived_secret().await.unwrap(), Some(secret));

            store.clear_pairing().await.unwrap();
        }

        let store = FileCredentialStore::open(&path).await.unwrap();
        assert!(!store.is_paired().await.unwrap());
        assert!(store.derived_secret().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("credentials.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = FileCredentialStore::open(&path).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }
}
