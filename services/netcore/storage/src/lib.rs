//! Rotating symmetric key store for netcore.
//!
//! Keys are addressed by `(bucket, handle)`: the bucket groups keys by
//! purpose, the handle names one key inside it. Both are compared exactly
//! (case-sensitive). A pair can be stored once; rotation means storing a new
//! handle and letting old keys expire. The store never purges expired keys,
//! callers filter by validity instead.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Key store errors
#[derive(Error, Debug)]
pub enum KeyStoreError {
    /// Empty bucket or handle
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The `(bucket, handle)` pair already exists
    #[error("Key {bucket}/{handle} already exists")]
    Collision {
        /// Bucket of the existing key
        bucket: String,
        /// Handle of the existing key
        handle: String,
    },
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Symmetric key with its validity window
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoKey {
    /// Secret key bytes
    #[serde(with = "hex_material")]
    pub material: Vec<u8>,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Expiry time
    pub expires: DateTime<Utc>,
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoKey")
            .field("material", &format_args!("<{} bytes>", self.material.len()))
            .field("created", &self.created)
            .field("expires", &self.expires)
            .finish()
    }
}

impl CryptoKey {
    /// Create a key from existing material
    pub fn new(material: Vec<u8>, created: DateTime<Utc>, expires: DateTime<Utc>) -> Self {
        Self {
            material,
            created,
            expires,
        }
    }

    /// Generate `len` random bytes valid from `created` for `lifetime`
    pub fn generate(len: usize, created: DateTime<Utc>, lifetime: Duration) -> Self {
        let mut material = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut material);
        Self::new(material, created, created + lifetime)
    }

    /// Whether `at` falls inside `[created, expires)`
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.created <= at && at < self.expires
    }
}

mod hex_material {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// Bucket/handle addressed key store
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Get one key, `None` if absent
    async fn get_key(&self, bucket: &str, handle: &str) -> Result<Option<CryptoKey>, KeyStoreError>;

    /// All keys of a bucket ordered by descending expiry (ties by handle).
    /// An unknown bucket yields an empty list.
    async fn get_keys(&self, bucket: &str) -> Result<Vec<(String, CryptoKey)>, KeyStoreError>;

    /// Store a key; fails with [`KeyStoreError::Collision`] if the pair exists
    async fn store_key(&self, bucket: &str, handle: &str, key: CryptoKey) -> Result<(), KeyStoreError>;

    /// Remove a key; absent keys are ignored
    async fn remove_key(&self, bucket: &str, handle: &str) -> Result<(), KeyStoreError>;

    /// Newest-expiring key of `bucket` that is valid at `now`
    async fn newest_valid_key(
        &self,
        bucket: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(String, CryptoKey)>, KeyStoreError> {
        Ok(self
            .get_keys(bucket)
            .await?
            .into_iter()
            .find(|(_, key)| key.is_valid_at(now)))
    }
}

pub(crate) fn check_bucket(bucket: &str) -> Result<(), KeyStoreError> {
    if bucket.is_empty() {
        return Err(KeyStoreError::InvalidArgument("bucket must not be empty"));
    }
    Ok(())
}

pub(crate) fn check_address(bucket: &str, handle: &str) -> Result<(), KeyStoreError> {
    check_bucket(bucket)?;
    if handle.is_empty() {
        return Err(KeyStoreError::InvalidArgument("handle must not be empty"));
    }
    Ok(())
}

pub(crate) fn order_by_expiry(keys: &mut [(String, CryptoKey)]) {
    keys.sort_by(|(ha, a), (hb, b)| b.expires.cmp(&a.expires).then_with(|| ha.cmp(hb)));
}

/// Key store backend configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StorageMode {
    /// In-memory storage, lost on restart
    #[default]
    InMemory,
    /// JSON document on disk
    File {
        /// Path of the key file
        path: PathBuf,
    },
}

// Re-export backend implementations
pub use backend::file::FileKeyStore;
pub use backend::mem::MemoryKeyStore;

/// Open the key store described by `mode`
pub async fn open_key_store(mode: &StorageMode) -> Result<Arc<dyn KeyStore>, KeyStoreError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemoryKeyStore::new())),
        StorageMode::File { path } => Ok(Arc::new(FileKeyStore::open(path.clone()).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_expiring_in(hours: i64, now: DateTime<Utc>) -> CryptoKey {
        CryptoKey::new(vec![hours as u8; 16], now - Duration::hours(1), now + Duration::hours(hours))
    }

    #[test]
    fn test_key_validity_window() {
        let now = Utc::now();
        let key = CryptoKey::generate(32, now, Duration::minutes(10));
        assert_eq!(key.material.len(), 32);
        assert!(key.is_valid_at(now));
        assert!(key.is_valid_at(now + Duration::minutes(9)));
        assert!(!key.is_valid_at(now + Duration::minutes(10)));
        assert!(!key.is_valid_at(now - Duration::seconds(1)));
    }

    #[test]
    fn test_key_serializes_material_as_hex() {
        let now = Utc::now();
        let key = CryptoKey::new(vec![0xde, 0xad, 0xbe, 0xef], now, now + Duration::hours(1));
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains("\"deadbeef\""));
        let back: CryptoKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(!format!("{:?}", key).contains("deadbeef"));
    }

    #[tokio::test]
    async fn test_newest_valid_key_skips_expired() {
        let now = Utc::now();
        let store = MemoryKeyStore::new();
        store.store_key("sig", "old", key_expiring_in(1, now)).await.unwrap();
        store.store_key("sig", "new", key_expiring_in(5, now)).await.unwrap();

        let (handle, _) = store.newest_valid_key("sig", now).await.unwrap().unwrap();
        assert_eq!(handle, "new");

        let later = now + Duration::hours(6);
        assert!(store.newest_valid_key("sig", later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_key_store_modes() {
        let store = open_key_store(&StorageMode::InMemory).await.unwrap();
        assert!(store.get_keys("any").await.unwrap().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let mode = StorageMode::File {
            path: dir.path().join("keys.json"),
        };
        let store = open_key_store(&mode).await.unwrap();
        store
            .store_key("b", "h", key_expiring_in(1, Utc::now()))
            .await
            .unwrap();
        assert!(dir.path().join("keys.json").exists());
    }
}
