//! File-backed key store

use crate::{check_address, check_bucket, order_by_expiry, CryptoKey, KeyStore, KeyStoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

type Buckets = BTreeMap<String, BTreeMap<String, CryptoKey>>;

/// On-disk document
#[derive(Serialize, Deserialize, Debug, Default)]
struct KeyFile {
    version: u32,
    buckets: Buckets,
}

const KEY_FILE_VERSION: u32 = 1;

/// Key store persisted as one JSON document.
///
/// The whole index is kept in memory. Every mutation rewrites the file
/// through a temporary sibling and a rename, under the write lock, so the
/// file on disk always holds a complete state.
#[derive(Debug)]
pub struct FileKeyStore {
    path: PathBuf,
    buckets: RwLock<Buckets>,
}

impl FileKeyStore {
    /// Open (or create) the key file at `path`
    pub async fn open(path: PathBuf) -> Result<Self, KeyStoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let buckets = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: KeyFile = serde_json::from_str(&content)?;
            let count: usize = file.buckets.values().map(BTreeMap::len).sum();
            info!("Loaded {} key(s) from {}", count, path.display());
            file.buckets
        } else {
            debug!("Key file {} does not exist yet", path.display());
            Buckets::new()
        };

        Ok(Self {
            path,
            buckets: RwLock::new(buckets),
        })
    }

    /// Location of the key file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, buckets: &Buckets) -> Result<(), KeyStoreError> {
        let document = KeyFile {
            version: KEY_FILE_VERSION,
            buckets: buckets.clone(),
        };
        let content = serde_json::to_string_pretty(&document)?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn get_key(&self, bucket: &str, handle: &str) -> Result<Option<CryptoKey>, KeyStoreError> {
        check_address(bucket, handle)?;
        let buckets = self.buckets.read().await;
        Ok(buckets.get(bucket).and_then(|keys| keys.get(handle)).cloned())
    }

    async fn get_keys(&self, bucket: &str) -> Result<Vec<(String, CryptoKey)>, KeyStoreError> {
        check_bucket(bucket)?;
        let buckets = self.buckets.read().await;
        let mut keys: Vec<(String, CryptoKey)> = buckets
            .get(bucket)
            .map(|keys| {
                keys.iter()
                    .map(|(handle, key)| (handle.clone(), key.clone()))
                    .collect()
            })
            .unwrap_or_default();
        order_by_expiry(&mut keys);
        Ok(keys)
    }

    async fn store_key(&self, bucket: &str, handle: &str, key: CryptoKey) -> Result<(), KeyStoreError> {
        check_address(bucket, handle)?;
        let mut buckets = self.buckets.write().await;

        match buckets.entry(bucket.to_string()).or_default().entry(handle.to_string()) {
            Entry::Occupied(_) => {
                return Err(KeyStoreError::Collision {
                    bucket: bucket.to_string(),
                    handle: handle.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(key);
            }
        }

        if let Err(e) = self.persist(&buckets) {
            // Keep memory and disk in step
            if let Some(keys) = buckets.get_mut(bucket) {
                keys.remove(handle);
                if keys.is_empty() {
                    buckets.remove(bucket);
                }
            }
            return Err(e);
        }
        debug!("Stored key {}/{} in {}", bucket, handle, self.path.display());
        Ok(())
    }

    async fn remove_key(&self, bucket: &str, handle: &str) -> Result<(), KeyStoreError> {
        check_address(bucket, handle)?;
        let mut buckets = self.buckets.write().await;

        let Some(keys) = buckets.get_mut(bucket) else {
            return Ok(());
        };
        let Some(removed) = keys.remove(handle) else {
            return Ok(());
        };
        let emptied = keys.is_empty();
        if emptied {
            buckets.remove(bucket);
        }

        if let Err(e) = self.persist(&buckets) {
            buckets
                .entry(bucket.to_string())
                .or_default()
                .insert(handle.to_string(), removed);
            return Err(e);
        }
        debug!("Removed key {}/{} from {}", bucket, handle, self.path.display());
        Ok(())
    }
}
