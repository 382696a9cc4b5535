//! In-memory key store

use crate::{check_address, check_bucket, order_by_expiry, CryptoKey, KeyStore, KeyStoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::debug;

/// In-memory key store.
///
/// Buckets live in a sharded map: lookups in different buckets never block
/// each other, and a store holds the bucket's shard write lock across the
/// collision check and the insert.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    buckets: DashMap<String, HashMap<String, CryptoKey>>,
}

impl MemoryKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get_key(&self, bucket: &str, handle: &str) -> Result<Option<CryptoKey>, KeyStoreError> {
        check_address(bucket, handle)?;
        Ok(self
            .buckets
            .get(bucket)
            .and_then(|keys| keys.get(handle).cloned()))
    }

    async fn get_keys(&self, bucket: &str) -> Result<Vec<(String, CryptoKey)>, KeyStoreError> {
        check_bucket(bucket)?;
        let mut keys: Vec<(String, CryptoKey)> = self
            .buckets
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
        let mut keys = self.buckets.entry(bucket.to_string()).or_default();
        match keys.entry(handle.to_string()) {
            Entry::Occupied(_) => Err(KeyStoreError::Collision {
                bucket: bucket.to_string(),
                handle: handle.to_string(),
            }),
            Entry::Vacant(slot) => {
                debug!("Stored key {}/{} (expires {})", bucket, handle, key.expires);
                slot.insert(key);
                Ok(())
            }
        }
    }

    async fn remove_key(&self, bucket: &str, handle: &str) -> Result<(), KeyStoreError> {
        check_address(bucket, handle)?;
        if let Some(mut keys) = self.buckets.get_mut(bucket) {
            if keys.remove(handle).is_some() {
                debug!("Removed key {}/{}", bucket, handle);
            }
        }
        self.buckets.remove_if(bucket, |_, keys| keys.is_empty());
        Ok(())
    }
}
