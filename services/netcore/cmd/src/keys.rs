//! Greeting key rotation.
//!
//! A fresh key is generated once the newest valid key is within a quarter of
//! its lifetime of expiring, and expired keys are dropped. Older keys stay in
//! the store until they expire so tokens issued shortly before a rotation
//! still verify.

use crate::echo::GREETING_BUCKET;
use chrono::{DateTime, Utc};
use netcore_storage::{CryptoKey, KeyStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Length of generated greeting keys
pub const GREETING_KEY_LEN: usize = 32;

const MIN_CHECK_PERIOD: Duration = Duration::from_secs(1);

pub struct GreetingKeys {
    store: Arc<dyn KeyStore>,
    lifetime: chrono::Duration,
}

impl GreetingKeys {
    pub fn new(store: Arc<dyn KeyStore>, lifetime: chrono::Duration) -> Self {
        Self { store, lifetime }
    }

    /// Remaining validity below which a new key is generated
    fn refresh_margin(&self) -> chrono::Duration {
        self.lifetime / 4
    }

    /// How often the rotation task checks the store
    pub fn check_period(&self) -> Duration {
        (self.lifetime / 8)
            .to_std()
            .unwrap_or(MIN_CHECK_PERIOD)
            .max(MIN_CHECK_PERIOD)
    }

    /// Drop expired keys and make sure a key stays valid for longer than the
    /// refresh margin. Returns the handle of a newly generated key.
    pub async fn ensure(&self, now: DateTime<Utc>) -> anyhow::Result<Option<String>> {
        for (handle, key) in self.store.get_keys(GREETING_BUCKET).await? {
            if key.expires <= now {
                self.store.remove_key(GREETING_BUCKET, &handle).await?;
                crate::component_debug!("keys", "Removed expired greeting key {}", handle);
            }
        }

        if let Some((handle, key)) = self.store.newest_valid_key(GREETING_BUCKET, now).await? {
            if key.expires - now > self.refresh_margin() {
                crate::component_debug!("keys", "Using greeting key {} (expires {})", handle, key.expires);
                return Ok(None);
            }
        }

        let handle = format!("k{}", netcore_wire::timestamp::encode_time(now));
        let key = CryptoKey::generate(GREETING_KEY_LEN, now, self.lifetime);
        let expires = key.expires;
        self.store.store_key(GREETING_BUCKET, &handle, key).await?;
        crate::component_info!("keys", "Generated greeting key {} (expires {})", handle, expires);
        Ok(Some(handle))
    }

    /// Check the store every [`check_period`](Self::check_period) until
    /// `shutdown` becomes `true`. `clock` supplies the wall-clock time.
    pub async fn run<C>(self, clock: C, mut shutdown: watch::Receiver<bool>)
    where
        C: Fn() -> DateTime<Utc> + Send,
    {
        let mut ticker = interval(self.check_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.ensure(clock()).await {
                        crate::component_error!("keys", "Greeting key rotation failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        crate::component_debug!("keys", "Greeting key rotation stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_storage::MemoryKeyStore;

    fn greeting_keys(lifetime_hours: i64) -> (Arc<dyn KeyStore>, GreetingKeys) {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let keys = GreetingKeys::new(Arc::clone(&store), chrono::Duration::hours(lifetime_hours));
        (store, keys)
    }

    #[tokio::test]
    async fn test_greeting_key_generated_once_and_expired_pruned() {
        let (store, keys) = greeting_keys(1);
        let now = Utc::now();
        store
            .store_key(
                GREETING_BUCKET,
                "stale",
                CryptoKey::new(vec![1; 32], now - chrono::Duration::hours(2), now - chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        assert!(keys.ensure(now).await.unwrap().is_some());
        let stored = store.get_keys(GREETING_BUCKET).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_ne!(stored[0].0, "stale");
        assert_eq!(stored[0].1.material.len(), GREETING_KEY_LEN);

        assert!(keys.ensure(now).await.unwrap().is_none());
        assert_eq!(store.get_keys(GREETING_BUCKET).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rotation_before_expiry_keeps_current_key() {
        let (store, keys) = greeting_keys(8);
        let now = Utc::now();
        store
            .store_key(
                GREETING_BUCKET,
                "current",
                CryptoKey::new(vec![2; 32], now - chrono::Duration::hours(7), now + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        let rotated = keys.ensure(now).await.unwrap().unwrap();
        let (newest, key) = store.newest_valid_key(GREETING_BUCKET, now).await.unwrap().unwrap();
        assert_eq!(newest, rotated);
        assert_eq!(key.expires, now + chrono::Duration::hours(8));
        assert!(store.get_key(GREETING_BUCKET, "current").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_key_outside_margin_is_kept() {
        let (store, keys) = greeting_keys(8);
        let now = Utc::now();
        store
            .store_key(
                GREETING_BUCKET,
                "current",
                CryptoKey::new(vec![3; 32], now - chrono::Duration::hours(3), now + chrono::Duration::hours(5)),
            )
            .await
            .unwrap();

        assert!(keys.ensure(now).await.unwrap().is_none());
        assert_eq!(store.get_keys(GREETING_BUCKET).await.unwrap().len(), 1);
    }

    #[test]
    fn test_check_period() {
        let (_, keys) = greeting_keys(8);
        assert_eq!(keys.check_period(), Duration::from_secs(3600));
        let short = GreetingKeys::new(Arc::new(MemoryKeyStore::new()), chrono::Duration::seconds(2));
        assert_eq!(short.check_period(), MIN_CHECK_PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_task_renews_key_until_shutdown() {
        let (store, keys) = greeting_keys(8);
        let origin = Utc::now();
        let start = tokio::time::Instant::now();
        let clock = move || origin + chrono::Duration::from_std(start.elapsed()).unwrap();

        let first = keys.ensure(origin).await.unwrap().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(keys.run(clock, shutdown_rx));
        tokio::task::yield_now().await;

        // Five hours in, three remain: above the two-hour margin
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(3600)).await;
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(store.get_keys(GREETING_BUCKET).await.unwrap().len(), 1);

        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(3600)).await;
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }
        let stored = store.get_keys(GREETING_BUCKET).await.unwrap();
        assert_eq!(stored.len(), 2);

        // Still signing after the first key has expired
        let after_expiry = origin + chrono::Duration::hours(9);
        let (newest, _) = store
            .newest_valid_key(GREETING_BUCKET, after_expiry)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(newest, first);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
