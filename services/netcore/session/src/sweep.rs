//! Periodic eviction of idle connections.

use crate::registry::{CloseReason, ContextRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Liveness sweep settings
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between passes
    pub interval: Duration,
    /// Idle minutes before eviction; negative disables eviction
    pub client_timeout_minutes: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            client_timeout_minutes: -1,
        }
    }
}

/// Evicts timed-out contexts from one registry
pub struct LivenessSweep<S> {
    registry: Arc<ContextRegistry<S>>,
    config: SweepConfig,
}

impl<S> LivenessSweep<S> {
    /// Create a sweep over `registry`
    pub fn new(registry: Arc<ContextRegistry<S>>, config: SweepConfig) -> Self {
        Self { registry, config }
    }

    /// One pass: close and remove every timed-out context.
    ///
    /// Closes run concurrently and each is bounded by the registry's close
    /// timeout, so one stalled peer does not hold up the others. Returns the
    /// number of evicted contexts.
    pub async fn sweep_once(&self) -> usize {
        if self.config.client_timeout_minutes < 0 {
            return 0;
        }

        let expired: Vec<String> = self
            .registry
            .find_all_member()
            .into_iter()
            .filter(|context| context.has_timed_out(self.config.client_timeout_minutes))
            .map(|context| context.unique_id().to_string())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        let closes = expired
            .iter()
            .map(|id| self.registry.close_and_remove(id, CloseReason::TimedOut));
        let evicted = futures::future::join_all(closes)
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count();

        info!(
            "Liveness sweep on {} evicted {} idle connection(s)",
            self.registry.config().server_name,
            evicted
        );
        evicted
    }

    /// Run passes on a fixed interval until `shutdown` becomes `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Liveness sweep for {} stopped", self.registry.config().server_name);
    }
}
