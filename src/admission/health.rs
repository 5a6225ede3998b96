use crate::admission::state_store::StateStore;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Probe cadence and failure threshold for the Store health flag
/// (§5 "Background tasks": "Store health probe every 30 s with
/// consecutive-failure threshold 5 flipping a health flag").
const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const FAILURE_THRESHOLD: u32 = 5;

/// Tracks whether the `StateStore` back-end is reachable, for the
/// `/health/*` surface. A single consecutive-failure counter flips one
/// flag — same discipline as `upstream::circuit_breaker::NodeBreaker`'s
/// `consecutive_failures` counter, generalized from per-node to a single
/// process-wide Store.
pub struct StoreHealth {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl StoreHealth {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn record(&self, ok: bool) {
        if ok {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            if !self.healthy.swap(true, Ordering::Release) {
                tracing::info!("admission: store health probe recovered");
            }
        } else {
            let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if count >= FAILURE_THRESHOLD && self.healthy.swap(false, Ordering::Release) {
                tracing::warn!(count, "admission: store health probe failed, flipping unhealthy");
            }
        }
    }

    /// Spawns the periodic probe loop (§5). Runs for the lifetime of the process.
    pub fn start(store: Arc<dyn StateStore>) -> Arc<Self> {
        let health = Arc::new(Self::new());
        let probed = health.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROBE_INTERVAL);
            loop {
                interval.tick().await;
                let ok = store.ping().await.is_ok();
                probed.record(ok);
            }
        });
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_healthy_under_the_failure_threshold() {
        let health = StoreHealth::new();
        for _ in 0..FAILURE_THRESHOLD - 1 {
            health.record(false);
        }
        assert!(health.is_healthy());
    }

    #[test]
    fn flips_unhealthy_at_the_failure_threshold() {
        let health = StoreHealth::new();
        for _ in 0..FAILURE_THRESHOLD {
            health.record(false);
        }
        assert!(!health.is_healthy());
    }

    #[test]
    fn a_single_success_resets_the_counter_and_recovers() {
        let health = StoreHealth::new();
        for _ in 0..FAILURE_THRESHOLD {
            health.record(false);
        }
        assert!(!health.is_healthy());
        health.record(true);
        assert!(health.is_healthy());
    }
}
