use super::{now_millis, AdmitOutcome, StateStore, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// GC sweep cadence for expired windows/flags (§5 "Background tasks":
/// sliding-window expired-record cleanup every 5 minutes).
const GC_INTERVAL: Duration = Duration::from_secs(300);
/// A window entry with no activity for this long is considered orphaned.
const WINDOW_IDLE_EXPIRE: Duration = Duration::from_secs(3600);

struct WindowEntry {
    timestamps: Mutex<VecDeque<u64>>,
    last_touched_ms: AtomicU64,
}

struct FlagEntry {
    value: String,
    expires_at: Instant,
}

/// In-memory `StateStore` back-end (§4.1 "In-memory back-end").
///
/// Each key's timestamp sequence is protected by its own
/// `tokio::sync::Mutex` rather than a CAS loop — the same choice
/// `proxy/filter/rate_limit.rs` makes for its token bucket: waiting for the
/// lock yields back to the runtime instead of blocking the worker thread,
/// and a per-key critical section is exactly what the sliding-window admit
/// operation needs to be atomic (§4.1 invariant, §9 "Back-end polymorphism").
pub struct MemoryStore {
    windows: DashMap<String, Arc<WindowEntry>>,
    flags: DashMap<String, FlagEntry>,
    active_sets: DashMap<String, Arc<Mutex<VecDeque<(u64, String)>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            flags: DashMap::new(),
            active_sets: DashMap::new(),
        }
    }

    pub fn start_gc(self: &Arc<Self>) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                store.evict_stale();
            }
        });
    }

    fn evict_stale(&self) {
        let now_ms = now_millis();
        let idle_ms = WINDOW_IDLE_EXPIRE.as_millis() as u64;

        self.windows.retain(|_, entry| {
            now_ms.saturating_sub(entry.last_touched_ms.load(Ordering::Relaxed)) < idle_ms
        });

        let now = Instant::now();
        self.flags.retain(|_, entry| entry.expires_at > now);

        self.active_sets.retain(|_, _| true);

        tracing::debug!(
            windows = self.windows.len(),
            flags = self.flags.len(),
            active_sets = self.active_sets.len(),
            "admission: memory store GC pass"
        );
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max: u64,
    ) -> StoreResult<AdmitOutcome> {
        let entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(WindowEntry {
                    timestamps: Mutex::new(VecDeque::new()),
                    last_touched_ms: AtomicU64::new(now_ms),
                })
            })
            .clone();

        entry.last_touched_ms.store(now_ms, Ordering::Relaxed);

        let mut ts = entry.timestamps.lock().await;

        // Evict entries with timestamp <= now - W (§3 "Sliding Window" invariant a).
        let floor = now_ms.saturating_sub(window_ms);
        while matches!(ts.front(), Some(&t) if t <= floor) {
            ts.pop_front();
        }

        let pre_count = ts.len() as u64;

        // Admit iff pre-count < max (§9 open question #2, strict `<`).
        if pre_count < max {
            ts.push_back(now_ms);
            Ok(AdmitOutcome {
                admitted: true,
                pre_count,
                post_count: pre_count + 1,
            })
        } else {
            Ok(AdmitOutcome {
                admitted: false,
                pre_count,
                post_count: pre_count,
            })
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        Ok(self.flags.get(key).and_then(|e| {
            if e.expires_at > now {
                Some(e.value.clone())
            } else {
                None
            }
        }))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.flags.insert(
            key.to_string(),
            FlagEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.flags.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn track_active_ip(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        window: Duration,
    ) -> StoreResult<u64> {
        let set = self
            .active_sets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone();

        let mut entries = set.lock().await;
        let floor = now_ms.saturating_sub(window.as_millis() as u64);

        // Evict stale observations first (append-then-evict, §4.5 step 4 says
        // "append-then-evict" but evicting first keeps the structure bounded
        // without changing the observable count for `member`'s own entry).
        entries.retain(|(t, _)| *t > floor);

        if let Some(existing) = entries.iter_mut().find(|(_, ip)| ip == member) {
            existing.0 = now_ms;
        } else {
            entries.push_back((now_ms, member.to_string()));
        }

        let mut distinct: Vec<&str> = entries.iter().map(|(_, ip)| ip.as_str()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        Ok(distinct.len() as u64)
    }

    async fn active_ip_count(&self, key: &str, now_ms: u64, window: Duration) -> StoreResult<u64> {
        let Some(set) = self.active_sets.get(key).map(|e| e.clone()) else {
            return Ok(0);
        };
        let mut entries = set.lock().await;
        let floor = now_ms.saturating_sub(window.as_millis() as u64);
        entries.retain(|(t, _)| *t > floor);

        let mut distinct: Vec<&str> = entries.iter().map(|(_, ip)| ip.as_str()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        Ok(distinct.len() as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_until_max_then_rejects() {
        let store = MemoryStore::new();
        let key = "1.2.3.4:/a";
        for i in 0..2 {
            let r = store.sliding_window_admit(key, 1000 + i, 1000, 2).await.unwrap();
            assert!(r.admitted, "request {i} should admit");
        }
        let r = store.sliding_window_admit(key, 1005, 1000, 2).await.unwrap();
        assert!(!r.admitted);
        assert_eq!(r.pre_count, 2);
    }

    #[tokio::test]
    async fn evicts_entries_outside_window() {
        let store = MemoryStore::new();
        let key = "1.2.3.4:/a";
        store.sliding_window_admit(key, 1000, 1000, 1).await.unwrap();
        // Second request at the same instant is over budget.
        let rejected = store.sliding_window_admit(key, 1500, 1000, 1).await.unwrap();
        assert!(!rejected.admitted);
        // After the window has fully elapsed the old timestamp is evicted.
        let admitted = store.sliding_window_admit(key, 2001, 1000, 1).await.unwrap();
        assert!(admitted.admitted);
    }

    #[tokio::test]
    async fn independent_keys_do_not_interfere() {
        let store = MemoryStore::new();
        store.sliding_window_admit("a", 1000, 1000, 1).await.unwrap();
        let r = store.sliding_window_admit("b", 1000, 1000, 1).await.unwrap();
        assert!(r.admitted);
    }

    #[tokio::test]
    async fn flag_roundtrip_with_ttl() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("white_list:1.2.3.4", "1", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(store.exists("white_list:1.2.3.4").await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!store.exists("white_list:1.2.3.4").await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_flag() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("black_list:5.5.5.5", "reason", Duration::from_secs(60))
            .await
            .unwrap();
        store.delete("black_list:5.5.5.5").await.unwrap();
        assert!(!store.exists("black_list:5.5.5.5").await.unwrap());
    }

    #[tokio::test]
    async fn active_ip_tracking_counts_distinct_ips() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(10);
        for ip in ["1.1.1.1", "2.2.2.2", "1.1.1.1", "3.3.3.3"] {
            store.track_active_ip("active", ip, 1000, window).await.unwrap();
        }
        let count = store.track_active_ip("active", "3.3.3.3", 1000, window).await.unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn active_ip_count_is_read_only() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(10);
        store.track_active_ip("active", "1.1.1.1", 1000, window).await.unwrap();
        let count = store.active_ip_count("active", 1000, window).await.unwrap();
        assert_eq!(count, 1);
        // Calling it again must not grow the set.
        let count = store.active_ip_count("active", 1000, window).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn active_ip_count_on_unknown_key_is_zero() {
        let store = MemoryStore::new();
        let count = store.active_ip_count("never_seen", 1000, Duration::from_secs(10)).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn active_ip_tracking_evicts_stale() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(10);
        store.track_active_ip("active", "1.1.1.1", 1000, window).await.unwrap();
        let count = store
            .track_active_ip("active", "2.2.2.2", 1000 + 11_000, window)
            .await
            .unwrap();
        assert_eq!(count, 1, "the stale 1.1.1.1 observation must be evicted");
    }
}
