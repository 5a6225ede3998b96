mod memory;
mod remote;

pub use memory::MemoryStore;
pub use remote::RemoteStore;

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the epoch — the common time base both
/// back-ends key their windows on (§4.1, §4.2 "Numeric semantics").
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Result of a sliding-window admit call (§4.1 family 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmitOutcome {
    pub admitted: bool,
    pub pre_count: u64,
    pub post_count: u64,
}

/// Infrastructure-class failure. Callers degrade these to fail-open (§4.1, §7).
#[derive(Debug, Clone)]
pub enum StoreError {
    Timeout,
    Transport(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Transport(msg) => write!(f, "store transport error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

/// Back-end-agnostic contract for the admission pipeline's durable state
/// (§4.1). Two implementations share this trait: `MemoryStore` (single-node,
/// DashMap-backed) and `RemoteStore` (Redis sorted sets + Lua admit script).
///
/// Every method carries its own timeout internally and maps transport/timeout
/// failures to `StoreError` — callers are expected to treat any `Err` as
/// fail-open per §4.1 and §7.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Sliding-window admit (§4.1 family 1, §4.2). `window` and `now` are both
    /// in milliseconds. Admits iff `pre_count < max` (§9 open question #2).
    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max: u64,
    ) -> StoreResult<AdmitOutcome>;

    /// Flag / scalar with TTL (§4.1 family 2).
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Record an IP observation in the active-set for DDoS tracking, and
    /// return the distinct-IP count within `window` (§4.1 family 3, §4.5
    /// step 4). `key` already encodes the active-set namespace; `member` is
    /// the observed IP.
    async fn track_active_ip(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        window: Duration,
    ) -> StoreResult<u64>;

    /// Read-only count of distinct IPs in the active window, without
    /// recording a new observation (§4.1 family 3 "enumerate/scan"). Used by
    /// the periodic hysteresis sweep (§5) so CAPTCHA_MODE can release even
    /// while no new request arrives to drive `track_active_ip`.
    async fn active_ip_count(&self, key: &str, now_ms: u64, window: Duration) -> StoreResult<u64>;

    /// Health probe for the `/health/*` admin surface (SPEC_FULL §11).
    async fn ping(&self) -> StoreResult<()>;
}
