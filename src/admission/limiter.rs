use crate::admission::path_rule::PathRuleTable;
use crate::admission::state_store::{now_millis, StateStore};
use std::net::IpAddr;
use std::sync::Arc;

/// Outcome of a sliding-window check (§4.2).
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub limit_type: String,
    pub current_count: u64,
    pub threshold: u64,
    pub window_size: u64,
}

/// Ties `PathRuleTable` (which rule applies) to `StateStore` (the admit
/// call itself) — mirrors the shape of
/// `proxy/filter/rate_limit.rs::rate_limit_on_request`, but route-independent
/// and keyed by client IP rather than by route name.
pub struct SlidingWindowLimiter {
    store: Arc<dyn StateStore>,
    key_prefix: String,
    default_window_secs: u64,
    default_max_requests: u64,
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn StateStore>,
        key_prefix: impl Into<String>,
        default_window_secs: u64,
        default_max_requests: u64,
    ) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            default_window_secs,
            default_max_requests,
        }
    }

    /// Resolve the applicable rule for `path` against `rules`, then admit
    /// or reject `ip` against it (§4.2). Fail-open on any store error.
    pub async fn check(&self, rules: &PathRuleTable, ip: &IpAddr, path: &str) -> Decision {
        let (window_secs, max, bucket, limit_type) = match rules.resolve(path) {
            Some(rule) => (rule.window_seconds, rule.max_requests, rule.pattern.as_str(), "IP_PATH_WINDOW"),
            None => (self.default_window_secs, self.default_max_requests, "default", "IP_DEFAULT_WINDOW"),
        };

        let key = format!("{}:{}:{}", self.key_prefix, ip, bucket);
        let now_ms = now_millis();
        let window_ms = window_secs * 1000;

        match self.store.sliding_window_admit(&key, now_ms, window_ms, max).await {
            Ok(outcome) => Decision {
                allowed: outcome.admitted,
                limit_type: limit_type.to_string(),
                current_count: if outcome.admitted { outcome.post_count } else { outcome.pre_count },
                threshold: max,
                window_size: window_secs,
            },
            Err(e) => {
                tracing::warn!(error = %e, %ip, path, "admission: store error, failing open");
                metrics::counter!("gateway_admission_store_errors_total", "op" => "sliding_window_admit").increment(1);
                Decision {
                    allowed: true,
                    limit_type: "ERROR".to_string(),
                    current_count: 0,
                    threshold: max,
                    window_size: window_secs,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::path_rule::PathRule;
    use crate::admission::state_store::MemoryStore;

    fn rule(pattern: &str, window_seconds: u64, max_requests: u64) -> PathRule {
        PathRule {
            pattern: pattern.to_string(),
            window_seconds,
            max_requests,
            enabled: true,
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn admits_until_path_rule_max_then_rejects() {
        let store = Arc::new(MemoryStore::new());
        let limiter = SlidingWindowLimiter::new(store, "rl", 60, 100);
        let rules = PathRuleTable::new(vec![rule("/ai/**", 60, 2)]);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();

        assert!(limiter.check(&rules, &ip, "/ai/x").await.allowed);
        assert!(limiter.check(&rules, &ip, "/ai/x").await.allowed);
        let third = limiter.check(&rules, &ip, "/ai/x").await;
        assert!(!third.allowed);
        assert_eq!(third.limit_type, "IP_PATH_WINDOW");
    }

    #[tokio::test]
    async fn falls_back_to_default_window_when_no_rule_matches() {
        let store = Arc::new(MemoryStore::new());
        let limiter = SlidingWindowLimiter::new(store, "rl", 60, 1);
        let rules = PathRuleTable::new(vec![]);
        let ip: IpAddr = "9.9.9.9".parse().unwrap();

        let first = limiter.check(&rules, &ip, "/anything").await;
        assert!(first.allowed);
        assert_eq!(first.limit_type, "IP_DEFAULT_WINDOW");
        assert!(!limiter.check(&rules, &ip, "/anything").await.allowed);
    }

    #[tokio::test]
    async fn different_paths_under_same_rule_share_one_bucket() {
        let store = Arc::new(MemoryStore::new());
        let limiter = SlidingWindowLimiter::new(store, "rl", 60, 100);
        let rules = PathRuleTable::new(vec![rule("/api/**", 60, 1)]);
        let ip: IpAddr = "5.5.5.5".parse().unwrap();

        assert!(limiter.check(&rules, &ip, "/api/a").await.allowed);
        assert!(!limiter.check(&rules, &ip, "/api/b").await.allowed);
    }
}
