pub mod abuse_state_machine;
pub mod audit;
pub mod browser_scorer;
pub mod captcha;
pub mod health;
pub mod identity;
pub mod limiter;
pub mod path_rule;
pub mod state_store;

use crate::config::AdmissionConfig;
use abuse_state_machine::AbuseStateMachine;
use arc_swap::ArcSwap;
use audit::AuditSink;
use captcha::CaptchaVerifier;
use health::StoreHealth;
use limiter::SlidingWindowLimiter;
use path_rule::PathRuleTable;
use state_store::{MemoryStore, RemoteStore, StateStore};
use std::sync::Arc;

/// Everything the admission pipeline needs at request time, composed the
/// way `server::state::RoutingState`/`InfraState` compose narrow sub-states
/// off `GatewayState`.
#[derive(Clone)]
pub struct AdmissionState {
    pub config: AdmissionConfig,
    pub path_rules: Arc<ArcSwap<PathRuleTable>>,
    pub abuse: Arc<AbuseStateMachine>,
    pub captcha: Arc<CaptchaVerifier>,
    pub audit: Arc<AuditSink>,
    pub store_health: Arc<StoreHealth>,
}

impl AdmissionState {
    /// Builds the concrete `StateStore` from config (`LOCAL_MEMORY` or
    /// `REMOTE`), starts its background maintenance, and wires the rest of
    /// the pipeline on top of it.
    pub async fn new(config: AdmissionConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn StateStore> = match config.rate_limit.sliding_window.storage_type {
            crate::config::StorageType::LocalMemory => {
                let store = Arc::new(MemoryStore::new());
                store.start_gc();
                store
            }
            crate::config::StorageType::Remote => {
                let url = config
                    .rate_limit
                    .sliding_window
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("admission.rate_limit.sliding_window.redis_url missing"))?;
                Arc::new(RemoteStore::connect(url).await?)
            }
        };

        let path_rules = Arc::new(ArcSwap::from_pointee(PathRuleTable::new(
            config.rate_limit.sliding_window.path_rules.clone(),
        )));

        let limiter = SlidingWindowLimiter::new(
            store.clone(),
            config.rate_limit.sliding_window.key_prefix.clone(),
            config.rate_limit.sliding_window.default_window_size,
            config.rate_limit.sliding_window.default_max_requests,
        );

        let abuse = Arc::new(AbuseStateMachine::new(
            store.clone(),
            limiter,
            config.rate_limit.clone(),
            config.captcha.clone(),
        ));

        let captcha = Arc::new(CaptchaVerifier::new(store.clone()));

        let audit = AuditSink::start(config.access_record.channel_capacity, config.access_record.retention_days, None);

        let store_health = StoreHealth::start(store.clone());
        abuse.start_periodic_hysteresis_check();

        Ok(Self {
            config,
            path_rules,
            abuse,
            captcha,
            audit,
            store_health,
        })
    }

    /// Captcha-page path from config, used by `proxy::admission_phase` to
    /// recognize the issue endpoint without reaching into `rate_limit`.
    pub fn captcha_page_path(&self) -> &str {
        &self.config.rate_limit.captcha_page_path
    }

    pub fn path_rules(&self) -> arc_swap::Guard<Arc<PathRuleTable>> {
        self.path_rules.load()
    }

    /// Atomically swap in a new path-rule snapshot (§9 "Path-rule hot reload").
    pub fn reload_path_rules(&self, rules: Vec<path_rule::PathRule>) {
        self.path_rules.store(Arc::new(PathRuleTable::new(rules)));
    }
}
