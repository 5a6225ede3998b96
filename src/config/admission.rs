use super::deserialize_null_default;
use crate::admission::path_rule::PathRule;
use serde::{Deserialize, Serialize};

/// Top-level admission-pipeline configuration (SPEC_FULL §10.3). Unlike
/// `DomainConfig`/`ClusterConfig`, this is operator-tuned policy loaded from
/// the same local file as infra config — not pushed through etcd.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub rate_limit: RateLimitAdmissionConfig,

    #[serde(default)]
    pub browser_detection: BrowserDetectionConfig,

    #[serde(default)]
    pub x_forwarded_for: XForwardedForConfig,

    #[serde(default)]
    pub captcha: CaptchaConfig,

    #[serde(default)]
    pub access_record: AccessRecordConfig,
}

impl AdmissionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.rate_limit.enabled {
            return Ok(());
        }
        if self.rate_limit.ddos_release_ip_count >= self.rate_limit.ddos_threshold_ip_count {
            return Err(format!(
                "rate_limit.ddos_release_ip_count ({}) must be < ddos_threshold_ip_count ({})",
                self.rate_limit.ddos_release_ip_count, self.rate_limit.ddos_threshold_ip_count
            ));
        }
        if self.rate_limit.captcha_page_path.is_empty() {
            return Err("rate_limit.captcha_page_path must not be empty when rate_limit.enabled".into());
        }
        if self.rate_limit.sliding_window.storage_type == StorageType::Remote
            && self.rate_limit.sliding_window.redis_url.is_none()
        {
            return Err(
                "rate_limit.sliding_window.storage_type = REMOTE requires redis_url".into(),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitAdmissionConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub sliding_window: SlidingWindowConfig,

    #[serde(default = "default_ddos_threshold")]
    pub ddos_threshold_ip_count: u64,

    #[serde(default = "default_ddos_release")]
    pub ddos_release_ip_count: u64,

    #[serde(default = "default_active_window_secs")]
    pub ip_track_duration_seconds: u64,

    #[serde(default = "default_whitelist_minutes")]
    pub white_list_duration_minutes: u64,

    #[serde(default = "default_blacklist_minutes")]
    pub black_list_duration_minutes: u64,

    #[serde(default = "default_captcha_minutes")]
    pub captcha_duration_minutes: u64,

    #[serde(default = "default_true")]
    pub black_list_enabled: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub skip_paths: Vec<String>,

    #[serde(default = "default_captcha_page_path")]
    pub captcha_page_path: String,

    #[serde(default)]
    pub base_url: String,
}

impl Default for RateLimitAdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sliding_window: SlidingWindowConfig::default(),
            ddos_threshold_ip_count: default_ddos_threshold(),
            ddos_release_ip_count: default_ddos_release(),
            ip_track_duration_seconds: default_active_window_secs(),
            white_list_duration_minutes: default_whitelist_minutes(),
            black_list_duration_minutes: default_blacklist_minutes(),
            captcha_duration_minutes: default_captcha_minutes(),
            black_list_enabled: true,
            skip_paths: Vec::new(),
            captcha_page_path: default_captcha_page_path(),
            base_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    #[serde(rename = "LOCAL_MEMORY")]
    LocalMemory,
    #[serde(rename = "REMOTE")]
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    #[serde(default = "default_storage_type")]
    pub storage_type: StorageType,

    #[serde(default = "default_window_size")]
    pub default_window_size: u64,

    #[serde(default = "default_max_requests")]
    pub default_max_requests: u64,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub path_rules: Vec<PathRule>,

    /// Required when `storage_type = REMOTE`.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            storage_type: default_storage_type(),
            default_window_size: default_window_size(),
            default_max_requests: default_max_requests(),
            path_rules: Vec::new(),
            redis_url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserDetectionConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_strictness")]
    pub strictness: Strictness,

    #[serde(default = "default_min_ua_len")]
    pub min_user_agent_length: usize,

    #[serde(default = "default_max_ua_len")]
    pub max_user_agent_length: usize,

    #[serde(default = "default_bot_keywords", deserialize_with = "deserialize_null_default")]
    pub bot_keywords: Vec<String>,

    #[serde(default = "default_real_browser_keywords", deserialize_with = "deserialize_null_default")]
    pub real_browser_keywords: Vec<String>,

    #[serde(default = "default_mobile_keywords", deserialize_with = "deserialize_null_default")]
    pub mobile_keywords: Vec<String>,

    #[serde(default = "default_required_headers", deserialize_with = "deserialize_null_default")]
    pub required_headers: Vec<String>,

    #[serde(default = "default_suspicious_headers", deserialize_with = "deserialize_null_default")]
    pub suspicious_headers: Vec<String>,
}

impl Default for BrowserDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strictness: default_strictness(),
            min_user_agent_length: default_min_ua_len(),
            max_user_agent_length: default_max_ua_len(),
            bot_keywords: default_bot_keywords(),
            real_browser_keywords: default_real_browser_keywords(),
            mobile_keywords: default_mobile_keywords(),
            required_headers: default_required_headers(),
            suspicious_headers: default_suspicious_headers(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strictness {
    Strict,
    Moderate,
    Loose,
}

impl Strictness {
    pub fn threshold(self) -> i64 {
        match self {
            Strictness::Strict => 50,
            Strictness::Moderate => 20,
            Strictness::Loose => -20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XForwardedForConfig {
    /// Trust depth (§4.3): number of hops from the rightmost XFF entry
    /// trusted as proxies. 0 = trust only the rightmost entry.
    #[serde(default)]
    pub max_trusted_index: usize,
}

impl Default for XForwardedForConfig {
    fn default() -> Self {
        Self { max_trusted_index: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    #[serde(default = "default_true")]
    pub strict_mode: bool,

    #[serde(default)]
    pub allow_api_when_captcha_active: bool,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            strict_mode: true,
            allow_api_when_captcha_active: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRecordConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_audit_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for AccessRecordConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            channel_capacity: default_audit_channel_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_ddos_threshold() -> u64 {
    50
}
fn default_ddos_release() -> u64 {
    10
}
fn default_active_window_secs() -> u64 {
    10
}
fn default_whitelist_minutes() -> u64 {
    5
}
fn default_blacklist_minutes() -> u64 {
    30
}
fn default_captcha_minutes() -> u64 {
    1
}
fn default_captcha_page_path() -> String {
    "/captcha".to_string()
}
fn default_storage_type() -> StorageType {
    StorageType::LocalMemory
}
fn default_window_size() -> u64 {
    60
}
fn default_max_requests() -> u64 {
    100
}
fn default_key_prefix() -> String {
    "rate_limit".to_string()
}
fn default_strictness() -> Strictness {
    Strictness::Moderate
}
fn default_min_ua_len() -> usize {
    10
}
fn default_max_ua_len() -> usize {
    512
}
fn default_bot_keywords() -> Vec<String> {
    ["bot", "crawler", "spider", "scraper", "curl", "wget", "python-requests", "httpclient"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_real_browser_keywords() -> Vec<String> {
    ["mozilla", "chrome", "safari", "firefox", "edge", "webkit"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_mobile_keywords() -> Vec<String> {
    ["mobile", "android", "iphone", "ipad"].iter().map(|s| s.to_string()).collect()
}
fn default_required_headers() -> Vec<String> {
    ["accept", "accept-language", "accept-encoding", "connection"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_suspicious_headers() -> Vec<String> {
    ["x-scan", "x-bot", "x-crawler"].iter().map(|s| s.to_string()).collect()
}
fn default_retention_days() -> u32 {
    30
}
fn default_audit_channel_capacity() -> usize {
    10_000
}
