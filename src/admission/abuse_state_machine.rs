use crate::admission::limiter::SlidingWindowLimiter;
use crate::admission::path_rule::{pattern_matches, PathRuleTable};
use crate::admission::state_store::{now_millis, StateStore};
use crate::config::{CaptchaConfig, RateLimitAdmissionConfig};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const GLOBAL_CAPTCHA_FLAG_KEY: &str = "captcha_mode:global";
const ACTIVE_SET_KEY: &str = "active_ips";
/// Cadence for the traffic-independent hysteresis sweep (§5 "Background
/// tasks": "CAPTCHA-mode hysteresis check every 30 s").
const HYSTERESIS_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn whitelist_key(ip: &IpAddr) -> String {
    format!("white_list:{ip}")
}

fn blacklist_key(ip: &IpAddr) -> String {
    format!("black_list:{ip}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Challenge,
}

/// Result of the hysteresis stage (§4.5 steps 4, 6) — owned by the
/// `DdosDefense` filter slot (§9 open question #1 resolution).
#[derive(Debug, Clone)]
pub struct HysteresisOutcome {
    pub verdict: Verdict,
    pub active_ip_count: u64,
    pub captcha_mode: bool,
    pub blacklist_reason: Option<String>,
    /// Set when the non-strict escape hatch admitted an API request while
    /// `CAPTCHA_MODE` was active (§4.5 step 6).
    pub relaxed_notice: bool,
}

/// Result of the list/limiter stage (§4.5 steps 1, 2, 3, 5) — owned by the
/// `ApiRateLimit` filter slot.
#[derive(Debug, Clone)]
pub struct RateLimitOutcome {
    pub verdict: Verdict,
    pub in_whitelist: bool,
    pub in_blacklist: bool,
    pub blacklist_info: Option<String>,
    pub rate_limited: bool,
    pub rate_limit_type: Option<String>,
}

/// Result of the shared list pre-check (§4.5 steps 1, 2, 3) — evaluated once,
/// ahead of both the `DdosDefense` and `ApiRateLimit` filter slots (§9 open
/// question #1 resolution), so neither slot can blacklist or challenge an IP
/// the pre-check already admitted via whitelist.
#[derive(Debug, Clone)]
pub struct ListOutcome {
    pub verdict: Verdict,
    pub skip: bool,
    pub in_whitelist: bool,
    pub in_blacklist: bool,
    pub blacklist_info: Option<String>,
}

/// Shared abuse-tracking state reachable from both filter slots (§4.5,
/// §9 open question #1). Holds the active-IP hysteresis flag's in-process
/// mirror purely to avoid an extra store round trip on the hot "still
/// NORMAL" path — the Store entry remains the source of truth.
pub struct AbuseStateMachine {
    store: Arc<dyn StateStore>,
    limiter: SlidingWindowLimiter,
    config: RateLimitAdmissionConfig,
    captcha_config: CaptchaConfig,
    captcha_mode_hint: AtomicBool,
}

impl AbuseStateMachine {
    pub fn new(
        store: Arc<dyn StateStore>,
        limiter: SlidingWindowLimiter,
        config: RateLimitAdmissionConfig,
        captcha_config: CaptchaConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            config,
            captcha_config,
            captcha_mode_hint: AtomicBool::new(false),
        }
    }

    fn is_skip_path(&self, path: &str) -> bool {
        self.config.skip_paths.iter().any(|p| pattern_matches(p, path))
    }

    /// Spawns the periodic release-only hysteresis sweep (§5). Traffic
    /// already drives the enter/leave transition on every request via
    /// `track_and_check_hysteresis`; this task only exists to release
    /// `CAPTCHA_MODE` when traffic has fallen quiet enough that no request
    /// is left to observe the drop, instead of waiting out the flag's TTL.
    pub fn start_periodic_hysteresis_check(self: &Arc<Self>) {
        let machine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HYSTERESIS_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                machine.release_captcha_mode_if_quiet().await;
            }
        });
    }

    async fn release_captcha_mode_if_quiet(&self) {
        let captcha_mode = match self.store.exists(GLOBAL_CAPTCHA_FLAG_KEY).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "admission: periodic hysteresis sweep failed to read captcha-mode flag");
                return;
            }
        };
        if !captcha_mode {
            return;
        }

        let now_ms = now_millis();
        let window = Duration::from_secs(self.config.ip_track_duration_seconds);
        let active_ip_count = match self.store.active_ip_count(ACTIVE_SET_KEY, now_ms, window).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "admission: periodic hysteresis sweep failed to count active ips");
                return;
            }
        };

        if active_ip_count <= self.config.ddos_release_ip_count {
            if let Err(e) = self.store.delete(GLOBAL_CAPTCHA_FLAG_KEY).await {
                tracing::warn!(error = %e, "admission: periodic sweep failed to clear captcha-mode flag");
                return;
            }
            self.captcha_mode_hint.store(false, Ordering::Relaxed);
            metrics::counter!("gateway_admission_ddos_mode_transitions_total", "direction" => "leave_periodic").increment(1);
            tracing::info!(active_ip_count, "admission: periodic sweep released captcha mode on quiet traffic");
        }
    }

    pub fn captcha_page_url(&self) -> String {
        if self.config.base_url.is_empty() {
            self.config.captcha_page_path.clone()
        } else {
            format!("{}{}", self.config.base_url.trim_end_matches('/'), self.config.captcha_page_path)
        }
    }

    /// DDoS hysteresis stage (§4.5 steps 4, 6). Records the IP's observation
    /// in the active-set, then evaluates the global `NORMAL`/`CAPTCHA_MODE`
    /// transition. Fails open on any Store error (§4.5 invariant d).
    pub async fn track_and_check_hysteresis(&self, ip: &IpAddr, path: &str, is_api_request: bool) -> HysteresisOutcome {
        if self.is_skip_path(path) {
            return HysteresisOutcome {
                verdict: Verdict::Admit,
                active_ip_count: 0,
                captcha_mode: self.captcha_mode_hint.load(Ordering::Relaxed),
                blacklist_reason: None,
                relaxed_notice: false,
            };
        }

        let now_ms = now_millis();
        let window = Duration::from_secs(self.config.ip_track_duration_seconds);
        let active_ip_count = match self.store.track_active_ip(ACTIVE_SET_KEY, &ip.to_string(), now_ms, window).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "admission: active-ip tracking failed, failing open");
                return HysteresisOutcome {
                    verdict: Verdict::Admit,
                    active_ip_count: 0,
                    captcha_mode: false,
                    blacklist_reason: None,
                    relaxed_notice: false,
                };
            }
        };

        let captcha_mode = match self.store.exists(GLOBAL_CAPTCHA_FLAG_KEY).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "admission: captcha-mode flag read failed, failing open");
                return HysteresisOutcome {
                    verdict: Verdict::Admit,
                    active_ip_count,
                    captcha_mode: false,
                    blacklist_reason: None,
                    relaxed_notice: false,
                };
            }
        };
        self.captcha_mode_hint.store(captcha_mode, Ordering::Relaxed);

        if !captcha_mode && active_ip_count >= self.config.ddos_threshold_ip_count {
            let ttl = Duration::from_secs(self.config.captcha_duration_minutes * 60);
            if let Err(e) = self.store.set_with_ttl(GLOBAL_CAPTCHA_FLAG_KEY, "1", ttl).await {
                tracing::warn!(error = %e, "admission: failed to set global captcha-mode flag");
            }
            self.captcha_mode_hint.store(true, Ordering::Relaxed);
            metrics::counter!("gateway_admission_ddos_mode_transitions_total", "direction" => "enter").increment(1);
            let reason = "DDOS_THRESHOLD".to_string();
            self.blacklist(ip, &reason).await;
            return HysteresisOutcome {
                verdict: Verdict::Challenge,
                active_ip_count,
                captcha_mode: true,
                blacklist_reason: Some(reason),
                relaxed_notice: false,
            };
        }

        if captcha_mode && active_ip_count <= self.config.ddos_release_ip_count {
            if let Err(e) = self.store.delete(GLOBAL_CAPTCHA_FLAG_KEY).await {
                tracing::warn!(error = %e, "admission: failed to clear global captcha-mode flag");
            }
            self.captcha_mode_hint.store(false, Ordering::Relaxed);
            metrics::counter!("gateway_admission_ddos_mode_transitions_total", "direction" => "leave").increment(1);
            return HysteresisOutcome {
                verdict: Verdict::Admit,
                active_ip_count,
                captcha_mode: false,
                blacklist_reason: None,
                relaxed_notice: false,
            };
        }

        if captcha_mode {
            if !self.captcha_config.strict_mode
                && self.captcha_config.allow_api_when_captcha_active
                && is_api_request
            {
                return HysteresisOutcome {
                    verdict: Verdict::Admit,
                    active_ip_count,
                    captcha_mode: true,
                    blacklist_reason: None,
                    relaxed_notice: true,
                };
            }
            let reason = "CAPTCHA_ACTIVE".to_string();
            self.blacklist(ip, &reason).await;
            return HysteresisOutcome {
                verdict: Verdict::Challenge,
                active_ip_count,
                captcha_mode: true,
                blacklist_reason: Some(reason),
                relaxed_notice: false,
            };
        }

        HysteresisOutcome {
            verdict: Verdict::Admit,
            active_ip_count,
            captcha_mode: false,
            blacklist_reason: None,
            relaxed_notice: false,
        }
    }

    /// Shared list pre-check (§4.5 steps 1, 2, 3): skip-path, whitelist,
    /// blacklist — in that order, "first match wins". Both
    /// `track_and_check_hysteresis` and the rate-limiter check must be
    /// skipped once this returns `in_whitelist` or a non-`Admit` verdict, so
    /// that neither the DDoS hysteresis branch nor the sliding-window
    /// limiter can blacklist an IP the list check already disposed of.
    pub async fn check_lists(&self, ip: &IpAddr, path: &str) -> ListOutcome {
        if self.is_skip_path(path) {
            return ListOutcome {
                verdict: Verdict::Admit,
                skip: true,
                in_whitelist: false,
                in_blacklist: false,
                blacklist_info: None,
            };
        }

        if self.is_whitelisted(ip).await {
            return ListOutcome {
                verdict: Verdict::Admit,
                skip: false,
                in_whitelist: true,
                in_blacklist: false,
                blacklist_info: None,
            };
        }

        if let Some(info) = self.blacklist_info(ip).await {
            return ListOutcome {
                verdict: Verdict::Challenge,
                skip: false,
                in_whitelist: false,
                in_blacklist: true,
                blacklist_info: Some(info),
            };
        }

        ListOutcome {
            verdict: Verdict::Admit,
            skip: false,
            in_whitelist: false,
            in_blacklist: false,
            blacklist_info: None,
        }
    }

    /// Sliding-window limiter stage only (§4.5 step 5), assuming the caller
    /// already ran `check_lists` and got a plain `Admit`.
    pub async fn check_rate_limit(&self, rules: &PathRuleTable, ip: &IpAddr, path: &str) -> RateLimitOutcome {
        let decision = self.limiter.check(rules, ip, path).await;
        if !decision.allowed {
            let reason = format!("IP_RATE_LIMIT:{}", decision.limit_type);
            if self.config.black_list_enabled {
                self.blacklist(ip, &reason).await;
            }
            return RateLimitOutcome {
                verdict: Verdict::Challenge,
                in_whitelist: false,
                in_blacklist: self.config.black_list_enabled,
                blacklist_info: Some(reason),
                rate_limited: true,
                rate_limit_type: Some(decision.limit_type),
            };
        }

        RateLimitOutcome {
            verdict: Verdict::Admit,
            in_whitelist: false,
            in_blacklist: false,
            blacklist_info: None,
            rate_limited: false,
            rate_limit_type: Some(decision.limit_type),
        }
    }

    /// List/limiter stage (§4.5 steps 1, 2, 3, 5), combining `check_lists`
    /// and `check_rate_limit` for callers (tests, and any future single-shot
    /// caller) that want the full list+limiter verdict in one call.
    pub async fn evaluate_rate_limit_and_lists(
        &self,
        rules: &PathRuleTable,
        ip: &IpAddr,
        path: &str,
    ) -> RateLimitOutcome {
        let lists = self.check_lists(ip, path).await;
        if lists.skip || lists.in_whitelist {
            return RateLimitOutcome {
                verdict: Verdict::Admit,
                in_whitelist: lists.in_whitelist,
                in_blacklist: false,
                blacklist_info: None,
                rate_limited: false,
                rate_limit_type: None,
            };
        }
        if lists.verdict == Verdict::Challenge {
            return RateLimitOutcome {
                verdict: Verdict::Challenge,
                in_whitelist: false,
                in_blacklist: true,
                blacklist_info: lists.blacklist_info,
                rate_limited: false,
                rate_limit_type: None,
            };
        }

        self.check_rate_limit(rules, ip, path).await
    }

    pub async fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.store.exists(&whitelist_key(ip)).await.unwrap_or(false)
    }

    pub async fn blacklist_info(&self, ip: &IpAddr) -> Option<String> {
        self.store.get(&blacklist_key(ip)).await.unwrap_or(None)
    }

    pub async fn whitelist(&self, ip: &IpAddr) {
        let ttl = Duration::from_secs(self.config.white_list_duration_minutes * 60);
        if let Err(e) = self.store.set_with_ttl(&whitelist_key(ip), "1", ttl).await {
            tracing::warn!(error = %e, %ip, "admission: failed to whitelist ip");
        }
    }

    pub async fn blacklist(&self, ip: &IpAddr, reason: &str) {
        let ttl = Duration::from_secs(self.config.black_list_duration_minutes * 60);
        if let Err(e) = self.store.set_with_ttl(&blacklist_key(ip), reason, ttl).await {
            tracing::warn!(error = %e, %ip, reason, "admission: failed to blacklist ip");
        }
        metrics::counter!("gateway_admission_blacklist_total", "reason" => reason.to_string()).increment(1);
    }

    pub async fn remove_whitelist(&self, ip: &IpAddr) {
        if let Err(e) = self.store.delete(&whitelist_key(ip)).await {
            tracing::warn!(error = %e, %ip, "admission: failed to remove ip from whitelist");
        }
    }

    pub async fn remove_blacklist(&self, ip: &IpAddr) {
        if let Err(e) = self.store.delete(&blacklist_key(ip)).await {
            tracing::warn!(error = %e, %ip, "admission: failed to remove ip from blacklist");
        }
    }

    /// Admin-initiated blacklist (§6 `POST .../admin/blacklist/{ip}?durationMinutes=`):
    /// same as the automatic path, except the TTL may be overridden per call
    /// instead of always using the configured default.
    pub async fn blacklist_with_ttl(&self, ip: &IpAddr, reason: &str, duration_minutes: Option<u64>) {
        let minutes = duration_minutes.unwrap_or(self.config.black_list_duration_minutes);
        let ttl = Duration::from_secs(minutes * 60);
        if let Err(e) = self.store.set_with_ttl(&blacklist_key(ip), reason, ttl).await {
            tracing::warn!(error = %e, %ip, reason, "admission: failed to blacklist ip (admin)");
        }
        metrics::counter!("gateway_admission_blacklist_total", "reason" => reason.to_string()).increment(1);
    }

    /// Current mirror of the global `CAPTCHA_MODE` flag, for the admin
    /// `stats` endpoint. Reads the Store directly rather than the
    /// request-path hint so it reflects reality even with no recent traffic.
    pub async fn captcha_mode(&self) -> bool {
        self.store.exists(GLOBAL_CAPTCHA_FLAG_KEY).await.unwrap_or(false)
    }

    /// Read-only active-IP count for the admin `stats` endpoint (§6).
    pub async fn active_ip_count_now(&self) -> u64 {
        let window = Duration::from_secs(self.config.ip_track_duration_seconds);
        self.store
            .active_ip_count(ACTIVE_SET_KEY, now_millis(), window)
            .await
            .unwrap_or(0)
    }

    /// `POST /api/rate-limit/admin/reset-captcha` (§6): force-clears the
    /// global `CAPTCHA_MODE` flag regardless of the current active-IP count.
    pub async fn reset_captcha_mode(&self) {
        if let Err(e) = self.store.delete(GLOBAL_CAPTCHA_FLAG_KEY).await {
            tracing::warn!(error = %e, "admission: admin reset-captcha failed to clear flag");
        }
        self.captcha_mode_hint.store(false, Ordering::Relaxed);
        metrics::counter!("gateway_admission_ddos_mode_transitions_total", "direction" => "leave_admin").increment(1);
    }
}
