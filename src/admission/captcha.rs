use crate::admission::abuse_state_machine::AbuseStateMachine;
use crate::admission::state_store::StateStore;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

const CAPTCHA_TEXT_TTL: Duration = Duration::from_secs(60);
const CAPTCHA_TEXT_LEN: usize = 6;

fn captcha_key(ip: &IpAddr) -> String {
    format!("captcha_text:{ip}")
}

/// Issues and verifies per-IP CAPTCHA challenges (§4.6). Independent of the
/// whitelist/blacklist flags it ultimately mutates on success.
pub struct CaptchaVerifier {
    store: Arc<dyn StateStore>,
}

impl CaptchaVerifier {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Generates a challenge string for `ip` and stores it with a 1-minute
    /// TTL, independent of any other admission state (§4.6 "Issue").
    pub async fn issue(&self, ip: &IpAddr) -> String {
        let text: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CAPTCHA_TEXT_LEN)
            .map(char::from)
            .collect();

        if let Err(e) = self.store.set_with_ttl(&captcha_key(ip), &text, CAPTCHA_TEXT_TTL).await {
            tracing::warn!(error = %e, %ip, "admission: failed to store captcha text");
        }
        text
    }

    /// Verifies `submitted` against the stored expected text for `ip`. On
    /// match, removes the IP from the blacklist, inserts it into the
    /// whitelist, and deletes the captcha-text entry, in that order,
    /// tolerating partial failure by logging (§4.6 "Verify").
    pub async fn verify(&self, ip: &IpAddr, submitted: &str, abuse: &AbuseStateMachine) -> bool {
        let expected = match self.store.get(&captcha_key(ip)).await {
            Ok(Some(v)) => v,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(error = %e, %ip, "admission: captcha lookup failed");
                return false;
            }
        };

        if submitted != expected {
            return false;
        }

        abuse.remove_blacklist(ip).await;
        abuse.whitelist(ip).await;
        if let Err(e) = self.store.delete(&captcha_key(ip)).await {
            tracing::warn!(error = %e, %ip, "admission: failed to delete consumed captcha text");
        }

        metrics::counter!("gateway_admission_captcha_verified_total").increment(1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::limiter::SlidingWindowLimiter;
    use crate::admission::state_store::MemoryStore;
    use crate::config::{CaptchaConfig, RateLimitAdmissionConfig};

    fn setup() -> (CaptchaVerifier, AbuseStateMachine) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let limiter = SlidingWindowLimiter::new(store.clone(), "rl", 60, 100);
        let abuse = AbuseStateMachine::new(store.clone(), limiter, RateLimitAdmissionConfig::default(), CaptchaConfig::default());
        (CaptchaVerifier::new(store), abuse)
    }

    #[tokio::test]
    async fn correct_submission_whitelists_and_consumes_challenge() {
        let (verifier, abuse) = setup();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        abuse.blacklist(&ip, "test").await;

        let text = verifier.issue(&ip).await;
        assert!(verifier.verify(&ip, &text, &abuse).await);
        assert!(abuse.is_whitelisted(&ip).await);
        assert!(abuse.blacklist_info(&ip).await.is_none());

        // Replaying the same text fails — the entry was deleted on success.
        assert!(!verifier.verify(&ip, &text, &abuse).await);
    }

    #[tokio::test]
    async fn wrong_submission_leaves_lists_untouched() {
        let (verifier, abuse) = setup();
        let ip: IpAddr = "5.6.7.8".parse().unwrap();
        abuse.blacklist(&ip, "test").await;
        verifier.issue(&ip).await;

        assert!(!verifier.verify(&ip, "wrong-guess", &abuse).await);
        assert!(!abuse.is_whitelisted(&ip).await);
        assert!(abuse.blacklist_info(&ip).await.is_some());
    }

    #[tokio::test]
    async fn verify_with_no_issued_challenge_fails() {
        let (verifier, abuse) = setup();
        let ip: IpAddr = "9.9.9.9".parse().unwrap();
        assert!(!verifier.verify(&ip, "anything", &abuse).await);
    }
}
