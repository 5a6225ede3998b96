use crate::config::{BrowserDetectionConfig, Strictness};
use http::HeaderMap;

/// Outcome of scoring one request (§4.4 "Browser Authenticity Scorer").
#[derive(Debug, Clone)]
pub struct ScoreResult {
    pub score: i64,
    pub threshold: i64,
    pub admit: bool,
    /// Axis names that pulled the score below what was needed to admit —
    /// surfaced in the 403 JSON body.
    pub failing_axes: Vec<&'static str>,
}

/// Stateless, deterministic additive scorer across three axes (§4.4).
/// Never suspends — CPU-bound and bounded, per §5 "Scheduling".
pub fn score(headers: &HeaderMap, config: &BrowserDetectionConfig) -> ScoreResult {
    let ua = headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let (ua_score, ua_failed) = score_user_agent(ua, config);
    let (header_score, header_failed) = score_headers(headers, config);
    let (js_score, _) = score_js_support(headers);

    let total = ua_score + header_score + js_score;
    let threshold = config.strictness.threshold();

    let mut failing_axes = Vec::new();
    if ua_failed {
        failing_axes.push("user_agent");
    }
    if header_failed {
        failing_axes.push("headers");
    }

    ScoreResult {
        score: total,
        threshold,
        admit: total >= threshold,
        failing_axes,
    }
}

/// What to do when the scorer itself errors (malformed input it cannot
/// reason about) — STRICT rejects, MODERATE/LOOSE admit (§4.4).
pub fn admit_on_scorer_error(strictness: Strictness) -> bool {
    !matches!(strictness, Strictness::Strict)
}

fn score_user_agent(ua: &str, config: &BrowserDetectionConfig) -> (i64, bool) {
    let mut score: i64 = 0;
    let mut failed = false;

    if ua.is_empty() {
        score -= 50;
        failed = true;
    } else {
        let lower = ua.to_lowercase();

        if ua.len() < config.min_user_agent_length {
            score -= 30;
        } else if ua.len() > config.max_user_agent_length {
            score -= 20;
        }

        // First bot-keyword match only (§4.4).
        if config.bot_keywords.iter().any(|k| lower.contains(k.as_str())) {
            score -= 80;
            failed = true;
        }

        if !config.real_browser_keywords.iter().any(|k| lower.contains(k.as_str())) {
            score -= 40;
        } else {
            score += 20;
        }

        if config.mobile_keywords.iter().any(|k| lower.contains(k.as_str())) {
            score += 10;
        }

        let complex = ua.contains('(') && ua.contains(';');
        if complex {
            score += 15;
        } else {
            score -= 25;
        }
    }

    (score, failed)
}

fn score_headers(headers: &HeaderMap, config: &BrowserDetectionConfig) -> (i64, bool) {
    let mut score: i64 = 0;

    let mut missing = 0usize;
    for name in &config.required_headers {
        if headers.contains_key(name.as_str()) {
            score += 5;
        } else {
            score -= 15;
            missing += 1;
        }
    }
    let too_many_missing = missing > 2;
    if too_many_missing {
        score -= 30;
    }

    if let Some(accept) = headers.get(http::header::ACCEPT).and_then(|v| v.to_str().ok()) {
        if accept.trim() == "*/*" {
            score -= 20;
        } else if accept.contains("text/html") {
            score += 15;
        }
    }

    if let Some(al) = headers.get(http::header::ACCEPT_LANGUAGE).and_then(|v| v.to_str().ok()) {
        if al.contains("q=") {
            score += 10;
        }
    }

    if let Some(ae) = headers.get(http::header::ACCEPT_ENCODING).and_then(|v| v.to_str().ok()) {
        let lower = ae.to_lowercase();
        if lower.contains("gzip") || lower.contains("deflate") {
            score += 10;
        }
    }

    for suspicious in &config.suspicious_headers {
        if headers.contains_key(suspicious.as_str()) {
            score -= 10;
        }
    }

    if let Some(conn) = headers.get(http::header::CONNECTION).and_then(|v| v.to_str().ok()) {
        if conn.eq_ignore_ascii_case("keep-alive") {
            score += 5;
        }
    }

    (score, too_many_missing)
}

fn score_js_support(headers: &HeaderMap) -> (i64, bool) {
    let mut score: i64 = 0;

    if headers
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
        .unwrap_or(false)
    {
        score += 20;
    }

    if headers.contains_key(http::header::REFERER) {
        score += 10;
    }

    (score, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    #[test]
    fn curl_with_no_headers_is_rejected_under_moderate() {
        let cfg = BrowserDetectionConfig {
            strictness: Strictness::Moderate,
            ..Default::default()
        };
        let h = headers(&[("user-agent", "curl/7.79")]);
        let result = score(&h, &cfg);
        assert!(!result.admit, "score={}", result.score);
    }

    #[test]
    fn full_browser_headers_are_admitted_under_moderate() {
        let cfg = BrowserDetectionConfig {
            strictness: Strictness::Moderate,
            ..Default::default()
        };
        let h = headers(&[
            ("user-agent", "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0"),
            ("accept", "text/html,*/*"),
            ("accept-language", "en-US,en;q=0.9"),
            ("accept-encoding", "gzip, deflate, br"),
            ("connection", "keep-alive"),
        ]);
        let result = score(&h, &cfg);
        assert!(result.admit, "score={}", result.score);
    }

    #[test]
    fn scorer_is_deterministic() {
        let cfg = BrowserDetectionConfig::default();
        let h = headers(&[("user-agent", "Mozilla/5.0 (X11; Linux x86_64) Firefox/120.0")]);
        let a = score(&h, &cfg);
        let b = score(&h, &cfg);
        assert_eq!(a.score, b.score);
    }

    #[test]
    fn missing_user_agent_is_heavily_penalized() {
        let cfg = BrowserDetectionConfig::default();
        let h = HeaderMap::new();
        let result = score(&h, &cfg);
        assert!(result.score < 0);
        assert!(result.failing_axes.contains(&"user_agent"));
    }

    #[test]
    fn fail_open_policy_matches_strictness() {
        assert!(!admit_on_scorer_error(Strictness::Strict));
        assert!(admit_on_scorer_error(Strictness::Moderate));
        assert!(admit_on_scorer_error(Strictness::Loose));
    }
}
