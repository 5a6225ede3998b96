//! Admission filter chain (§4.7): runs once per connection ahead of routing,
//! since admission policy is not tied to which upstream route a request
//! matches (§9 "Reactive-to-imperative translation"). Canonical order:
//!
//! ```text
//! TRACE_INIT < DDOS_DEFENSE < BROWSER_DETECTION < API_RATE_LIMIT
//! < REQUEST_LOGGER < ACCESS_LOGGER < ACCESS_RECORDER
//! ```
//!
//! `REQUEST_LOGGER`/`ACCESS_LOGGER`/`ACCESS_RECORDER` are folded into
//! `proxy::handler::phase_log`'s existing access-log line plus
//! `record_audit` below, rather than duplicating a second logging pass.

use crate::admission::abuse_state_machine::Verdict;
use crate::admission::audit::{filter_sensitive_headers, AdmissionRecord};
use crate::admission::state_store::now_millis;
use crate::admission::AdmissionState;
use crate::proxy::context::{empty_body, full_body, BoxBody, RequestContext};
use http::{HeaderMap, Method, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};
use http_body_util::BodyExt;
use std::net::SocketAddr;

const VALIDATE_CAPTCHA_PATH: &str = "/validate-captcha";

/// Runs `DDOS_DEFENSE`, `BROWSER_DETECTION`, and `API_RATE_LIMIT`. Returns
/// `Some(response)` to short-circuit the pipeline (§4.5 "challenge"),
/// `None` to continue to route matching.
pub async fn run(
    req_headers: &HeaderMap,
    peer_addr: SocketAddr,
    ctx: &mut RequestContext,
    admission: &AdmissionState,
) -> Option<Response<BoxBody>> {
    let cfg = &admission.config;
    if !cfg.rate_limit.enabled && !cfg.browser_detection.enabled {
        return None;
    }

    // TRACE_INIT — resolve the canonical client IP once and write it back
    // into the attribute bus (§4.3).
    ctx.client_ip = crate::admission::identity::resolve_client_ip(req_headers, peer_addr.ip(), &cfg.x_forwarded_for);
    ctx.is_api_request = ctx.uri_path.starts_with("/api");
    let is_api_request = ctx.is_api_request;

    // Shared list pre-check (§4.5 steps 1-3), evaluated once ahead of both
    // the `DdosDefense` and `ApiRateLimit` slots (§9 open question #1
    // resolution) — a whitelisted or already-blacklisted IP must never reach
    // the hysteresis branch below, which has no whitelist awareness of its
    // own.
    let mut skip_rate_limit_checks = false;
    if cfg.rate_limit.enabled {
        let lists = admission.abuse.check_lists(&ctx.client_ip, &ctx.uri_path).await;
        ctx.in_whitelist = lists.in_whitelist;
        ctx.in_blacklist = lists.in_blacklist;
        if lists.blacklist_info.is_some() {
            ctx.blacklist_info = lists.blacklist_info.clone();
        }
        if lists.verdict == Verdict::Challenge {
            return Some(challenge_response(admission, ctx));
        }
        skip_rate_limit_checks = lists.skip || lists.in_whitelist;

        if !skip_rate_limit_checks {
            let hysteresis = admission
                .abuse
                .track_and_check_hysteresis(&ctx.client_ip, &ctx.uri_path, is_api_request)
                .await;
            if hysteresis.verdict == Verdict::Challenge {
                ctx.in_blacklist = true;
                ctx.blacklist_info = hysteresis.blacklist_reason;
                return Some(challenge_response(admission, ctx));
            }
        }
    }

    if cfg.browser_detection.enabled {
        let result = crate::admission::browser_scorer::score(req_headers, &cfg.browser_detection);
        if !result.admit {
            tracing::debug!(
                client_ip = %ctx.client_ip,
                score = result.score,
                threshold = result.threshold,
                failing_axes = ?result.failing_axes,
                "admission: browser authenticity rejected"
            );
            metrics::counter!("gateway_admission_browser_rejected_total").increment(1);
            let message = format!("not a browser: failing axes {:?}", result.failing_axes);
            let body = format!(
                r#"{{"success":false,"message":"{message}","code":403,"timestamp":{}}}"#,
                now_millis()
            );
            ctx.response_body_excerpt = Some(body.clone());
            return Some(
                apply_security_headers(
                    Response::builder()
                        .status(StatusCode::FORBIDDEN)
                        .header("content-type", "application/json"),
                )
                .body(full_body(body))
                .unwrap(),
            );
        }
    }

    if cfg.rate_limit.enabled && !skip_rate_limit_checks {
        let rules = admission.path_rules();
        let outcome = admission
            .abuse
            // `rules` is an `arc_swap::Guard<Arc<PathRuleTable>>`; auto-deref
            // through `Arc` resolves `&rules` to `&PathRuleTable` here.
            .check_rate_limit(&rules, &ctx.client_ip, &ctx.uri_path)
            .await;
        ctx.rate_limited = outcome.rate_limited;
        ctx.rate_limit_type = outcome.rate_limit_type;

        if outcome.verdict == Verdict::Challenge {
            ctx.in_blacklist = true;
            ctx.blacklist_info = outcome.blacklist_info;
            return Some(challenge_response(admission, ctx));
        }
    }

    None
}

/// Terminal "challenge" response (§6, GLOSSARY "Challenge"): page clients get
/// a 302 to the CAPTCHA page, API clients get a 429 with one of two JSON
/// bodies depending on whether a rate-limit rule or the DDoS/blacklist path
/// is what triggered the challenge.
fn challenge_response(admission: &AdmissionState, ctx: &mut RequestContext) -> Response<BoxBody> {
    metrics::counter!("gateway_admission_challenged_total").increment(1);

    if ctx.is_api_request {
        let message = if ctx.rate_limited {
            "请求频率过高，请稍后再试"
        } else {
            "需要验证码验证"
        };
        let body = format!(r#"{{"code":429,"message":"{message}","data":null}}"#);
        ctx.response_body_excerpt = Some(body.clone());
        return apply_security_headers(
            Response::builder()
                .status(StatusCode::TOO_MANY_REQUESTS)
                .header("content-type", "application/json"),
        )
        .body(full_body(body))
        .unwrap();
    }

    let redirect_url = admission.abuse.captcha_page_url();
    apply_security_headers(
        Response::builder()
            .status(StatusCode::FOUND)
            .header("location", redirect_url),
    )
    .body(empty_body())
    .unwrap()
}

/// Attaches the §6 "Security response headers" to a response builder. These
/// are set on every admission-pipeline terminal response, as well as on the
/// pass-through path (`proxy::handler::handle_request`) whenever the
/// admission pipeline is active — there is no separate config toggle in the
/// enumerated configuration keys (§6), so this rides the same
/// `rate_limit.enabled`/`browser_detection.enabled` master switches the rest
/// of the pipeline uses.
pub fn apply_security_headers(builder: http::response::Builder) -> http::response::Builder {
    builder
        .header("x-xss-protection", "1; mode=block")
        .header("x-frame-options", "SAMEORIGIN")
        .header("x-content-type-options", "nosniff")
        .header("referrer-policy", "no-referrer")
        .header(
            "content-security-policy",
            "default-src 'self'; style-src 'self' 'unsafe-inline'; script-src 'self' 'unsafe-inline'; frame-src 'self';",
        )
}

/// Adds the §6 security headers and `X-Trace-Id` to an already-built
/// response, for the "Admitted" pass-through path where the response comes
/// back from the upstream cluster rather than being built locally.
pub fn annotate_admitted_response(resp: &mut Response<BoxBody>, ctx: &RequestContext, admission: &AdmissionState) {
    if !admission.config.rate_limit.enabled && !admission.config.browser_detection.enabled {
        return;
    }
    let headers = resp.headers_mut();
    if let Ok(v) = http::HeaderValue::from_str(&ctx.record_id) {
        headers.insert("x-trace-id", v);
    }
    headers.insert("x-xss-protection", http::HeaderValue::from_static("1; mode=block"));
    headers.insert("x-frame-options", http::HeaderValue::from_static("SAMEORIGIN"));
    headers.insert("x-content-type-options", http::HeaderValue::from_static("nosniff"));
    headers.insert("referrer-policy", http::HeaderValue::from_static("no-referrer"));
    headers.insert(
        "content-security-policy",
        http::HeaderValue::from_static(
            "default-src 'self'; style-src 'self' 'unsafe-inline'; script-src 'self' 'unsafe-inline'; frame-src 'self';",
        ),
    );
}

/// RAII guard for §5 "Cancellation": if a client disconnects before the
/// request reaches any of `handle_request_phases`'s normal exit points, the
/// `async fn` driving it is dropped mid-poll and none of those exit points
/// ever runs `record_audit`. This guard's `Drop` impl is the only code that
/// still runs in that case, and it enqueues a `response_status=499` audit
/// record. Callers must call `mark_completed()` on every normal exit so the
/// guard does not also fire for requests that finished normally.
pub struct DisconnectAuditGuard {
    admission: AdmissionState,
    record_id: String,
    client_ip: std::net::IpAddr,
    path: String,
    method: String,
    completed: bool,
}

impl DisconnectAuditGuard {
    pub fn new(ctx: &RequestContext, admission: &AdmissionState) -> Self {
        Self {
            admission: admission.clone(),
            record_id: ctx.record_id.clone(),
            client_ip: ctx.client_ip,
            path: ctx.uri_path.clone(),
            method: ctx.method.clone(),
            completed: false,
        }
    }

    /// Refreshes the snapshot from `ctx` after the admission phase resolves
    /// the trust-aware client IP, so a disconnect later in the pipeline
    /// reports the real client rather than the raw TCP peer.
    pub fn sync_from_ctx(&mut self, ctx: &RequestContext) {
        self.client_ip = ctx.client_ip;
    }

    pub fn mark_completed(&mut self) {
        self.completed = true;
    }
}

impl Drop for DisconnectAuditGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if !self.admission.config.rate_limit.enabled && !self.admission.config.browser_detection.enabled {
            return;
        }
        let record = AdmissionRecord {
            record_id: self.record_id.clone(),
            timestamp_ms: now_millis(),
            client_ip: self.client_ip,
            path: self.path.clone(),
            method: self.method.clone(),
            verdict: "CANCELLED".to_string(),
            rate_limited: false,
            rate_limit_type: None,
            in_whitelist: false,
            in_blacklist: false,
            blacklist_info: None,
            response_status: Some(499),
            response_body_excerpt: None,
            headers: Vec::new(),
        };
        self.admission.audit.enqueue(record);
    }
}

/// `ACCESS_RECORDER` — assembles and enqueues the durable audit record after
/// the chain has run to completion (§4.8). Never blocks the caller.
pub fn record_audit(ctx: &RequestContext, req_headers: &HeaderMap, response_status: u16, admission: &AdmissionState) {
    if !admission.config.rate_limit.enabled && !admission.config.browser_detection.enabled {
        return;
    }

    let headers = req_headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let record = AdmissionRecord {
        record_id: ctx.record_id.clone(),
        timestamp_ms: now_millis(),
        client_ip: ctx.client_ip,
        path: ctx.uri_path.clone(),
        method: ctx.method.clone(),
        verdict: if ctx.in_blacklist { "CHALLENGE".to_string() } else { "ADMIT".to_string() },
        rate_limited: ctx.rate_limited,
        rate_limit_type: ctx.rate_limit_type.clone(),
        in_whitelist: ctx.in_whitelist,
        in_blacklist: ctx.in_blacklist,
        blacklist_info: ctx.blacklist_info.clone(),
        response_status: Some(response_status),
        response_body_excerpt: ctx.response_body_excerpt.clone(),
        headers: filter_sensitive_headers(headers),
    };

    admission.audit.enqueue(record);
}

/// CAPTCHA Verifier HTTP surface (§4.6, §6): issue on `GET <captcha_page_path>`,
/// verify on `POST /validate-captcha`. Returns `Err(req)` with the request
/// handed back unconsumed when neither path matches, so the normal routing
/// phase can proceed.
///
/// This is core, not admin — §1 only excludes "the admin REST surface that
/// merely exposes the core's state" from scope; minting/verifying the
/// expected text is the algorithm itself.
pub async fn handle_captcha_endpoints(
    req: Request<Incoming>,
    ctx: &RequestContext,
    admission: &AdmissionState,
) -> Result<Response<BoxBody>, Request<Incoming>> {
    if !admission.config.rate_limit.enabled {
        return Err(req);
    }

    if req.method() == Method::GET && ctx.uri_path == admission.captcha_page_path() {
        let text = admission.captcha.issue(&ctx.client_ip).await;
        tracing::debug!(client_ip = %ctx.client_ip, len = text.len(), "admission: captcha challenge issued");
        metrics::counter!("gateway_admission_captcha_issued_total").increment(1);
        let body = format!(r#"{{"success":true,"message":"captcha issued","code":200}}"#);
        return Ok(apply_security_headers(
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json"),
        )
        .body(full_body(body))
        .unwrap());
    }

    if req.method() == Method::POST && ctx.uri_path == VALIDATE_CAPTCHA_PATH {
        let query_value = req.uri().query().map(|s| s.to_string());
        let submitted = match query_value.as_deref().and_then(|q| query_param(q, "captcha")) {
            Some(v) => v,
            None => {
                let body = match req.into_body().collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(_) => bytes::Bytes::new(),
                };
                let form = String::from_utf8_lossy(&body);
                query_param(&form, "captcha").unwrap_or_default()
            }
        };

        let ok = admission.captcha.verify(&ctx.client_ip, &submitted, &admission.abuse).await;
        let location = if ok { "/".to_string() } else { admission.abuse.captcha_page_url() };
        tracing::debug!(client_ip = %ctx.client_ip, ok, "admission: captcha verification attempt");
        return Ok(apply_security_headers(
            Response::builder().status(StatusCode::FOUND).header("location", location),
        )
        .body(empty_body())
        .unwrap());
    }

    Err(req)
}

/// Minimal `application/x-www-form-urlencoded`-style lookup — the CAPTCHA
/// text alphabet (§4.6) never needs percent-decoding in practice, so this
/// stays a plain split instead of pulling in a URL-encoding crate.
fn query_param(raw: &str, key: &str) -> Option<String> {
    raw.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let k = parts.next()?;
        let v = parts.next().unwrap_or("");
        if k == key {
            Some(v.to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionConfig;
    use std::net::IpAddr;

    async fn admission() -> AdmissionState {
        let mut cfg = AdmissionConfig::default();
        cfg.rate_limit.enabled = true;
        AdmissionState::new(cfg).await.unwrap()
    }

    fn ctx(ip: &str, path: &str) -> RequestContext {
        RequestContext::new("h".into(), path.into(), "GET".into(), ip.parse::<IpAddr>().unwrap())
    }

    #[tokio::test]
    async fn api_rate_limited_challenge_is_429_json_with_rate_limit_message() {
        let admission = admission().await;
        let mut c = ctx("1.1.1.1", "/api/x");
        c.is_api_request = true;
        c.rate_limited = true;
        let resp = challenge_response(&admission, &mut c);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(c.response_body_excerpt.as_deref().unwrap().contains("请求频率过高"));
    }

    #[tokio::test]
    async fn api_captcha_required_challenge_uses_captcha_message() {
        let admission = admission().await;
        let mut c = ctx("2.2.2.2", "/api/x");
        c.is_api_request = true;
        c.rate_limited = false;
        let resp = challenge_response(&admission, &mut c);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(c.response_body_excerpt.as_deref().unwrap().contains("需要验证码验证"));
    }

    #[tokio::test]
    async fn page_client_challenge_is_a_redirect() {
        let admission = admission().await;
        let mut c = ctx("3.3.3.3", "/x");
        c.is_api_request = false;
        let resp = challenge_response(&admission, &mut c);
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert!(resp.headers().get("location").is_some());
    }

    #[test]
    fn apply_security_headers_sets_all_five() {
        let resp = apply_security_headers(Response::builder().status(StatusCode::OK))
            .body(empty_body())
            .unwrap();
        for header in [
            "x-xss-protection",
            "x-frame-options",
            "x-content-type-options",
            "referrer-policy",
            "content-security-policy",
        ] {
            assert!(resp.headers().contains_key(header), "missing {header}");
        }
    }
}
