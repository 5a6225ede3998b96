use super::GatewayState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use std::collections::HashMap;
use std::net::IpAddr;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json(status: u16, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

fn not_found() -> Response<BoxBody> {
    json(404, r#"{"error":"not found"}"#.to_string())
}

/// Parses a query string into a lookup map. No percent-decoding — admin
/// callers pass plain IPs/reasons/integers, same shortcut
/// `admission_phase::query_param` takes for the CAPTCHA form body.
fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let k = parts.next()?;
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), parts.next().unwrap_or("").to_string()))
        })
        .collect()
}

/// Extracts the `{ip}` path parameter after `prefix`, parsed as an `IpAddr`.
fn ip_param(path: &str, prefix: &str) -> Option<IpAddr> {
    path.strip_prefix(prefix)?.parse().ok()
}

/// Admission-pipeline admin endpoints (§6 "Admin surface"). These merely
/// expose/mutate `AdmissionState`'s durable lists and flags — the REST
/// surface itself is out of scope per spec §1, but the straightforward
/// handlers over it are worth having on the existing admin listener rather
/// than leaving the lists/flags operator-invisible. Returns `None` when
/// `path` doesn't match any admission admin route, so `handle_admin` falls
/// through to its own routes (including 404).
async fn handle_rate_limit_admin(
    method: &Method,
    path: &str,
    query: &HashMap<String, String>,
    state: &GatewayState,
) -> Option<Response<BoxBody>> {
    let admission = &state.admission;

    if method == Method::GET && (path == "/health/redis" || path == "/api/rate-limit/health/redis") {
        let healthy = admission.store_health.is_healthy();
        return Some(json(if healthy { 200 } else { 503 }, format!(r#"{{"healthy":{healthy}}}"#)));
    }

    if method == Method::GET && path == "/api/rate-limit/status" {
        let Some(ip) = query.get("ip").and_then(|s| s.parse::<IpAddr>().ok()) else {
            return Some(json(400, r#"{"error":"missing or invalid ip query parameter"}"#.to_string()));
        };
        let in_whitelist = admission.abuse.is_whitelisted(&ip).await;
        let blacklist_info = admission.abuse.blacklist_info(&ip).await;
        let body = serde_json::json!({
            "ip": ip.to_string(),
            "in_whitelist": in_whitelist,
            "in_blacklist": blacklist_info.is_some(),
            "blacklist_info": blacklist_info,
            "captcha_mode": admission.abuse.captcha_mode().await,
        });
        return Some(json(200, body.to_string()));
    }

    if method == Method::POST && path == "/api/rate-limit/verify-captcha" {
        let (Some(ip), Some(captcha)) = (
            query.get("ip").and_then(|s| s.parse::<IpAddr>().ok()),
            query.get("captcha"),
        ) else {
            return Some(json(400, r#"{"error":"missing ip or captcha query parameter"}"#.to_string()));
        };
        let ok = admission.captcha.verify(&ip, captcha, &admission.abuse).await;
        return Some(json(200, format!(r#"{{"success":{ok}}}"#)));
    }

    if let Some(ip) = ip_param(path, "/api/rate-limit/admin/whitelist/") {
        return Some(match *method {
            Method::POST => {
                admission.abuse.whitelist(&ip).await;
                json(200, r#"{"success":true}"#.to_string())
            }
            Method::DELETE => {
                admission.abuse.remove_whitelist(&ip).await;
                json(200, r#"{"success":true}"#.to_string())
            }
            _ => json(405, r#"{"error":"method not allowed"}"#.to_string()),
        });
    }

    if let Some(ip) = ip_param(path, "/api/rate-limit/admin/blacklist/check/") {
        if *method == Method::GET {
            let info = admission.abuse.blacklist_info(&ip).await;
            let body = serde_json::json!({"ip": ip.to_string(), "blacklisted": info.is_some(), "info": info});
            return Some(json(200, body.to_string()));
        }
    }

    if let Some(ip) = ip_param(path, "/api/rate-limit/admin/blacklist/") {
        return Some(match *method {
            Method::POST => {
                let reason = query.get("reason").cloned().unwrap_or_else(|| "ADMIN_MANUAL".to_string());
                let duration_minutes = query.get("durationMinutes").and_then(|s| s.parse::<u64>().ok());
                admission.abuse.blacklist_with_ttl(&ip, &reason, duration_minutes).await;
                json(200, r#"{"success":true}"#.to_string())
            }
            Method::DELETE => {
                admission.abuse.remove_blacklist(&ip).await;
                json(200, r#"{"success":true}"#.to_string())
            }
            _ => json(405, r#"{"error":"method not allowed"}"#.to_string()),
        });
    }

    if method == Method::POST && path == "/api/rate-limit/admin/reset-captcha" {
        admission.abuse.reset_captcha_mode().await;
        return Some(json(200, r#"{"success":true}"#.to_string()));
    }

    if method == Method::GET && path == "/api/rate-limit/admin/stats" {
        let body = serde_json::json!({
            "captcha_mode": admission.abuse.captcha_mode().await,
            "active_ip_count": admission.abuse.active_ip_count_now().await,
            "audit_record_count": admission.audit.count().await,
            "store_healthy": admission.store_health.is_healthy(),
        });
        return Some(json(200, body.to_string()));
    }

    if method == Method::GET && path == "/admin/rate-limit-logs/by-ip" {
        let Some(ip) = query.get("ip").and_then(|s| s.parse::<IpAddr>().ok()) else {
            return Some(json(400, r#"{"error":"missing or invalid ip query parameter"}"#.to_string()));
        };
        let limit = query.get("limit").and_then(|s| s.parse::<usize>().ok()).unwrap_or(100);
        let records = admission.audit.by_ip(&ip, limit).await;
        return Some(json(200, serde_json::to_string(&records).unwrap_or_else(|_| "[]".to_string())));
    }

    if method == Method::GET && path == "/admin/rate-limit-logs/count" {
        let count = admission.audit.count().await;
        return Some(json(200, format!(r#"{{"count":{count}}}"#)));
    }

    if method == Method::GET && path == "/admin/rate-limit-logs/ddos" {
        let limit = query.get("limit").and_then(|s| s.parse::<usize>().ok()).unwrap_or(100);
        let records = admission.audit.ddos_events(limit).await;
        return Some(json(200, serde_json::to_string(&records).unwrap_or_else(|_| "[]".to_string())));
    }

    None
}

pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(parse_query).unwrap_or_default();

    if let Some(resp) = handle_rate_limit_admin(&method, &path, &query, &state).await {
        return Ok(resp);
    }

    match path.as_str() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let cfg = state.config.load();
            let route_count = cfg.total_route_count();
            Ok(Response::builder()
                .status(200)
                .body(full_body(format!(
                    r#"{{"status":"ready","domains":{},"total_routes":{}}}"#,
                    cfg.domains.len(),
                    route_count,
                )))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/domains" => {
            let cfg = state.config.load();
            let domains: Vec<serde_json::Value> = cfg
                .domains
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "name": d.name,
                        "hosts": d.hosts,
                        "routes": d.routes.iter().map(|r| {
                            serde_json::json!({
                                "name": r.name,
                                "uri": r.uri,
                                "methods": r.methods,
                                "headers": r.headers.iter().map(|h| {
                                    serde_json::json!({
                                        "name": h.name,
                                        "value": h.value,
                                        "match_type": h.match_type,
                                        "invert": h.invert,
                                    })
                                }).collect::<Vec<_>>(),
                                "priority": r.priority,
                                "clusters": r.clusters.iter().map(|c| {
                                    serde_json::json!({"name": c.name, "weight": c.weight})
                                }).collect::<Vec<_>>(),
                            })
                        }).collect::<Vec<_>>(),
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&domains).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        "/routes" => {
            let table = state.routing.route_table.load();
            let routes: Vec<serde_json::Value> = table
                .all_routes()
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "name": r.name,
                        "uri": r.uri,
                        "priority": r.priority,
                        "clusters": r.cluster_selector.clusters().iter().map(|c| {
                            serde_json::json!({"name": c.name, "weight": c.weight})
                        }).collect::<Vec<_>>(),
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&routes).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(not_found()),
    }
}
