use std::collections::VecDeque;
use std::io::Write;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const SENSITIVE_HEADER_SUBSTRINGS: &[&str] = &["authorization", "cookie", "token", "password"];
const DAILY_SWEEP: Duration = Duration::from_secs(24 * 60 * 60);
const HOURLY_SWEEP: Duration = Duration::from_secs(60 * 60);

/// A single admission decision, assembled after the upstream call completes
/// (or the chain terminated early) and enqueued for durable write (§4.8).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AdmissionRecord {
    pub record_id: String,
    pub timestamp_ms: u64,
    pub client_ip: IpAddr,
    pub path: String,
    pub method: String,
    pub verdict: String,
    pub rate_limited: bool,
    pub rate_limit_type: Option<String>,
    pub in_whitelist: bool,
    pub in_blacklist: bool,
    pub blacklist_info: Option<String>,
    pub response_status: Option<u16>,
    pub response_body_excerpt: Option<String>,
    pub headers: Vec<(String, String)>,
}

/// Removes headers whose name matches a sensitive substring before a record
/// is ever queued for serialization (§4.8 "Sensitive headers").
pub fn filter_sensitive_headers(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| {
            let lower = name.to_lowercase();
            !SENSITIVE_HEADER_SUBSTRINGS.iter().any(|s| lower.contains(s))
        })
        .collect()
}

/// Bounded, non-blocking audit log (§4.8). Enqueue never blocks the request
/// path — the channel is bounded and `try_send` drops under pressure, the
/// same trade-off `tracing_appender::non_blocking` makes for the access log
/// (`server/bootstrap.rs::init_tracing`).
pub struct AuditSink {
    tx: mpsc::Sender<AdmissionRecord>,
    records: Arc<Mutex<VecDeque<AdmissionRecord>>>,
}

impl AuditSink {
    pub fn start(channel_capacity: usize, retention_days: u32, log_path: Option<std::path::PathBuf>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<AdmissionRecord>(channel_capacity);
        let records = Arc::new(Mutex::new(VecDeque::new()));

        let writer_records = records.clone();
        tokio::spawn(async move {
            let mut file = log_path.and_then(|p| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&p)
                    .map_err(|e| tracing::warn!(error = %e, path = %p.display(), "admission: failed to open audit log file"))
                    .ok()
            });

            let mut daily = tokio::time::interval(DAILY_SWEEP);
            let mut hourly = tokio::time::interval(HOURLY_SWEEP);

            loop {
                tokio::select! {
                    record = rx.recv() => {
                        match record {
                            Some(record) => {
                                if let Some(f) = file.as_mut() {
                                    if let Ok(line) = serde_json::to_string(&record) {
                                        if let Err(e) = writeln!(f, "{line}") {
                                            tracing::warn!(error = %e, "admission: audit log write failed");
                                        }
                                    }
                                }
                                let mut guard = writer_records.lock().await;
                                guard.push_back(record);
                            }
                            None => break,
                        }
                    }
                    _ = daily.tick() => {
                        sweep(&writer_records, retention_days).await;
                    }
                    _ = hourly.tick() => {
                        sweep(&writer_records, retention_days + 1).await;
                    }
                }
            }
        });

        Arc::new(Self { tx, records })
    }

    /// Non-blocking enqueue (§4.8 "MUST never block request completion").
    pub fn enqueue(&self, record: AdmissionRecord) {
        if self.tx.try_send(record).is_err() {
            metrics::counter!("gateway_admission_audit_dropped_total").increment(1);
        }
    }

    pub async fn count(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn by_ip(&self, ip: &IpAddr, limit: usize) -> Vec<AdmissionRecord> {
        self.records
            .lock()
            .await
            .iter()
            .rev()
            .filter(|r| &r.client_ip == ip)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn ddos_events(&self, limit: usize) -> Vec<AdmissionRecord> {
        self.records
            .lock()
            .await
            .iter()
            .rev()
            .filter(|r| r.blacklist_info.as_deref() == Some("DDOS_THRESHOLD") || r.blacklist_info.as_deref() == Some("CAPTCHA_ACTIVE"))
            .take(limit)
            .cloned()
            .collect()
    }
}

async fn sweep(records: &Arc<Mutex<VecDeque<AdmissionRecord>>>, retention_days: u32) {
    let now_ms = crate::admission::state_store::now_millis();
    let retention_ms = retention_days as u64 * 24 * 60 * 60 * 1000;
    let floor = now_ms.saturating_sub(retention_ms);
    let mut guard = records.lock().await;
    let before = guard.len();
    guard.retain(|r| r.timestamp_ms > floor);
    let evicted = before - guard.len();
    if evicted > 0 {
        tracing::debug!(evicted, retention_days, "admission: audit retention sweep");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ip: &str, blacklist_info: Option<&str>, timestamp_ms: u64) -> AdmissionRecord {
        AdmissionRecord {
            record_id: "r1".into(),
            timestamp_ms,
            client_ip: ip.parse().unwrap(),
            path: "/x".into(),
            method: "GET".into(),
            verdict: "ADMIT".into(),
            rate_limited: false,
            rate_limit_type: None,
            in_whitelist: false,
            in_blacklist: blacklist_info.is_some(),
            blacklist_info: blacklist_info.map(|s| s.to_string()),
            response_status: Some(200),
            response_body_excerpt: None,
            headers: vec![],
        }
    }

    #[test]
    fn filters_sensitive_headers_case_insensitively() {
        let headers = vec![
            ("Authorization".to_string(), "Bearer x".to_string()),
            ("X-Auth-Token".to_string(), "abc".to_string()),
            ("Cookie".to_string(), "a=b".to_string()),
            ("X-Request-Id".to_string(), "123".to_string()),
        ];
        let filtered = filter_sensitive_headers(headers);
        assert_eq!(filtered, vec![("X-Request-Id".to_string(), "123".to_string())]);
    }

    #[tokio::test]
    async fn enqueued_records_are_queryable_by_ip() {
        let sink = AuditSink::start(16, 30, None);
        sink.enqueue(record("1.1.1.1", None, 1000));
        sink.enqueue(record("2.2.2.2", Some("DDOS_THRESHOLD"), 1000));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sink.count().await, 2);
        assert_eq!(sink.by_ip(&"1.1.1.1".parse().unwrap(), 10).await.len(), 1);
        assert_eq!(sink.ddos_events(10).await.len(), 1);
    }

    #[tokio::test]
    async fn drops_under_pressure_without_blocking() {
        let sink = AuditSink::start(1, 30, None);
        sink.enqueue(record("1.1.1.1", None, 1000));
        sink.enqueue(record("1.1.1.1", None, 1000));
        sink.enqueue(record("1.1.1.1", None, 1000));
        // No panic, no deadlock — some records may be dropped under a
        // channel capacity of 1.
    }
}
