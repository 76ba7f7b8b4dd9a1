//! Process-wide counters in Prometheus text format.
//!
//! Atomics plus a few locked label maps; nothing here feeds back into
//! detection or caching.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
const SIZE_BUCKETS: &[f64] = &[100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0];

/// Fixed-bucket histogram. `counts[i]` holds observations in `(bounds[i-1], bounds[i]]`;
/// the last slot is the `+Inf` overflow.
#[derive(Debug, Clone)]
struct Histogram {
    bounds: &'static [f64],
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            counts: vec![0; bounds.len() + 1],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, v: f64) {
        let slot = self.bounds.iter().position(|b| v <= *b).unwrap_or(self.bounds.len());
        self.counts[slot] += 1;
        self.sum += v;
        self.count += 1;
    }

    fn render(&self, out: &mut String, name: &str, label: &str, value: &str) {
        let mut cumulative: u64 = 0;
        for (bound, n) in self.bounds.iter().zip(&self.counts) {
            cumulative += n;
            out.push_str(&format!("{name}_bucket{{{label}=\"{value}\",le=\"{bound}\"}} {cumulative}\n"));
        }
        out.push_str(&format!("{name}_bucket{{{label}=\"{value}\",le=\"+Inf\"}} {}\n", self.count));
        out.push_str(&format!("{name}_sum{{{label}=\"{value}\"}} {}\n", self.sum));
        out.push_str(&format!("{name}_count{{{label}=\"{value}\"}} {}\n", self.count));
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    /// Requests currently inside the router.
    pub active_requests: AtomicI64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_errors: AtomicU64,
    pub detect_calls: AtomicU64,
    pub anomalies_detected: AtomicU64,
    pub train_runs: AtomicU64,
    pub train_failures: AtomicU64,
    pub last_train_duration_ms: AtomicU64,
    pub train_duration_ms_total: AtomicU64,
    pub completion_failures: AtomicU64,
    api_errors: Mutex<BTreeMap<(String, String), u64>>,
    log_count: Mutex<BTreeMap<String, u64>>,
    requests: Mutex<BTreeMap<(String, String, u16), u64>>,
    request_latency: Mutex<BTreeMap<String, Histogram>>,
    response_size: Mutex<BTreeMap<String, Histogram>>,
}

static METRICS: OnceLock<Arc<Metrics>> = OnceLock::new();

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared process-wide instance.
    pub fn global() -> Arc<Metrics> {
        METRICS.get_or_init(|| Arc::new(Metrics::new())).clone()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn observe_train(&self, elapsed: Duration, ok: bool) {
        let ms = elapsed.as_millis() as u64;
        Self::inc(&self.train_runs);
        if !ok {
            Self::inc(&self.train_failures);
        }
        self.last_train_duration_ms.store(ms, Ordering::Relaxed);
        Self::add(&self.train_duration_ms_total, ms);
    }

    pub fn inc_api_error(&self, endpoint: &str, kind: &str) {
        *self
            .api_errors
            .lock()
            .entry((endpoint.to_string(), kind.to_string()))
            .or_insert(0) += 1;
    }

    pub fn api_errors(&self, endpoint: &str, kind: &str) -> u64 {
        self.api_errors
            .lock()
            .get(&(endpoint.to_string(), kind.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished request. `endpoint` is the matched route template.
    pub fn request_finished(&self, method: &str, endpoint: &str, status: u16, elapsed: Duration, size: Option<u64>) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        *self
            .requests
            .lock()
            .entry((method.to_string(), endpoint.to_string(), status))
            .or_insert(0) += 1;
        self.request_latency
            .lock()
            .entry(endpoint.to_string())
            .or_insert_with(|| Histogram::new(LATENCY_BUCKETS))
            .observe(elapsed.as_secs_f64());
        if let Some(size) = size {
            self.response_size
                .lock()
                .entry(endpoint.to_string())
                .or_insert_with(|| Histogram::new(SIZE_BUCKETS))
                .observe(size as f64);
        }
    }

    pub fn requests(&self, method: &str, endpoint: &str, status: u16) -> u64 {
        self.requests
            .lock()
            .get(&(method.to_string(), endpoint.to_string(), status))
            .copied()
            .unwrap_or(0)
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn set_log_count(&self, level: &str, count: u64) {
        self.log_count.lock().insert(level.to_string(), count);
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let counter = |out: &mut String, name: &str, help: &str, v: u64| {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {v}\n"));
        };
        let gauge = |out: &mut String, name: &str, help: &str, v: u64| {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n{name} {v}\n"));
        };

        let requests = self.requests.lock();
        out.push_str("# HELP logwarden_requests_total API requests by method, endpoint and status\n");
        out.push_str("# TYPE logwarden_requests_total counter\n");
        for ((method, endpoint, status), v) in requests.iter() {
            out.push_str(&format!(
                "logwarden_requests_total{{method=\"{method}\",endpoint=\"{endpoint}\",status=\"{status}\"}} {v}\n"
            ));
        }
        drop(requests);

        out.push_str("# HELP logwarden_active_requests Requests currently being served\n");
        out.push_str("# TYPE logwarden_active_requests gauge\n");
        out.push_str(&format!("logwarden_active_requests {}\n", self.active_requests()));

        let latency = self.request_latency.lock();
        out.push_str("# HELP logwarden_request_latency_seconds Request latency by endpoint\n");
        out.push_str("# TYPE logwarden_request_latency_seconds histogram\n");
        for (endpoint, h) in latency.iter() {
            h.render(&mut out, "logwarden_request_latency_seconds", "endpoint", endpoint);
        }
        drop(latency);

        let sizes = self.response_size.lock();
        out.push_str("# HELP logwarden_response_size_bytes Response body size by endpoint\n");
        out.push_str("# TYPE logwarden_response_size_bytes histogram\n");
        for (endpoint, h) in sizes.iter() {
            h.render(&mut out, "logwarden_response_size_bytes", "endpoint", endpoint);
        }
        drop(sizes);

        counter(&mut out, "logwarden_cache_hits_total", "Response cache hits", Self::get(&self.cache_hits));
        counter(&mut out, "logwarden_cache_misses_total", "Response cache misses", Self::get(&self.cache_misses));
        counter(&mut out, "logwarden_cache_errors_total", "Response cache failures", Self::get(&self.cache_errors));
        counter(&mut out, "logwarden_detect_calls_total", "Detection calls", Self::get(&self.detect_calls));
        counter(
            &mut out,
            "logwarden_anomalies_detected_total",
            "Records flagged anomalous",
            Self::get(&self.anomalies_detected),
        );
        counter(&mut out, "logwarden_train_runs_total", "Model training runs", Self::get(&self.train_runs));
        counter(
            &mut out,
            "logwarden_train_failures_total",
            "Model training runs that produced no model",
            Self::get(&self.train_failures),
        );
        gauge(
            &mut out,
            "logwarden_last_train_duration_ms",
            "Duration of the most recent training run",
            Self::get(&self.last_train_duration_ms),
        );
        counter(
            &mut out,
            "logwarden_train_duration_ms_total",
            "Cumulative time spent training",
            Self::get(&self.train_duration_ms_total),
        );
        counter(
            &mut out,
            "logwarden_completion_failures_total",
            "Completion calls answered with the fallback text",
            Self::get(&self.completion_failures),
        );

        let errors = self.api_errors.lock();
        if !errors.is_empty() {
            out.push_str("# HELP logwarden_api_errors_total API errors by endpoint and kind\n");
            out.push_str("# TYPE logwarden_api_errors_total counter\n");
            for ((endpoint, kind), v) in errors.iter() {
                out.push_str(&format!(
                    "logwarden_api_errors_total{{endpoint=\"{endpoint}\",error_type=\"{kind}\"}} {v}\n"
                ));
            }
        }
        drop(errors);

        let levels = self.log_count.lock();
        if !levels.is_empty() {
            out.push_str("# HELP logwarden_log_count Stored log records by level\n");
            out.push_str("# TYPE logwarden_log_count gauge\n");
            for (level, v) in levels.iter() {
                out.push_str(&format!("logwarden_log_count{{level=\"{level}\"}} {v}\n"));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let m = Metrics::new();
        Metrics::inc(&m.cache_hits);
        Metrics::add(&m.anomalies_detected, 7);
        m.observe_train(Duration::from_millis(120), true);
        m.observe_train(Duration::from_millis(30), false);
        m.inc_api_error("/chat", "missing_message");
        m.set_log_count("ERROR", 3);
        m.request_started();
        m.request_finished("POST", "/api/v1/chat", 200, Duration::from_millis(20), Some(512));
        m.request_started();
        m.request_finished("POST", "/api/v1/chat", 400, Duration::from_secs(3), None);

        let text = m.render_prometheus();
        assert!(text.contains("logwarden_cache_hits_total 1\n"));
        assert!(text.contains("logwarden_anomalies_detected_total 7\n"));
        assert!(text.contains("logwarden_train_runs_total 2\n"));
        assert!(text.contains("logwarden_train_failures_total 1\n"));
        assert!(text.contains("logwarden_last_train_duration_ms 30\n"));
        assert!(text.contains("logwarden_train_duration_ms_total 150\n"));
        assert!(text.contains(r#"logwarden_api_errors_total{endpoint="/chat",error_type="missing_message"} 1"#));
        assert!(text.contains(r#"logwarden_log_count{level="ERROR"} 3"#));
        assert_eq!(m.api_errors("/chat", "missing_message"), 1);

        assert!(text.contains(r#"logwarden_requests_total{method="POST",endpoint="/api/v1/chat",status="200"} 1"#));
        assert!(text.contains(r#"logwarden_requests_total{method="POST",endpoint="/api/v1/chat",status="400"} 1"#));
        assert!(text.contains("logwarden_active_requests 0\n"));
        assert!(text.contains(r#"logwarden_request_latency_seconds_bucket{endpoint="/api/v1/chat",le="0.025"} 1"#));
        assert!(text.contains(r#"logwarden_request_latency_seconds_bucket{endpoint="/api/v1/chat",le="5"} 2"#));
        assert!(text.contains(r#"logwarden_request_latency_seconds_count{endpoint="/api/v1/chat"} 2"#));
        assert!(text.contains(r#"logwarden_response_size_bytes_bucket{endpoint="/api/v1/chat",le="1000"} 1"#));
        assert!(text.contains(r#"logwarden_response_size_bytes_count{endpoint="/api/v1/chat"} 1"#));
        assert_eq!(m.requests("POST", "/api/v1/chat", 200), 1);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let mut h = Histogram::new(SIZE_BUCKETS);
        h.observe(50.0);
        h.observe(100.0);
        h.observe(5_000_000.0);
        let mut out = String::new();
        h.render(&mut out, "x", "endpoint", "/e");
        assert!(out.contains(r#"x_bucket{endpoint="/e",le="100"} 2"#));
        assert!(out.contains(r#"x_bucket{endpoint="/e",le="1000000"} 2"#));
        assert!(out.contains(r#"x_bucket{endpoint="/e",le="+Inf"} 3"#));
        assert!(out.contains(r#"x_sum{endpoint="/e"} 5000150"#));
    }

    #[test]
    fn test_global_is_shared() {
        let a = Metrics::global();
        let b = Metrics::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
