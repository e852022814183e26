//! In-process counters surfaced through `/status`
//!
//! Plain atomics; nothing is persisted. Structured events go to the tracing
//! sink instead.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    started_at: Instant,
    pub requests_total: AtomicU64,
    pub responses_success: AtomicU64,
    pub responses_redirect: AtomicU64,
    pub responses_client_error: AtomicU64,
    pub responses_server_error: AtomicU64,
    pub admission_denied: AtomicU64,
    pub route_misses: AtomicU64,
    pub active_requests: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: AtomicU64::new(0),
            responses_success: AtomicU64::new(0),
            responses_redirect: AtomicU64::new(0),
            responses_client_error: AtomicU64::new(0),
            responses_server_error: AtomicU64::new(0),
            admission_denied: AtomicU64::new(0),
            route_misses: AtomicU64::new(0),
            active_requests: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self, status: u16) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        let counter = match status {
            200..=299 => &self.responses_success,
            300..=399 => &self.responses_redirect,
            400..=499 => &self.responses_client_error,
            _ => &self.responses_server_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.admission_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_route_miss(&self) {
        self.route_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "requests_total": self.requests_total.load(Ordering::Relaxed),
            "responses": {
                "success": self.responses_success.load(Ordering::Relaxed),
                "redirect": self.responses_redirect.load(Ordering::Relaxed),
                "client_error": self.responses_client_error.load(Ordering::Relaxed),
                "server_error": self.responses_server_error.load(Ordering::Relaxed),
            },
            "admission_denied": self.admission_denied.load(Ordering::Relaxed),
            "route_misses": self.route_misses.load(Ordering::Relaxed),
            "active_requests": self.active_requests.load(Ordering::Relaxed),
            "uptime_seconds": self.uptime_seconds(),
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_classes() {
        let metrics = Metrics::new();

        metrics.record_request();
        metrics.record_response(200);
        metrics.record_request();
        metrics.record_response(404);
        metrics.record_request();
        metrics.record_response(502);

        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.responses_success.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.responses_client_error.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.responses_server_error.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.active_requests.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_snapshot_keys() {
        let metrics = Metrics::new();
        metrics.record_request();
        metrics.record_response(204);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["requests_total"], 1);
        assert_eq!(snapshot["responses"]["success"], 1);
        assert!(snapshot.get("uptime_seconds").is_some());
    }
}
