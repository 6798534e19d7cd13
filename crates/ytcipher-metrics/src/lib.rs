//! Prometheus metrics for the ytcipher service.
//!
//! Thin wrapper over the `metrics` facade: metric names live in [`names`],
//! and every emission site goes through a typed helper so label sets stay
//! consistent across the codebase. The recorder is installed once at startup
//! via [`init_metrics`]; the returned handle renders the exposition text for
//! the `/metrics` endpoint.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

pub use metrics_exporter_prometheus::PrometheusHandle;

/// Histogram buckets for HTTP request duration, in seconds.
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_RESPONSES_TOTAL: &str = "http_responses_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

    pub const WORKER_ERRORS_TOTAL: &str = "worker_errors_total";
    pub const PLAYER_SCRIPT_FETCHES_TOTAL: &str = "player_script_fetches_total";
    pub const PLAYER_URL_REQUESTS_TOTAL: &str = "player_url_requests_total";

    pub const CACHE_SIZE: &str = "cache_size";
}

/// Installs the Prometheus recorder and returns the render handle.
///
/// Must be called once, before any metric is emitted. Panics if a recorder
/// is already installed, which only happens on programmer error.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(names::HTTP_REQUEST_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )
        .expect("duration buckets are non-empty")
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
}

/// Record an incoming HTTP request.
pub fn record_http_request(method: &str, path: &str) {
    let labels = [("method", method.to_string()), ("path", path.to_string())];
    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
}

/// Record a completed HTTP response with its status and duration.
pub fn record_http_response(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];
    counter!(names::HTTP_RESPONSES_TOTAL, &labels).increment(1);

    let duration_labels = [("method", method.to_string()), ("path", path.to_string())];
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &duration_labels).record(duration_secs);
}

/// Record a worker failure attributed to a player.
pub fn record_worker_error(player_id: &str, message: &str) {
    let labels = [
        ("player_id", player_id.to_string()),
        ("message", message.to_string()),
    ];
    counter!(names::WORKER_ERRORS_TOTAL, &labels).increment(1);
}

/// Record an upstream player-script fetch and its HTTP status text.
pub fn record_player_fetch(url: &str, status_text: &str) {
    let labels = [
        ("url", url.to_string()),
        ("status", status_text.to_string()),
    ];
    counter!(names::PLAYER_SCRIPT_FETCHES_TOTAL, &labels).increment(1);
}

/// Record a request naming a player URL.
pub fn record_player_url_request(player_id: &str) {
    let labels = [("player_id", player_id.to_string())];
    counter!(names::PLAYER_URL_REQUESTS_TOTAL, &labels).increment(1);
}

/// Publish the current size of a named cache.
pub fn set_cache_size(cache_name: &'static str, size: usize) {
    let labels = [("cache_name", cache_name)];
    gauge!(names::CACHE_SIZE, &labels).set(size as f64);
}
