//! Facade for outbound-call and cache metrics.
//!
//! Every outbound API call is tracked as an `(endpoint, path, status)` counter
//! plus a latency histogram; caches report hits, misses, sets and collisions.
//! Wiring a recorder/exporter is the embedding binary's concern; without one,
//! these calls are no-ops.

use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Registers metric descriptions. Call once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "vouch_api_requests_total",
        "Total number of requests to an outbound API endpoint"
    );
    describe_histogram!(
        "vouch_api_request_duration_seconds",
        "Duration of requests to an outbound API endpoint"
    );
    describe_counter!("vouch_cache_hits_total", "Total number of cache hits");
    describe_counter!("vouch_cache_misses_total", "Total number of cache misses");
    describe_counter!("vouch_cache_sets_total", "Total number of cache writes");
    describe_counter!(
        "vouch_cache_collisions_total",
        "Total number of cache key collisions detected on fetch"
    );
}

/// Tracks outbound API calls under a fixed namespace label.
#[derive(Debug, Clone)]
pub struct ApiMetrics {
    namespace: &'static str,
}

impl ApiMetrics {
    /// Creates a tracker labeling all series with `namespace`.
    pub fn new(namespace: &'static str) -> Self {
        Self { namespace }
    }

    /// Counts one request to `endpoint`/`path` with the given status.
    ///
    /// A status of `-1` marks a call that failed without an HTTP response.
    pub fn track_request(&self, endpoint: &str, path: &'static str, status: i32) {
        counter!(
            "vouch_api_requests_total",
            "namespace" => self.namespace,
            "endpoint" => endpoint_label(endpoint),
            "path" => path,
            "status" => status.to_string(),
        )
        .increment(1);
    }

    /// Records the latency of one request to `endpoint`/`path`.
    pub fn track_duration(&self, endpoint: &str, path: &'static str, elapsed: Duration) {
        histogram!(
            "vouch_api_request_duration_seconds",
            "namespace" => self.namespace,
            "endpoint" => endpoint_label(endpoint),
            "path" => path,
        )
        .record(elapsed.as_secs_f64());
    }

    /// Tracks both latency and status of a finished call.
    pub fn track_call(&self, endpoint: &str, path: &'static str, started: Instant, status: i32) {
        self.track_duration(endpoint, path, started.elapsed());
        self.track_request(endpoint, path, status);
    }
}

/// Counts a hit on the named cache.
pub fn cache_hit(cache: &'static str) {
    counter!("vouch_cache_hits_total", "cache" => cache).increment(1);
}

/// Counts a miss on the named cache.
pub fn cache_miss(cache: &'static str) {
    counter!("vouch_cache_misses_total", "cache" => cache).increment(1);
}

/// Counts a write to the named cache.
pub fn cache_set(cache: &'static str) {
    counter!("vouch_cache_sets_total", "cache" => cache).increment(1);
}

/// Counts a detected key collision on the named cache.
pub fn cache_collision(cache: &'static str) {
    counter!("vouch_cache_collisions_total", "cache" => cache).increment(1);
}

/// Reduces an endpoint URL to its host for use as a metric label.
fn endpoint_label(endpoint: &str) -> String {
    let stripped = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .unwrap_or(endpoint);
    let host = stripped.split('/').next().unwrap_or(stripped);
    host.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_label_strips_scheme_and_path() {
        assert_eq!(
            endpoint_label("https://sts.googleapis.com/v1"),
            "sts.googleapis.com"
        );
        assert_eq!(
            endpoint_label("http://127.0.0.1:10250/pods"),
            "127.0.0.1:10250"
        );
        assert_eq!(endpoint_label("kubeapi"), "kubeapi");
    }

    #[test]
    fn test_tracking_without_recorder_is_noop() {
        let metrics = ApiMetrics::new("test");
        metrics.track_request("https://example.com", "token", 200);
        metrics.track_duration("https://example.com", "token", Duration::from_millis(5));
        metrics.track_call("kubeapi", "pods", Instant::now(), -1);
        cache_hit("tokens");
        cache_miss("tokens");
        cache_set("tokens");
        cache_collision("tokens");
    }
}
