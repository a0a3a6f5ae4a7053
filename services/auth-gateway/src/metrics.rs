//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `auth_flows_total` (counter): labels `provider`, `outcome`
//! - `rate_limit_throttled_total` (counter): label `class`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use rate_limit::EndpointClass;

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `proxy_request_duration_seconds` gets explicit buckets (5 ms to 60 s) so
/// it renders as a histogram usable with `histogram_quantile()` instead of a
/// summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record the end of a sign-in attempt. `outcome` is `initiated`, `success`
/// or an error kind.
pub fn record_auth_flow(provider: &str, outcome: &str) {
    metrics::counter!("auth_flows_total", "provider" => provider.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

pub fn record_throttled(class: EndpointClass) {
    metrics::counter!("rate_limit_throttled_total", "class" => class.as_str()).increment(1);
}
