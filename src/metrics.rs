//! Prometheus metrics for the security pipeline.
//!
//! Metrics are exposed via a dedicated HTTP listener (default: `0.0.0.0:9090`).
//! Recording functions are safe to call before (or without) initialization;
//! the `metrics` facade discards values when no recorder is installed.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `shield_responses_total` - Responses sent (labels: scope, status)
//! - `shield_rate_limited_total` - Requests denied by the rate limiter (label: scope)
//! - `shield_security_rejections_total` - Policy rejections (label: kind)
//!
//! ## Histograms
//! - `shield_file_read_duration_seconds` - Static file read latency
//!
//! ## Gauges
//! - `shield_rate_limit_buckets` - Rate-limit buckets currently tracked in memory
//! - `shield_csrf_sessions` - Sessions holding an issued CSRF token

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const RESPONSES_TOTAL: &str = "shield_responses_total";
    pub const RATE_LIMITED_TOTAL: &str = "shield_rate_limited_total";
    pub const SECURITY_REJECTIONS_TOTAL: &str = "shield_security_rejections_total";
    pub const FILE_READ_DURATION_SECONDS: &str = "shield_file_read_duration_seconds";
    pub const RATE_LIMIT_BUCKETS: &str = "shield_rate_limit_buckets";
    pub const CSRF_SESSIONS: &str = "shield_csrf_sessions";
}

/// Initialize the Prometheus metrics exporter.
///
/// Sets up metric descriptions and starts the Prometheus HTTP listener on
/// `metrics_addr`.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::RESPONSES_TOTAL,
        "Total number of responses sent, by rate scope and status"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Total number of requests denied by the rate limiter"
    );
    describe_counter!(
        names::SECURITY_REJECTIONS_TOTAL,
        "Total number of requests rejected by a security policy"
    );
    describe_histogram!(
        names::FILE_READ_DURATION_SECONDS,
        "Static file read duration in seconds"
    );
    describe_gauge!(
        names::RATE_LIMIT_BUCKETS,
        "Number of rate-limit buckets tracked in memory"
    );
    describe_gauge!(
        names::CSRF_SESSIONS,
        "Number of sessions holding an issued CSRF token"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

/// Record a response leaving the pipeline.
pub fn record_response(scope: &'static str, status: u16) {
    counter!(names::RESPONSES_TOTAL, "scope" => scope, "status" => status.to_string())
        .increment(1);
}

/// Record a rate-limit denial.
pub fn record_rate_limited(scope: &'static str) {
    counter!(names::RATE_LIMITED_TOTAL, "scope" => scope).increment(1);
}

/// Record a security policy rejection (traversal, extension, csrf, ...).
pub fn record_security_rejection(kind: &'static str) {
    counter!(names::SECURITY_REJECTIONS_TOTAL, "kind" => kind).increment(1);
}

/// Record how long a static file read took.
pub fn record_file_read_duration(duration_secs: f64) {
    histogram!(names::FILE_READ_DURATION_SECONDS).record(duration_secs);
}

/// Update the tracked bucket gauge after a sweep.
pub fn set_rate_limit_buckets(count: usize) {
    // Precision loss above 2^53 buckets is irrelevant for a gauge.
    #[allow(clippy::cast_precision_loss)]
    gauge!(names::RATE_LIMIT_BUCKETS).set(count as f64);
}

/// Update the CSRF session gauge after a sweep.
pub fn set_csrf_sessions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!(names::CSRF_SESSIONS).set(count as f64);
}
