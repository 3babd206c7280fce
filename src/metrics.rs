//! Prometheus metrics for the admission layer.
//!
//! Metrics are exposed on a dedicated HTTP listener (default `0.0.0.0:9090`),
//! separate from the API port.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `portal_guard_admission_total` - Rate-limit decisions (labels: class, decision)
//! - `portal_guard_auth_failures_total` - Rejected credentials (label: reason)
//! - `portal_guard_audit_records_total` - Audit records written (label: outcome)
//! - `portal_guard_audit_failures_total` - Audit writes that failed
//! - `portal_guard_jwks_refresh_total` - JWKS fetches (label: status)
//! - `portal_guard_sessions_total` - Session lifecycle events (label: event)
//!
//! ## Histograms
//! - `portal_guard_request_duration_seconds` - Request duration (labels: class, status)
//!
//! ## Gauges
//! - `portal_guard_rate_windows` - Tracked rate windows
//! - `portal_guard_active_sessions` - Stored admin sessions
//!
//! Recording before [`init_metrics`] is a no-op, so library code and tests
//! can call the `record_*` functions unconditionally.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const ADMISSION_TOTAL: &str = "portal_guard_admission_total";
    pub const AUTH_FAILURES_TOTAL: &str = "portal_guard_auth_failures_total";
    pub const AUDIT_RECORDS_TOTAL: &str = "portal_guard_audit_records_total";
    pub const AUDIT_FAILURES_TOTAL: &str = "portal_guard_audit_failures_total";
    pub const JWKS_REFRESH_TOTAL: &str = "portal_guard_jwks_refresh_total";
    pub const SESSIONS_TOTAL: &str = "portal_guard_sessions_total";
    pub const REQUEST_DURATION_SECONDS: &str = "portal_guard_request_duration_seconds";
    pub const RATE_WINDOWS: &str = "portal_guard_rate_windows";
    pub const ACTIVE_SESSIONS: &str = "portal_guard_active_sessions";
}

/// Install the Prometheus exporter and describe every metric.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::ADMISSION_TOTAL, "Rate limiter decisions by route class");
    describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Requests rejected during identity resolution or capability checks"
    );
    describe_counter!(names::AUDIT_RECORDS_TOTAL, "Audit records persisted");
    describe_counter!(names::AUDIT_FAILURES_TOTAL, "Audit records that could not be persisted");
    describe_counter!(names::JWKS_REFRESH_TOTAL, "JWKS fetch attempts by result");
    describe_counter!(names::SESSIONS_TOTAL, "Admin session lifecycle events");

    describe_histogram!(names::REQUEST_DURATION_SECONDS, "HTTP request duration in seconds");

    describe_gauge!(names::RATE_WINDOWS, "Rate windows currently tracked");
    describe_gauge!(names::ACTIVE_SESSIONS, "Admin sessions currently stored");

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Initialize metrics, logging failures instead of returning them.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counters
// =============================================================================

pub fn record_admission(class: &'static str, decision: &'static str) {
    counter!(names::ADMISSION_TOTAL, "class" => class, "decision" => decision).increment(1);
}

pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

pub fn record_audit_record(outcome: &'static str) {
    counter!(names::AUDIT_RECORDS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_audit_failure() {
    counter!(names::AUDIT_FAILURES_TOTAL).increment(1);
}

pub fn record_jwks_refresh(status: &'static str) {
    counter!(names::JWKS_REFRESH_TOTAL, "status" => status).increment(1);
}

/// `event` is one of `created`, `revoked`, `purged`.
pub fn record_session_event(event: &'static str, count: u64) {
    counter!(names::SESSIONS_TOTAL, "event" => event).increment(count);
}

// =============================================================================
// Histograms
// =============================================================================

pub fn record_request_duration(class: &'static str, status: u16, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "class" => class, "status" => status.to_string())
        .record(duration_secs);
}

// =============================================================================
// Gauges
// =============================================================================

pub fn set_rate_windows(count: usize) {
    gauge!(names::RATE_WINDOWS).set(count as f64);
}

pub fn set_active_sessions(count: usize) {
    gauge!(names::ACTIVE_SESSIONS).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_share_prefix() {
        let all = [
            names::ADMISSION_TOTAL,
            names::AUTH_FAILURES_TOTAL,
            names::AUDIT_RECORDS_TOTAL,
            names::AUDIT_FAILURES_TOTAL,
            names::JWKS_REFRESH_TOTAL,
            names::SESSIONS_TOTAL,
            names::REQUEST_DURATION_SECONDS,
            names::RATE_WINDOWS,
            names::ACTIVE_SESSIONS,
        ];
        assert!(all.iter().all(|n| n.starts_with("portal_guard_")));
    }

    #[test]
    fn test_recording_without_exporter_is_noop() {
        record_admission("content", "allow");
        record_auth_failure("credential_expired");
        record_audit_record("success");
        record_audit_failure();
        record_jwks_refresh("success");
        record_session_event("created", 1);
        record_request_duration("admin", 200, 0.01);
        set_rate_windows(3);
        set_active_sessions(1);
    }
}
