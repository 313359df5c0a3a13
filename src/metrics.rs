//! Prometheus metrics for thermalcast.
//!
//! This module provides application metrics exposed via the /metrics endpoint.
//!
//! ## Metrics
//!
//! ### Counters
//! - `thermalcast_ledger_ops_total` - Ledger operations by op (reserve/refund/purchase)
//! - `thermalcast_reports_generated_total` - Reports generated by kind and status
//! - `thermalcast_emails_sent_total` - Report emails by status
//! - `thermalcast_jobs_total` - Background jobs by name and status
//! - `thermalcast_upstream_calls_total` - Upstream API calls by service and status
//! - `thermalcast_rate_limited_total` - Requests denied by the rate limiter
//!
//! ### Histograms
//! - `thermalcast_report_duration_seconds` - Report generation duration by kind
//!
//! ### Gauges
//! - `thermalcast_active_jobs` - Currently running background jobs

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics exporter.
///
/// This should be called once at application startup.
/// Returns the PrometheusHandle for rendering metrics.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns None if metrics have not been initialized.
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match get_prometheus_handle() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

// =============================================================================
// Ledger Metrics
// =============================================================================

/// Record a credit ledger operation with its absolute amount.
pub fn record_ledger_op(op: &str, amount: i64) {
    counter!(
        "thermalcast_ledger_ops_total",
        "op" => op.to_string()
    )
    .increment(1);
    counter!(
        "thermalcast_ledger_credits_total",
        "op" => op.to_string()
    )
    .increment(amount.unsigned_abs());
}

/// Record a request denied by the rate limiter.
pub fn record_rate_limited(action: &str) {
    counter!(
        "thermalcast_rate_limited_total",
        "action" => action.to_string()
    )
    .increment(1);
}

// =============================================================================
// Report Metrics
// =============================================================================

/// Record a report generation attempt.
pub fn record_report(kind: &str, status: &str) {
    counter!(
        "thermalcast_reports_generated_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record how long a report took to generate.
pub fn record_report_duration(duration: Duration, kind: &str) {
    histogram!(
        "thermalcast_report_duration_seconds",
        "kind" => kind.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a report email delivery attempt.
pub fn record_email(status: &str) {
    counter!(
        "thermalcast_emails_sent_total",
        "status" => status.to_string()
    )
    .increment(1);
}

// =============================================================================
// Job Metrics
// =============================================================================

/// Record a job submission.
pub fn record_job_submitted(name: &str) {
    counter!(
        "thermalcast_jobs_total",
        "job" => name.to_string(),
        "status" => "submitted".to_string()
    )
    .increment(1);
}

/// Record a job outcome ("completed", "failed", "panicked").
pub fn record_job_finished(name: &str, status: &str) {
    counter!(
        "thermalcast_jobs_total",
        "job" => name.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Increment active jobs gauge.
pub fn inc_active_jobs() {
    gauge!("thermalcast_active_jobs").increment(1.0);
}

/// Decrement active jobs gauge.
pub fn dec_active_jobs() {
    gauge!("thermalcast_active_jobs").decrement(1.0);
}

// =============================================================================
// Upstream Metrics
// =============================================================================

/// Record a call to an upstream service (open_meteo, meteoblue, gemini, brevo).
pub fn record_upstream_call(service: &str, status: &str) {
    counter!(
        "thermalcast_upstream_calls_total",
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}
