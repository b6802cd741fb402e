//! Prometheus metrics for the preview gateway.
//!
//! This module provides:
//! - Preview request outcomes by session kind
//! - Cache metrics (hits, misses, evictions, invalidations, entries)
//! - Upstream fetch metrics (status, latency)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const PREVIEW_REQUESTS_TOTAL: &str = "preview_requests_total";

    pub const CACHE_HITS_TOTAL: &str = "preview_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "preview_cache_misses_total";
    pub const CACHE_EVICTIONS_TOTAL: &str = "preview_cache_evictions_total";
    pub const CACHE_INVALIDATIONS_TOTAL: &str = "preview_cache_invalidations_total";
    pub const CACHE_ENTRIES: &str = "preview_cache_entries";

    pub const UPSTREAM_REQUESTS_TOTAL: &str = "preview_upstream_requests_total";
    pub const UPSTREAM_DURATION_SECONDS: &str = "preview_upstream_duration_seconds";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders the handle
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

pub fn record_preview_request(session: &'static str, outcome: &'static str) {
    counter!(names::PREVIEW_REQUESTS_TOTAL, "session" => session, "outcome" => outcome)
        .increment(1);
}

pub fn record_cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_cache_eviction() {
    counter!(names::CACHE_EVICTIONS_TOTAL).increment(1);
}

pub fn record_cache_invalidation(removed: usize) {
    counter!(names::CACHE_INVALIDATIONS_TOTAL).increment(1);
    tracing::trace!(removed, "cache invalidation recorded");
}

pub fn set_cache_entries(count: usize) {
    gauge!(names::CACHE_ENTRIES).set(count as f64);
}

pub fn record_upstream_request(status: u16, duration: Duration) {
    counter!(names::UPSTREAM_REQUESTS_TOTAL, "status" => status.to_string()).increment(1);
    histogram!(names::UPSTREAM_DURATION_SECONDS).record(duration.as_secs_f64());
}
