//! Process-wide request counters
//!
//! Counters are kept in atomics so callers and tests can read exact values,
//! and every increment is mirrored to the `metrics` facade
//! (`fhir_client_<name>_total`) for whatever recorder the process installs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use serde::Serialize;

static GLOBAL: LazyLock<Arc<MetricsRegistry>> =
    LazyLock::new(|| Arc::new(MetricsRegistry::new()));

/// Monotonic counters for request, retry and failure activity
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    request_count: AtomicU64,
    error_count: AtomicU64,
    retry_count: AtomicU64,
    rate_limit_count: AtomicU64,
    auth_error_count: AtomicU64,
    outcome_error_count: AtomicU64,
    token_refresh_count: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub error_count: u64,
    pub retry_count: u64,
    pub rate_limit_count: u64,
    pub auth_error_count: u64,
    pub outcome_error_count: u64,
    pub token_refresh_count: u64,
}

impl MetricsRegistry {
    /// A fresh registry. Most code should share [`MetricsRegistry::global`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every client in this process
    pub fn global() -> Arc<MetricsRegistry> {
        Arc::clone(&GLOBAL)
    }

    pub fn record_request(&self) {
        bump(&self.request_count, "fhir_client_requests_total");
    }

    pub fn record_error(&self) {
        bump(&self.error_count, "fhir_client_errors_total");
    }

    pub fn record_retry(&self) {
        bump(&self.retry_count, "fhir_client_retries_total");
    }

    pub fn record_rate_limit(&self) {
        bump(&self.rate_limit_count, "fhir_client_rate_limits_total");
    }

    pub fn record_auth_error(&self) {
        bump(&self.auth_error_count, "fhir_client_auth_errors_total");
    }

    pub fn record_outcome_error(&self) {
        bump(&self.outcome_error_count, "fhir_client_outcome_errors_total");
    }

    pub fn record_token_refresh(&self) {
        bump(&self.token_refresh_count, "fhir_client_token_refreshes_total");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            rate_limit_count: self.rate_limit_count.load(Ordering::Relaxed),
            auth_error_count: self.auth_error_count.load(Ordering::Relaxed),
            outcome_error_count: self.outcome_error_count.load(Ordering::Relaxed),
            token_refresh_count: self.token_refresh_count.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64, name: &'static str) {
    counter.fetch_add(1, Ordering::Relaxed);
    ::metrics::counter!(name).increment(1);
}

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Repeated calls don't panic: the second install is ignored and the
/// returned handle still renders.
pub fn install_prometheus() -> metrics_exporter_prometheus::PrometheusHandle {
    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let _ = ::metrics::set_global_recorder(recorder);
    handle
}
