use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Installs the Prometheus recorder and registers metric descriptions.
/// Returns `None` when a recorder is already installed (e.g. by the host
/// application), in which case emission still works against that recorder.
pub fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = METRICS_HANDLE.set(handle.clone());
            describe_metrics();
            Some(handle)
        }
        Err(e) => {
            tracing::warn!("Prometheus recorder not installed: {}", e);
            None
        }
    }
}

/// Handle for rendering the Prometheus exposition text.
pub fn metrics_handle() -> Option<&'static PrometheusHandle> {
    METRICS_HANDLE.get()
}

fn describe_metrics() {
    describe_counter!(
        "idempotency_cache_hits_total",
        "Invocations answered from the process-local cache"
    );
    describe_counter!(
        "idempotency_replayed_responses_total",
        "Invocations answered from a stored completed record"
    );
    describe_counter!(
        "idempotency_claim_conflicts_total",
        "Conditional claims that lost to an existing record"
    );
    describe_counter!(
        "idempotency_records_completed_total",
        "Records transitioned to their completed state"
    );
    describe_counter!(
        "idempotency_records_deleted_total",
        "Records deleted after handler failure"
    );
    describe_histogram!(
        "idempotency_handler_duration_ms",
        Unit::Milliseconds,
        "Wrapped function execution time"
    );
}

/// Metrics recorder for the idempotency machinery.
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_cache_hit(&self) {
        counter!("idempotency_cache_hits_total").increment(1);
    }

    pub fn record_replayed_response(&self) {
        counter!("idempotency_replayed_responses_total").increment(1);
    }

    pub fn record_claim_conflict(&self) {
        counter!("idempotency_claim_conflicts_total").increment(1);
    }

    pub fn record_record_completed(&self) {
        counter!("idempotency_records_completed_total").increment(1);
    }

    pub fn record_record_deleted(&self) {
        counter!("idempotency_records_deleted_total").increment(1);
    }

    pub fn record_handler_latency(&self, duration_ms: f64) {
        histogram!("idempotency_handler_duration_ms").record(duration_ms);
    }
}
