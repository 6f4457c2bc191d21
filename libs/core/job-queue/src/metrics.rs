//! Prometheus metrics for the job queue
//!
//! Provides observability into enqueue/consume throughput, retries, the
//! circuit breaker, and broker connection health.

use crate::breaker::CircuitState;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize the Prometheus recorder.
///
/// Call once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");
        info!("Prometheus metrics initialized");
        handle
    });
}

/// Get the Prometheus handle for rendering metrics.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format.
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Record a job accepted by `enqueue`.
pub fn record_enqueued(queue: &str) {
    counter!("job_queue_jobs_enqueued_total", "queue" => queue.to_string()).increment(1);
}

/// Record an enqueue that failed to publish.
///
/// `cause` is `circuit_open` or `publish_error`.
pub fn record_publish_failure(queue: &str, cause: &'static str) {
    counter!(
        "job_queue_publish_failures_total",
        "queue" => queue.to_string(),
        "cause" => cause
    )
    .increment(1);
}

/// Record a consumed job finishing with the given status
/// (`completed`, `failed`, `poison`).
pub fn record_processed(queue: &str, status: &'static str) {
    counter!(
        "job_queue_jobs_processed_total",
        "queue" => queue.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record the duration of one handler invocation.
pub fn record_handler_duration(queue: &str, duration: Duration) {
    histogram!(
        "job_queue_handler_duration_seconds",
        "queue" => queue.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a job re-queued by the manual retry path.
pub fn record_retry(queue: &str) {
    counter!("job_queue_jobs_retried_total", "queue" => queue.to_string()).increment(1);
}

/// Track broker connection health (1 = connected).
pub fn gauge_connection(up: bool) {
    gauge!("job_queue_broker_connected").set(if up { 1.0 } else { 0.0 });
}

/// Track circuit breaker state (0 = closed, 1 = half-open, 2 = open).
pub fn gauge_breaker(state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("job_queue_circuit_breaker_state").set(value);
}

/// Track the dead-letter queue depth.
pub fn gauge_dlq_depth(queue: &str, depth: u32) {
    gauge!("job_queue_dlq_depth", "queue" => queue.to_string()).set(depth as f64);
}
