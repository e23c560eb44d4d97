// Prometheus metrics for the Notebox API

use lazy_static::lazy_static;
use notebox_common::types::{CompletionEvent, QueueStatus};
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    // Global registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Accepted submissions
    pub static ref EXECUTIONS_SUBMITTED: IntCounter = IntCounter::new(
        "notebox_executions_submitted_total",
        "Total number of executions queued"
    )
    .expect("metric can be created");

    // Submissions refused before queuing
    pub static ref EXECUTIONS_REJECTED: CounterVec = CounterVec::new(
        Opts::new("notebox_executions_rejected_total", "Total submissions rejected"),
        &["reason"]
    )
    .expect("metric can be created");

    // Cancel calls by outcome
    pub static ref EXECUTIONS_CANCELLED: CounterVec = CounterVec::new(
        Opts::new("notebox_executions_cancelled_total", "Total cancel requests"),
        &["outcome"]
    )
    .expect("metric can be created");

    // Terminal states reported by workers
    pub static ref EXECUTIONS_COMPLETED: CounterVec = CounterVec::new(
        Opts::new("notebox_executions_completed_total", "Total executions finished"),
        &["state"]
    )
    .expect("metric can be created");

    // Wall time inside the worker, milliseconds
    pub static ref EXECUTION_TIME: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "notebox_execution_time_ms",
            "Execution time in milliseconds"
        )
        .buckets(vec![100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 120000.0]),
        &["state"]
    )
    .expect("metric can be created");

    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "notebox_queue_depth",
        "Executions waiting for a worker"
    )
    .expect("metric can be created");

    pub static ref RUNNING: IntGauge = IntGauge::new(
        "notebox_running_executions",
        "Executions holding a sandbox"
    )
    .expect("metric can be created");

    pub static ref OPEN_STREAMS: IntGauge = IntGauge::new(
        "notebox_open_streams",
        "Connected output stream clients"
    )
    .expect("metric can be created");
}

/// Register every collector with the global registry
pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(EXECUTIONS_SUBMITTED.clone()))?;
    REGISTRY.register(Box::new(EXECUTIONS_REJECTED.clone()))?;
    REGISTRY.register(Box::new(EXECUTIONS_CANCELLED.clone()))?;
    REGISTRY.register(Box::new(EXECUTIONS_COMPLETED.clone()))?;
    REGISTRY.register(Box::new(EXECUTION_TIME.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(RUNNING.clone()))?;
    REGISTRY.register(Box::new(OPEN_STREAMS.clone()))?;
    Ok(())
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

pub fn record_submitted() {
    EXECUTIONS_SUBMITTED.inc();
}

pub fn record_rejected(reason: &str) {
    EXECUTIONS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_cancel(outcome: &str) {
    EXECUTIONS_CANCELLED.with_label_values(&[outcome]).inc();
}

pub fn record_completed(event: &CompletionEvent) {
    let state = event.state.as_str();
    EXECUTIONS_COMPLETED.with_label_values(&[state]).inc();
    EXECUTION_TIME
        .with_label_values(&[state])
        .observe(event.execution_time_ms as f64);
}

pub fn update_queue(status: &QueueStatus) {
    QUEUE_DEPTH.set(status.pending as i64);
    RUNNING.set(status.running as i64);
}

/// Holds the open-streams gauge up for as long as it lives
pub struct StreamGuard;

impl StreamGuard {
    pub fn open() -> Self {
        OPEN_STREAMS.inc();
        StreamGuard
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        OPEN_STREAMS.dec();
    }
}
