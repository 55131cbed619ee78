//! Prometheus metrics registration and recording.
//!
//! Metrics are registered once at startup via [`init_metrics`]; the
//! [`MetricsCollector`] facade is cheap to clone into pipeline contexts
//! and silently no-ops when metrics were never initialized (unit tests,
//! library embedding).

use std::sync::OnceLock;

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};

/// Global Prometheus registry for all webeval metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total tasks executed, labeled by local status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// End-to-end task pipeline duration in seconds, labeled by status.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Distribution of evaluation scores (0-1).
pub static EVAL_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Server save attempts, labeled by outcome.
pub static SERVER_SAVES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of task pipelines currently holding the admission gate.
pub static ACTIVE_PIPELINES: OnceLock<Gauge> = OnceLock::new();

/// Initializes and registers all metrics.
///
/// Call once at application startup.
///
/// # Errors
///
/// Returns a `prometheus::Error` on duplicate registration.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("webeval_tasks_total", "Total number of tasks executed"),
        &["status"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "webeval_task_duration_seconds",
            "End-to-end task pipeline duration in seconds",
        )
        .buckets(vec![30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0]),
        &["status"],
    )?;

    let eval_score = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "webeval_eval_score",
            "Distribution of evaluation scores",
        )
        .buckets(vec![0.0, 0.25, 0.5, 0.75, 1.0]),
    )?;

    let server_saves_total = CounterVec::new(
        Opts::new("webeval_server_saves_total", "Server save attempts"),
        &["status"],
    )?;

    let active_pipelines = Gauge::new(
        "webeval_active_pipelines",
        "Task pipelines currently in flight",
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(eval_score.clone()))?;
    registry.register(Box::new(server_saves_total.clone()))?;
    registry.register(Box::new(active_pipelines.clone()))?;

    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = EVAL_SCORE.set(eval_score);
    let _ = SERVER_SAVES_TOTAL.set(server_saves_total);
    let _ = ACTIVE_PIPELINES.set(active_pipelines);
    let _ = REGISTRY.set(registry);

    Ok(())
}

/// Exports all registered metrics in the Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).to_string()
}

/// Recording facade shared by the pipelines.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Creates a collector. Metrics must be initialized separately via
    /// [`init_metrics`] for recordings to land anywhere.
    pub fn new() -> Self {
        Self
    }

    /// Records one finished task.
    pub fn record_task(&self, status: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[status]).inc();
        }
        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[status])
                .observe(duration_secs);
        }
    }

    /// Records an evaluation score.
    pub fn record_eval_score(&self, score: f64) {
        if let Some(eval_score) = EVAL_SCORE.get() {
            eval_score.observe(score);
        }
    }

    /// Records a server save attempt.
    pub fn record_server_save(&self, status: &str) {
        if let Some(saves) = SERVER_SAVES_TOTAL.get() {
            saves.with_label_values(&[status]).inc();
        }
    }

    /// Marks a pipeline as in flight.
    pub fn pipeline_started(&self) {
        if let Some(active) = ACTIVE_PIPELINES.get() {
            active.inc();
        }
    }

    /// Marks a pipeline as finished.
    pub fn pipeline_finished(&self) {
        if let Some(active) = ACTIVE_PIPELINES.get() {
            active.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_is_safe_without_init() {
        // Recording before init_metrics must be a no-op, not a panic.
        let collector = MetricsCollector::new();
        collector.record_task("success", 12.0);
        collector.record_eval_score(1.0);
        collector.record_server_save("failure");
        collector.pipeline_started();
        collector.pipeline_finished();
    }

    #[test]
    fn test_init_and_record() {
        // init_metrics may race with other tests; both outcomes are fine.
        let _ = init_metrics();

        let collector = MetricsCollector::new();
        collector.record_task("success", 3.0);
        collector.record_eval_score(0.5);

        if REGISTRY.get().is_some() {
            let exported = export_metrics();
            assert!(exported.contains("webeval_tasks_total"));
        }
    }
}
