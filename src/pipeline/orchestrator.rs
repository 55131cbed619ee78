//! Batch coordinator for concurrent task pipelines.
//!
//! Fans the sliced task list out to [`run_task_pipeline`] instances under
//! one admission gate, converts per-task panics into synthetic failure
//! records so one task can never cancel or corrupt its siblings, runs the
//! batch heartbeat and resource monitor for the duration, and aggregates
//! everything into a [`BatchSummary`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::result::TaskStatus;
use super::runner::{run_task_pipeline, PipelineContext};
use crate::monitor::{Heartbeat, ResourceMonitor};
use crate::task::Task;

/// Heartbeat interval for long-running batches.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Resource sampling interval.
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Aggregate outcome of one batch.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    /// Per-task local-status records, one per sliced task.
    pub results: Vec<TaskStatus>,
    /// Number of tasks whose local status is success.
    pub successful: usize,
    /// Number of tasks whose local status is failure.
    pub failed: usize,
}

impl BatchSummary {
    fn from_results(results: Vec<TaskStatus>) -> Self {
        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;
        Self {
            results,
            successful,
            failed,
        }
    }

    /// Success rate in percent.
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.successful as f64 / self.results.len() as f64 * 100.0
    }
}

/// Runs the configured `[start, end)` slice of `tasks` concurrently.
///
/// Every pipeline acquires the admission gate before starting and releases
/// it only after its own cleanup; order of completion across siblings is
/// not defined. Always returns a record per sliced task.
pub async fn run_multiple_tasks(
    ctx: Arc<PipelineContext>,
    tasks: Vec<Task>,
    cancel: CancellationToken,
) -> BatchSummary {
    let batch_start = Instant::now();

    let start = ctx.config.start_index.min(tasks.len());
    let end = ctx
        .config
        .end_index
        .unwrap_or(tasks.len())
        .clamp(start, tasks.len());
    let tasks_to_run: Vec<Task> = tasks[start..end].to_vec();

    tracing::info!(
        total_available = tasks.len(),
        start_index = start,
        end_index = end,
        max_parallel = ctx.config.max_parallel,
        "Batch starting"
    );

    // A zero-width gate would deadlock every pipeline; degrade to uniform
    // failure records instead of aborting silently.
    if ctx.config.max_parallel == 0 {
        tracing::error!("Cannot create admission gate with zero slots");
        return BatchSummary::from_results(
            tasks_to_run
                .iter()
                .map(|task| TaskStatus {
                    task_id: task.task_id.clone(),
                    success: false,
                    error: Some("Batch execution failed: admission gate has zero slots".to_string()),
                    completed_stages: Vec::new(),
                })
                .collect(),
        );
    }

    let gate = Arc::new(Semaphore::new(ctx.config.max_parallel));

    let monitor = ResourceMonitor::start(MONITOR_INTERVAL);
    let heartbeat = Heartbeat::start(batch_start, HEARTBEAT_INTERVAL);

    let mut handles = Vec::with_capacity(tasks_to_run.len());
    for task in &tasks_to_run {
        let handle = tokio::spawn(run_task_pipeline(
            Arc::clone(&ctx),
            task.clone(),
            Arc::clone(&gate),
            cancel.child_token(),
        ));
        handles.push((task.task_id.clone(), handle));
    }

    tracing::info!(launched = handles.len(), "All task pipelines launched");

    let mut results = Vec::with_capacity(handles.len());
    for (task_id, handle) in handles {
        match handle.await {
            Ok(status) => results.push(status),
            Err(e) => {
                // A panicked pipeline still yields a failure record.
                tracing::error!(task_id = %task_id, error = %e, "Task pipeline aborted");
                results.push(TaskStatus {
                    task_id,
                    success: false,
                    error: Some(format!("Task execution aborted: {}", e)),
                    completed_stages: Vec::new(),
                });
            }
        }
    }

    // Tear down observability before returning; both stops are bounded.
    heartbeat.stop().await;
    monitor.stop().await;

    let summary = BatchSummary::from_results(results);
    tracing::info!(
        total = summary.results.len(),
        successful = summary.successful,
        failed = summary.failed,
        success_rate = format!("{:.1}%", summary.success_rate()),
        batch_secs = format!("{:.2}", batch_start.elapsed().as_secs_f64()),
        "Batch finished"
    );

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let summary = BatchSummary::from_results(vec![
            TaskStatus {
                task_id: "a".to_string(),
                success: true,
                error: None,
                completed_stages: vec![],
            },
            TaskStatus {
                task_id: "b".to_string(),
                success: false,
                error: Some("x".to_string()),
                completed_stages: vec![],
            },
            TaskStatus {
                task_id: "c".to_string(),
                success: true,
                error: None,
                completed_stages: vec![],
            },
        ]);

        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        assert!((summary.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_empty_summary() {
        let summary = BatchSummary::from_results(vec![]);
        assert_eq!(summary.successful, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.success_rate(), 0.0);
    }
}
