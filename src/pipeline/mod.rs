//! The concurrent task-execution pipeline.
//!
//! Each task runs through a strict five-stage state machine (browser
//! setup, agent run, history formatting, evaluation, server save) with
//! per-stage error isolation and best-effort result persistence on every
//! abnormal exit. The orchestrator fans tasks out under an admission gate
//! and aggregates their outcomes.

pub mod config;
pub mod orchestrator;
pub mod result;
pub mod runner;

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use config::{EvalConfig, StageTimeouts};
pub use orchestrator::{run_multiple_tasks, BatchSummary};
pub use result::{TaskResult, TaskStatus};
pub use runner::{run_task_pipeline, PipelineContext};

/// One step of the task pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SetupBrowser,
    RunAgent,
    FormatHistory,
    Evaluate,
    SaveServer,
}

impl Stage {
    /// String form used in payloads and progress updates.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetupBrowser => "setup_browser",
            Self::RunAgent => "run_agent",
            Self::FormatHistory => "format_history",
            Self::Evaluate => "evaluate",
            Self::SaveServer => "save_server",
        }
    }

    /// Determines the stage currently in flight from the completed set.
    ///
    /// Returns the highest completed stage (the one whose successor was
    /// running when an abort hit), defaulting to browser setup when
    /// nothing has completed yet.
    pub fn current(completed: &HashSet<Stage>) -> Stage {
        for stage in [
            Self::SaveServer,
            Self::Evaluate,
            Self::FormatHistory,
            Self::RunAgent,
            Self::SetupBrowser,
        ] {
            if completed.contains(&stage) {
                return stage;
            }
        }
        Self::SetupBrowser
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a recorded stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Unexpected failure within the stage.
    Exception,
    /// The stage exceeded its allotted duration.
    Timeout,
    /// The server save specifically failed.
    ServerSave,
}

impl StageErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exception => "exception",
            Self::Timeout => "timeout",
            Self::ServerSave => "server_save",
        }
    }
}

/// A recorded stage failure. Appended to the owning [`TaskResult`]'s error
/// list; never propagated onward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    /// Records an unexpected failure.
    pub fn exception(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: StageErrorKind::Exception,
            message: message.into(),
        }
    }

    /// Records a timeout.
    pub fn timeout(stage: Stage) -> Self {
        Self {
            stage,
            kind: StageErrorKind::Timeout,
            message: "Operation timed out".to_string(),
        }
    }

    /// Records a server-save failure.
    pub fn server_save(message: impl Into<String>) -> Self {
        Self {
            stage: Stage::SaveServer,
            kind: StageErrorKind::ServerSave,
            message: message.into(),
        }
    }
}

/// Failure of one [`run_stage`] invocation.
#[derive(Debug)]
pub enum StageRunError {
    /// The stage exceeded its timeout. Distinguished so callers can
    /// attribute the abort to the correct stage.
    Timeout,
    /// The stage action itself failed.
    Failed(anyhow::Error),
}

impl std::fmt::Display for StageRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("stage timed out"),
            Self::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Runs a stage action, optionally bounded by `timeout`.
///
/// Purely a timeout-wrapping adapter; no side effects of its own.
pub async fn run_stage<T, F>(action: F, timeout: Option<Duration>) -> Result<T, StageRunError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, action).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StageRunError::Failed(e)),
            Err(_) => Err(StageRunError::Timeout),
        },
        None => action.await.map_err(StageRunError::Failed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_as_str() {
        assert_eq!(Stage::SetupBrowser.as_str(), "setup_browser");
        assert_eq!(Stage::SaveServer.as_str(), "save_server");
        assert_eq!(serde_json::to_value(Stage::RunAgent).unwrap(), "run_agent");
    }

    #[test]
    fn test_current_stage_lookup() {
        let mut completed = HashSet::new();
        assert_eq!(Stage::current(&completed), Stage::SetupBrowser);

        completed.insert(Stage::SetupBrowser);
        assert_eq!(Stage::current(&completed), Stage::SetupBrowser);

        completed.insert(Stage::RunAgent);
        assert_eq!(Stage::current(&completed), Stage::RunAgent);

        completed.insert(Stage::FormatHistory);
        completed.insert(Stage::Evaluate);
        assert_eq!(Stage::current(&completed), Stage::Evaluate);

        completed.insert(Stage::SaveServer);
        assert_eq!(Stage::current(&completed), Stage::SaveServer);
    }

    #[tokio::test]
    async fn test_run_stage_passes_value_through() {
        let value = run_stage(async { Ok(7) }, None).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_stage_distinguishes_timeout() {
        let result: Result<(), _> = run_stage(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
            Some(Duration::from_millis(20)),
        )
        .await;

        assert!(matches!(result, Err(StageRunError::Timeout)));
    }

    #[tokio::test]
    async fn test_run_stage_wraps_failures() {
        let result: Result<(), _> =
            run_stage(async { Err(anyhow::anyhow!("boom")) }, Some(Duration::from_secs(5))).await;

        match result {
            Err(StageRunError::Failed(e)) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_stage_error_constructors() {
        let err = StageError::timeout(Stage::RunAgent);
        assert_eq!(err.kind, StageErrorKind::Timeout);
        assert_eq!(err.message, "Operation timed out");

        let err = StageError::server_save("503");
        assert_eq!(err.stage, Stage::SaveServer);
        assert_eq!(err.kind, StageErrorKind::ServerSave);
    }
}
