//! Per-task outcome record.
//!
//! A [`TaskResult`] tracks which pipeline stages completed, which failed
//! with what error, the cancellation/critical flags, and the payloads the
//! stages produced. It is exclusively owned by its task's pipeline
//! invocation; the server-payload builder and the coordinator's
//! aggregation are its only readers.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{Stage, StageError, StageErrorKind};
use crate::task::Task;

/// Local status summary for one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub completed_stages: Vec<String>,
}

/// Full outcome record for one task execution.
#[derive(Debug)]
pub struct TaskResult {
    pub task_id: String,
    pub run_id: String,
    pub confirmed_task: String,
    pub max_steps: usize,
    pub workflow_url: Option<String>,
    /// Grow-only set of completed stages.
    pub completed_stages: HashSet<Stage>,
    /// Stage payloads; the first write for a stage wins.
    stage_data: HashMap<Stage, Value>,
    /// Append-only error list.
    pub errors: Vec<StageError>,
    pub cancelled: bool,
    pub critical_error: Option<String>,
    pub server_save_failed: bool,
}

impl TaskResult {
    /// Creates a fresh record for one task execution.
    pub fn new(
        task: &Task,
        run_id: impl Into<String>,
        max_steps: usize,
        workflow_url: Option<String>,
    ) -> Self {
        Self {
            task_id: task.task_id.clone(),
            run_id: run_id.into(),
            confirmed_task: task.confirmed_task.clone(),
            max_steps,
            workflow_url,
            completed_stages: HashSet::new(),
            stage_data: HashMap::new(),
            errors: Vec::new(),
            cancelled: false,
            critical_error: None,
            server_save_failed: false,
        }
    }

    /// Marks a stage completed.
    pub fn stage_completed(&mut self, stage: Stage) {
        self.completed_stages.insert(stage);
    }

    /// Marks a stage completed with its payload. Data already recorded for
    /// the stage is not overwritten.
    pub fn stage_completed_with_data(&mut self, stage: Stage, data: Value) {
        self.completed_stages.insert(stage);
        self.stage_data.entry(stage).or_insert(data);
    }

    /// Records a stage failure.
    pub fn stage_failed(&mut self, error: StageError) {
        self.errors.push(error);
    }

    /// Returns the recorded payload for a stage, if any.
    pub fn stage_data(&self, stage: Stage) -> Option<&Value> {
        self.stage_data.get(&stage)
    }

    /// Flags external cancellation.
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Records a fatal failure outside stage boundaries.
    pub fn mark_critical_error(&mut self, error: impl Into<String>) {
        self.critical_error = Some(error.into());
    }

    /// Records a failed server save.
    pub fn mark_server_save_failed(&mut self, error: impl Into<String>) {
        self.server_save_failed = true;
        self.errors.push(StageError::server_save(error));
    }

    /// Whether any execution data exists to evaluate.
    pub fn has_execution_data(&self) -> bool {
        self.completed_stages.contains(&Stage::RunAgent)
            || self.completed_stages.contains(&Stage::FormatHistory)
    }

    /// Builds the flattened, serializable payload for server submission.
    pub fn server_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("taskId".to_string(), json!(self.task_id));
        payload.insert("runId".to_string(), json!(self.run_id));
        payload.insert("task".to_string(), json!(self.confirmed_task));
        payload.insert(
            "completed_stages".to_string(),
            json!(self
                .completed_stages
                .iter()
                .map(Stage::as_str)
                .collect::<Vec<_>>()),
        );
        payload.insert("has_errors".to_string(), json!(!self.errors.is_empty()));
        payload.insert("cancelled".to_string(), json!(self.cancelled));
        payload.insert("critical_error".to_string(), json!(self.critical_error));
        payload.insert(
            "server_save_failed".to_string(),
            json!(self.server_save_failed),
        );
        payload.insert("githubWorkflowUrl".to_string(), json!(self.workflow_url));

        if self.completed_stages.contains(&Stage::FormatHistory) {
            if let Some(format_data) = self.stage_data.get(&Stage::FormatHistory) {
                copy_field(format_data, "action_history", &mut payload, "actionHistory");
                copy_field(
                    format_data,
                    "final_result_response",
                    &mut payload,
                    "finalResultResponse",
                );
                payload.insert(
                    "selfReportCompleted".to_string(),
                    format_data
                        .get("self_report_completed")
                        .cloned()
                        .unwrap_or(json!(false)),
                );
                payload.insert(
                    "selfReportSuccess".to_string(),
                    format_data
                        .get("self_report_success")
                        .cloned()
                        .unwrap_or(json!(false)),
                );
                copy_field(format_data, "task_duration", &mut payload, "taskDuration");
                copy_field(format_data, "steps", &mut payload, "steps");
                payload.insert("maxSteps".to_string(), json!(self.max_steps));
                copy_field(format_data, "tokensUsed", &mut payload, "tokensUsed");
                // Usage objects are stored as JSON strings by the backend.
                let usage = match format_data.get("usage") {
                    Some(Value::Object(map)) => {
                        json!(serde_json::to_string(map).unwrap_or_default())
                    }
                    Some(other) => other.clone(),
                    None => Value::Null,
                };
                payload.insert("usage".to_string(), usage);
                copy_field(
                    format_data,
                    "complete_history",
                    &mut payload,
                    "completeHistory",
                );
            }
        }

        if self.completed_stages.contains(&Stage::Evaluate) {
            let eval_data = self.stage_data.get(&Stage::Evaluate);

            if let Some(comp) =
                eval_data.and_then(|data| data.get("comprehensive_evaluation"))
            {
                copy_field(
                    comp,
                    "task_summary",
                    &mut payload,
                    "comprehensiveJudgeEvaluationSummary",
                );
                copy_field(
                    comp,
                    "reasoning",
                    &mut payload,
                    "comprehensiveJudgeEvaluationReasoning",
                );
                copy_field(comp, "passed", &mut payload, "comprehensiveJudgeEvaluationPassed");
                copy_field(
                    comp,
                    "final_score",
                    &mut payload,
                    "comprehensiveJudgeEvaluationScore",
                );
                copy_field(
                    comp,
                    "task_categories",
                    &mut payload,
                    "comprehensiveJudgeEvaluationCategories",
                );
                copy_field(
                    comp,
                    "error_categories",
                    &mut payload,
                    "comprehensiveJudgeEvaluationErrors",
                );
                copy_field(
                    comp,
                    "improvement_tips",
                    &mut payload,
                    "comprehensiveJudgeEvaluationTips",
                );
                copy_field(
                    comp,
                    "critical_issues",
                    &mut payload,
                    "comprehensiveJudgeEvaluationCriticalIssues",
                );
                copy_field(comp, "scores", &mut payload, "comprehensiveJudgeEvaluationScores");
                payload.insert(
                    "comprehensiveJudgeEvaluationFull".to_string(),
                    comp.clone(),
                );
            }

            payload.insert(
                "onlineMind2WebEvaluationJudgement".to_string(),
                eval_data
                    .and_then(|data| data.get("judgement"))
                    .filter(|j| !j.is_null())
                    .cloned()
                    .unwrap_or(json!("No evaluation available")),
            );
            payload.insert(
                "onlineMind2WebEvaluationError".to_string(),
                eval_data
                    .and_then(|data| data.get("error"))
                    .cloned()
                    .unwrap_or(Value::Null),
            );
            payload.insert(
                "onlineMind2WebEvaluationSuccess".to_string(),
                eval_data
                    .and_then(|data| data.get("success"))
                    .cloned()
                    .unwrap_or(json!(false)),
            );
            payload.insert(
                "onlineMind2WebEvaluationScore".to_string(),
                eval_data
                    .and_then(|data| data.get("score"))
                    .cloned()
                    .unwrap_or(json!(0.0)),
            );
        }

        Value::Object(payload)
    }

    /// Derives the local status summary.
    ///
    /// Success requires a completed evaluation, no cancellation, no
    /// critical error, and zero recorded errors of kind `exception`.
    pub fn local_status(&self) -> TaskStatus {
        let success = self.completed_stages.contains(&Stage::Evaluate)
            && !self.cancelled
            && self.critical_error.is_none()
            && !self
                .errors
                .iter()
                .any(|e| e.kind == StageErrorKind::Exception);

        let error = self
            .critical_error
            .clone()
            .or_else(|| self.errors.first().map(|e| e.message.clone()));

        TaskStatus {
            task_id: self.task_id.clone(),
            success,
            error,
            completed_stages: self
                .completed_stages
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
        }
    }
}

/// Copies `src[src_key]` into `dst[dst_key]` when present.
fn copy_field(src: &Value, src_key: &str, dst: &mut Map<String, Value>, dst_key: &str) {
    if let Some(value) = src.get(src_key) {
        dst.insert(dst_key.to_string(), value.clone());
    }
}
