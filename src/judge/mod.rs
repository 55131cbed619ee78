//! Trajectory judging subsystem.
//!
//! Two interchangeable evaluators produce an [`EvaluationOutcome`] for a
//! persisted trajectory: the comprehensive rubric judge (external
//! collaborator behind [`ComprehensiveJudge`], with the legacy
//! screenshot-based protocol in [`mind2web`] as fallback), and the
//! deterministic cookie check in [`cookie`] for login tasks. For login
//! tasks both run, and the cookie verdict is authoritative for
//! score/success/error.

pub mod comprehensive;
pub mod cookie;
pub mod mind2web;
pub mod prompts;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::ChatModel;
use crate::task::Task;
use crate::trajectory;

pub use comprehensive::{ComprehensiveJudge, ComprehensiveVerdict, ErrorCategory, TaskCategory};
pub use cookie::{evaluate_with_login_cookie, CookieMatcher, LoginCookieTracker};

/// Bound on one comprehensive-judge evaluation.
const COMPREHENSIVE_TIMEOUT: Duration = Duration::from_secs(180);

/// Screenshots the comprehensive judge may inspect.
const COMPREHENSIVE_MAX_IMAGES: usize = 10;

/// Key under which the legacy evaluation is persisted in `result.json`.
const MIND2WEB_RESULT_KEY: &str = "Online_Mind2Web_evaluation";

/// Key under which the comprehensive verdict is persisted in `result.json`.
const COMPREHENSIVE_RESULT_KEY: &str = "comprehensive_judge_evaluation";

/// The judging result for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub task_id: String,
    /// Judge narrative (verdict text or automatic judgement line).
    pub judgement: String,
    pub success: bool,
    pub error: Option<String>,
    /// Score on a 0-1 scale.
    pub score: f64,
    /// Full comprehensive verdict, when that judge ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comprehensive_evaluation: Option<ComprehensiveVerdict>,
    /// Step-level cookie tracking record, for login tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_data: Option<Value>,
}

impl EvaluationOutcome {
    fn failure(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            task_id: task_id.into(),
            judgement: message.clone(),
            success: false,
            error: Some(message),
            score: 0.0,
            comprehensive_evaluation: None,
            tracking_data: None,
        }
    }
}

fn dir_name(task_dir: &Path) -> String {
    task_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Judges one persisted trajectory.
///
/// Uses the comprehensive judge when one is configured (falling back to
/// the legacy protocol when it is absent or fails — an absent judge is a
/// quiet fallback, a failing one is logged as an error so evaluator bugs
/// stay visible), or the legacy protocol directly when `use_mind2web` is
/// set. Never returns an error; failures become failure outcomes.
pub async fn judge_task_result(
    model: &dyn ChatModel,
    task_dir: &Path,
    score_threshold: u8,
    use_mind2web: bool,
    comprehensive: Option<&dyn ComprehensiveJudge>,
) -> EvaluationOutcome {
    let task_id = dir_name(task_dir);

    let result = match trajectory::read_result_json(task_dir).await {
        Ok(Some(result)) => result,
        Ok(None) => return EvaluationOutcome::failure(task_id, "No result.json found"),
        Err(e) => {
            return EvaluationOutcome::failure(
                task_id,
                format!("Evaluation failed: {}", e),
            )
        }
    };

    if use_mind2web {
        return judge_mind2web(model, task_dir, &task_id, &result, score_threshold).await;
    }

    let Some(judge) = comprehensive else {
        tracing::debug!(task_id = %task_id, "Comprehensive judge not configured, using legacy judge");
        return judge_mind2web(model, task_dir, &task_id, &result, score_threshold).await;
    };

    // Reuse a previously persisted verdict.
    if let Some(existing) = result.get(COMPREHENSIVE_RESULT_KEY) {
        if let Ok(verdict) =
            serde_json::from_value::<ComprehensiveVerdict>(existing.clone())
        {
            return outcome_from_verdict(&task_id, verdict);
        }
    }

    tracing::info!(task_id = %task_id, "Using comprehensive judge evaluation");

    let evaluation = tokio::time::timeout(
        COMPREHENSIVE_TIMEOUT,
        judge.evaluate(task_dir, model, COMPREHENSIVE_MAX_IMAGES),
    )
    .await;

    match evaluation {
        Ok(Ok(verdict)) => {
            if let Ok(value) = serde_json::to_value(&verdict) {
                if let Err(e) =
                    trajectory::update_result_json(task_dir, COMPREHENSIVE_RESULT_KEY, value).await
                {
                    tracing::warn!(task_id = %task_id, error = %e, "Failed to persist comprehensive verdict");
                }
            }
            outcome_from_verdict(&task_id, verdict)
        }
        Ok(Err(e)) => {
            tracing::error!(
                task_id = %task_id,
                error = %e,
                "Comprehensive judge failed, falling back to legacy judge"
            );
            judge_mind2web(model, task_dir, &task_id, &result, score_threshold).await
        }
        Err(_) => {
            tracing::error!(
                task_id = %task_id,
                timeout_secs = COMPREHENSIVE_TIMEOUT.as_secs(),
                "Comprehensive judge timed out, falling back to legacy judge"
            );
            judge_mind2web(model, task_dir, &task_id, &result, score_threshold).await
        }
    }
}

fn outcome_from_verdict(task_id: &str, verdict: ComprehensiveVerdict) -> EvaluationOutcome {
    let judgement = if verdict.reasoning.is_empty() {
        "Comprehensive evaluation completed".to_string()
    } else {
        verdict.reasoning.clone()
    };

    EvaluationOutcome {
        task_id: task_id.to_string(),
        judgement,
        success: verdict.passed,
        error: None,
        score: verdict.final_score as f64 / 100.0,
        comprehensive_evaluation: Some(verdict),
        tracking_data: None,
    }
}

/// Runs (or reuses) the legacy protocol for one trajectory.
async fn judge_mind2web(
    model: &dyn ChatModel,
    task_dir: &Path,
    task_id: &str,
    result: &Value,
    score_threshold: u8,
) -> EvaluationOutcome {
    // Skip the eval when an evaluation has already been persisted.
    if let Some(existing) = result.get(MIND2WEB_RESULT_KEY) {
        if let Ok(outcome) = serde_json::from_value::<EvaluationOutcome>(existing.clone()) {
            return outcome;
        }
    }

    tracing::info!(task_id = %task_id, "Using legacy screenshot-based evaluation");

    let task_text = result
        .get("task")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let action_history: Vec<String> = result
        .get("action_history")
        .and_then(Value::as_array)
        .map(|actions| {
            actions
                .iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let screenshot_paths: Vec<String> = result
        .get("screenshot_paths")
        .and_then(Value::as_array)
        .map(|paths| {
            paths
                .iter()
                .filter_map(|p| p.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let evaluation = mind2web::evaluate_with_retry(
        &task_text,
        &action_history,
        &screenshot_paths,
        model,
        score_threshold,
        mind2web::MAX_RETRIES,
    )
    .await;

    match evaluation {
        Ok(evaluation) => {
            let outcome = EvaluationOutcome {
                task_id: task_id.to_string(),
                judgement: evaluation.judgement,
                success: evaluation.success,
                error: None,
                score: evaluation.score,
                comprehensive_evaluation: None,
                tracking_data: None,
            };

            match serde_json::to_value(&outcome) {
                Ok(value) => {
                    if let Err(e) =
                        trajectory::update_result_json(task_dir, MIND2WEB_RESULT_KEY, value).await
                    {
                        tracing::warn!(task_id = %task_id, error = %e, "Failed to persist evaluation");
                    }
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Failed to serialize evaluation");
                }
            }

            outcome
        }
        Err(e) => EvaluationOutcome::failure(task_id, format!("Evaluation failed: {}", e)),
    }
}

/// Overwrites the judge verdict with the authoritative cookie verdict.
///
/// The judge narrative and categories are kept for context; pass/fail and
/// score are taken from the cookie evaluation, including inside the
/// comprehensive verdict.
pub fn apply_cookie_overwrite(judge: &mut EvaluationOutcome, cookie: EvaluationOutcome) {
    judge.score = cookie.score;
    judge.success = cookie.success;
    judge.error = cookie.error;
    if cookie.tracking_data.is_some() {
        judge.tracking_data = cookie.tracking_data;
    }

    if let Some(verdict) = judge.comprehensive_evaluation.as_mut() {
        verdict.passed = judge.success;
        verdict.final_score = (judge.score * 100.0).round() as i64;
    }
}

/// Evaluates one task's trajectory.
///
/// Login tasks run both the judge and the cookie evaluator; the cookie
/// result is authoritative for score/success/error.
pub async fn evaluate_task_result(
    model: &dyn ChatModel,
    task_dir: &Path,
    task: Option<&Task>,
    use_mind2web: bool,
    comprehensive: Option<&dyn ComprehensiveJudge>,
) -> EvaluationOutcome {
    let login_cookie = task.and_then(|t| {
        t.is_login_task()
            .then(|| t.login_cookie.clone())
            .flatten()
    });

    match login_cookie {
        Some(login_cookie) => {
            if let Some(task) = task {
                tracing::info!(
                    task_id = %task.task_id,
                    "Using combined cookie-based and judge evaluation for login task"
                );
            }

            let mut judge_result = judge_task_result(
                model,
                task_dir,
                mind2web::DEFAULT_SCORE_THRESHOLD,
                use_mind2web,
                comprehensive,
            )
            .await;
            let cookie_result = evaluate_with_login_cookie(&login_cookie, task_dir).await;
            apply_cookie_overwrite(&mut judge_result, cookie_result);
            judge_result
        }
        None => {
            judge_task_result(
                model,
                task_dir,
                mind2web::DEFAULT_SCORE_THRESHOLD,
                use_mind2web,
                comprehensive,
            )
            .await
        }
    }
}
