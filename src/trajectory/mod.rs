//! Trajectory formatting and artifact persistence.
//!
//! Turns a raw [`AgentHistory`] into the formatted record the judges and
//! the tracking backend consume: screenshots written to the task folder,
//! the action-history text sequence (with the final "done" result split
//! out), a complete per-step history with cleaned model output, token
//! totals, and the task duration. The formatted record is persisted as
//! `result.json` in the task-scoped directory.

use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;

use crate::agent::AgentHistory;
use crate::error::StorageError;

/// Subdirectory holding per-step screenshots.
pub const SCREENSHOT_DIR: &str = "trajectory_with_highlights";

/// File name of the formatted-trajectory artifact.
pub const RESULT_FILE: &str = "result.json";

/// One step of the complete history, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_number: usize,
    pub model_output: Option<Value>,
    pub result: Option<Vec<Value>>,
    pub state: StepStateRecord,
    pub metadata: Map<String, Value>,
}

/// Page state captured in a step record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepStateRecord {
    pub url: Option<String>,
    pub title: Option<String>,
}

/// The formatted trajectory for one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattedHistory {
    pub task_id: String,
    pub run_id: String,
    pub task: String,
    pub action_history: Vec<String>,
    pub screenshot_paths: Vec<String>,
    pub final_result_response: Option<String>,
    pub last_message: String,
    pub self_report_completed: bool,
    pub self_report_success: Option<bool>,
    pub complete_history: Vec<StepRecord>,
    pub task_duration: Option<f64>,
    pub steps: usize,
    #[serde(rename = "tokensUsed")]
    pub tokens_used: i64,
    pub usage: Option<Value>,
}

/// Inputs for formatting one trajectory.
#[derive(Debug, Clone)]
pub struct FormatContext {
    pub task_id: String,
    pub run_id: String,
    pub task: String,
    pub last_message: String,
    /// Base directory under which the task folder lives.
    pub base_path: PathBuf,
    /// Append the final result to the action history handed to judges.
    pub include_result: bool,
    /// Wall-clock agent execution time, when measured by the caller.
    pub agent_execution_time: Option<f64>,
}

/// Formats the history, writing screenshots and `result.json` as it goes.
pub async fn format_history(
    history: &AgentHistory,
    ctx: &FormatContext,
) -> Result<FormattedHistory, StorageError> {
    let task_dir = ctx.base_path.join(&ctx.task_id);
    let highlights_dir = task_dir.join(SCREENSHOT_DIR);

    fs::create_dir_all(&highlights_dir).await.map_err(|e| {
        StorageError::DirectoryCreationFailed {
            path: highlights_dir.display().to_string(),
            reason: e.to_string(),
        }
    })?;

    let mut screenshot_paths = Vec::new();
    let mut action_history = Vec::new();
    let mut final_result: Option<String> = None;
    let mut self_report_completed = false;
    let mut self_report_success = None;
    let mut complete_history = Vec::new();
    let mut tokens_used: i64 = 0;

    for (step_num, step) in history.steps.iter().enumerate() {
        if let Some(screenshot) = &step.screenshot {
            let path = highlights_dir.join(format!("step_{}.png", step_num));
            let data = base64::engine::general_purpose::STANDARD.decode(screenshot)?;
            fs::write(&path, data).await?;
            screenshot_paths.push(path.display().to_string());
        }

        for result in &step.results {
            // The final result is judged separately, so it stays out of the
            // action history.
            if let Some(content) = &result.extracted_content {
                if !content.is_empty() && content != "None" && !result.is_done {
                    action_history.push(content.clone());
                }
            }
            if result.is_done {
                final_result = result.extracted_content.clone();
                self_report_completed = true;
                self_report_success = result.success;
            }
        }

        let model_output = step.model_output.as_ref().map(clean_model_output);
        let metadata = step
            .metadata
            .as_ref()
            .map(|m| match serde_json::to_value(m) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            })
            .unwrap_or_default();

        match metadata.get("input_tokens") {
            None => {}
            Some(Value::Null) => {}
            Some(value) => match value.as_i64() {
                Some(tokens) => tokens_used += tokens,
                None => {
                    tracing::warn!(
                        task_id = %ctx.task_id,
                        step = step_num,
                        "Could not parse input_tokens as an integer"
                    );
                }
            },
        }

        complete_history.push(StepRecord {
            step_number: step_num,
            model_output,
            result: if step.results.is_empty() {
                None
            } else {
                Some(
                    step.results
                        .iter()
                        .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
                        .collect(),
                )
            },
            state: StepStateRecord {
                url: step.state.as_ref().and_then(|s| s.url.clone()),
                title: step.state.as_ref().and_then(|s| s.title.clone()),
            },
            metadata,
        });
    }

    // Wall-clock timing around the agent run wins; step timestamps are the
    // fallback.
    let task_duration = ctx
        .agent_execution_time
        .or_else(|| step_based_duration(&complete_history));

    if ctx.include_result {
        if let Some(result) = &final_result {
            if !result.trim().is_empty() {
                action_history.push(result.clone());
            }
        }
    }

    let formatted = FormattedHistory {
        task_id: ctx.task_id.clone(),
        run_id: ctx.run_id.clone(),
        task: ctx.task.clone(),
        action_history,
        screenshot_paths,
        final_result_response: final_result,
        last_message: ctx.last_message.clone(),
        self_report_completed,
        self_report_success,
        steps: complete_history.len(),
        complete_history,
        task_duration,
        tokens_used,
        usage: history.usage.clone(),
    };

    write_result_json(&task_dir, &serde_json::to_value(&formatted)?).await?;

    Ok(formatted)
}

/// Computes the duration from the first step's start to the last step's end.
fn step_based_duration(complete_history: &[StepRecord]) -> Option<f64> {
    let first = complete_history.first()?;
    let last = complete_history.last()?;
    let start = first.metadata.get("step_start_time")?.as_f64()?;
    let end = last.metadata.get("step_end_time")?.as_f64()?;
    Some(end - start)
}

/// Strips null values from the action list of a model output.
fn clean_model_output(output: &Value) -> Value {
    let mut cleaned = output.clone();
    if let Some(actions) = cleaned.get_mut("action").and_then(Value::as_array_mut) {
        for action in actions.iter_mut() {
            *action = strip_nulls(action);
        }
    }
    cleaned
}

/// Recursively removes null-valued keys from JSON objects.
fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Writes `result.json` into the task directory.
pub async fn write_result_json(task_dir: &Path, value: &Value) -> Result<(), StorageError> {
    fs::create_dir_all(task_dir).await?;
    let path = task_dir.join(RESULT_FILE);
    fs::write(&path, serde_json::to_vec_pretty(value)?).await?;
    Ok(())
}

/// Reads `result.json` from the task directory, if present.
pub async fn read_result_json(task_dir: &Path) -> Result<Option<Value>, StorageError> {
    let path = task_dir.join(RESULT_FILE);
    if !fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(None);
    }
    let data = fs::read(&path).await?;
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Merges `key = value` into an existing `result.json`.
pub async fn update_result_json(
    task_dir: &Path,
    key: &str,
    value: Value,
) -> Result<(), StorageError> {
    let mut current = read_result_json(task_dir)
        .await?
        .unwrap_or_else(|| Value::Object(Map::new()));
    if let Some(map) = current.as_object_mut() {
        map.insert(key.to_string(), value);
    }
    write_result_json(task_dir, &current).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ActionOutcome, AgentStep, StepMetadata, StepState};
    use serde_json::json;

    fn ctx(base: &Path) -> FormatContext {
        FormatContext {
            task_id: "t-1".to_string(),
            run_id: "run-1".to_string(),
            task: "Find a hotel".to_string(),
            last_message: "final prompt".to_string(),
            base_path: base.to_path_buf(),
            include_result: false,
            agent_execution_time: None,
        }
    }

    fn step(content: &str, done: bool) -> AgentStep {
        AgentStep {
            results: vec![ActionOutcome {
                extracted_content: Some(content.to_string()),
                is_done: done,
                success: if done { Some(true) } else { None },
                error: None,
            }],
            state: Some(StepState {
                url: Some("https://example.com".to_string()),
                title: None,
            }),
            ..AgentStep::default()
        }
    }

    #[tokio::test]
    async fn test_format_history_splits_final_result() {
        let dir = tempfile::tempdir().unwrap();
        let history = AgentHistory {
            steps: vec![step("Clicked search", false), step("Booked the hotel", true)],
            usage: None,
        };

        let formatted = format_history(&history, &ctx(dir.path())).await.unwrap();

        assert_eq!(formatted.action_history, vec!["Clicked search".to_string()]);
        assert_eq!(
            formatted.final_result_response.as_deref(),
            Some("Booked the hotel")
        );
        assert!(formatted.self_report_completed);
        assert_eq!(formatted.self_report_success, Some(true));
        assert_eq!(formatted.steps, 2);

        // result.json lands in the task folder
        let persisted = read_result_json(&dir.path().join("t-1")).await.unwrap();
        assert!(persisted.is_some());
    }

    #[tokio::test]
    async fn test_format_history_include_result() {
        let dir = tempfile::tempdir().unwrap();
        let history = AgentHistory {
            steps: vec![step("Clicked search", false), step("Booked the hotel", true)],
            usage: None,
        };
        let mut ctx = ctx(dir.path());
        ctx.include_result = true;

        let formatted = format_history(&history, &ctx).await.unwrap();
        assert_eq!(
            formatted.action_history,
            vec!["Clicked search".to_string(), "Booked the hotel".to_string()]
        );
    }

    #[tokio::test]
    async fn test_format_history_writes_screenshots() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"fake-png-bytes");
        let history = AgentHistory {
            steps: vec![AgentStep {
                screenshot: Some(encoded),
                ..AgentStep::default()
            }],
            usage: None,
        };

        let formatted = format_history(&history, &ctx(dir.path())).await.unwrap();

        assert_eq!(formatted.screenshot_paths.len(), 1);
        let path = dir.path().join("t-1").join(SCREENSHOT_DIR).join("step_0.png");
        assert_eq!(std::fs::read(path).unwrap(), b"fake-png-bytes");
    }

    #[tokio::test]
    async fn test_format_history_sums_tokens_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = step("a", false);
        first.metadata = Some(StepMetadata {
            step_start_time: Some(100.0),
            step_end_time: Some(104.0),
            input_tokens: Some(700),
            extra: Map::new(),
        });
        let mut last = step("b", false);
        last.metadata = Some(StepMetadata {
            step_start_time: Some(104.0),
            step_end_time: Some(110.5),
            input_tokens: Some(300),
            extra: Map::new(),
        });

        let history = AgentHistory {
            steps: vec![first, last],
            usage: Some(json!({"total_tokens": 1000})),
        };

        let formatted = format_history(&history, &ctx(dir.path())).await.unwrap();
        assert_eq!(formatted.tokens_used, 1000);
        assert_eq!(formatted.task_duration, Some(10.5));
        assert_eq!(formatted.usage, Some(json!({"total_tokens": 1000})));
    }

    #[tokio::test]
    async fn test_wall_clock_duration_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path());
        ctx.agent_execution_time = Some(42.0);

        let history = AgentHistory {
            steps: vec![step("a", false)],
            usage: None,
        };
        let formatted = format_history(&history, &ctx).await.unwrap();
        assert_eq!(formatted.task_duration, Some(42.0));
    }

    #[test]
    fn test_clean_model_output_strips_null_action_fields() {
        let output = json!({
            "thinking": "...",
            "action": [
                {"click": {"index": 3, "xpath": null}},
                {"done": {"text": "ok", "success": true, "files": null}}
            ]
        });

        let cleaned = clean_model_output(&output);
        assert_eq!(cleaned["action"][0], json!({"click": {"index": 3}}));
        assert_eq!(
            cleaned["action"][1],
            json!({"done": {"text": "ok", "success": true}})
        );
    }

    #[tokio::test]
    async fn test_update_result_json() {
        let dir = tempfile::tempdir().unwrap();
        let task_dir = dir.path().join("t-9");
        write_result_json(&task_dir, &json!({"task": "x"})).await.unwrap();
        update_result_json(&task_dir, "evaluation", json!({"score": 1.0}))
            .await
            .unwrap();

        let value = read_result_json(&task_dir).await.unwrap().unwrap();
        assert_eq!(value["task"], "x");
        assert_eq!(value["evaluation"]["score"], 1.0);
    }
}
