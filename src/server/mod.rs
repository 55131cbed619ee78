//! Remote tracking backend client.
//!
//! The backend exposes five logical endpoints: fetch a named task list,
//! fetch an auth-credential distribution, start a run, save one task's
//! result, and save periodic per-runner progress. All are bearer
//! authenticated JSON; failures surface as typed [`ServerError`]s and the
//! callers decide how to degrade.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::AuthDistribution;
use crate::error::ServerError;

/// Details registered with the backend when a run starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetails {
    pub model: String,
    pub git_branch: String,
    pub git_commit_hash: String,
    pub git_commit_timestamp: i64,
    pub git_repo: String,
    pub user_message: String,
    pub eval_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub developer_id: Option<String>,
    pub total_tasks: usize,
    pub test_case_name: String,
    /// Free-form run configuration stored alongside the run.
    pub additional_data: Value,
}

/// One per-runner progress update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub run_id: String,
    pub runner_id: String,
    pub task_id: String,
    pub current_stage: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_task_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Capability trait for the tracking backend.
#[async_trait]
pub trait TrackingClient: Send + Sync {
    /// Fetches the named task list.
    async fn fetch_test_case(&self, name: &str) -> Result<Vec<Value>, ServerError>;

    /// Fetches an available auth distribution; `Ok(None)` when the backend
    /// has none to hand out.
    async fn fetch_auth_distribution(&self) -> Result<Option<AuthDistribution>, ServerError>;

    /// Starts (or re-initializes) a run and returns its id.
    async fn start_run(
        &self,
        details: &RunDetails,
        existing_run_id: Option<&str>,
    ) -> Result<String, ServerError>;

    /// Saves one task's result payload.
    async fn save_task_result(&self, payload: &Value) -> Result<(), ServerError>;

    /// Saves a per-runner progress record.
    async fn save_runner_progress(&self, update: &ProgressUpdate) -> Result<(), ServerError>;
}

/// HTTP implementation of [`TrackingClient`].
pub struct HttpTrackingClient {
    base_url: String,
    secret_key: String,
    http_client: Client,
}

impl HttpTrackingClient {
    /// Creates a client with explicit configuration.
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            secret_key: secret_key.into(),
            http_client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Creates a client from `WEBEVAL_TRACKER_URL` / `WEBEVAL_TRACKER_SECRET`.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::MissingConfig` naming the missing variable.
    pub fn from_env() -> Result<Self, ServerError> {
        let base_url = std::env::var("WEBEVAL_TRACKER_URL")
            .map_err(|_| ServerError::MissingConfig("WEBEVAL_TRACKER_URL"))?;
        let secret_key = std::env::var("WEBEVAL_TRACKER_SECRET")
            .map_err(|_| ServerError::MissingConfig("WEBEVAL_TRACKER_SECRET"))?;
        Ok(Self::new(base_url, secret_key))
    }

    async fn post(
        &self,
        endpoint: &str,
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<(StatusCode, Value), ServerError> {
        let mut builder = self
            .http_client
            .post(format!("{}/api/{}", self.base_url, endpoint))
            .bearer_auth(&self.secret_key)
            .json(payload);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            // 404 is a meaningful outcome for some endpoints; hand it back.
            if status != StatusCode::NOT_FOUND {
                return Err(ServerError::Status {
                    code: status.as_u16(),
                    body,
                });
            }
            return Ok((status, Value::Null));
        }

        let parsed = serde_json::from_str(&body)
            .map_err(|e| ServerError::MalformedResponse(format!("{}: {}", e, body)))?;
        Ok((status, parsed))
    }
}

#[async_trait]
impl TrackingClient for HttpTrackingClient {
    async fn fetch_test_case(&self, name: &str) -> Result<Vec<Value>, ServerError> {
        tracing::info!(test_case = %name, "Fetching task list from tracking backend");

        let (status, data) = self
            .post("getTestCase", &json!({"name": name}), None)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(ServerError::Status {
                code: 404,
                body: format!("test case '{}' not found", name),
            });
        }

        match data {
            Value::Array(tasks) => Ok(tasks),
            other => Err(ServerError::MalformedResponse(format!(
                "fetched task data is not a list: {}",
                other
            ))),
        }
    }

    async fn fetch_auth_distribution(&self) -> Result<Option<AuthDistribution>, ServerError> {
        tracing::info!("Fetching auth distribution from tracking backend");

        let (status, data) = self.post("getAuthDistribution", &json!({}), None).await?;
        if status == StatusCode::NOT_FOUND {
            tracing::warn!("No available auth distribution found on server");
            return Ok(None);
        }

        let distribution: AuthDistribution = serde_json::from_value(data)
            .map_err(|e| ServerError::MalformedResponse(e.to_string()))?;
        Ok(Some(distribution))
    }

    async fn start_run(
        &self,
        details: &RunDetails,
        existing_run_id: Option<&str>,
    ) -> Result<String, ServerError> {
        let mut payload = serde_json::to_value(details)
            .map_err(|e| ServerError::MalformedResponse(e.to_string()))?;
        if let (Some(run_id), Some(map)) = (existing_run_id, payload.as_object_mut()) {
            map.insert("runId".to_string(), json!(run_id));
        }

        tracing::info!(
            test_case = %details.test_case_name,
            total_tasks = details.total_tasks,
            "Starting run on tracking backend"
        );

        let (_, data) = self.post("startRun", &payload, None).await?;
        data.get("runId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(ServerError::MissingField("runId"))
    }

    async fn save_task_result(&self, payload: &Value) -> Result<(), ServerError> {
        let has_run_id = payload
            .get("runId")
            .and_then(Value::as_str)
            .is_some_and(|id| !id.is_empty());
        if !has_run_id {
            return Err(ServerError::MissingField("runId"));
        }

        let (_, data) = self.post("saveTaskResult", payload, None).await?;
        let result_id = data
            .get("resultId")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        tracing::info!(result_id = %result_id, "Saved task result");
        Ok(())
    }

    async fn save_runner_progress(&self, update: &ProgressUpdate) -> Result<(), ServerError> {
        let payload = serde_json::to_value(update)
            .map_err(|e| ServerError::MalformedResponse(e.to_string()))?;
        self.post(
            "saveRunnerProgress",
            &payload,
            Some(Duration::from_secs(10)),
        )
        .await?;
        Ok(())
    }
}

/// Derives the runner id used for progress tracking.
///
/// CI runs use a batch-level id matching the workflow convention; local
/// runs fall back to a timestamped id.
pub fn generate_runner_id(ci_run_id: Option<&str>, start_index: usize) -> String {
    match ci_run_id {
        Some(run_id) => format!("github_run_{}_batch_{}", run_id, start_index),
        None => format!("local_run_{}", chrono::Utc::now().timestamp()),
    }
}

/// Extracts the workflow run id from a workflow URL, when present.
pub fn workflow_run_id(workflow_url: &str) -> Option<String> {
    let (_, rest) = workflow_url.split_once("actions/runs/")?;
    let id = rest.split('/').next()?;
    (!id.is_empty()).then(|| id.to_string())
}

/// Sends a best-effort progress update; failures are logged, never raised.
pub async fn send_progress_update(
    client: Option<&dyn TrackingClient>,
    run_id: &str,
    task_id: &str,
    current_stage: &str,
    status: &str,
    workflow_url: Option<&str>,
    error_message: Option<&str>,
) {
    let Some(client) = client else {
        return;
    };

    let ci_run_id = std::env::var("GITHUB_RUN_ID").ok();
    let start_index = std::env::var("EVAL_START_INDEX")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let update = ProgressUpdate {
        run_id: run_id.to_string(),
        runner_id: generate_runner_id(ci_run_id.as_deref(), start_index),
        task_id: task_id.to_string(),
        current_stage: current_stage.to_string(),
        status: status.to_string(),
        workflow_url: workflow_url.map(str::to_string),
        workflow_run_id: workflow_url.and_then(workflow_run_id),
        assigned_task_range: None,
        error_message: error_message.map(str::to_string),
    };

    if let Err(e) = client.save_runner_progress(&update).await {
        tracing::warn!(task_id = %task_id, stage = %current_stage, error = %e, "Failed to send progress update");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_runner_id() {
        assert_eq!(
            generate_runner_id(Some("987654"), 40),
            "github_run_987654_batch_40"
        );
        assert!(generate_runner_id(None, 0).starts_with("local_run_"));
    }

    #[test]
    fn test_workflow_run_id_extraction() {
        assert_eq!(
            workflow_run_id("https://github.com/acme/evals/actions/runs/123456789/job/1"),
            Some("123456789".to_string())
        );
        assert_eq!(
            workflow_run_id("https://github.com/acme/evals/actions/runs/42"),
            Some("42".to_string())
        );
        assert_eq!(workflow_run_id("https://github.com/acme/evals"), None);
    }

    #[test]
    fn test_progress_update_serializes_camel_case() {
        let update = ProgressUpdate {
            run_id: "r-1".to_string(),
            runner_id: "github_run_1_batch_0".to_string(),
            task_id: "t-1".to_string(),
            current_stage: "run_agent".to_string(),
            status: "active".to_string(),
            workflow_url: None,
            workflow_run_id: None,
            assigned_task_range: None,
            error_message: None,
        };

        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["runId"], "r-1");
        assert_eq!(json["runnerId"], "github_run_1_batch_0");
        assert_eq!(json["currentStage"], "run_agent");
        assert!(json.get("workflowUrl").is_none());
    }

    #[test]
    fn test_run_details_serializes_camel_case() {
        let details = RunDetails {
            model: "gpt-judge".to_string(),
            git_branch: "main".to_string(),
            git_commit_hash: "abc".to_string(),
            git_commit_timestamp: 1700000000,
            git_repo: "acme/evals".to_string(),
            user_message: String::new(),
            eval_group: "nightly".to_string(),
            developer_id: None,
            total_tasks: 100,
            test_case_name: "WebBench".to_string(),
            additional_data: json!({"max_steps": 25}),
        };

        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["gitBranch"], "main");
        assert_eq!(json["totalTasks"], 100);
        assert_eq!(json["testCaseName"], "WebBench");
        assert_eq!(json["additionalData"]["max_steps"], 25);
    }
}
