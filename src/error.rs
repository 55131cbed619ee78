//! Error types for webeval operations.
//!
//! Defines error types for all major subsystems:
//! - Task construction and validation
//! - Browser session provisioning and lifecycle
//! - Agent execution
//! - Chat-model API interactions
//! - Trajectory judging
//! - Tracking-backend communication
//! - Artifact storage

use thiserror::Error;

/// Errors that can occur when constructing or validating a task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task_id is required and cannot be empty")]
    MissingTaskId,

    #[error("confirmed_task is required and cannot be empty")]
    MissingInstruction,

    #[error("Invalid task definition: {0}")]
    InvalidDefinition(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during browser session operations.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("Session provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("Unexpected response from provisioning service: {0}")]
    ProvisioningResponse(String),

    #[error("Failed to launch browser session: {0}")]
    LaunchFailed(String),

    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while running the browser agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent service error ({code}): {message}")]
    Service { code: u16, message: String },

    #[error("Agent event stream ended before a final history event")]
    StreamTruncated,

    #[error("Malformed agent event: {0}")]
    MalformedEvent(String),

    #[error("Agent backend not configured: {0}")]
    NotConfigured(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during chat-model operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: WEBEVAL_LLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse model response: {0}")]
    ParseError(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Model returned an empty completion")]
    EmptyCompletion,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while judging a task trajectory.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("No result.json found in task folder '{0}'")]
    ResultMissing(String),

    #[error("Comprehensive judge is not configured")]
    Unavailable,

    #[error("Comprehensive judge failed: {0}")]
    ComprehensiveFailed(String),

    #[error("Evaluation failed after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("Could not parse judge verdict: {0}")]
    MalformedVerdict(String),

    #[error("Evaluation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Model error: {0}")]
    Llm(#[from] LlmError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by the remote tracking backend client.
///
/// Callers decide fallback behavior explicitly; none of these are
/// converted into sentinel values inside the client.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Tracking backend not configured: {0} not set")]
    MissingConfig(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tracking backend returned status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Malformed response from tracking backend: {0}")]
    MalformedResponse(String),

    #[error("Missing field '{0}' in tracking backend response")]
    MissingField(&'static str),
}

/// Errors that can occur while persisting task artifacts.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to decode screenshot data: {0}")]
    ScreenshotDecode(#[from] base64::DecodeError),

    #[error("Failed to create task directory '{path}': {reason}")]
    DirectoryCreationFailed { path: String, reason: String },
}
