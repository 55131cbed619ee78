//! Browser-agent capability and trajectory data model.
//!
//! The agent itself is an external collaborator behind [`WebAgent`] /
//! [`AgentFactory`]: given a live browser session and a run spec it
//! produces a trajectory. This module owns the typed step records the rest
//! of the pipeline consumes, plus the tool-registry options resolved per
//! task (web-search substitution, structured output, two-factor email
//! credentials).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::{email_user_id, extract_email};
use crate::browser::BrowserSession;
use crate::error::AgentError;
use crate::task::Task;

/// One result object emitted by an agent action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Content the action extracted from the page, if any.
    #[serde(default)]
    pub extracted_content: Option<String>,
    /// Whether this result terminates the run.
    #[serde(default)]
    pub is_done: bool,
    /// Self-reported success of the terminal result.
    #[serde(default)]
    pub success: Option<bool>,
    /// Error text if the action failed.
    #[serde(default)]
    pub error: Option<String>,
}

/// Page state captured at a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepState {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Per-step timing and token metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepMetadata {
    /// Unix timestamp at which the step started.
    #[serde(default)]
    pub step_start_time: Option<f64>,
    /// Unix timestamp at which the step ended.
    #[serde(default)]
    pub step_end_time: Option<f64>,
    /// Prompt tokens consumed by the step.
    #[serde(default)]
    pub input_tokens: Option<i64>,
    /// Remaining metadata fields from the agent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One step of an agent trajectory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStep {
    /// Base64-encoded screenshot taken at this step.
    #[serde(default)]
    pub screenshot: Option<String>,
    /// Results of the actions executed in this step.
    #[serde(default)]
    pub results: Vec<ActionOutcome>,
    /// Raw model output, including the chosen action list.
    #[serde(default)]
    pub model_output: Option<Value>,
    /// Page state at this step.
    #[serde(default)]
    pub state: Option<StepState>,
    /// Timing and token metadata.
    #[serde(default)]
    pub metadata: Option<StepMetadata>,
}

/// The full trajectory produced by one agent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentHistory {
    /// Ordered step records.
    #[serde(default)]
    pub steps: Vec<AgentStep>,
    /// Aggregate usage data reported by the agent, if any.
    #[serde(default)]
    pub usage: Option<Value>,
}

/// Result of one agent run: the trajectory plus the final message the
/// agent sent to its underlying model.
#[derive(Debug, Clone, Default)]
pub struct AgentRun {
    pub history: AgentHistory,
    pub last_message: String,
}

/// Callback invoked after every completed agent step.
///
/// Receives the zero-based step number. Owned by one pipeline invocation;
/// never shared across tasks.
pub type StepCallback = Arc<dyn Fn(usize) -> BoxFuture<'static, ()> + Send + Sync>;

/// Options for the agent's tool/action registry.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistryOptions {
    /// Substitute the default search action with a web-search capability.
    pub use_web_search: bool,
    /// Structured-output contract derived from the task's output schema.
    pub output_schema: Option<Value>,
    /// Access token for two-factor email lookup, when the task references
    /// an email identity present in the credential map.
    pub two_factor_token: Option<String>,
}

impl ToolRegistryOptions {
    /// Resolves the registry options for a task.
    ///
    /// Two-factor wiring: if the task instruction mentions an email address
    /// whose user id has a token in `two_factor_tokens`, that token is
    /// forwarded so the registry can expose inbox-lookup actions.
    pub fn for_task(
        task: &Task,
        use_web_search: bool,
        two_factor_tokens: Option<&HashMap<String, String>>,
    ) -> Self {
        let two_factor_token = two_factor_tokens.and_then(|tokens| {
            let email = extract_email(&task.confirmed_task)?;
            let user_id = email_user_id(email);
            match tokens.get(user_id) {
                Some(token) => {
                    tracing::info!(task_id = %task.task_id, user_id = %user_id, "Two-factor email lookup enabled");
                    Some(token.clone())
                }
                None => {
                    tracing::debug!(task_id = %task.task_id, user_id = %user_id, "No two-factor token for user");
                    None
                }
            }
        });

        Self {
            use_web_search,
            output_schema: task.output_schema.clone(),
            two_factor_token,
        }
    }
}

/// Run parameters handed to the agent factory.
#[derive(Debug, Clone)]
pub struct AgentRunSpec {
    /// Task id, for tracing and service-side correlation.
    pub task_id: String,
    /// The instruction to execute (auth text already injected).
    pub instruction: String,
    /// Model identifier for the agent's underlying LLM.
    pub model: String,
    /// Attach screenshots to model calls.
    pub use_vision: bool,
    /// Maximum actions per step.
    pub max_actions_per_step: usize,
    /// Enable thinking in the agent system prompt.
    pub use_thinking: bool,
    /// Tool/action registry options.
    pub tools: ToolRegistryOptions,
}

/// A runnable agent bound to one browser session.
#[async_trait]
pub trait WebAgent: Send {
    /// Drives the agent for at most `max_steps` steps and returns the
    /// recorded trajectory.
    async fn run(&mut self, max_steps: usize) -> Result<AgentRun, AgentError>;
}

/// Something that can build agents.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    /// Creates an agent bound to `session`. When `on_step` is supplied it
    /// is invoked after every completed step.
    async fn create(
        &self,
        session: Arc<dyn BrowserSession>,
        spec: AgentRunSpec,
        on_step: Option<StepCallback>,
    ) -> Result<Box<dyn WebAgent>, AgentError>;
}
