//! Benchmark task definitions.
//!
//! A [`Task`] is one evaluation unit: a natural-language instruction plus
//! optional benchmark attributes (target website, difficulty, login-cookie
//! marker, credential keys, ...). Tasks are constructed once per run, from
//! a server-fetched list or a single CLI definition, and are immutable
//! afterwards; the only derived form is the value copy produced by
//! [`Task::with_injected_auth_text`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;

/// Prefix on a login-cookie marker selecting exact cookie-name matching.
pub const EXACT_MATCH_PREFIX: &str = "EXACTMATCH ";

/// A single benchmark task.
///
/// Unknown fields from the task source are preserved in [`Task::extra`]
/// rather than being promoted to attributes; consumers that need them read
/// the map directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawTask")]
pub struct Task {
    /// Unique identifier for the task. Never empty.
    pub task_id: String,
    /// The natural-language instruction given to the agent. Never empty.
    pub confirmed_task: String,
    /// Target website, if the benchmark pins one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// Length of the reference trajectory, in steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_length: Option<u64>,
    /// Difficulty level as supplied by the task source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<Value>,
    /// Cluster identifier for grouped reporting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<Value>,
    /// Login-success marker: a cookie name/value fragment, or an exact
    /// cookie name when prefixed with `EXACTMATCH `.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_cookie: Option<String>,
    /// Matching mode hint supplied by the task source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_type: Option<String>,
    /// Task category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// JSON-schema descriptor for structured agent output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Credential keys to resolve against the auth distribution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_keys: Option<Vec<String>>,
    /// All additional key/value attributes from the task source.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// Creates a new task with the required fields.
    ///
    /// # Errors
    ///
    /// Returns `TaskError` if `task_id` or `confirmed_task` is empty.
    pub fn new(
        task_id: impl Into<String>,
        confirmed_task: impl Into<String>,
    ) -> Result<Self, TaskError> {
        let task_id = task_id.into();
        let confirmed_task = confirmed_task.into();

        if task_id.trim().is_empty() {
            return Err(TaskError::MissingTaskId);
        }
        if confirmed_task.trim().is_empty() {
            return Err(TaskError::MissingInstruction);
        }

        Ok(Self {
            task_id,
            confirmed_task,
            website: None,
            reference_length: None,
            level: None,
            cluster_id: None,
            login_cookie: None,
            login_type: None,
            category: None,
            output_schema: None,
            auth_keys: None,
            extra: Map::new(),
        })
    }

    /// Builds a task from a JSON object as fetched from the task source.
    pub fn from_value(value: Value) -> Result<Self, TaskError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Sets the target website.
    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }

    /// Sets the login-cookie marker.
    pub fn with_login_cookie(mut self, login_cookie: impl Into<String>) -> Self {
        self.login_cookie = Some(login_cookie.into());
        self
    }

    /// Sets the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Sets the credential keys to inject.
    pub fn with_auth_keys(mut self, auth_keys: Vec<String>) -> Self {
        self.auth_keys = Some(auth_keys);
        self
    }

    /// Whether this task is verified via a login cookie.
    pub fn is_login_task(&self) -> bool {
        self.login_cookie
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }

    /// Whether this task requests credential injection.
    pub fn wants_auth(&self) -> bool {
        self.auth_keys.as_ref().is_some_and(|keys| !keys.is_empty())
    }

    /// Returns a value copy with `auth_text` appended to the instruction.
    ///
    /// The receiver is left untouched; the copy is what gets handed to the
    /// agent, so credential text never leaks back into the task list.
    pub fn with_injected_auth_text(&self, auth_text: &str) -> Task {
        let mut injected = self.clone();
        injected.confirmed_task = format!("{}{}", self.confirmed_task, auth_text);
        injected
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Task(task_id={}, confirmed_task={}, website={:?}, level={:?}, category={:?})",
            self.task_id, self.confirmed_task, self.website, self.level, self.category
        )
    }
}

/// Wire form of a task, before required-field validation.
#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    confirmed_task: String,
    website: Option<String>,
    reference_length: Option<u64>,
    level: Option<Value>,
    cluster_id: Option<Value>,
    login_cookie: Option<String>,
    login_type: Option<String>,
    category: Option<String>,
    output_schema: Option<Value>,
    auth_keys: Option<Vec<String>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TryFrom<RawTask> for Task {
    type Error = TaskError;

    fn try_from(raw: RawTask) -> Result<Self, Self::Error> {
        let mut task = Task::new(raw.task_id, raw.confirmed_task)?;
        task.website = raw.website;
        task.reference_length = raw.reference_length;
        task.level = raw.level;
        task.cluster_id = raw.cluster_id;
        task.login_cookie = raw.login_cookie;
        task.login_type = raw.login_type;
        task.category = raw.category;
        task.output_schema = raw.output_schema;
        task.auth_keys = raw.auth_keys;
        task.extra = raw.extra;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_new() {
        let task = Task::new("t-1", "Find the cheapest flight").unwrap();
        assert_eq!(task.task_id, "t-1");
        assert_eq!(task.confirmed_task, "Find the cheapest flight");
        assert!(task.website.is_none());
        assert!(!task.is_login_task());
        assert!(!task.wants_auth());
    }

    #[test]
    fn test_task_requires_task_id() {
        let err = Task::new("", "do something").unwrap_err();
        assert!(matches!(err, TaskError::MissingTaskId));

        let err = Task::new("   ", "do something").unwrap_err();
        assert!(matches!(err, TaskError::MissingTaskId));
    }

    #[test]
    fn test_task_requires_instruction() {
        let err = Task::new("t-1", "").unwrap_err();
        assert!(matches!(err, TaskError::MissingInstruction));
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new("t-2", "Log in to the site")
            .unwrap()
            .with_website("https://example.com")
            .with_login_cookie("session")
            .with_category("login")
            .with_auth_keys(vec!["example".to_string()]);

        assert_eq!(task.website.as_deref(), Some("https://example.com"));
        assert!(task.is_login_task());
        assert!(task.wants_auth());
        assert_eq!(task.category.as_deref(), Some("login"));
    }

    #[test]
    fn test_task_from_value_preserves_extra_fields() {
        let task = Task::from_value(json!({
            "task_id": "t-3",
            "confirmed_task": "Book a table",
            "website": "https://resy.example",
            "attemptNumber": 2,
            "sourceBatch": "night-run"
        }))
        .unwrap();

        assert_eq!(task.extra.get("attemptNumber"), Some(&json!(2)));
        assert_eq!(task.extra.get("sourceBatch"), Some(&json!("night-run")));
    }

    #[test]
    fn test_task_from_value_rejects_missing_fields() {
        assert!(Task::from_value(json!({"confirmed_task": "x"})).is_err());
        assert!(Task::from_value(json!({"task_id": "x"})).is_err());
        assert!(Task::from_value(json!({"task_id": "x", "confirmed_task": ""})).is_err());
    }

    #[test]
    fn test_with_injected_auth_text_is_a_value_copy() {
        let task = Task::new("t-4", "Log in to the dashboard").unwrap();
        let injected = task.with_injected_auth_text("\n\nUse credentials a/b.");

        assert_eq!(task.confirmed_task, "Log in to the dashboard");
        assert_eq!(
            injected.confirmed_task,
            "Log in to the dashboard\n\nUse credentials a/b."
        );
        assert_eq!(injected.task_id, task.task_id);
    }

    #[test]
    fn test_task_serde_round_trip() {
        let task = Task::from_value(json!({
            "task_id": "t-5",
            "confirmed_task": "Search for shoes",
            "level": "medium",
            "custom": {"nested": true}
        }))
        .unwrap();

        let json = serde_json::to_string(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.task_id, "t-5");
        assert_eq!(parsed.level, Some(json!("medium")));
        assert_eq!(parsed.extra.get("custom"), Some(&json!({"nested": true})));
    }
}
