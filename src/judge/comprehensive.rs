//! Comprehensive judge contract.
//!
//! The comprehensive judge is an external collaborator: a richer,
//! category/score-based evaluator. This module pins down its input/output
//! contract; the rubric itself lives with the implementation.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JudgeError;
use crate::llm::ChatModel;

/// Task categories assigned by the comprehensive judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Search,
    Shopping,
    Booking,
    Login,
    FormFilling,
    Research,
    Navigation,
    Communication,
    Other,
}

impl TaskCategory {
    /// Plain string form, as stored by the tracking backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Shopping => "shopping",
            Self::Booking => "booking",
            Self::Login => "login",
            Self::FormFilling => "form_filling",
            Self::Research => "research",
            Self::Navigation => "navigation",
            Self::Communication => "communication",
            Self::Other => "other",
        }
    }
}

/// Error categories assigned by the comprehensive judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NavigationError,
    ElementInteraction,
    Hallucination,
    IncompleteExecution,
    WrongTarget,
    StepExhaustion,
    AuthenticationFailure,
    Other,
}

impl ErrorCategory {
    /// Plain string form, as stored by the tracking backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NavigationError => "navigation_error",
            Self::ElementInteraction => "element_interaction",
            Self::Hallucination => "hallucination",
            Self::IncompleteExecution => "incomplete_execution",
            Self::WrongTarget => "wrong_target",
            Self::StepExhaustion => "step_exhaustion",
            Self::AuthenticationFailure => "authentication_failure",
            Self::Other => "other",
        }
    }
}

/// Verdict returned by the comprehensive judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComprehensiveVerdict {
    /// One-line summary of what the task asked for.
    #[serde(default)]
    pub task_summary: Option<String>,
    /// Full reasoning behind the verdict.
    #[serde(default)]
    pub reasoning: String,
    /// Whether the task passed.
    pub passed: bool,
    /// Final score on a 0-100 scale.
    pub final_score: i64,
    /// Categories the task belongs to.
    #[serde(default)]
    pub task_categories: Vec<TaskCategory>,
    /// Error categories observed in the trajectory.
    #[serde(default)]
    pub error_categories: Vec<ErrorCategory>,
    /// Suggested improvements to the agent.
    #[serde(default)]
    pub improvement_tips: Vec<String>,
    /// Issues severe enough to fail the task on their own.
    #[serde(default)]
    pub critical_issues: Vec<String>,
    /// Per-dimension sub-scores.
    #[serde(default)]
    pub scores: Option<Value>,
}

/// Capability trait for the comprehensive judge.
#[async_trait]
pub trait ComprehensiveJudge: Send + Sync {
    /// Evaluates the trajectory persisted in `task_dir`.
    ///
    /// At most `max_images` screenshots may be sent to the model.
    async fn evaluate(
        &self,
        task_dir: &Path,
        model: &dyn ChatModel,
        max_images: usize,
    ) -> Result<ComprehensiveVerdict, JudgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_categories_serialize_as_plain_strings() {
        let verdict = ComprehensiveVerdict {
            task_summary: None,
            reasoning: "looks right".to_string(),
            passed: true,
            final_score: 92,
            task_categories: vec![TaskCategory::Shopping, TaskCategory::FormFilling],
            error_categories: vec![ErrorCategory::ElementInteraction],
            improvement_tips: vec![],
            critical_issues: vec![],
            scores: None,
        };

        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["task_categories"], json!(["shopping", "form_filling"]));
        assert_eq!(json["error_categories"], json!(["element_interaction"]));
    }

    #[test]
    fn test_verdict_deserialize_with_defaults() {
        let verdict: ComprehensiveVerdict = serde_json::from_value(json!({
            "passed": false,
            "final_score": 15
        }))
        .unwrap();

        assert!(!verdict.passed);
        assert_eq!(verdict.final_score, 15);
        assert!(verdict.task_categories.is_empty());
        assert!(verdict.reasoning.is_empty());
    }

    #[test]
    fn test_category_as_str() {
        assert_eq!(TaskCategory::FormFilling.as_str(), "form_filling");
        assert_eq!(ErrorCategory::StepExhaustion.as_str(), "step_exhaustion");
    }
}
