//! Evaluation run configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::browser::BrowserSource;

/// Errors produced by configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_parallel must be at least 1")]
    NoParallelism,

    #[error("max_steps must be at least 1")]
    NoSteps,

    #[error("start_index ({start}) must not exceed end_index ({end})")]
    InvalidRange { start: usize, end: usize },
}

/// Per-stage timeout budget.
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    /// Browser setup. Default: 120s.
    pub setup_browser: Duration,
    /// Agent run. Default: 1000s.
    pub run_agent: Duration,
    /// Evaluation. Default: 300s.
    pub evaluate: Duration,
    /// Nominal server save. Default: 60s.
    pub save_server: Duration,
    /// Emergency save on abnormal exits. Default: 30s.
    pub emergency_save: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            setup_browser: Duration::from_secs(120),
            run_agent: Duration::from_secs(1000),
            evaluate: Duration::from_secs(300),
            save_server: Duration::from_secs(60),
            emergency_save: Duration::from_secs(30),
        }
    }
}

/// Configuration for one evaluation batch.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Model identifier for the agent's underlying LLM.
    pub agent_model: String,
    /// Maximum agent steps per task.
    pub max_steps: usize,
    /// Maximum simultaneously in-flight task pipelines.
    pub max_parallel: usize,
    /// First task index to run (inclusive).
    pub start_index: usize,
    /// Last task index (exclusive); `None` runs to the end.
    pub end_index: Option<usize>,
    /// Run browsers headless.
    pub headless: bool,
    /// Attach screenshots to agent model calls.
    pub use_vision: bool,
    /// Substitute the default search action with a web-search capability.
    pub use_web_search: bool,
    /// Where browser sessions come from.
    pub browser_source: BrowserSource,
    /// Preconfigured CDP URL for [`BrowserSource::Remote`].
    pub remote_cdp_url: Option<String>,
    /// Highlight interactive elements on pages.
    pub highlight_elements: bool,
    /// Maximum actions per agent step.
    pub max_actions_per_step: usize,
    /// Enable thinking in the agent system prompt.
    pub use_thinking: bool,
    /// Append the final result to the action history handed to judges.
    pub include_result: bool,
    /// Use the legacy screenshot-based judge instead of the comprehensive one.
    pub use_mind2web_judge: bool,
    /// Base directory for task-scoped artifacts.
    pub base_path: PathBuf,
    /// Stage timeout budget.
    pub timeouts: StageTimeouts,
    /// Two-factor email access tokens, keyed by user id.
    pub two_factor_tokens: Option<HashMap<String, String>>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            agent_model: "gpt-4.1".to_string(),
            max_steps: 25,
            max_parallel: 3,
            start_index: 0,
            end_index: None,
            headless: false,
            use_vision: true,
            use_web_search: false,
            browser_source: BrowserSource::Local,
            remote_cdp_url: None,
            highlight_elements: true,
            max_actions_per_step: 10,
            use_thinking: true,
            include_result: false,
            use_mind2web_judge: false,
            base_path: PathBuf::from("saved_trajectories"),
            timeouts: StageTimeouts::default(),
            two_factor_tokens: None,
        }
    }
}

impl EvalConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum agent steps per task.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Sets the parallelism bound.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    /// Sets the `[start, end)` task slice.
    pub fn with_range(mut self, start: usize, end: Option<usize>) -> Self {
        self.start_index = start;
        self.end_index = end;
        self
    }

    /// Sets the artifact base directory.
    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Sets the stage timeout budget.
    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::NoParallelism);
        }
        if self.max_steps == 0 {
            return Err(ConfigError::NoSteps);
        }
        if let Some(end) = self.end_index {
            if self.start_index > end {
                return Err(ConfigError::InvalidRange {
                    start: self.start_index,
                    end,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EvalConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_steps, 25);
        assert_eq!(config.max_parallel, 3);
        assert_eq!(config.timeouts.setup_browser, Duration::from_secs(120));
        assert_eq!(config.timeouts.run_agent, Duration::from_secs(1000));
        assert_eq!(config.timeouts.evaluate, Duration::from_secs(300));
        assert_eq!(config.timeouts.save_server, Duration::from_secs(60));
        assert_eq!(config.timeouts.emergency_save, Duration::from_secs(30));
    }

    #[test]
    fn test_validation_rejects_zero_parallelism() {
        let config = EvalConfig::default().with_max_parallel(0);
        assert!(matches!(config.validate(), Err(ConfigError::NoParallelism)));
    }

    #[test]
    fn test_validation_rejects_inverted_range() {
        let config = EvalConfig::default().with_range(10, Some(5));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRange { start: 10, end: 5 })
        ));
    }

    #[test]
    fn test_builder() {
        let config = EvalConfig::new()
            .with_max_steps(40)
            .with_max_parallel(8)
            .with_range(5, Some(50))
            .with_base_path("/tmp/runs");

        assert_eq!(config.max_steps, 40);
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.start_index, 5);
        assert_eq!(config.end_index, Some(50));
        assert_eq!(config.base_path, PathBuf::from("/tmp/runs"));
    }
}
