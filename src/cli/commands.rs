//! CLI command definitions and handlers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use crate::browser::{BrowserSource, CdpProvisioner, RemoteBrowserProvisioner};
use crate::judge;
use crate::llm::OpenAiCompatClient;
use crate::metrics::{init_metrics, MetricsCollector};
use crate::monitor::ShutdownController;
use crate::pipeline::{run_multiple_tasks, EvalConfig, PipelineContext};
use crate::server::{HttpTrackingClient, RunDetails, TrackingClient};
use crate::service::AgentServiceClient;
use crate::task::Task;
use crate::utils::git;

/// Browser-agent evaluation harness.
#[derive(Debug, Parser)]
#[command(name = "webeval", version, about)]
pub struct Cli {
    /// Log level filter (overridden by RUST_LOG).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run an evaluation batch against a benchmark task list.
    Run(RunArgs),
    /// Re-judge a previously saved task folder.
    Judge(JudgeArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Number of task pipelines to run in parallel.
    #[arg(long, default_value_t = 3)]
    pub parallel_runs: usize,

    /// Maximum agent steps per task.
    #[arg(long, default_value_t = 25)]
    pub max_steps: usize,

    /// Start index into the task list (inclusive).
    #[arg(long, default_value_t = 0)]
    pub start: usize,

    /// End index into the task list (exclusive).
    #[arg(long)]
    pub end: Option<usize>,

    /// Run browsers headless.
    #[arg(long)]
    pub headless: bool,

    /// Model for the agent's underlying LLM.
    #[arg(long, default_value = "gpt-4.1")]
    pub model: String,

    /// Model for the evaluation judge.
    #[arg(long, default_value = "gpt-4.1")]
    pub eval_model: String,

    /// Disable vision capabilities in the agent.
    #[arg(long)]
    pub no_vision: bool,

    /// Free-form message stored with the run.
    #[arg(long, default_value = "")]
    pub user_message: String,

    /// Evaluation group stored with the run.
    #[arg(long, default_value = "")]
    pub eval_group: String,

    /// Developer starting the run.
    #[arg(long)]
    pub developer_id: Option<String>,

    /// Substitute the default search action with a web-search capability.
    #[arg(long)]
    pub use_web_search: bool,

    /// Browser source: local, provisioned, or remote.
    #[arg(long, default_value = "local")]
    pub browser: String,

    /// Preconfigured CDP URL for --browser remote.
    #[arg(long, env = "WEBEVAL_CDP_URL")]
    pub remote_cdp_url: Option<String>,

    /// Maximum actions per agent step.
    #[arg(long, default_value_t = 10)]
    pub max_actions_per_step: usize,

    /// Name of the task list to fetch.
    #[arg(long, default_value = "OnlineMind2Web")]
    pub test_case: String,

    /// Existing run id to continue adding results to.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Append the final result to the action history handed to judges.
    #[arg(long)]
    pub include_result: bool,

    /// Disable highlighting of interactive elements.
    #[arg(long)]
    pub no_highlight_elements: bool,

    /// Use the legacy screenshot-based judge.
    #[arg(long)]
    pub use_mind2web_judge: bool,

    /// Disable thinking in the agent system prompt.
    #[arg(long)]
    pub no_thinking: bool,

    /// Workflow URL stored with results for CI traceability.
    #[arg(long)]
    pub github_workflow_url: Option<String>,

    /// JSON map of user ids to two-factor email access tokens.
    #[arg(long)]
    pub two_factor_tokens: Option<String>,

    /// Task description for single-task mode.
    #[arg(long)]
    pub task_text: Option<String>,

    /// Task website for single-task mode.
    #[arg(long)]
    pub task_website: Option<String>,

    /// Task id for single-task mode (generated when omitted).
    #[arg(long)]
    pub task_id: Option<String>,

    /// Grace period before a requested shutdown is forced, in seconds.
    #[arg(long, default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Base directory for task artifacts.
    #[arg(long, default_value = "saved_trajectories")]
    pub output_dir: PathBuf,

    /// Agent service base URL.
    #[arg(long, env = "WEBEVAL_AGENT_SERVICE_URL")]
    pub agent_service_url: Option<String>,
}

#[derive(Debug, Args)]
pub struct JudgeArgs {
    /// Task folder containing a result.json.
    pub task_folder: PathBuf,

    /// Model for the evaluation judge.
    #[arg(long, default_value = "gpt-4.1")]
    pub eval_model: String,

    /// Use the legacy screenshot-based judge.
    #[arg(long)]
    pub use_mind2web_judge: bool,

    /// Login-cookie marker; runs the cookie evaluator as authority.
    #[arg(long)]
    pub login_cookie: Option<String>,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Dispatches a parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_batch(args).await,
        Commands::Judge(args) => judge_folder(args).await,
    }
}

async fn run_batch(args: RunArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Failed to initialize metrics");
    }

    let tracker: Option<Arc<dyn TrackingClient>> = match HttpTrackingClient::from_env() {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!(error = %e, "Tracking backend not configured");
            None
        }
    };

    let single_task_mode = args.task_text.is_some();

    // Load tasks: single CLI-specified task, or the named server list.
    let tasks = if let Some(task_text) = &args.task_text {
        let task_id = args.task_id.clone().unwrap_or_else(|| {
            format!("single_task_{}", uuid::Uuid::new_v4().simple())
        });
        tracing::info!(task_id = %task_id, "Single task mode");

        let mut task = Task::new(task_id, task_text.clone())?;
        task.website = args.task_website.clone();
        vec![task]
    } else {
        let tracker = tracker
            .as_ref()
            .context("Tracking backend must be configured to fetch a task list")?;
        let raw_tasks = tracker
            .fetch_test_case(&args.test_case)
            .await
            .context("Failed to fetch tasks from the tracking backend")?;

        let mut tasks = Vec::with_capacity(raw_tasks.len());
        for value in raw_tasks {
            tasks.push(Task::from_value(value).context(
                "Task data must include non-empty task_id and confirmed_task fields",
            )?);
        }
        tracing::info!(count = tasks.len(), "Loaded tasks from the tracking backend");
        tasks
    };

    // Fetch the auth distribution once when any task needs credentials.
    let needs_auth = tasks.iter().any(Task::wants_auth);
    let auth_distribution = if needs_auth {
        match &tracker {
            Some(tracker) => match tracker.fetch_auth_distribution().await {
                Ok(distribution) => {
                    if distribution.is_none() {
                        tracing::warn!("No auth distribution available, auth tasks may fail");
                    }
                    distribution
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to fetch auth distribution");
                    None
                }
            },
            None => {
                tracing::warn!("Tasks require auth but no tracking backend is configured");
                None
            }
        }
    } else {
        None
    };

    // Register the run (multi-task mode) or derive a local id.
    let run_id = if single_task_mode {
        match &args.run_id {
            Some(run_id) => run_id.clone(),
            None => format!(
                "local_single_task_{}",
                chrono::Utc::now().timestamp()
            ),
        }
    } else {
        let tracker = tracker
            .as_ref()
            .context("Tracking backend must be configured to start a run")?;
        let git_info = git::git_info().await;
        let details = RunDetails {
            model: args.model.clone(),
            git_branch: git_info.branch,
            git_commit_hash: git_info.commit_hash,
            git_commit_timestamp: git_info.commit_timestamp,
            git_repo: git_info.repo,
            user_message: args.user_message.clone(),
            eval_group: args.eval_group.clone(),
            developer_id: args.developer_id.clone(),
            total_tasks: sliced_len(tasks.len(), args.start, args.end),
            test_case_name: args.test_case.clone(),
            additional_data: json!({
                "max_steps": args.max_steps,
                "parallel_runs": args.parallel_runs,
                "start_index": args.start,
                "end_index": args.end,
                "headless": args.headless,
                "use_vision": !args.no_vision,
                "llm_judge": args.eval_model,
                "use_web_search": args.use_web_search,
                "browser": args.browser,
                "max_actions_per_step": args.max_actions_per_step,
                "include_result": args.include_result,
            }),
        };

        tracker
            .start_run(&details, args.run_id.as_deref())
            .await
            .context("Failed to start run on the tracking backend")?
    };
    tracing::info!(run_id = %run_id, "Run id obtained");

    // Collaborators.
    let agent_service = Arc::new(match &args.agent_service_url {
        Some(url) => AgentServiceClient::new(url.clone()),
        None => AgentServiceClient::from_env(),
    });
    tracing::info!(agent_service = %agent_service.base_url(), "Using agent service");

    let judge_model = Arc::new(
        OpenAiCompatClient::from_env(&args.eval_model)
            .context("Judge model configuration missing")?,
    );

    let browser_source = BrowserSource::parse_lossy(&args.browser);
    let provisioner: Option<Arc<dyn CdpProvisioner>> = match browser_source {
        BrowserSource::Provisioned => match RemoteBrowserProvisioner::from_env() {
            Some(provisioner) => Some(Arc::new(provisioner)),
            None => {
                tracing::warn!(
                    "Provisioned browser requested but WEBEVAL_BROWSER_API_KEY is not set"
                );
                None
            }
        },
        _ => None,
    };

    let config = EvalConfig {
        agent_model: args.model.clone(),
        max_steps: args.max_steps,
        max_parallel: if single_task_mode { 1 } else { args.parallel_runs },
        start_index: if single_task_mode { 0 } else { args.start },
        end_index: if single_task_mode { Some(1) } else { args.end },
        headless: args.headless,
        use_vision: !args.no_vision,
        use_web_search: args.use_web_search,
        browser_source,
        remote_cdp_url: args.remote_cdp_url.clone(),
        highlight_elements: !args.no_highlight_elements,
        max_actions_per_step: args.max_actions_per_step,
        use_thinking: !args.no_thinking,
        include_result: args.include_result,
        use_mind2web_judge: args.use_mind2web_judge,
        base_path: args.output_dir.clone(),
        timeouts: Default::default(),
        two_factor_tokens: parse_two_factor_tokens(args.two_factor_tokens.as_deref()),
    };
    config.validate()?;

    let shutdown = ShutdownController::new(Duration::from_secs(args.shutdown_grace_secs));
    shutdown.install_interrupt_handler();

    let ctx = Arc::new(PipelineContext {
        run_id,
        config,
        browser_backend: agent_service.clone(),
        agent_factory: agent_service,
        judge_model,
        comprehensive_judge: None,
        tracker,
        provisioner,
        auth_distribution,
        workflow_url: args.github_workflow_url.clone(),
        metrics: MetricsCollector::new(),
    });

    let summary = run_multiple_tasks(ctx, tasks, shutdown.token()).await;

    println!(
        "Completed {} tasks: {} succeeded, {} failed ({:.1}%)",
        summary.results.len(),
        summary.successful,
        summary.failed,
        summary.success_rate()
    );
    for status in &summary.results {
        println!(
            "  {} {} {}",
            if status.success { "PASS" } else { "FAIL" },
            status.task_id,
            status.error.as_deref().unwrap_or("")
        );
    }

    if shutdown.is_requested() {
        bail!("Evaluation interrupted");
    }
    Ok(())
}

async fn judge_folder(args: JudgeArgs) -> anyhow::Result<()> {
    let model = OpenAiCompatClient::from_env(&args.eval_model)
        .context("Judge model configuration missing")?;

    let mut outcome = judge::judge_task_result(
        &model,
        &args.task_folder,
        judge::mind2web::DEFAULT_SCORE_THRESHOLD,
        args.use_mind2web_judge,
        None,
    )
    .await;

    if let Some(login_cookie) = &args.login_cookie {
        let cookie_outcome =
            judge::evaluate_with_login_cookie(login_cookie, &args.task_folder).await;
        judge::apply_cookie_overwrite(&mut outcome, cookie_outcome);
    }

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

/// Number of tasks in the `[start, end)` slice.
fn sliced_len(total: usize, start: usize, end: Option<usize>) -> usize {
    let start = start.min(total);
    let end = end.unwrap_or(total).clamp(start, total);
    end - start
}

/// Parses the two-factor token map; malformed input degrades to none.
fn parse_two_factor_tokens(raw: Option<&str>) -> Option<HashMap<String, String>> {
    let raw = raw?.trim();
    if raw.is_empty() || raw == "null" || raw == "{}" {
        return None;
    }

    match serde_json::from_str::<HashMap<String, String>>(raw) {
        Ok(tokens) if tokens.is_empty() => None,
        Ok(tokens) => {
            tracing::info!(users = tokens.len(), "Two-factor tokens loaded");
            Some(tokens)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse two-factor tokens");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sliced_len() {
        assert_eq!(sliced_len(100, 0, None), 100);
        assert_eq!(sliced_len(100, 10, Some(40)), 30);
        assert_eq!(sliced_len(100, 90, Some(200)), 10);
        assert_eq!(sliced_len(5, 10, None), 0);
    }

    #[test]
    fn test_parse_two_factor_tokens() {
        assert!(parse_two_factor_tokens(None).is_none());
        assert!(parse_two_factor_tokens(Some("")).is_none());
        assert!(parse_two_factor_tokens(Some("{}")).is_none());
        assert!(parse_two_factor_tokens(Some("null")).is_none());
        assert!(parse_two_factor_tokens(Some("not json")).is_none());

        let tokens =
            parse_two_factor_tokens(Some("{\"carol\": \"tok-1\"}")).unwrap();
        assert_eq!(tokens.get("carol").map(String::as_str), Some("tok-1"));
    }

    #[test]
    fn test_cli_parses_run_command() {
        let cli = Cli::try_parse_from([
            "webeval",
            "run",
            "--parallel-runs",
            "5",
            "--max-steps",
            "30",
            "--headless",
            "--task-text",
            "Find the weather",
        ])
        .unwrap();

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.parallel_runs, 5);
                assert_eq!(args.max_steps, 30);
                assert!(args.headless);
                assert_eq!(args.task_text.as_deref(), Some("Find the weather"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_judge_command() {
        let cli = Cli::try_parse_from([
            "webeval",
            "judge",
            "saved_trajectories/t-1",
            "--login-cookie",
            "EXACTMATCH session",
        ])
        .unwrap();

        match cli.command {
            Commands::Judge(args) => {
                assert_eq!(args.task_folder, PathBuf::from("saved_trajectories/t-1"));
                assert_eq!(args.login_cookie.as_deref(), Some("EXACTMATCH session"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
