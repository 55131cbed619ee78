//! End-to-end pipeline tests with in-process mock collaborators.
//!
//! Exercises the coordinator and single-task pipeline against mock
//! browser, agent, judge-model, and tracking backends: admission-gate
//! bounds, failure isolation between sibling tasks, emergency saves on
//! abnormal exits, and login-cookie tracking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use webeval::agent::{
    ActionOutcome, AgentFactory, AgentHistory, AgentRun, AgentRunSpec, AgentStep, StepCallback,
    WebAgent,
};
use webeval::auth::AuthDistribution;
use webeval::browser::{BrowserBackend, BrowserSession, Cookie, LaunchSpec};
use webeval::error::{AgentError, BrowserError, LlmError, ServerError};
use webeval::llm::{ChatCompletion, ChatMessage, ChatModel};
use webeval::metrics::MetricsCollector;
use webeval::pipeline::{
    run_multiple_tasks, run_task_pipeline, EvalConfig, PipelineContext, StageTimeouts, TaskStatus,
};
use webeval::server::{ProgressUpdate, RunDetails, TrackingClient};
use webeval::task::Task;

// ---------------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------------

struct MockSession {
    id: String,
    cookies: Vec<Cookie>,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserSession for MockSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn get_cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
        Ok(self.cookies.clone())
    }

    async fn kill(&self) -> Result<(), BrowserError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockBackend {
    fail_launch: bool,
    cookies: Vec<Cookie>,
    kills: Arc<AtomicUsize>,
    launches: AtomicUsize,
}

#[async_trait]
impl BrowserBackend for MockBackend {
    async fn launch(&self, _spec: LaunchSpec) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        if self.fail_launch {
            return Err(BrowserError::LaunchFailed("no browsers available".to_string()));
        }
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            id: format!("session-{}", n),
            cookies: self.cookies.clone(),
            kills: Arc::clone(&self.kills),
        }))
    }
}

/// Agent behavior keyed off the task id prefix: `fail-*` errors, `hang-*`
/// sleeps past any test timeout, everything else succeeds.
#[derive(Default)]
struct MockAgentFactory {
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

struct MockAgent {
    task_id: String,
    on_step: Option<StepCallback>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentFactory for MockAgentFactory {
    async fn create(
        &self,
        _session: Arc<dyn BrowserSession>,
        spec: AgentRunSpec,
        on_step: Option<StepCallback>,
    ) -> Result<Box<dyn WebAgent>, AgentError> {
        Ok(Box::new(MockAgent {
            task_id: spec.task_id,
            on_step,
            running: Arc::clone(&self.running),
            max_running: Arc::clone(&self.max_running),
        }))
    }
}

#[async_trait]
impl WebAgent for MockAgent {
    async fn run(&mut self, _max_steps: usize) -> Result<AgentRun, AgentError> {
        if self.task_id.starts_with("fail") {
            return Err(AgentError::Service {
                code: 500,
                message: "agent exploded".to_string(),
            });
        }
        if self.task_id.starts_with("hang") {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;

        if let Some(callback) = &self.on_step {
            for step in 0..2 {
                callback(step).await;
            }
        }

        self.running.fetch_sub(1, Ordering::SeqCst);

        Ok(AgentRun {
            history: AgentHistory {
                steps: vec![
                    AgentStep {
                        results: vec![ActionOutcome {
                            extracted_content: Some("Clicked the search box".to_string()),
                            is_done: false,
                            success: None,
                            error: None,
                        }],
                        ..AgentStep::default()
                    },
                    AgentStep {
                        results: vec![ActionOutcome {
                            extracted_content: Some("Task finished".to_string()),
                            is_done: true,
                            success: Some(true),
                            error: None,
                        }],
                        ..AgentStep::default()
                    },
                ],
                usage: None,
            },
            last_message: "final input message".to_string(),
        })
    }
}

/// Judge model that extracts trivial key points and always votes success.
struct SuccessJudgeModel;

#[async_trait]
impl ChatModel for SuccessJudgeModel {
    async fn invoke(&self, _messages: &[ChatMessage]) -> Result<ChatCompletion, LlmError> {
        Ok(ChatCompletion {
            completion: "**Key Points**:\n1. A\n\nThoughts: looks complete\nStatus: \"success\""
                .to_string(),
            usage: None,
        })
    }

    fn model_name(&self) -> &str {
        "mock-judge"
    }
}

#[derive(Default)]
struct MockTracker {
    fail_saves: bool,
    saves: Mutex<Vec<String>>,
}

impl MockTracker {
    fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }
}

#[async_trait]
impl TrackingClient for MockTracker {
    async fn fetch_test_case(&self, _name: &str) -> Result<Vec<Value>, ServerError> {
        Ok(Vec::new())
    }

    async fn fetch_auth_distribution(&self) -> Result<Option<AuthDistribution>, ServerError> {
        Ok(None)
    }

    async fn start_run(
        &self,
        _details: &RunDetails,
        _existing_run_id: Option<&str>,
    ) -> Result<String, ServerError> {
        Ok("run-test".to_string())
    }

    async fn save_task_result(&self, payload: &Value) -> Result<(), ServerError> {
        let task_id = payload
            .get("taskId")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        self.saves.lock().unwrap().push(task_id);

        if self.fail_saves {
            return Err(ServerError::Status {
                code: 503,
                body: "backend unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn save_runner_progress(&self, _update: &ProgressUpdate) -> Result<(), ServerError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

struct Harness {
    ctx: Arc<PipelineContext>,
    tracker: Arc<MockTracker>,
    backend_kills: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

fn build_harness(
    max_parallel: usize,
    timeouts: StageTimeouts,
    fail_launch: bool,
    fail_saves: bool,
    cookies: Vec<Cookie>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();

    let kills = Arc::new(AtomicUsize::new(0));
    let backend = Arc::new(MockBackend {
        fail_launch,
        cookies,
        kills: Arc::clone(&kills),
        launches: AtomicUsize::new(0),
    });

    let factory = Arc::new(MockAgentFactory::default());
    let max_running = Arc::clone(&factory.max_running);

    let tracker = Arc::new(MockTracker {
        fail_saves,
        saves: Mutex::new(Vec::new()),
    });

    let config = EvalConfig {
        max_parallel,
        use_mind2web_judge: true,
        base_path: dir.path().to_path_buf(),
        timeouts,
        ..EvalConfig::default()
    };

    let ctx = Arc::new(PipelineContext {
        run_id: "run-test".to_string(),
        config,
        browser_backend: backend,
        agent_factory: factory,
        judge_model: Arc::new(SuccessJudgeModel),
        comprehensive_judge: None,
        tracker: Some(Arc::clone(&tracker) as Arc<dyn TrackingClient>),
        provisioner: None,
        auth_distribution: None,
        workflow_url: None,
        metrics: MetricsCollector::new(),
    });

    Harness {
        ctx,
        tracker,
        backend_kills: kills,
        max_running,
        _dir: dir,
    }
}

fn tasks(ids: &[&str]) -> Vec<Task> {
    ids.iter()
        .map(|id| Task::new(*id, format!("Do the thing for {}", id)).unwrap())
        .collect()
}

fn status_for<'a>(results: &'a [TaskStatus], task_id: &str) -> &'a TaskStatus {
    results
        .iter()
        .find(|s| s.task_id == task_id)
        .unwrap_or_else(|| panic!("no status for {}", task_id))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gate_bounds_concurrency_and_all_tasks_complete() {
    let harness = build_harness(2, StageTimeouts::default(), false, false, Vec::new());
    let ids: Vec<String> = (0..8).map(|i| format!("task-{}", i)).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

    let summary = run_multiple_tasks(
        Arc::clone(&harness.ctx),
        tasks(&id_refs),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(summary.results.len(), 8);
    assert_eq!(summary.successful, 8);
    assert_eq!(summary.failed, 0);

    // At no instant were more than K=2 agents in flight.
    assert!(harness.max_running.load(Ordering::SeqCst) <= 2);

    // Every pipeline cleaned up its session and saved its result.
    assert_eq!(harness.backend_kills.load(Ordering::SeqCst), 8);
    assert_eq!(harness.tracker.save_count(), 8);
}

#[tokio::test]
async fn failing_task_does_not_cancel_siblings() {
    let harness = build_harness(4, StageTimeouts::default(), false, false, Vec::new());

    let summary = run_multiple_tasks(
        Arc::clone(&harness.ctx),
        tasks(&["ok-1", "fail-2", "ok-3", "ok-4"]),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(summary.results.len(), 4);
    assert_eq!(summary.successful, 3);
    assert_eq!(summary.failed, 1);

    let failed = status_for(&summary.results, "fail-2");
    assert!(!failed.success);
    assert!(failed.error.as_deref().unwrap().contains("agent exploded"));

    // The failed task still reached the server save.
    assert!(failed
        .completed_stages
        .iter()
        .any(|s| s == "save_server"));
    assert_eq!(harness.tracker.save_count(), 4);
}

#[tokio::test]
async fn stage_timeout_triggers_single_emergency_save() {
    let timeouts = StageTimeouts {
        run_agent: Duration::from_millis(100),
        ..StageTimeouts::default()
    };
    // Saves fail too: the original timeout error must survive.
    let harness = build_harness(1, timeouts, false, true, Vec::new());

    let gate = Arc::new(Semaphore::new(1));
    let status = run_task_pipeline(
        Arc::clone(&harness.ctx),
        tasks(&["hang-1"]).remove(0),
        gate,
        CancellationToken::new(),
    )
    .await;

    assert!(!status.success);
    // The first recorded error is the timeout, not the failed save.
    assert_eq!(status.error.as_deref(), Some("Operation timed out"));
    assert!(status.completed_stages.iter().any(|s| s == "setup_browser"));
    assert!(!status.completed_stages.iter().any(|s| s == "run_agent"));

    // Exactly one emergency save attempt.
    assert_eq!(harness.tracker.save_count(), 1);

    // The browser was still cleaned up.
    assert_eq!(harness.backend_kills.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn browser_failure_still_reaches_server_save() {
    let harness = build_harness(1, StageTimeouts::default(), true, false, Vec::new());

    let gate = Arc::new(Semaphore::new(1));
    let status = run_task_pipeline(
        Arc::clone(&harness.ctx),
        tasks(&["task-nobrowser"]).remove(0),
        gate,
        CancellationToken::new(),
    )
    .await;

    assert!(!status.success);
    assert!(status
        .error
        .as_deref()
        .unwrap()
        .contains("no browsers available"));

    // The agent never ran, but the save stage did.
    assert!(!status.completed_stages.iter().any(|s| s == "setup_browser"));
    assert!(!status.completed_stages.iter().any(|s| s == "run_agent"));
    assert!(status.completed_stages.iter().any(|s| s == "save_server"));
    assert_eq!(harness.tracker.save_count(), 1);
    assert_eq!(harness.backend_kills.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_attempts_emergency_save() {
    let harness = build_harness(1, StageTimeouts::default(), false, false, Vec::new());

    let gate = Arc::new(Semaphore::new(1));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_task_pipeline(
        Arc::clone(&harness.ctx),
        tasks(&["hang-cancel"]).remove(0),
        gate,
        cancel.clone(),
    ));

    // Let the pipeline reach the hanging agent, then cancel.
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let status = handle.await.unwrap();
    assert!(!status.success);
    assert!(!status.completed_stages.iter().any(|s| s == "evaluate"));

    // Best-effort final save happened despite the cancellation.
    assert_eq!(harness.tracker.save_count(), 1);
    assert_eq!(harness.backend_kills.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn login_task_records_cookie_tracking_and_succeeds() {
    let cookies = vec![Cookie {
        name: "session_id".to_string(),
        value: "abc".to_string(),
        attributes: Default::default(),
    }];
    let harness = build_harness(1, StageTimeouts::default(), false, false, cookies);

    let task = Task::new("login-1", "Log in to the portal")
        .unwrap()
        .with_login_cookie("EXACTMATCH session_id");

    let gate = Arc::new(Semaphore::new(1));
    let status = run_task_pipeline(
        Arc::clone(&harness.ctx),
        task,
        gate,
        CancellationToken::new(),
    )
    .await;

    assert!(status.success, "login pipeline failed: {:?}", status.error);
    assert!(status.completed_stages.iter().any(|s| s == "evaluate"));

    // The per-step tracker flushed its record into the task folder.
    let tracking_path = harness
        .ctx
        .config
        .base_path
        .join("login-1")
        .join("login_cookie_tracking.json");
    let tracking: Value =
        serde_json::from_slice(&std::fs::read(&tracking_path).unwrap()).unwrap();
    assert_eq!(tracking["found"], Value::Bool(true));
    assert_eq!(tracking["cookie_name"], "session_id");
    assert_eq!(tracking["match_type"], "exact");
}

#[tokio::test]
async fn auth_distribution_text_reaches_agent_instruction() {
    // Verified at the unit level in the pipeline module; here we check the
    // full batch path doesn't break when a distribution is present.
    let harness = build_harness(1, StageTimeouts::default(), false, false, Vec::new());

    let mut ctx = PipelineContext {
        run_id: harness.ctx.run_id.clone(),
        config: harness.ctx.config.clone(),
        browser_backend: Arc::clone(&harness.ctx.browser_backend),
        agent_factory: Arc::clone(&harness.ctx.agent_factory),
        judge_model: Arc::clone(&harness.ctx.judge_model),
        comprehensive_judge: None,
        tracker: harness.ctx.tracker.clone(),
        provisioner: None,
        auth_distribution: Some(
            serde_json::from_value(serde_json::json!({
                "id": "dist-1",
                "loginInfo": {"portal": {"username": "alice"}}
            }))
            .unwrap(),
        ),
        workflow_url: None,
        metrics: MetricsCollector::new(),
    };
    ctx.config.use_mind2web_judge = true;

    let task = Task::new("auth-1", "Log in to the portal")
        .unwrap()
        .with_auth_keys(vec!["portal".to_string()]);

    let summary =
        run_multiple_tasks(Arc::new(ctx), vec![task], CancellationToken::new()).await;

    assert_eq!(summary.results.len(), 1);
    assert!(summary.results[0].success);
}
