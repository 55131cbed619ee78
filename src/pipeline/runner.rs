//! Single-task execution pipeline.
//!
//! Runs one task through the five-stage state machine under the batch's
//! admission gate. Stage failures are isolated: a failed stage records its
//! error and later stages are skipped via precondition checks, but the
//! server save is always attempted. Timeouts, cancellation, and fatal
//! errors each get their own best-effort emergency save, and a created
//! browser session is always cleaned up. The pipeline never returns an
//! error; [`TaskStatus`] is the guaranteed floor.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::config::EvalConfig;
use super::result::{TaskResult, TaskStatus};
use super::{run_stage, Stage, StageError, StageRunError};
use crate::agent::{AgentFactory, AgentRun, AgentRunSpec, StepCallback, ToolRegistryOptions};
use crate::auth::AuthDistribution;
use crate::browser::{
    self, BrowserBackend, BrowserSession, CdpProvisioner, SessionOptions,
};
use crate::judge::{self, ComprehensiveJudge, CookieMatcher, LoginCookieTracker};
use crate::llm::ChatModel;
use crate::metrics::MetricsCollector;
use crate::server::{send_progress_update, TrackingClient};
use crate::task::Task;
use crate::trajectory::{self, FormatContext};

/// Collaborators and configuration shared by every pipeline in a batch.
pub struct PipelineContext {
    pub run_id: String,
    pub config: EvalConfig,
    pub browser_backend: Arc<dyn BrowserBackend>,
    pub agent_factory: Arc<dyn AgentFactory>,
    pub judge_model: Arc<dyn ChatModel>,
    pub comprehensive_judge: Option<Arc<dyn ComprehensiveJudge>>,
    pub tracker: Option<Arc<dyn TrackingClient>>,
    pub provisioner: Option<Arc<dyn CdpProvisioner>>,
    pub auth_distribution: Option<AuthDistribution>,
    pub workflow_url: Option<String>,
    pub metrics: MetricsCollector,
}

/// Abnormal exit of the stage sequence.
enum PipelineAbort {
    /// A stage exceeded its timeout.
    Timeout,
    /// A failure escaped the stage boundaries.
    Fatal(String),
}

type SharedResult = Arc<Mutex<TaskResult>>;
type SessionSlot = Arc<Mutex<Option<Arc<dyn BrowserSession>>>>;

/// Locks a mutex, recovering the value from a poisoned lock.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs one task's pipeline to completion under the admission gate.
///
/// The gate permit is held for the entire duration, cleanup included, so
/// gate slots model full end-to-end task lifetime.
pub async fn run_task_pipeline(
    ctx: Arc<PipelineContext>,
    task: Task,
    gate: Arc<Semaphore>,
    cancel: CancellationToken,
) -> TaskStatus {
    let task_start = Instant::now();
    tracing::info!(task_id = %task.task_id, "Task pipeline waiting for admission");

    let permit = match gate.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return TaskStatus {
                task_id: task.task_id.clone(),
                success: false,
                error: Some("Admission gate closed before task could start".to_string()),
                completed_stages: Vec::new(),
            }
        }
    };

    let gate_acquired = Instant::now();
    tracing::info!(
        task_id = %task.task_id,
        wait_secs = format!("{:.2}", (gate_acquired - task_start).as_secs_f64()),
        "Admission acquired, starting execution pipeline"
    );

    ctx.metrics.pipeline_started();
    let status = run_within_gate(&ctx, &task, &cancel).await;
    ctx.metrics.pipeline_finished();
    ctx.metrics.record_task(
        if status.success { "success" } else { "failure" },
        task_start.elapsed().as_secs_f64(),
    );

    tracing::info!(
        task_id = %task.task_id,
        success = status.success,
        error = ?status.error,
        total_secs = format!("{:.2}", task_start.elapsed().as_secs_f64()),
        gate_held_secs = format!("{:.2}", gate_acquired.elapsed().as_secs_f64()),
        "Task pipeline finished"
    );

    drop(permit);
    status
}

async fn run_within_gate(
    ctx: &PipelineContext,
    task: &Task,
    cancel: &CancellationToken,
) -> TaskStatus {
    let task_dir = ctx.config.base_path.join(&task.task_id);

    // Catastrophic initialization failure: fall back to a minimal result
    // so something still reaches the server.
    if let Err(e) = fs::create_dir_all(&ctx.config.base_path).await {
        tracing::error!(task_id = %task.task_id, error = %e, "Catastrophic initialization error");
        let mut fallback = TaskResult::new(
            task,
            &ctx.run_id,
            ctx.config.max_steps,
            ctx.workflow_url.clone(),
        );
        fallback.mark_critical_error(format!("Initialization failed: {}", e));
        let fallback = Arc::new(Mutex::new(fallback));
        emergency_save(ctx, &fallback, "initialization error").await;
        return lock(&fallback).local_status();
    }

    let result: SharedResult = Arc::new(Mutex::new(TaskResult::new(
        task,
        &ctx.run_id,
        ctx.config.max_steps,
        ctx.workflow_url.clone(),
    )));
    let session_slot: SessionSlot = Arc::new(Mutex::new(None));
    let agent_secs: Arc<Mutex<Option<f64>>> = Arc::new(Mutex::new(None));

    send_progress_update(
        ctx.tracker.as_deref(),
        &ctx.run_id,
        &task.task_id,
        "starting",
        "active",
        ctx.workflow_url.as_deref(),
        None,
    )
    .await;

    let outcome = tokio::select! {
        res = execute_stages(ctx, task, &task_dir, &result, &session_slot, &agent_secs) => Some(res),
        _ = cancel.cancelled() => None,
    };

    match outcome {
        Some(Ok(())) => {}
        Some(Err(PipelineAbort::Timeout)) => {
            let stage = Stage::current(&lock(&result).completed_stages);
            lock(&result).stage_failed(StageError::timeout(stage));
            tracing::error!(task_id = %task.task_id, stage = %stage, "Stage timed out");
            emergency_save(ctx, &result, "timeout").await;
        }
        Some(Err(PipelineAbort::Fatal(message))) => {
            lock(&result).mark_critical_error(&message);
            tracing::error!(task_id = %task.task_id, error = %message, "Critical pipeline error");
            emergency_save(ctx, &result, "critical error").await;
        }
        None => {
            lock(&result).mark_cancelled();
            tracing::warn!(task_id = %task.task_id, "Task was cancelled");
            emergency_save(ctx, &result, "cancellation").await;
        }
    }

    // Cleanup runs on every path; failures are logged, never propagated.
    let session = lock(&session_slot).take();
    match session {
        Some(session) => {
            tracing::info!(task_id = %task.task_id, "Starting browser cleanup");
            browser::cleanup_session_safe(session.as_ref()).await;
        }
        None => {
            tracing::debug!(task_id = %task.task_id, "No browser to clean up");
        }
    }

    match *lock(&agent_secs) {
        Some(secs) => {
            tracing::info!(
                task_id = %task.task_id,
                agent_secs = format!("{:.2}", secs),
                "Agent execution time recorded"
            );
        }
        None => {
            tracing::info!(task_id = %task.task_id, "Pipeline completed without an agent run");
        }
    }

    let status = lock(&result).local_status();
    status
}

/// The five-stage sequence. Per-stage failures are recorded and the
/// sequence continues; timeouts abort with [`PipelineAbort::Timeout`].
async fn execute_stages(
    ctx: &PipelineContext,
    task: &Task,
    task_dir: &Path,
    result: &SharedResult,
    session_slot: &SessionSlot,
    agent_secs: &Mutex<Option<f64>>,
) -> Result<(), PipelineAbort> {
    let cfg = &ctx.config;
    let tracker = ctx.tracker.as_deref();

    // The task directory backs every stage; failing to create it is fatal
    // for the whole pipeline, not for one stage.
    if let Err(e) = fs::create_dir_all(task_dir).await {
        return Err(PipelineAbort::Fatal(format!(
            "Failed to create task directory '{}': {}",
            task_dir.display(),
            e
        )));
    }

    // Stage 1: browser setup. Failure skips the agent but not the save.
    tracing::info!(task_id = %task.task_id, "Browser setup starting");
    send_progress_update(
        tracker,
        &ctx.run_id,
        &task.task_id,
        "setup_browser",
        "active",
        ctx.workflow_url.as_deref(),
        None,
    )
    .await;

    let session_options = SessionOptions {
        source: cfg.browser_source,
        headless: cfg.headless,
        highlight_elements: cfg.highlight_elements,
        remote_cdp_url: cfg.remote_cdp_url.clone(),
    };

    let setup = run_stage(
        async {
            browser::setup_session(
                task,
                &session_options,
                ctx.browser_backend.as_ref(),
                ctx.provisioner.as_deref(),
                task_dir,
            )
            .await
            .map_err(anyhow::Error::from)
        },
        Some(cfg.timeouts.setup_browser),
    )
    .await;

    match setup {
        Ok(session) => {
            *lock(session_slot) = Some(session);
            lock(result).stage_completed(Stage::SetupBrowser);
            tracing::info!(task_id = %task.task_id, "Browser session started");
            send_progress_update(
                tracker,
                &ctx.run_id,
                &task.task_id,
                "browser_ready",
                "active",
                ctx.workflow_url.as_deref(),
                None,
            )
            .await;
        }
        Err(StageRunError::Timeout) => return Err(PipelineAbort::Timeout),
        Err(StageRunError::Failed(e)) => {
            lock(result).stage_failed(StageError::exception(Stage::SetupBrowser, e.to_string()));
            tracing::error!(task_id = %task.task_id, error = %e, "Browser setup failed");
            send_progress_update(
                tracker,
                &ctx.run_id,
                &task.task_id,
                "setup_browser",
                "failed",
                ctx.workflow_url.as_deref(),
                Some(&e.to_string()),
            )
            .await;
        }
    }

    // Stage 2: agent run, only with a live session.
    let session = lock(session_slot).clone();
    let mut agent_run: Option<AgentRun> = None;

    if let Some(session) = session {
        tracing::info!(task_id = %task.task_id, "Agent run starting");
        send_progress_update(
            tracker,
            &ctx.run_id,
            &task.task_id,
            "run_agent",
            "active",
            ctx.workflow_url.as_deref(),
            None,
        )
        .await;

        let task_for_agent = inject_auth_text(task, ctx.auth_distribution.as_ref());

        let cookie_tracker = task
            .is_login_task()
            .then(|| Arc::new(LoginCookieTracker::new()));
        let on_step = make_cookie_callback(task, &session, cookie_tracker.as_ref());

        let spec = AgentRunSpec {
            task_id: task.task_id.clone(),
            instruction: task_for_agent.confirmed_task.clone(),
            model: cfg.agent_model.clone(),
            use_vision: cfg.use_vision,
            max_actions_per_step: cfg.max_actions_per_step,
            use_thinking: cfg.use_thinking,
            tools: ToolRegistryOptions::for_task(
                &task_for_agent,
                cfg.use_web_search,
                cfg.two_factor_tokens.as_ref(),
            ),
        };

        let agent_start = Instant::now();
        let run_result = run_stage(
            async {
                let mut agent = ctx
                    .agent_factory
                    .create(Arc::clone(&session), spec, on_step)
                    .await?;
                agent.run(cfg.max_steps).await.map_err(anyhow::Error::from)
            },
            Some(cfg.timeouts.run_agent),
        )
        .await;

        match run_result {
            Ok(run) => {
                let elapsed = agent_start.elapsed().as_secs_f64();
                *lock(agent_secs) = Some(elapsed);
                lock(result).stage_completed(Stage::RunAgent);
                tracing::info!(
                    task_id = %task.task_id,
                    agent_secs = format!("{:.2}", elapsed),
                    "Agent run completed"
                );

                if let Some(tracker) = &cookie_tracker {
                    if let Err(e) = tracker.save(task_dir, &task.task_id).await {
                        tracing::warn!(task_id = %task.task_id, error = %e, "Failed to save login cookie tracking");
                    }
                }

                send_progress_update(
                    tracker,
                    &ctx.run_id,
                    &task.task_id,
                    "agent_completed",
                    "active",
                    ctx.workflow_url.as_deref(),
                    None,
                )
                .await;
                agent_run = Some(run);
            }
            Err(StageRunError::Timeout) => return Err(PipelineAbort::Timeout),
            Err(StageRunError::Failed(e)) => {
                lock(result).stage_failed(StageError::exception(Stage::RunAgent, e.to_string()));
                tracing::error!(task_id = %task.task_id, error = %e, "Agent run failed");
                send_progress_update(
                    tracker,
                    &ctx.run_id,
                    &task.task_id,
                    "run_agent",
                    "failed",
                    ctx.workflow_url.as_deref(),
                    Some(&e.to_string()),
                )
                .await;
            }
        }
    }

    // Stage 3: format history, only if the agent produced a trajectory.
    if let Some(run) = &agent_run {
        tracing::info!(task_id = %task.task_id, "History formatting starting");

        let format_ctx = FormatContext {
            task_id: task.task_id.clone(),
            run_id: ctx.run_id.clone(),
            task: task.confirmed_task.clone(),
            last_message: run.last_message.clone(),
            base_path: cfg.base_path.clone(),
            include_result: cfg.include_result,
            agent_execution_time: *lock(agent_secs),
        };

        let formatted = run_stage(
            async {
                let formatted = trajectory::format_history(&run.history, &format_ctx).await?;
                serde_json::to_value(&formatted).map_err(anyhow::Error::from)
            },
            None,
        )
        .await;

        match formatted {
            Ok(value) => {
                lock(result).stage_completed_with_data(Stage::FormatHistory, value);
                tracing::info!(task_id = %task.task_id, "Agent history formatted");
            }
            Err(StageRunError::Timeout) => return Err(PipelineAbort::Timeout),
            Err(StageRunError::Failed(e)) => {
                lock(result)
                    .stage_failed(StageError::exception(Stage::FormatHistory, e.to_string()));
                tracing::error!(task_id = %task.task_id, error = %e, "History formatting failed");
            }
        }
    }

    // Stage 4: evaluate whenever some execution data exists.
    let should_evaluate = {
        let r = lock(result);
        r.has_execution_data() && !r.completed_stages.contains(&Stage::Evaluate)
    };

    if should_evaluate {
        tracing::info!(task_id = %task.task_id, "Evaluation starting");

        let evaluated = run_stage(
            async {
                let outcome = judge::evaluate_task_result(
                    ctx.judge_model.as_ref(),
                    task_dir,
                    Some(task),
                    cfg.use_mind2web_judge,
                    ctx.comprehensive_judge.as_deref(),
                )
                .await;
                let score = outcome.score;
                serde_json::to_value(&outcome)
                    .map(|value| (score, value))
                    .map_err(anyhow::Error::from)
            },
            Some(cfg.timeouts.evaluate),
        )
        .await;

        match evaluated {
            Ok((score, value)) => {
                ctx.metrics.record_eval_score(score);
                lock(result).stage_completed_with_data(Stage::Evaluate, value);
                tracing::info!(task_id = %task.task_id, score = score, "Evaluation completed");
            }
            Err(StageRunError::Timeout) => return Err(PipelineAbort::Timeout),
            Err(StageRunError::Failed(e)) => {
                lock(result).stage_failed(StageError::exception(Stage::Evaluate, e.to_string()));
                tracing::error!(task_id = %task.task_id, error = %e, "Evaluation failed");
            }
        }
    }

    // Stage 5: save to server. Always attempted; failure is recorded but
    // never re-raised.
    match &ctx.tracker {
        Some(tracker_client) => {
            tracing::info!(task_id = %task.task_id, "Saving result to server");
            let payload = lock(result).server_payload();

            let saved = run_stage(
                async {
                    tracker_client
                        .save_task_result(&payload)
                        .await
                        .map_err(anyhow::Error::from)
                },
                Some(cfg.timeouts.save_server),
            )
            .await;

            match saved {
                Ok(()) => {
                    lock(result).stage_completed(Stage::SaveServer);
                    ctx.metrics.record_server_save("success");
                    tracing::info!(task_id = %task.task_id, "Result saved to server");
                }
                Err(StageRunError::Timeout) => return Err(PipelineAbort::Timeout),
                Err(StageRunError::Failed(e)) => {
                    let mut r = lock(result);
                    r.stage_failed(StageError::exception(Stage::SaveServer, e.to_string()));
                    r.mark_server_save_failed(e.to_string());
                    drop(r);
                    ctx.metrics.record_server_save("failure");
                    tracing::error!(task_id = %task.task_id, error = %e, "Server save failed");
                }
            }
        }
        None => {
            // Single-task mode without a backend: skip but mark complete.
            tracing::info!(task_id = %task.task_id, "Skipping server save (no tracking backend)");
            lock(result).stage_completed(Stage::SaveServer);
        }
    }

    Ok(())
}

/// Appends formatted credential text to the instruction when the task
/// requests it and a distribution is available.
fn inject_auth_text(task: &Task, distribution: Option<&AuthDistribution>) -> Task {
    if !task.wants_auth() {
        return task.clone();
    }

    let Some(keys) = task.auth_keys.as_ref() else {
        return task.clone();
    };

    match distribution {
        Some(distribution) => match distribution.format_for_agent(keys) {
            Some(text) => {
                tracing::info!(task_id = %task.task_id, "Auth info added to task description");
                task.with_injected_auth_text(&text)
            }
            None => {
                tracing::warn!(
                    task_id = %task.task_id,
                    auth_keys = ?keys,
                    "No matching auth info found for requested keys"
                );
                task.clone()
            }
        },
        None => {
            tracing::warn!(
                task_id = %task.task_id,
                "Auth keys specified but no auth distribution available"
            );
            task.clone()
        }
    }
}

/// Builds the per-step login-cookie callback for login tasks.
fn make_cookie_callback(
    task: &Task,
    session: &Arc<dyn BrowserSession>,
    tracker: Option<&Arc<LoginCookieTracker>>,
) -> Option<StepCallback> {
    let tracker = tracker?;
    let marker = task.login_cookie.as_deref()?;

    tracing::info!(task_id = %task.task_id, "Login cookie monitoring enabled");

    let tracker = Arc::clone(tracker);
    let session = Arc::clone(session);
    let matcher = Arc::new(CookieMatcher::parse(marker));
    let task_id = task.task_id.clone();

    Some(Arc::new(move |step: usize| {
        let tracker = Arc::clone(&tracker);
        let session = Arc::clone(&session);
        let matcher = Arc::clone(&matcher);
        let task_id = task_id.clone();
        Box::pin(async move {
            tracker
                .check_at_step(session.as_ref(), &matcher, &task_id, step)
                .await;
        }) as BoxFuture<'static, ()>
    }))
}

/// One best-effort emergency save, with its own shorter timeout.
///
/// Independently wrapped so a failed save never masks the original stage
/// failure being reported.
async fn emergency_save(ctx: &PipelineContext, result: &SharedResult, reason: &str) {
    let Some(tracker) = &ctx.tracker else {
        return;
    };

    let task_id = lock(result).task_id.clone();
    tracing::info!(task_id = %task_id, reason = %reason, "Attempting server save after abnormal exit");

    let payload = lock(result).server_payload();
    let timeout = ctx.config.timeouts.emergency_save;

    match tokio::time::timeout(timeout, tracker.save_task_result(&payload)).await {
        Ok(Ok(())) => {
            lock(result).stage_completed(Stage::SaveServer);
            ctx.metrics.record_server_save("success");
        }
        Ok(Err(e)) => {
            lock(result).mark_server_save_failed(e.to_string());
            ctx.metrics.record_server_save("failure");
            tracing::error!(task_id = %task_id, reason = %reason, error = %e, "Emergency server save failed");
        }
        Err(_) => {
            lock(result).mark_server_save_failed(format!(
                "emergency save timed out after {}s",
                timeout.as_secs()
            ));
            ctx.metrics.record_server_save("failure");
            tracing::error!(task_id = %task_id, reason = %reason, "Emergency server save timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inject_auth_text_without_distribution() {
        let task = Task::new("t-1", "Log in")
            .unwrap()
            .with_auth_keys(vec!["site".to_string()]);

        let injected = inject_auth_text(&task, None);
        assert_eq!(injected.confirmed_task, "Log in");
    }

    #[test]
    fn test_inject_auth_text_with_matching_key() {
        let task = Task::new("t-1", "Log in")
            .unwrap()
            .with_auth_keys(vec!["site".to_string()]);
        let distribution: AuthDistribution = serde_json::from_value(json!({
            "id": "d-1",
            "loginInfo": {"site": {"username": "bob"}}
        }))
        .unwrap();

        let injected = inject_auth_text(&task, Some(&distribution));
        assert!(injected.confirmed_task.starts_with("Log in"));
        assert!(injected.confirmed_task.contains("username: bob"));
    }

    #[test]
    fn test_inject_auth_text_plain_task_untouched() {
        let task = Task::new("t-2", "Search the weather").unwrap();
        let injected = inject_auth_text(&task, None);
        assert_eq!(injected.confirmed_task, task.confirmed_task);
    }
}
