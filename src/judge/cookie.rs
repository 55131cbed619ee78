//! Deterministic cookie-based evaluation for login tasks.
//!
//! A login task names a cookie marker. During the agent run a per-pipeline
//! [`LoginCookieTracker`] inspects live browser cookies after every step and
//! records the first hit; the evaluator consults that record first and only
//! falls back to the browser's persisted end-of-run cookie state when no
//! step-level hit exists.

use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;

use super::EvaluationOutcome;
use crate::browser::{BrowserSession, Cookie};
use crate::task::EXACT_MATCH_PREFIX;

/// File recording the step-level cookie detection for a task.
pub const TRACKING_FILE: &str = "login_cookie_tracking.json";

/// How a login-cookie marker matches against browser cookies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieMatcher {
    /// Exact match on the cookie name.
    Exact(String),
    /// Substring match on the cookie name or value.
    Substring(String),
}

impl CookieMatcher {
    /// Parses a marker string; the `EXACTMATCH ` prefix selects exact mode.
    pub fn parse(marker: &str) -> Self {
        match marker.strip_prefix(EXACT_MATCH_PREFIX) {
            Some(name) => Self::Exact(name.to_string()),
            None => Self::Substring(marker.to_string()),
        }
    }

    /// The cookie fragment being searched for.
    pub fn target(&self) -> &str {
        match self {
            Self::Exact(s) | Self::Substring(s) => s,
        }
    }

    /// Match-type label for tracking records and judgements.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Exact(_) => "exact",
            Self::Substring(_) => "substring",
        }
    }

    /// Whether the cookie satisfies this matcher.
    pub fn matches(&self, cookie: &Cookie) -> bool {
        match self {
            Self::Exact(name) => cookie.name == *name,
            Self::Substring(fragment) => {
                cookie.name.contains(fragment) || cookie.value.contains(fragment)
            }
        }
    }

    /// Finds the first matching cookie in a set.
    pub fn find<'a>(&self, cookies: &'a [Cookie]) -> Option<&'a Cookie> {
        cookies.iter().find(|c| self.matches(c))
    }
}

/// Step-level record of the first cookie hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieHit {
    pub step: usize,
    pub cookie_name: String,
    pub match_type: String,
}

/// Tracks the first step at which the login cookie appears.
///
/// Owned by exactly one pipeline invocation; flushed to the task folder
/// once after the agent run and dropped with the pipeline.
#[derive(Debug, Default)]
pub struct LoginCookieTracker {
    hit: Mutex<Option<CookieHit>>,
}

impl LoginCookieTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a hit has been recorded.
    pub fn found(&self) -> bool {
        self.hit.lock().map(|h| h.is_some()).unwrap_or(false)
    }

    /// Checks live browser cookies at `step`, recording the first hit.
    ///
    /// Errors from the browser are logged and swallowed; a cookie check
    /// must never fail the agent run.
    pub async fn check_at_step(
        &self,
        session: &dyn BrowserSession,
        matcher: &CookieMatcher,
        task_id: &str,
        step: usize,
    ) -> bool {
        if self.found() {
            return true;
        }

        let cookies = match session.get_cookies().await {
            Ok(cookies) => cookies,
            Err(e) => {
                tracing::warn!(task_id = %task_id, step = step, error = %e, "Error checking login cookie");
                return false;
            }
        };

        if cookies.is_empty() {
            tracing::debug!(task_id = %task_id, step = step, "No cookies found");
            return false;
        }

        match matcher.find(&cookies) {
            Some(cookie) => {
                tracing::info!(
                    task_id = %task_id,
                    step = step,
                    cookie = %cookie.name,
                    match_type = matcher.mode(),
                    "Login cookie found"
                );
                if let Ok(mut hit) = self.hit.lock() {
                    hit.get_or_insert(CookieHit {
                        step,
                        cookie_name: cookie.name.clone(),
                        match_type: matcher.mode().to_string(),
                    });
                }
                true
            }
            None => {
                tracing::debug!(
                    task_id = %task_id,
                    step = step,
                    target = matcher.target(),
                    checked = cookies.len(),
                    "Login cookie not found"
                );
                false
            }
        }
    }

    /// Flushes the tracking record to the task folder and purges it.
    pub async fn save(&self, task_dir: &Path, task_id: &str) -> std::io::Result<()> {
        let hit = self.hit.lock().map(|mut h| h.take()).unwrap_or(None);

        let record = match &hit {
            Some(hit) => serde_json::json!({
                "found": true,
                "step": hit.step,
                "cookie_name": hit.cookie_name,
                "match_type": hit.match_type,
                "timestamp": chrono::Utc::now().timestamp(),
            }),
            None => serde_json::json!({
                "found": false,
                "timestamp": chrono::Utc::now().timestamp(),
            }),
        };

        fs::create_dir_all(task_dir).await?;
        fs::write(
            task_dir.join(TRACKING_FILE),
            serde_json::to_vec_pretty(&record).unwrap_or_default(),
        )
        .await?;

        tracing::info!(task_id = %task_id, found = hit.is_some(), "Saved login cookie tracking");
        Ok(())
    }
}

/// Evaluates a login task by cookie presence.
///
/// Step-tracking data wins when present; otherwise the persisted
/// end-of-run cookie state (`storage_state.json`, then `cookies.json`) is
/// inspected. No cookie data at all is a failure.
pub async fn evaluate_with_login_cookie(login_cookie: &str, task_dir: &Path) -> EvaluationOutcome {
    let task_id = task_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    // Step-by-step tracking first.
    if let Some(tracking) = load_json(&task_dir.join(TRACKING_FILE)).await {
        if tracking.get("found").and_then(Value::as_bool).unwrap_or(false) {
            let step = tracking
                .get("step")
                .and_then(Value::as_u64)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let match_type = tracking
                .get("match_type")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let cookie_name = tracking
                .get("cookie_name")
                .and_then(Value::as_str)
                .unwrap_or("unknown");

            return EvaluationOutcome {
                task_id,
                judgement: format!(
                    "Automatic judgement: Login cookie '{}' was found during step {} ({} match on '{}')",
                    login_cookie, step, match_type, cookie_name
                ),
                success: true,
                error: None,
                score: 1.0,
                comprehensive_evaluation: None,
                tracking_data: Some(tracking),
            };
        }
    }

    tracing::info!(task_id = %task_id, "No step-level cookie hit, checking end-state cookies");

    let cookies = load_end_state_cookies(task_dir).await;
    let Some(cookies) = cookies else {
        return EvaluationOutcome {
            task_id,
            judgement:
                "Automatic judgement: No cookies saved for evaluation and no step-by-step tracking"
                    .to_string(),
            success: false,
            error: Some(
                "No cookies file found for login task evaluation and no step-by-step tracking"
                    .to_string(),
            ),
            score: 0.0,
            comprehensive_evaluation: None,
            tracking_data: None,
        };
    };

    let matcher = CookieMatcher::parse(login_cookie);
    let (success, judgement) = match matcher.find(&cookies) {
        Some(_) => (
            true,
            format!(
                "Automatic judgement: Login cookie '{}' was found{} in end-state browser cookies",
                matcher.target(),
                exact_suffix(&matcher)
            ),
        ),
        None => (
            false,
            format!(
                "Automatic judgement: Login cookie '{}' was NOT found{} in end-state browser cookies",
                matcher.target(),
                exact_suffix(&matcher)
            ),
        ),
    };

    tracing::info!(task_id = %task_id, success = success, "Cookie evaluation from end-state");

    EvaluationOutcome {
        task_id,
        judgement,
        success,
        error: None,
        score: if success { 1.0 } else { 0.0 },
        comprehensive_evaluation: None,
        tracking_data: None,
    }
}

fn exact_suffix(matcher: &CookieMatcher) -> &'static str {
    match matcher {
        CookieMatcher::Exact(_) => " as exact match",
        CookieMatcher::Substring(_) => "",
    }
}

/// Loads the persisted end-of-run cookies, newest format first.
async fn load_end_state_cookies(task_dir: &Path) -> Option<Vec<Cookie>> {
    if let Some(storage_state) = load_json(&task_dir.join("storage_state.json")).await {
        if let Some(cookies) = storage_state.get("cookies") {
            if let Ok(cookies) = serde_json::from_value::<Vec<Cookie>>(cookies.clone()) {
                if !cookies.is_empty() {
                    return Some(cookies);
                }
            }
        }
    }

    if let Some(value) = load_json(&task_dir.join("cookies.json")).await {
        if let Ok(cookies) = serde_json::from_value::<Vec<Cookie>>(value) {
            if !cookies.is_empty() {
                return Some(cookies);
            }
        }
    }

    None
}

async fn load_json(path: &Path) -> Option<Value> {
    let data = fs::read(path).await.ok()?;
    match serde_json::from_slice(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to parse cookie file");
            None
        }
    }
}
