//! HTTP client for the sidecar agent service.
//!
//! The browser and the agent that drives it live in a separate service
//! process; this module is the thin wire adapter. One client implements
//! both capabilities: [`BrowserBackend`] via the session endpoints, and
//! [`AgentFactory`] via the run endpoint, which streams newline-delimited
//! JSON step events so the harness can observe live browser state (login
//! cookie checks) between steps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentFactory, AgentHistory, AgentRun, AgentRunSpec, StepCallback, WebAgent};
use crate::browser::{BrowserBackend, BrowserSession, Cookie, LaunchSpec};
use crate::error::{AgentError, BrowserError};

/// Timeout for the short control-plane calls (create/start/cookies/kill).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for the agent service.
pub struct AgentServiceClient {
    base_url: String,
    http_client: Client,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct CookiesResponse {
    #[serde(default)]
    cookies: Vec<Cookie>,
}

/// One event on the run stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RunEvent {
    /// A step finished; live browser state can be inspected now.
    Step { step_number: usize },
    /// The run finished; carries the full trajectory.
    Final {
        history: AgentHistory,
        #[serde(default)]
        last_message: String,
    },
    /// The service failed mid-run.
    Error { message: String },
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    task: &'a str,
    model: &'a str,
    max_steps: usize,
    use_vision: bool,
    max_actions_per_step: usize,
    use_thinking: bool,
    use_web_search: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_schema: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    two_factor_token: Option<&'a str>,
}

impl AgentServiceClient {
    /// Creates a client for the given service base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            // No global timeout: the run stream is bounded by the pipeline's
            // stage timeout, not by the transport.
            http_client: Client::builder()
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Creates a client from `WEBEVAL_AGENT_SERVICE_URL`, defaulting to a
    /// local sidecar.
    pub fn from_env() -> Self {
        let base_url = std::env::var("WEBEVAL_AGENT_SERVICE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8742".to_string());
        Self::new(base_url)
    }

    /// Service base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn create_session(&self, spec: &LaunchSpec) -> Result<SessionInfo, BrowserError> {
        let body = serde_json::json!({
            "profile": spec.profile,
            "cdp_url": spec.cdp_url,
        });

        let response = self
            .http_client
            .post(format!("{}/sessions", self.base_url))
            .timeout(CONTROL_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrowserError::LaunchFailed(format!(
                "status {}: {}",
                status.as_u16(),
                body
            )));
        }

        Ok(response.json().await?)
    }

    async fn start_session(&self, session_id: &str) -> Result<(), BrowserError> {
        let response = self
            .http_client
            .post(format!("{}/sessions/{}/start", self.base_url, session_id))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BrowserError::SessionNotFound(session_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrowserError::LaunchFailed(format!(
                "status {}: {}",
                status.as_u16(),
                body
            )));
        }
        Ok(())
    }

    async fn session_cookies(&self, session_id: &str) -> Result<Vec<Cookie>, BrowserError> {
        let response = self
            .http_client
            .get(format!("{}/sessions/{}/cookies", self.base_url, session_id))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BrowserError::SessionNotFound(session_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrowserError::LaunchFailed(format!(
                "status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: CookiesResponse = response.json().await?;
        Ok(parsed.cookies)
    }

    async fn kill_session(&self, session_id: &str) -> Result<(), BrowserError> {
        let response = self
            .http_client
            .delete(format!("{}/sessions/{}", self.base_url, session_id))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;

        // A missing session means it is already gone; kill is idempotent.
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(BrowserError::LaunchFailed(format!(
                "status {}: {}",
                status.as_u16(),
                body
            )))
        }
    }

    async fn run_agent(
        &self,
        session_id: &str,
        spec: &AgentRunSpec,
        max_steps: usize,
        on_step: Option<&StepCallback>,
    ) -> Result<AgentRun, AgentError> {
        let request = RunRequest {
            task: &spec.instruction,
            model: &spec.model,
            max_steps,
            use_vision: spec.use_vision,
            max_actions_per_step: spec.max_actions_per_step,
            use_thinking: spec.use_thinking,
            use_web_search: spec.tools.use_web_search,
            output_schema: spec.tools.output_schema.as_ref(),
            two_factor_token: spec.tools.two_factor_token.as_deref(),
        };

        let response = self
            .http_client
            .post(format!("{}/sessions/{}/run", self.base_url, session_id))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Service {
                code: status.as_u16(),
                message: body,
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer = NdjsonBuffer::new();
        let mut outcome = None;

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for line in buffer.push(&chunk) {
                match self.handle_event(&line, spec, on_step).await? {
                    Some(run) => {
                        outcome = Some(run);
                        break 'outer;
                    }
                    None => continue,
                }
            }
        }

        if outcome.is_none() {
            if let Some(line) = buffer.take_remainder() {
                outcome = self.handle_event(&line, spec, on_step).await?;
            }
        }

        outcome.ok_or(AgentError::StreamTruncated)
    }

    async fn handle_event(
        &self,
        line: &str,
        spec: &AgentRunSpec,
        on_step: Option<&StepCallback>,
    ) -> Result<Option<AgentRun>, AgentError> {
        let event: RunEvent = serde_json::from_str(line)
            .map_err(|e| AgentError::MalformedEvent(format!("{}: {}", e, line)))?;

        match event {
            RunEvent::Step { step_number } => {
                tracing::trace!(task_id = %spec.task_id, step = step_number, "Agent step completed");
                if let Some(callback) = on_step {
                    callback(step_number).await;
                }
                Ok(None)
            }
            RunEvent::Final {
                history,
                last_message,
            } => Ok(Some(AgentRun {
                history,
                last_message,
            })),
            RunEvent::Error { message } => Err(AgentError::Service {
                code: 500,
                message,
            }),
        }
    }
}

/// Accumulates stream chunks and yields complete NDJSON lines.
struct NdjsonBuffer {
    pending: Vec<u8>,
}

impl NdjsonBuffer {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Pushes a chunk and returns all complete, non-empty lines.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Returns any trailing line not terminated by a newline.
    fn take_remainder(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&std::mem::take(&mut self.pending)).to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// A browser session hosted by the agent service.
pub struct ServiceSession {
    client: Arc<AgentServiceClient>,
    session_id: String,
}

#[async_trait]
impl BrowserSession for ServiceSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn start(&self) -> Result<(), BrowserError> {
        self.client.start_session(&self.session_id).await
    }

    async fn get_cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
        self.client.session_cookies(&self.session_id).await
    }

    async fn kill(&self) -> Result<(), BrowserError> {
        self.client.kill_session(&self.session_id).await
    }
}

#[async_trait]
impl BrowserBackend for AgentServiceClient {
    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        let info = self.create_session(&spec).await?;
        Ok(Arc::new(ServiceSession {
            client: Arc::new(Self {
                base_url: self.base_url.clone(),
                http_client: self.http_client.clone(),
            }),
            session_id: info.session_id,
        }))
    }
}

/// An agent run hosted by the service, bound to one session.
pub struct ServiceAgent {
    client: Arc<AgentServiceClient>,
    session_id: String,
    spec: AgentRunSpec,
    on_step: Option<StepCallback>,
}

#[async_trait]
impl WebAgent for ServiceAgent {
    async fn run(&mut self, max_steps: usize) -> Result<AgentRun, AgentError> {
        self.client
            .run_agent(&self.session_id, &self.spec, max_steps, self.on_step.as_ref())
            .await
    }
}

#[async_trait]
impl AgentFactory for AgentServiceClient {
    async fn create(
        &self,
        session: Arc<dyn BrowserSession>,
        spec: AgentRunSpec,
        on_step: Option<StepCallback>,
    ) -> Result<Box<dyn WebAgent>, AgentError> {
        Ok(Box::new(ServiceAgent {
            client: Arc::new(Self {
                base_url: self.base_url.clone(),
                http_client: self.http_client.clone(),
            }),
            session_id: session.session_id().to_string(),
            spec,
            on_step,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ndjson_buffer_splits_lines() {
        let mut buffer = NdjsonBuffer::new();

        let lines = buffer.push(b"{\"a\":1}\n{\"b\":");
        assert_eq!(lines, vec!["{\"a\":1}".to_string()]);

        let lines = buffer.push(b"2}\n\n");
        assert_eq!(lines, vec!["{\"b\":2}".to_string()]);

        assert!(buffer.take_remainder().is_none());
    }

    #[test]
    fn test_ndjson_buffer_remainder() {
        let mut buffer = NdjsonBuffer::new();
        assert!(buffer.push(b"{\"type\":\"final\"}").is_empty());
        assert_eq!(
            buffer.take_remainder(),
            Some("{\"type\":\"final\"}".to_string())
        );
    }

    #[test]
    fn test_run_event_parse() {
        let event: RunEvent =
            serde_json::from_str("{\"type\":\"step\",\"step_number\":3}").unwrap();
        assert!(matches!(event, RunEvent::Step { step_number: 3 }));

        let event: RunEvent = serde_json::from_str(
            "{\"type\":\"final\",\"history\":{\"steps\":[]},\"last_message\":\"done\"}",
        )
        .unwrap();
        match event {
            RunEvent::Final {
                history,
                last_message,
            } => {
                assert!(history.steps.is_empty());
                assert_eq!(last_message, "done");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_cookies_response_defaults() {
        let parsed: CookiesResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.cookies.is_empty());
    }
}
