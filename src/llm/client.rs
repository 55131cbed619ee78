//! OpenAI-compatible chat-completion client.
//!
//! Works against any gateway speaking the `/chat/completions` wire format
//! (hosted router, local proxy, or the vendors' own endpoints). Text-only
//! messages are sent with plain string content; messages carrying images
//! use the content-block array form.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ChatCompletion, ChatMessage, ChatModel, ContentBlock, Usage};
use crate::error::LlmError;

/// Chat-completion client for OpenAI-compatible APIs.
pub struct OpenAiCompatClient {
    api_base: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    http_client: Client,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f64,
}

/// Wire form of a message: plain string content for text-only turns,
/// content-block array otherwise.
#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatClient {
    /// Creates a new client with explicit configuration.
    pub fn new(api_base: String, api_key: Option<String>, model: String) -> Self {
        Self {
            api_base,
            api_key,
            model,
            temperature: 0.0,
            http_client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Creates a client for `model` from environment variables.
    ///
    /// Reads `WEBEVAL_LLM_API_BASE` (required) and `WEBEVAL_LLM_API_KEY`
    /// (optional).
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiBase` if the base URL is not set.
    pub fn from_env(model: impl Into<String>) -> Result<Self, LlmError> {
        let api_base = env::var("WEBEVAL_LLM_API_BASE").map_err(|_| LlmError::MissingApiBase)?;
        let api_key = env::var("WEBEVAL_LLM_API_KEY").ok();
        Ok(Self::new(api_base, api_key, model.into()))
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    fn to_wire(messages: &[ChatMessage]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|m| {
                let content = match m.content.as_slice() {
                    [ContentBlock::Text { text }] => Value::String(text.clone()),
                    blocks => serde_json::to_value(blocks).unwrap_or(Value::Null),
                };
                WireMessage {
                    role: m.role.clone(),
                    content,
                }
            })
            .collect()
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    async fn invoke(&self, messages: &[ChatMessage]) -> Result<ChatCompletion, LlmError> {
        let request = CompletionRequest {
            model: &self.model,
            messages: Self::to_wire(messages),
            temperature: self.temperature,
        };

        let mut builder = self
            .http_client
            .post(format!("{}/chat/completions", self.api_base))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                code: status.as_u16(),
                message: body,
            });
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let completion = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::EmptyCompletion)?;

        Ok(ChatCompletion {
            completion,
            usage: parsed.usage,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
