//! Chat-model capability for agent driving and trajectory judging.
//!
//! Messages are role-tagged turns; user turns may carry an ordered list of
//! text and image content blocks (images as embedded base64 data URIs).
//! Concrete clients implement [`ChatModel`]; the shipped implementation in
//! [`client`] speaks the OpenAI-compatible wire format.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

pub use client::OpenAiCompatClient;

/// A single content block inside a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text { text: String },
    /// An embedded image, as a base64 data URI.
    ImageUrl { image_url: ImageUrl },
}

/// Image reference carried by an image content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    /// `data:image/...;base64,...` URI.
    pub url: String,
    /// Rendering detail hint ("high" for judge screenshots).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ContentBlock {
    /// Creates a text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Creates a high-detail image block from a base64-encoded JPEG.
    pub fn jpeg_base64(data: impl AsRef<str>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:image/jpeg;base64,{}", data.as_ref()),
                detail: Some("high".to_string()),
            },
        }
    }

    /// Creates a high-detail image block from a base64-encoded PNG.
    pub fn png_base64(data: impl AsRef<str>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:image/png;base64,{}", data.as_ref()),
                detail: Some("high".to_string()),
            },
        }
    }
}

/// A message in a conversation with a chat model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the sender ("system", "user", "assistant").
    pub role: String,
    /// Ordered content blocks.
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    /// Creates a system message with a single text block.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: vec![ContentBlock::text(content)],
        }
    }

    /// Creates a user message with a single text block.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: vec![ContentBlock::text(content)],
        }
    }

    /// Creates a user message with explicit content blocks.
    pub fn user_blocks(content: Vec<ContentBlock>) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

/// Token usage statistics for one completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// A chat-model completion.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    /// The completion text.
    pub completion: String,
    /// Usage statistics, when the provider reports them.
    pub usage: Option<Usage>,
}

/// Capability trait for chat-completion clients.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generates a completion for the given conversation.
    async fn invoke(&self, messages: &[ChatMessage]) -> Result<ChatCompletion, LlmError>;

    /// Model identifier, for logs and metrics labels.
    fn model_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_block_serialization() {
        let block = ContentBlock::text("hello");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hello");

        let block = ContentBlock::jpeg_base64("QUJD");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "image_url");
        assert_eq!(json["image_url"]["url"], "data:image/jpeg;base64,QUJD");
        assert_eq!(json["image_url"]["detail"], "high");
    }

    #[test]
    fn test_chat_message_constructors() {
        let msg = ChatMessage::system("be precise");
        assert_eq!(msg.role, "system");
        assert_eq!(msg.content.len(), 1);

        let msg = ChatMessage::user_blocks(vec![
            ContentBlock::text("look at this"),
            ContentBlock::png_base64("QUJD"),
        ]);
        assert_eq!(msg.role, "user");
        assert_eq!(msg.content.len(), 2);
    }
}
