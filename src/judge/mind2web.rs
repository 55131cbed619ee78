//! Screenshot-based LLM judging protocol.
//!
//! The legacy binary judge: extract the task's explicit key points, score
//! every captured screenshot for how essential it is to demonstrating
//! completion, then ask for a final success/failure verdict over the
//! action history and the retained screenshots. The word "success" after
//! the `Status:` marker is the sole success criterion.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine;
use futures::future::join_all;
use regex::Regex;
use tokio::fs;

use super::prompts;
use crate::error::JudgeError;
use crate::llm::{ChatMessage, ChatModel, ContentBlock};

/// Minimum screenshot score (1-5) required to reach the final verdict call.
pub const DEFAULT_SCORE_THRESHOLD: u8 = 3;

/// Maximum screenshots forwarded to the final verdict call.
pub const MAX_IMAGES: usize = 5;

/// Default number of protocol attempts.
pub const MAX_RETRIES: u32 = 3;

/// Parsed judgement for one screenshot.
#[derive(Debug, Clone)]
pub struct ImageJudgement {
    /// Raw model response.
    pub response: String,
    /// Essentiality score 1-5; 0 when unparseable.
    pub score: u8,
    /// One-paragraph rationale extracted from the response.
    pub thought: String,
}

/// Outcome of the full protocol.
#[derive(Debug, Clone)]
pub struct Mind2WebEvaluation {
    /// The final verdict text.
    pub judgement: String,
    /// Whether the verdict indicates success.
    pub success: bool,
    /// Binary score: 1.0 on success, 0.0 otherwise.
    pub score: f64,
    /// Extracted key points, kept for the persisted record.
    pub key_points: String,
    /// Per-screenshot judgements, kept for the persisted record.
    pub image_record: Vec<ImageJudgement>,
}

fn score_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("[1-5]").expect("score regex is valid"))
}

/// Strips the key-points header and per-line leading whitespace.
pub fn extract_key_points(completion: &str) -> String {
    let collapsed = completion.replace("\n\n", "\n");

    let body = match collapsed.split_once("**Key Points**:") {
        Some((_, rest)) => rest.to_string(),
        None => collapsed
            .rsplit_once("Key Points:")
            .map(|(_, rest)| rest.to_string())
            .unwrap_or(collapsed),
    };

    body.lines()
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Parses one screenshot-judgement response.
pub fn parse_image_judgement(response: &str) -> ImageJudgement {
    let score = response
        .split_once("Score")
        .and_then(|(_, after)| score_regex().find(after))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .unwrap_or(0);

    let thought = response
        .rsplit_once("**Reasoning**:")
        .map(|(_, rest)| rest)
        .unwrap_or(response)
        .trim_start()
        .split("\n\n")
        .next()
        .unwrap_or("")
        .replace('\n', " ");

    ImageJudgement {
        response: response.to_string(),
        score,
        thought,
    }
}

/// The official success criterion: "success" appearing after `Status:`.
pub fn verdict_indicates_success(judgement: &str) -> bool {
    judgement
        .to_lowercase()
        .split_once("status:")
        .map(|(_, after)| after.contains("success"))
        .unwrap_or(false)
}

/// Indices of judgements that clear the threshold, capped at [`MAX_IMAGES`].
pub fn retain_essential(judgements: &[ImageJudgement], threshold: u8) -> Vec<usize> {
    judgements
        .iter()
        .enumerate()
        .filter(|(_, j)| j.score >= threshold)
        .map(|(i, _)| i)
        .take(MAX_IMAGES)
        .collect()
}

async fn identify_key_points(task: &str, model: &dyn ChatModel) -> Result<String, JudgeError> {
    let messages = vec![
        ChatMessage::system(prompts::KEY_POINTS_SYSTEM_PROMPT),
        ChatMessage::user_blocks(vec![ContentBlock::text(prompts::key_points_user_prompt(
            task,
        ))]),
    ];
    let response = model.invoke(&messages).await?;
    Ok(response.completion)
}

async fn judge_image(
    task: &str,
    image_b64: &str,
    key_points: &str,
    model: &dyn ChatModel,
) -> Result<String, JudgeError> {
    let messages = vec![
        ChatMessage::system(prompts::JUDGE_IMAGE_SYSTEM_PROMPT),
        ChatMessage::user_blocks(vec![
            ContentBlock::text(prompts::judge_image_user_prompt(task, key_points)),
            ContentBlock::jpeg_base64(image_b64),
        ]),
    ];
    let response = model.invoke(&messages).await?;
    Ok(response.completion)
}

/// Runs the full protocol once.
pub async fn evaluate(
    task: &str,
    action_history: &[String],
    screenshot_paths: &[String],
    model: &dyn ChatModel,
    score_threshold: u8,
) -> Result<Mind2WebEvaluation, JudgeError> {
    let key_points = extract_key_points(&identify_key_points(task, model).await?);

    // Load and score every captured screenshot independently.
    let mut encoded_images = Vec::with_capacity(screenshot_paths.len());
    for path in screenshot_paths {
        let data = fs::read(Path::new(path)).await?;
        encoded_images.push(base64::engine::general_purpose::STANDARD.encode(data));
    }

    let responses = join_all(
        encoded_images
            .iter()
            .map(|image| judge_image(task, image, &key_points, model)),
    )
    .await;

    let mut judgements = Vec::with_capacity(responses.len());
    for response in responses {
        judgements.push(parse_image_judgement(&response?));
    }

    let retained = retain_essential(&judgements, score_threshold);
    let image_blocks: Vec<ContentBlock> = retained
        .iter()
        .map(|&i| ContentBlock::png_base64(&encoded_images[i]))
        .collect();
    let thoughts: Vec<String> = retained
        .iter()
        .filter_map(|&i| {
            let thought = judgements[i].thought.trim();
            (!thought.is_empty()).then(|| thought.to_string())
        })
        .take(MAX_IMAGES)
        .collect();

    let numbered_actions = action_history
        .iter()
        .enumerate()
        .map(|(i, action)| format!("{}. {}", i + 1, action))
        .collect::<Vec<_>>()
        .join("\n");
    let numbered_thoughts = thoughts
        .iter()
        .enumerate()
        .map(|(i, thought)| format!("{}. {}", i + 1, thought))
        .collect::<Vec<_>>()
        .join("\n");

    let user_text = if image_blocks.is_empty() {
        prompts::final_verdict_text_only_prompt(task, &key_points, &numbered_actions)
    } else {
        prompts::final_verdict_user_prompt(task, &key_points, &numbered_actions, &numbered_thoughts)
    };

    let mut content = vec![ContentBlock::text(user_text)];
    content.extend(image_blocks);

    let messages = vec![
        ChatMessage::system(prompts::FINAL_VERDICT_SYSTEM_PROMPT),
        ChatMessage::user_blocks(content),
    ];

    let judgement = model.invoke(&messages).await?.completion;
    let success = verdict_indicates_success(&judgement);

    Ok(Mind2WebEvaluation {
        judgement,
        success,
        score: if success { 1.0 } else { 0.0 },
        key_points,
        image_record: judgements,
    })
}

/// Runs the protocol with exponential-backoff retries.
///
/// The delay doubles each attempt (1s, 2s, ...); the last failure
/// propagates to the caller.
pub async fn evaluate_with_retry(
    task: &str,
    action_history: &[String],
    screenshot_paths: &[String],
    model: &dyn ChatModel,
    score_threshold: u8,
    max_retries: u32,
) -> Result<Mind2WebEvaluation, JudgeError> {
    let mut attempt = 0;
    loop {
        match evaluate(task, action_history, screenshot_paths, model, score_threshold).await {
            Ok(evaluation) => return Ok(evaluation),
            Err(e) if attempt + 1 >= max_retries => {
                tracing::error!(attempts = max_retries, error = %e, "Evaluation failed after all attempts");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(attempt = attempt + 1, error = %e, "Evaluation attempt failed, retrying");
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::ChatCompletion;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_extract_key_points_strips_header() {
        let extracted = extract_key_points("**Key Points**:\n1. A\n2. B");
        assert_eq!(extracted, "1. A\n2. B");
    }

    #[test]
    fn test_extract_key_points_strips_leading_whitespace() {
        let extracted = extract_key_points("**Key Points**:\n  1. A\n\t2. B");
        assert_eq!(extracted, "1. A\n2. B");
    }

    #[test]
    fn test_extract_key_points_plain_header_fallback() {
        let extracted = extract_key_points("Here you go.\nKey Points:\n1. Filter by highest");
        assert_eq!(extracted, "1. Filter by highest");
    }

    #[test]
    fn test_parse_image_judgement() {
        let judgement = parse_image_judgement(
            "1. **Reasoning**: Shows the applied filter.\nClear evidence.\n\n2. **Score**: 4",
        );
        assert_eq!(judgement.score, 4);
        assert_eq!(judgement.thought, "Shows the applied filter. Clear evidence.");
    }

    #[test]
    fn test_parse_image_judgement_unparseable_scores_zero() {
        let judgement = parse_image_judgement("no structure at all");
        assert_eq!(judgement.score, 0);
    }

    #[test]
    fn test_verdict_parsing() {
        assert!(verdict_indicates_success(
            "Thoughts: all key points met\nStatus: \"success\""
        ));
        assert!(!verdict_indicates_success(
            "Thoughts: filter missing\nStatus: \"failure\""
        ));
        assert!(!verdict_indicates_success("success without a status line"));
    }

    #[test]
    fn test_retain_essential_caps_at_max() {
        let judgements: Vec<ImageJudgement> = (0..8)
            .map(|i| ImageJudgement {
                response: String::new(),
                score: 5,
                thought: format!("t{}", i),
            })
            .collect();

        let retained = retain_essential(&judgements, 3);
        assert_eq!(retained.len(), MAX_IMAGES);
        assert_eq!(retained, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_retain_essential_threshold() {
        let judgements = vec![
            ImageJudgement {
                response: String::new(),
                score: 2,
                thought: String::new(),
            },
            ImageJudgement {
                response: String::new(),
                score: 3,
                thought: String::new(),
            },
        ];
        assert_eq!(retain_essential(&judgements, 3), vec![1]);
    }

    /// Model that fails a fixed number of times before succeeding.
    struct FlakyModel {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatModel for FlakyModel {
        async fn invoke(&self, _messages: &[ChatMessage]) -> Result<ChatCompletion, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(LlmError::RequestFailed("rate limited".to_string()))
            } else {
                Ok(ChatCompletion {
                    completion: "**Key Points**:\n1. A\n\nThoughts: ok\nStatus: \"success\""
                        .to_string(),
                    usage: None,
                })
            }
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluate_with_retry_recovers() {
        let model = FlakyModel {
            failures: 2,
            calls: AtomicUsize::new(0),
        };

        let evaluation = evaluate_with_retry("task", &[], &[], &model, 3, MAX_RETRIES)
            .await
            .unwrap();
        assert!(evaluation.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluate_with_retry_propagates_last_failure() {
        let model = FlakyModel {
            failures: 10,
            calls: AtomicUsize::new(0),
        };

        let result = evaluate_with_retry("task", &[], &[], &model, 3, MAX_RETRIES).await;
        assert!(result.is_err());
        assert_eq!(model.calls.load(Ordering::SeqCst), MAX_RETRIES as usize);
    }
}
