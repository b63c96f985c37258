use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::IronloomError;

/// One tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Why a tool call failed. The kind determines the default retry policy:
/// timeouts, rate limits, and connection drops are worth retrying; bad
/// arguments and unknown paths are returned straight to the model so it can
/// self-correct its next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimit,
    Connection,
    InvalidArguments,
    NotFound,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn default_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimit | Self::Connection)
    }
}

/// The outcome of one tool invocation. Always a value — a tool handler that
/// panics or times out is converted into `Failure` at the dispatch boundary,
/// never an error crossing into the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success {
        payload: String,
    },
    Failure {
        kind: FailureKind,
        message: String,
        retryable: bool,
    },
}

impl ToolOutcome {
    pub fn success(payload: impl Into<String>) -> Self {
        Self::Success {
            payload: payload.into(),
        }
    }

    /// Build a failure with the kind's default retryability.
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failure { retryable: true, .. })
    }

    /// Text representation fed back to the model.
    pub fn render(&self) -> String {
        match self {
            Self::Success { payload } => payload.clone(),
            Self::Failure { kind, message, .. } => {
                format!("Tool failed ({:?}): {}", kind, message)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One content block inside a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        tool_use_id: String,
        outcome: ToolOutcome,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Block>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![Block::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![Block::Text { text: text.into() }],
        }
    }

    /// Assistant message combining optional text with the model's tool calls.
    pub fn assistant(text: Option<String>, tool_calls: &[ToolCallRequest]) -> Self {
        let mut content = Vec::with_capacity(tool_calls.len() + 1);
        if let Some(text) = text
            && !text.is_empty()
        {
            content.push(Block::Text { text });
        }
        for tc in tool_calls {
            content.push(Block::ToolUse {
                id: tc.id.clone(),
                name: tc.name.clone(),
                arguments: tc.arguments.clone(),
            });
        }
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Tool message carrying one result block per completed tool call.
    pub fn tool_results(results: Vec<Block>) -> Self {
        debug_assert!(
            results
                .iter()
                .all(|b| matches!(b, Block::ToolResult { .. })),
            "tool_results only accepts ToolResult blocks"
        );
        Self {
            role: Role::Tool,
            content: results,
        }
    }

    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        let mut parts = Vec::new();
        for block in &self.content {
            if let Block::Text { text } = block {
                parts.push(text.as_str());
            }
        }
        parts.join("\n")
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str)> {
        self.content.iter().filter_map(|b| match b {
            Block::ToolUse { id, name, .. } => Some((id.as_str(), name.as_str())),
            _ => None,
        })
    }

    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            Block::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema
}

/// Completion returned by a provider. `tool_calls` is non-empty when the model
/// wants tool invocations before producing its final text.
#[derive(Debug, Clone, Default)]
pub struct LLMResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    /// Input token count reported by the provider, used for compaction
    /// threshold checks when available.
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl LLMResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// Text content of the completion, empty when the model produced only
    /// tool calls.
    pub fn content_text(&self) -> String {
        self.content.clone().unwrap_or_default()
    }
}

/// Retry policy for transient provider failures. `max_attempts` counts the
/// first call, so the default allows two retries after the initial attempt.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Parameters for a completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub model: Option<&'a str>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// One completion call. Implementations must be cancel-safe: when `cancel`
    /// fires they should abandon the request promptly.
    async fn chat(
        &self,
        req: ChatRequest<'_>,
        cancel: CancellationToken,
    ) -> anyhow::Result<LLMResponse>;

    fn default_model(&self) -> &str;

    /// Chat with automatic retry on transient errors (network, 5xx, rate
    /// limit). Fatal errors and non-retryable provider errors return
    /// immediately; exhausted attempts return the last error.
    async fn chat_with_retry(
        &self,
        req: ChatRequest<'_>,
        retry_config: Option<RetryConfig>,
        cancel: CancellationToken,
    ) -> anyhow::Result<LLMResponse> {
        let config = retry_config.unwrap_or_default();
        let mut last_error = None;

        for attempt in 1..=config.max_attempts {
            if cancel.is_cancelled() {
                return Err(IronloomError::Cancelled("model call".into()).into());
            }
            if attempt > 1 {
                warn!(
                    "provider retry attempt {}/{} after error: {}",
                    attempt,
                    config.max_attempts,
                    last_error
                        .as_ref()
                        .map(|e: &anyhow::Error| e.to_string())
                        .unwrap_or_default()
                );
            }
            let chat_req = ChatRequest {
                messages: req.messages.clone(),
                tools: req.tools.clone(),
                model: req.model,
                max_tokens: req.max_tokens,
                temperature: req.temperature,
            };
            match self.chat(chat_req, cancel.clone()).await {
                Ok(response) => {
                    debug!("chat request succeeded on attempt {}", attempt);
                    return Ok(response);
                }
                Err(e) => {
                    let rate_limit_delay = e
                        .downcast_ref::<IronloomError>()
                        .and_then(|il| match il {
                            IronloomError::RateLimit { retry_after } => *retry_after,
                            _ => None,
                        });
                    if !crate::errors::is_retryable(&e) {
                        return Err(e);
                    }
                    warn!("chat request failed on attempt {}: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < config.max_attempts {
                        // Honor a rate-limit hint when present, otherwise
                        // exponential backoff with jitter.
                        let delay_ms = if let Some(retry_secs) = rate_limit_delay {
                            retry_secs * 1000
                        } else {
                            let base = (config.initial_delay_ms as f64
                                * config.backoff_multiplier.powi(attempt as i32 - 1))
                            .min(config.max_delay_ms as f64)
                                as u64;
                            let jitter = (base as f64 * 0.25 * fastrand::f64()) as u64;
                            base + jitter
                        };
                        tokio::select! {
                            () = cancel.cancelled() => {
                                return Err(IronloomError::Cancelled("model call backoff".into()).into());
                            }
                            () = tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)) => {}
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("all retry attempts failed")))
    }
}
