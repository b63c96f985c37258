use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::conversation::Conversation;
use crate::config::CompactionConfig;
use crate::providers::base::{Block, ChatRequest, LLMProvider, Message, RetryConfig};

/// Rough chars-per-token ratio for English prose and JSON payloads.
pub const CHARS_PER_TOKEN_ESTIMATE: usize = 4;

/// Prefix that marks an injected summary message. Checked before compacting
/// so repeated invocations over an already-compacted history are no-ops.
pub const SUMMARY_MARKER: &str = "[Conversation summary]";

const SUMMARY_PROMPT: &str = "Summarize the conversation so far for an AI assistant that will \
continue it. Preserve: the user's goal, decisions already made, key facts and figures \
discovered by tools, and any constraints stated. Omit pleasantries and dead ends. \
Write plain prose, at most 500 words.";

/// Record of one completed compaction.
#[derive(Debug, Clone)]
pub struct CompactionCheckpoint {
    pub summary_text: String,
    /// Number of original messages the summary replaced.
    pub cutoff_index: usize,
    /// Estimated token size of the conversation after compaction.
    pub estimated_tokens: usize,
}

/// Cheap token estimate for a single message, counting text, tool arguments,
/// and rendered tool results.
pub fn estimate_tokens(message: &Message) -> usize {
    let chars: usize = message
        .content
        .iter()
        .map(|block| match block {
            Block::Text { text } => text.len(),
            Block::ToolUse { name, arguments, .. } => name.len() + arguments.to_string().len(),
            Block::ToolResult { outcome, .. } => outcome.render().len(),
        })
        .sum();
    chars.div_ceil(CHARS_PER_TOKEN_ESTIMATE)
}

pub fn estimate_conversation_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_tokens).sum()
}

/// Pick the compaction cutoff: everything before the returned index is
/// summarized, everything at or after it is kept verbatim. Starts from
/// `len - keep_recent` and moves EARLIER until no tool-use in the kept suffix
/// references a result that would land in the summarized prefix (and vice
/// versa). Never splits a use/result pair.
pub fn select_cutoff(messages: &[Message], keep_recent: usize) -> usize {
    if messages.len() <= keep_recent {
        return 0;
    }
    let mut cutoff = messages.len() - keep_recent;
    while cutoff > 0 && splits_pair(messages, cutoff) {
        cutoff -= 1;
    }
    cutoff
}

/// True when a tool-use before `cutoff` has its result at or after it.
/// Results always follow their use, so checking the prefix's unresolved
/// uses is sufficient.
fn splits_pair(messages: &[Message], cutoff: usize) -> bool {
    let mut open: Vec<&str> = Vec::new();
    for message in &messages[..cutoff] {
        for block in &message.content {
            match block {
                Block::ToolUse { id, .. } => open.push(id),
                Block::ToolResult { tool_use_id, .. } => {
                    open.retain(|open_id| open_id != tool_use_id);
                }
                Block::Text { .. } => {}
            }
        }
    }
    !open.is_empty()
}

/// Summarizes old history into a single synthetic message when the estimated
/// size crosses the configured threshold.
pub struct Compactor {
    provider: Arc<dyn LLMProvider>,
    retry: RetryConfig,
}

impl Compactor {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            retry: RetryConfig::default(),
        }
    }

    /// Compact `conversation` in place if it is over threshold. Returns the
    /// checkpoint when compaction ran, `None` when it was not needed.
    pub async fn maybe_compact(
        &self,
        conversation: &mut Conversation,
        config: &CompactionConfig,
        cancel: CancellationToken,
    ) -> Result<Option<CompactionCheckpoint>> {
        if !config.enabled {
            return Ok(None);
        }
        let estimated = estimate_conversation_tokens(conversation.messages());
        if estimated < config.threshold_tokens() {
            return Ok(None);
        }

        let cutoff = select_cutoff(conversation.messages(), config.keep_recent);
        if cutoff == 0 {
            debug!("compaction skipped: no prefix can be summarized without splitting a pair");
            return Ok(None);
        }
        // An already-compacted prefix of exactly one summary message means a
        // second pass would summarize a summary. Treat that as settled.
        if cutoff == 1 && self.is_summary_message(&conversation.messages()[0]) {
            return Ok(None);
        }

        info!(
            "compacting conversation: {} estimated tokens over {} threshold, summarizing {} of {} messages",
            estimated,
            config.threshold_tokens(),
            cutoff,
            conversation.len()
        );

        let summary = self
            .summarize(&conversation.messages()[..cutoff], config, cancel)
            .await?;
        let summary_text = format!("{SUMMARY_MARKER}\n{summary}");
        conversation.replace_prefix(cutoff, Message::user(&summary_text));

        let after = estimate_conversation_tokens(conversation.messages());
        Ok(Some(CompactionCheckpoint {
            summary_text,
            cutoff_index: cutoff,
            estimated_tokens: after,
        }))
    }

    fn is_summary_message(&self, message: &Message) -> bool {
        message.text().starts_with(SUMMARY_MARKER)
    }

    async fn summarize(
        &self,
        messages: &[Message],
        config: &CompactionConfig,
        cancel: CancellationToken,
    ) -> Result<String> {
        let mut transcript = String::new();
        for message in messages {
            transcript.push_str(&format!("{:?}: {}\n", message.role, message.text()));
            for (_id, name) in message.tool_uses() {
                transcript.push_str(&format!("  (called tool: {name})\n"));
            }
        }

        let prompt = format!("{SUMMARY_PROMPT}\n\n---\n{transcript}");
        let request = ChatRequest {
            messages: vec![Message::user(prompt)],
            tools: None,
            model: config.model.as_deref(),
            max_tokens: 1024,
            temperature: 0.0,
        };

        let response = self
            .provider
            .chat_with_retry(request, Some(self.retry.clone()), cancel)
            .await?;
        let text = response.content_text();
        if text.trim().is_empty() {
            warn!("summarizer returned empty text, keeping a minimal placeholder");
            return Ok("(earlier conversation omitted)".to_string());
        }
        Ok(text)
    }
}
