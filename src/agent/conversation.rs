use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::providers::base::{Message, Role};

/// Ordered, append-only message sequence for one thread. Owned exclusively by
/// the controller for the lifetime of one turn; subagents never receive a view
/// of it, only freshly authored context strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Replace the prefix `[0, cutoff)` with a single synthetic message.
    /// Used by the compactor; callers must have chosen a cutoff that does not
    /// split a tool-use/result pair.
    pub fn replace_prefix(&mut self, cutoff: usize, summary: Message) {
        debug_assert!(cutoff <= self.messages.len());
        let mut rebuilt = Vec::with_capacity(self.messages.len() - cutoff + 1);
        rebuilt.push(summary);
        rebuilt.extend(self.messages.drain(cutoff..));
        self.messages = rebuilt;
    }

    /// IDs of `ToolUse` blocks that have no matching `ToolResult` yet,
    /// in order of appearance.
    pub fn unresolved_tool_uses(&self) -> Vec<&str> {
        let resolved: HashSet<&str> = self
            .messages
            .iter()
            .flat_map(Message::tool_result_ids)
            .collect();
        self.messages
            .iter()
            .flat_map(|m| m.tool_uses().map(|(id, _)| id))
            .filter(|id| !resolved.contains(id))
            .collect()
    }

    /// Check the pairing invariant: every `ToolUse` has exactly one matching
    /// `ToolResult` in a later message, and every `ToolResult` references an
    /// earlier `ToolUse`. Returns the offending IDs, empty when the invariant
    /// holds. The controller asserts this before each model call.
    pub fn pairing_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let mut seen_uses: Vec<&str> = Vec::new();
        let mut result_counts: std::collections::HashMap<&str, usize> =
            std::collections::HashMap::new();

        for (index, message) in self.messages.iter().enumerate() {
            for (id, _) in message.tool_uses() {
                seen_uses.push(id);
            }
            for id in message.tool_result_ids() {
                let known = self.messages[..index]
                    .iter()
                    .any(|m| m.tool_uses().any(|(uid, _)| uid == id));
                if !known {
                    violations.push(format!("tool_result '{}' has no earlier tool_use", id));
                }
                *result_counts.entry(id).or_insert(0) += 1;
            }
        }

        for id in seen_uses {
            match result_counts.get(id) {
                Some(1) => {}
                Some(n) => violations.push(format!("tool_use '{}' has {} results", id, n)),
                None => violations.push(format!("tool_use '{}' has no result", id)),
            }
        }
        violations
    }

    /// Whether the pairing invariant holds (no unresolved or orphaned pairs).
    pub fn pairing_ok(&self) -> bool {
        self.pairing_violations().is_empty()
    }

    /// Last user-authored text, if any.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::text)
    }
}

impl FromIterator<Message> for Conversation {
    fn from_iter<T: IntoIterator<Item = Message>>(iter: T) -> Self {
        Self {
            messages: iter.into_iter().collect(),
        }
    }
}
