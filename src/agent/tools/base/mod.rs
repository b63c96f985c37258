use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::providers::base::ToolOutcome;

/// Context passed to every tool execution. Constructed fresh per turn — tools
/// must not stash it beyond the call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Identifier of the controller invocation this call belongs to.
    pub invocation_id: String,
    /// Cancellation token; fires when the turn or batch deadline expires.
    pub cancel: CancellationToken,
    /// Free-form metadata forwarded from the caller.
    pub metadata: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(invocation_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            cancel,
            metadata: HashMap::new(),
        }
    }
}

/// A tool handler. The return type enforces the "never throw" contract
/// structurally: every failure mode is a [`ToolOutcome::Failure`] value, and
/// the dispatcher additionally converts panics and timeouts into failures so
/// nothing crosses the boundary as an unwound error.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value; // JSON Schema

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> ToolOutcome;

    /// Per-tool timeout override. `None` uses the dispatcher default (30s).
    fn execution_timeout(&self) -> Option<Duration> {
        None
    }
}
