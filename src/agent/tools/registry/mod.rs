use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agent::tools::base::{ExecutionContext, Tool};
use crate::errors::IronloomError;
use crate::providers::base::{FailureKind, ToolDefinition, ToolOutcome};

const DEFAULT_MAX_RESULT_CHARS: usize = 10_000;
const TRUNCATION_MARKER: &str = "\n[... output truncated ...]";

/// Builder for the closed tool registry. Registration happens once at startup;
/// `build()` validates names and schemas so an unknown or malformed tool is a
/// configuration error, never a runtime surprise.
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<Arc<dyn Tool>>,
    max_result_chars: Option<usize>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    #[must_use]
    pub fn max_result_chars(mut self, max: usize) -> Self {
        self.max_result_chars = Some(max);
        self
    }

    pub fn build(self) -> Result<ToolRegistry> {
        let mut tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        for tool in self.tools {
            let name = tool.name().to_string();
            if name.is_empty() || name.len() > 256 || name.chars().any(char::is_control) {
                return Err(
                    IronloomError::Config(format!("invalid tool name {:?}", name)).into(),
                );
            }
            if tools.contains_key(&name) {
                return Err(
                    IronloomError::Config(format!("duplicate tool name '{}'", name)).into(),
                );
            }
            let schema = tool.parameters();
            if !schema.is_object() {
                return Err(IronloomError::Config(format!(
                    "tool '{}' parameters must be a JSON Schema object",
                    name
                ))
                .into());
            }
            tools.insert(name, tool);
        }
        info!("tool registry built with {} tool(s)", tools.len());
        Ok(ToolRegistry {
            tools,
            middleware: vec![
                Arc::new(TruncationMiddleware::new(
                    self.max_result_chars.unwrap_or(DEFAULT_MAX_RESULT_CHARS),
                )),
                Arc::new(LoggingMiddleware),
            ],
        })
    }
}

/// Immutable tool registry. Read-only after startup; shared across the
/// controller, dispatcher, and subagent loops via `Arc`.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    middleware: Vec<Arc<dyn ToolMiddleware>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Sorted tool names, for logs and deterministic prompts.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions handed to the provider, sorted by name so prompts are
    /// deterministic across runs.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool through the middleware pipeline. Lookup failure becomes
    /// a `NotFound` outcome — callers never see an `Err` from this path.
    /// Timeout and panic isolation live one level up, in the dispatcher.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ExecutionContext) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome::failure(
                FailureKind::NotFound,
                format!("tool '{}' is not registered", name),
            );
        };

        for mw in &self.middleware {
            if let Some(outcome) = mw.before_execute(name, &args, ctx, tool.as_ref()).await {
                return outcome;
            }
        }

        let mut outcome = tool.execute(args.clone(), ctx).await;

        for mw in &self.middleware {
            mw.after_execute(name, &args, ctx, tool.as_ref(), &mut outcome)
                .await;
        }

        outcome
    }
}

/// Middleware that can intercept tool execution for cross-cutting concerns.
#[async_trait]
pub trait ToolMiddleware: Send + Sync {
    /// Called before tool execution. Return `Some` to short-circuit.
    async fn before_execute(
        &self,
        _name: &str,
        _args: &Value,
        _ctx: &ExecutionContext,
        _tool: &dyn Tool,
    ) -> Option<ToolOutcome> {
        None
    }

    /// Called after tool execution. Can modify the outcome.
    async fn after_execute(
        &self,
        _name: &str,
        _args: &Value,
        _ctx: &ExecutionContext,
        _tool: &dyn Tool,
        _outcome: &mut ToolOutcome,
    ) {
    }
}

/// Truncates successful payloads to a maximum character count so one verbose
/// tool cannot blow the context budget.
pub struct TruncationMiddleware {
    max_chars: usize,
}

impl TruncationMiddleware {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait]
impl ToolMiddleware for TruncationMiddleware {
    async fn after_execute(
        &self,
        _name: &str,
        _args: &Value,
        _ctx: &ExecutionContext,
        _tool: &dyn Tool,
        outcome: &mut ToolOutcome,
    ) {
        if let ToolOutcome::Success { payload } = outcome
            && payload.chars().count() > self.max_chars
        {
            let mut truncated: String = payload.chars().take(self.max_chars).collect();
            truncated.push_str(TRUNCATION_MARKER);
            *payload = truncated;
        }
    }
}

/// Logs tool execution outcomes.
pub struct LoggingMiddleware;

#[async_trait]
impl ToolMiddleware for LoggingMiddleware {
    async fn before_execute(
        &self,
        name: &str,
        args: &Value,
        ctx: &ExecutionContext,
        _tool: &dyn Tool,
    ) -> Option<ToolOutcome> {
        debug!(
            "executing tool: {} (invocation={}) with arguments: {}",
            name, ctx.invocation_id, args
        );
        None
    }

    async fn after_execute(
        &self,
        name: &str,
        _args: &Value,
        _ctx: &ExecutionContext,
        _tool: &dyn Tool,
        outcome: &mut ToolOutcome,
    ) {
        match outcome {
            ToolOutcome::Success { payload } => {
                info!("tool '{}' completed ({} chars)", name, payload.len());
            }
            ToolOutcome::Failure { kind, message, .. } => {
                warn!("tool '{}' failed ({:?}): {}", name, kind, message);
            }
        }
    }
}
