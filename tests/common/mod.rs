use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use ironloom::agent::tools::base::{ExecutionContext, Tool};
use ironloom::agent::tools::registry::{ToolRegistry, ToolRegistryBuilder};
use ironloom::providers::base::{
    ChatRequest, LLMProvider, LLMResponse, Message, ToolCallRequest, ToolOutcome,
};

/// Route `RUST_LOG`-filtered tracing output to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn text_response(content: &str) -> LLMResponse {
    LLMResponse {
        content: Some(content.to_string()),
        tool_calls: vec![],
        input_tokens: None,
        output_tokens: None,
    }
}

pub fn tool_call_response(calls: &[(&str, &str, Value)]) -> LLMResponse {
    LLMResponse {
        content: None,
        tool_calls: calls
            .iter()
            .map(|(id, name, args)| ToolCallRequest {
                id: (*id).to_string(),
                name: (*name).to_string(),
                arguments: args.clone(),
            })
            .collect(),
        input_tokens: None,
        output_tokens: None,
    }
}

type RouteFn = Box<dyn Fn(&[Message]) -> anyhow::Result<LLMResponse> + Send + Sync>;

/// Mock provider that picks its response by inspecting the request messages,
/// so concurrent callers get deterministic answers regardless of ordering.
/// Every request's message snapshot is recorded for later assertions.
pub struct RoutedProvider {
    route: RouteFn,
    calls: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl RoutedProvider {
    pub fn new(
        route: impl Fn(&[Message]) -> anyhow::Result<LLMResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            route: Box::new(route),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<Vec<Message>>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl LLMProvider for RoutedProvider {
    async fn chat(
        &self,
        req: ChatRequest<'_>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<LLMResponse> {
        self.calls.lock().unwrap().push(req.messages.clone());
        (self.route)(&req.messages)
    }

    fn default_model(&self) -> &str {
        "routed-mock"
    }
}

/// Concatenated text of every message in a request, for substring routing.
pub fn transcript_of(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| m.text())
        .collect::<Vec<_>>()
        .join("\n")
}

/// True when the request already carries at least one tool result.
pub fn has_tool_results(messages: &[Message]) -> bool {
    messages
        .iter()
        .any(|m| m.tool_result_ids().next().is_some())
}

pub struct LookupTool {
    pub name: String,
    pub payload: String,
    pub delay: std::time::Duration,
    pub active: Arc<std::sync::atomic::AtomicUsize>,
    pub high_water: Arc<std::sync::atomic::AtomicUsize>,
}

impl LookupTool {
    pub fn new(name: &str, payload: &str) -> Self {
        Self {
            name: name.to_string(),
            payload: payload.to_string(),
            delay: std::time::Duration::from_millis(25),
            active: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            high_water: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Tool for LookupTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "returns a canned lookup result"
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"query": {"type": "string"}}})
    }
    async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> ToolOutcome {
        use std::sync::atomic::Ordering;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        ToolOutcome::success(self.payload.clone())
    }
}

/// Never finishes within its own 25ms execution budget.
pub struct StallingTool;

#[async_trait]
impl Tool for StallingTool {
    fn name(&self) -> &str {
        "slow_fetch"
    }
    fn description(&self) -> &str {
        "stalls past its deadline"
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> ToolOutcome {
        std::future::pending().await
    }
    fn execution_timeout(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_millis(25))
    }
}

pub fn build_registry(tools: Vec<Arc<dyn Tool>>) -> Arc<ToolRegistry> {
    let mut builder = ToolRegistryBuilder::new();
    for tool in tools {
        builder = builder.register(tool);
    }
    Arc::new(builder.build().expect("registry builds"))
}
