use super::*;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

use crate::agent::tools::base::Tool;
use crate::agent::tools::registry::ToolRegistryBuilder;

fn schema() -> Value {
    json!({"type": "object", "properties": {}})
}

fn fast_config() -> DispatchConfig {
    DispatchConfig {
        timeout_secs: 1,
        max_concurrent: 5,
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
    }
}

fn call(id: &str, name: &str) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments: json!({}),
    }
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "echoes its arguments"
    }
    fn parameters(&self) -> Value {
        schema()
    }
    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> ToolOutcome {
        ToolOutcome::success(args.to_string())
    }
}

struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "panic"
    }
    fn description(&self) -> &str {
        "always panics"
    }
    fn parameters(&self) -> Value {
        schema()
    }
    async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> ToolOutcome {
        panic!("handler blew up");
    }
}

struct HangTool;

#[async_trait]
impl Tool for HangTool {
    fn name(&self) -> &str {
        "hang"
    }
    fn description(&self) -> &str {
        "never returns"
    }
    fn parameters(&self) -> Value {
        schema()
    }
    async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> ToolOutcome {
        std::future::pending().await
    }
    fn execution_timeout(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_millis(20))
    }
}

/// Fails with a retryable kind until `failures` attempts have been consumed.
struct FlakyTool {
    failures: AtomicUsize,
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        "flaky"
    }
    fn description(&self) -> &str {
        "fails then succeeds"
    }
    fn parameters(&self) -> Value {
        schema()
    }
    async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> ToolOutcome {
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            ToolOutcome::failure(FailureKind::Connection, "transient")
        } else {
            ToolOutcome::success("recovered")
        }
    }
}

struct BadArgsTool;

#[async_trait]
impl Tool for BadArgsTool {
    fn name(&self) -> &str {
        "bad_args"
    }
    fn description(&self) -> &str {
        "always rejects its arguments"
    }
    fn parameters(&self) -> Value {
        schema()
    }
    async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> ToolOutcome {
        ToolOutcome::failure(FailureKind::InvalidArguments, "missing field 'query'")
    }
}

/// Tracks how many executions overlap, for concurrency ceiling checks.
struct GaugeTool {
    active: Arc<AtomicUsize>,
    high_water: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for GaugeTool {
    fn name(&self) -> &str {
        "gauge"
    }
    fn description(&self) -> &str {
        "records overlap"
    }
    fn parameters(&self) -> Value {
        schema()
    }
    async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> ToolOutcome {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        ToolOutcome::success("done")
    }
}

fn dispatcher_with(tools: Vec<Arc<dyn Tool>>, config: DispatchConfig) -> ToolDispatcher {
    let mut builder = ToolRegistryBuilder::new();
    for tool in tools {
        builder = builder.register(tool);
    }
    ToolDispatcher::new(Arc::new(builder.build().unwrap()), config)
}

#[tokio::test]
async fn success_passes_through() {
    let d = dispatcher_with(vec![Arc::new(EchoTool)], fast_config());
    let ctx = ExecutionContext::new("t", CancellationToken::new());
    let outcome = d.execute_one(&call("c1", "echo"), &ctx).await;
    assert!(outcome.is_success());
}

#[tokio::test]
async fn panic_becomes_internal_failure() {
    let d = dispatcher_with(vec![Arc::new(PanicTool)], fast_config());
    let ctx = ExecutionContext::new("t", CancellationToken::new());
    let outcome = d.execute_one(&call("c1", "panic"), &ctx).await;
    match outcome {
        ToolOutcome::Failure { kind, message, retryable } => {
            assert_eq!(kind, FailureKind::Internal);
            assert!(message.contains("handler blew up"));
            assert!(!retryable);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn per_tool_timeout_override_wins() {
    let d = dispatcher_with(vec![Arc::new(HangTool)], fast_config());
    let ctx = ExecutionContext::new("t", CancellationToken::new());
    let start = std::time::Instant::now();
    let record = d.execute_with_retry(&call("c1", "hang"), &ctx).await;
    match record.outcome {
        ToolOutcome::Failure { kind, .. } => assert_eq!(kind, FailureKind::Timeout),
        other => panic!("expected timeout, got {other:?}"),
    }
    // Timeout is retryable, so all attempts run, but each bounded at 20ms.
    assert_eq!(record.attempts, 3);
    assert!(start.elapsed() < std::time::Duration::from_millis(500));
}

#[tokio::test]
async fn retryable_failure_is_retried_until_success() {
    let flaky = Arc::new(FlakyTool { failures: AtomicUsize::new(2) });
    let d = dispatcher_with(vec![flaky], fast_config());
    let ctx = ExecutionContext::new("t", CancellationToken::new());
    let record = d.execute_with_retry(&call("c1", "flaky"), &ctx).await;
    assert!(record.outcome.is_success());
    assert_eq!(record.attempts, 3);
}

#[tokio::test]
async fn non_retryable_failure_returns_immediately() {
    let d = dispatcher_with(vec![Arc::new(BadArgsTool)], fast_config());
    let ctx = ExecutionContext::new("t", CancellationToken::new());
    let record = d.execute_with_retry(&call("c1", "bad_args"), &ctx).await;
    assert!(!record.outcome.is_success());
    assert_eq!(record.attempts, 1);
}

#[tokio::test]
async fn unknown_tool_is_not_found() {
    let d = dispatcher_with(vec![Arc::new(EchoTool)], fast_config());
    let ctx = ExecutionContext::new("t", CancellationToken::new());
    let outcome = d.execute_one(&call("c1", "missing"), &ctx).await;
    match outcome {
        ToolOutcome::Failure { kind, .. } => assert_eq!(kind, FailureKind::NotFound),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn batch_is_all_settled_and_ordered() {
    let d = dispatcher_with(
        vec![Arc::new(EchoTool), Arc::new(PanicTool)],
        fast_config(),
    );
    let ctx = ExecutionContext::new("t", CancellationToken::new());
    let calls = vec![
        call("c1", "echo"),
        call("c2", "panic"),
        call("c3", "echo"),
        call("c4", "missing"),
        call("c5", "echo"),
    ];
    let result = d.execute_batch(&calls, &ctx).await;

    assert_eq!(result.stats.total, 5);
    assert_eq!(result.stats.succeeded, 3);
    assert_eq!(result.stats.failed, 2);

    let ids: Vec<&str> = result.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2", "c3", "c4", "c5"]);

    let blocks = result.result_blocks();
    assert_eq!(blocks.len(), calls.len());
    for (block, call) in blocks.iter().zip(&calls) {
        match block {
            Block::ToolResult { tool_use_id, .. } => assert_eq!(tool_use_id, &call.id),
            other => panic!("expected tool result, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn batch_respects_concurrency_ceiling() {
    let active = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));
    let gauge = Arc::new(GaugeTool {
        active: active.clone(),
        high_water: high_water.clone(),
    });
    let config = DispatchConfig { max_concurrent: 2, ..fast_config() };
    let d = dispatcher_with(vec![gauge], config);
    let ctx = ExecutionContext::new("t", CancellationToken::new());

    let calls: Vec<_> = (0..6).map(|i| call(&format!("c{i}"), "gauge")).collect();
    let result = d.execute_batch(&calls, &ctx).await;

    assert_eq!(result.stats.succeeded, 6);
    assert!(high_water.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn cancellation_yields_cancelled_failure() {
    let d = dispatcher_with(vec![Arc::new(EchoTool)], fast_config());
    let ctx = ExecutionContext::new("t", CancellationToken::new());
    ctx.cancel.cancel();
    let hang_call = ToolCallRequest {
        id: "c1".into(),
        name: "echo".into(),
        arguments: json!({}),
    };
    let outcome = d.execute_one(&hang_call, &ctx).await;
    // Either the cancel branch or the tool may win the race; if the cancel
    // branch wins, the failure kind must be Cancelled.
    if let ToolOutcome::Failure { kind, .. } = outcome {
        assert_eq!(kind, FailureKind::Cancelled);
    }
}
