use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::agent::tools::base::ExecutionContext;
use crate::agent::tools::registry::ToolRegistry;
use crate::config::DispatchConfig;
use crate::providers::base::{Block, FailureKind, ToolCallRequest, ToolOutcome};

/// Outcome of one dispatched call, tagged with its originating tool-use id.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub id: String,
    pub name: String,
    pub outcome: ToolOutcome,
    /// Attempts actually made, counting the first.
    pub attempts: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Calls that needed more than one attempt.
    pub retried: usize,
    pub elapsed: Duration,
}

/// Aggregate of a batch dispatch. Records stay in input order so the caller
/// can pair each outcome with its tool-use block.
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    pub records: Vec<DispatchRecord>,
    pub stats: BatchStats,
}

impl AggregatedResult {
    pub fn successes(&self) -> impl Iterator<Item = &DispatchRecord> {
        self.records.iter().filter(|r| r.outcome.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &DispatchRecord> {
        self.records.iter().filter(|r| !r.outcome.is_success())
    }

    /// Exactly one `ToolResult` block per dispatched call, in input order.
    /// This is what upholds the use/result pairing invariant.
    pub fn result_blocks(&self) -> Vec<Block> {
        self.records
            .iter()
            .map(|r| Block::ToolResult {
                tool_use_id: r.id.clone(),
                outcome: r.outcome.clone(),
            })
            .collect()
    }
}

/// Executes tool invocations under timeout and retry policy. The one hard
/// contract: nothing escapes this boundary as an error — timeouts, panics,
/// and cancellations all come back as `ToolOutcome::Failure` values.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    config: DispatchConfig,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, config: DispatchConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one call with the full retry policy applied.
    pub async fn execute_one(&self, call: &ToolCallRequest, ctx: &ExecutionContext) -> ToolOutcome {
        self.execute_with_retry(call, ctx).await.outcome
    }

    /// Execute a batch in chunks of at most `max_concurrent` calls. Every call
    /// in a chunk runs concurrently and is awaited to completion regardless of
    /// sibling failures — no fail-fast.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCallRequest],
        ctx: &ExecutionContext,
    ) -> AggregatedResult {
        let start = Instant::now();
        let mut records = Vec::with_capacity(calls.len());

        for chunk in calls.chunks(self.config.max_concurrent.max(1)) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|call| self.execute_with_retry(call, ctx))
                .collect();
            records.extend(join_all(futures).await);
        }

        let succeeded = records.iter().filter(|r| r.outcome.is_success()).count();
        let retried = records.iter().filter(|r| r.attempts > 1).count();
        let stats = BatchStats {
            total: records.len(),
            succeeded,
            failed: records.len() - succeeded,
            retried,
            elapsed: start.elapsed(),
        };
        debug!(
            "batch dispatch complete: {}/{} succeeded, {} retried, {:?}",
            stats.succeeded, stats.total, stats.retried, stats.elapsed
        );
        AggregatedResult { records, stats }
    }

    async fn execute_with_retry(
        &self,
        call: &ToolCallRequest,
        ctx: &ExecutionContext,
    ) -> DispatchRecord {
        let max_attempts = self.config.max_attempts.max(1);
        let mut outcome = self.execute_attempt(call, ctx).await;
        let mut attempts = 1;

        while outcome.is_retryable() && attempts < max_attempts {
            let base = (self.config.initial_backoff_ms as f64
                * 2f64.powi(attempts as i32 - 1))
            .min(self.config.max_backoff_ms as f64) as u64;
            let jitter = (base as f64 * 0.25 * fastrand::f64()) as u64;
            let delay = Duration::from_millis(base + jitter);
            warn!(
                "tool '{}' failed (attempt {}/{}), retrying in {:?}",
                call.name, attempts, max_attempts, delay
            );
            tokio::select! {
                () = ctx.cancel.cancelled() => {
                    outcome = ToolOutcome::failure(
                        FailureKind::Cancelled,
                        format!("tool '{}' cancelled during retry backoff", call.name),
                    );
                    break;
                }
                () = tokio::time::sleep(delay) => {}
            }
            outcome = self.execute_attempt(call, ctx).await;
            attempts += 1;
        }

        DispatchRecord {
            id: call.id.clone(),
            name: call.name.clone(),
            outcome,
            attempts,
        }
    }

    /// One attempt: run the tool in a spawned task with a deadline, converting
    /// timeout, panic, and cancellation into failure values.
    async fn execute_attempt(&self, call: &ToolCallRequest, ctx: &ExecutionContext) -> ToolOutcome {
        let deadline = self
            .registry
            .get(&call.name)
            .and_then(|t| t.execution_timeout())
            .unwrap_or_else(|| self.config.timeout());

        let registry = self.registry.clone();
        let name = call.name.clone();
        let args = call.arguments.clone();
        let task_ctx = ctx.clone();
        // Spawned so a panicking handler is isolated and surfaces as a
        // JoinError instead of unwinding through the dispatcher.
        let mut handle = tokio::task::spawn(async move {
            tokio::time::timeout(deadline, registry.execute(&name, args, &task_ctx)).await
        });

        tokio::select! {
            () = ctx.cancel.cancelled() => {
                handle.abort();
                ToolOutcome::failure(
                    FailureKind::Cancelled,
                    format!("tool '{}' cancelled by deadline", call.name),
                )
            }
            join = &mut handle => match join {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_elapsed)) => {
                    warn!("tool '{}' timed out after {:?}", call.name, deadline);
                    ToolOutcome::failure(
                        FailureKind::Timeout,
                        format!("tool '{}' timed out after {}s", call.name, deadline.as_secs()),
                    )
                }
                Err(join_err) => {
                    if join_err.is_panic() {
                        let payload = join_err.into_panic();
                        let panic_msg = payload
                            .downcast_ref::<String>()
                            .map(String::as_str)
                            .or_else(|| payload.downcast_ref::<&str>().copied())
                            .unwrap_or("unknown cause");
                        error!("tool '{}' panicked: {}", call.name, panic_msg);
                        ToolOutcome::failure(
                            FailureKind::Internal,
                            format!("tool '{}' crashed: {}", call.name, panic_msg),
                        )
                    } else {
                        ToolOutcome::failure(
                            FailureKind::Cancelled,
                            format!("tool '{}' was cancelled", call.name),
                        )
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
