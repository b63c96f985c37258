use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::agent_loop::{AgentLoop, LoopConfig, RunOptions};
use crate::agent::compaction::{estimate_tokens, Compactor, CHARS_PER_TOKEN_ESTIMATE};
use crate::agent::conversation::Conversation;
use crate::agent::tools::base::{ExecutionContext, Tool};
use crate::agent::tools::registry::ToolRegistry;
use crate::agent::verify::{RequestProfile, Verifier};
use crate::config::{Config, SubagentLimits};
use crate::errors::IronloomError;
use crate::providers::base::{
    ChatRequest, FailureKind, LLMProvider, Message, RetryConfig, ToolOutcome,
};
use crate::trace::TraceSink;

#[derive(Debug, Clone)]
pub struct TaskBudget {
    pub max_tokens: usize,
    pub max_duration: Duration,
}

/// One unit of delegated work. Deliberately carries no parent messages, only
/// an explicitly authored context string, so a subagent can never observe or
/// mutate the parent conversation.
#[derive(Debug, Clone)]
pub struct SubagentTask {
    pub instructions: String,
    pub curated_context: String,
    pub budget: TaskBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentStatus {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct SubagentResult {
    pub task_index: usize,
    pub instructions: String,
    pub status: SubagentStatus,
    /// Findings on success, error note otherwise.
    pub content: String,
}

impl SubagentResult {
    pub fn is_success(&self) -> bool {
        self.status == SubagentStatus::Completed
    }
}

#[derive(Debug, Deserialize)]
struct ResearchTaskArgs {
    instructions: String,
    #[serde(default)]
    context: String,
}

#[derive(Debug, Deserialize)]
struct ResearchArgs {
    tasks: Vec<ResearchTaskArgs>,
}

/// Parse the arguments of a research tool call into tasks, applying the
/// configured budgets. Empty task lists are rejected so the model gets
/// actionable feedback instead of a silent no-op.
pub fn parse_research_tasks(
    args: &Value,
    limits: &SubagentLimits,
) -> Result<Vec<SubagentTask>, String> {
    let parsed: ResearchArgs =
        serde_json::from_value(args.clone()).map_err(|e| format!("invalid research call: {e}"))?;
    if parsed.tasks.is_empty() {
        return Err("research call must include at least one task".to_string());
    }
    Ok(parsed
        .tasks
        .into_iter()
        .map(|t| SubagentTask {
            instructions: t.instructions,
            curated_context: t.context,
            budget: TaskBudget {
                max_tokens: limits.max_result_tokens,
                max_duration: limits.deadline(),
            },
        })
        .collect())
}

/// Marker tool advertised to the model. The controller intercepts calls to it
/// by name and routes them to the orchestrator, so its handler only fires if
/// something dispatches it directly.
pub struct ResearchTool;

#[async_trait]
impl Tool for ResearchTool {
    fn name(&self) -> &str {
        "research"
    }

    fn description(&self) -> &str {
        "Delegate independent research questions to parallel subagents. Each task \
         gets its own isolated loop and returns a summary of findings."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "instructions": { "type": "string" },
                            "context": { "type": "string" }
                        },
                        "required": ["instructions"]
                    }
                }
            },
            "required": ["tasks"]
        })
    }

    async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> ToolOutcome {
        ToolOutcome::failure(
            FailureKind::Internal,
            "research calls are routed by the controller, not dispatched directly",
        )
    }
}

/// Runs isolated child loops for delegated tasks under a concurrency bound
/// and per-task deadline, then folds their outcomes into one context block.
pub struct SubagentOrchestrator {
    provider: Arc<dyn LLMProvider>,
    registry: Arc<ToolRegistry>,
    config: Config,
    verifier: Arc<Verifier>,
    trace: Arc<dyn TraceSink>,
    semaphore: Arc<Semaphore>,
}

impl SubagentOrchestrator {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        registry: Arc<ToolRegistry>,
        config: Config,
        trace: Arc<dyn TraceSink>,
    ) -> Result<Self, IronloomError> {
        let verifier = Arc::new(Verifier::new(
            config.verifier.clone(),
            Some(provider.clone()),
        )?);
        let permits = config.subagents.max_concurrent.max(1);
        Ok(Self {
            provider,
            registry,
            config,
            verifier,
            trace,
            semaphore: Arc::new(Semaphore::new(permits)),
        })
    }

    pub fn limits(&self) -> &SubagentLimits {
        &self.config.subagents
    }

    /// Run every task to completion. All-settled: a failed or timed-out task
    /// becomes an error result and never cancels its siblings. Results come
    /// back in task order.
    pub async fn spawn(
        &self,
        tasks: Vec<SubagentTask>,
        cancel: &CancellationToken,
    ) -> Vec<SubagentResult> {
        info!("spawning {} subagent task(s)", tasks.len());
        let handles: Vec<_> = tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| {
                let semaphore = self.semaphore.clone();
                let runner = self.task_runner(index, task);
                let cancel = cancel.child_token();
                tokio::task::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return runner.closed_result(),
                    };
                    runner.run(cancel).await
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, joined)| {
                joined.unwrap_or_else(|e| SubagentResult {
                    task_index: index,
                    instructions: String::new(),
                    status: SubagentStatus::Failed,
                    content: format!("subagent task crashed: {e}"),
                })
            })
            .collect()
    }

    fn task_runner(&self, index: usize, task: SubagentTask) -> TaskRunner {
        // Child loops get a tighter iteration budget and no orchestrator of
        // their own, so delegation bottoms out at depth one.
        let mut config = self.config.clone();
        config.agent.max_iterations = self.config.subagents.max_iterations;
        TaskRunner {
            index,
            task,
            provider: self.provider.clone(),
            registry: self.registry.clone(),
            config,
            verifier: self.verifier.clone(),
            trace: self.trace.clone(),
        }
    }

    /// Merge results into one structured block for the parent's next model
    /// call, keeping failures visible instead of silently dropping them.
    pub fn aggregate(results: &[SubagentResult]) -> String {
        let mut available = String::new();
        let mut unavailable = String::new();
        for result in results {
            let line = format!(
                "### Task {}: {}\n{}\n\n",
                result.task_index + 1,
                result.instructions,
                result.content
            );
            if result.is_success() {
                available.push_str(&line);
            } else {
                unavailable.push_str(&line);
            }
        }

        let mut out = String::new();
        out.push_str("## Available findings\n\n");
        if available.is_empty() {
            out.push_str("(none)\n\n");
        } else {
            out.push_str(&available);
        }
        out.push_str("## Unavailable\n\n");
        if unavailable.is_empty() {
            out.push_str("(none)\n");
        } else {
            out.push_str(&unavailable);
        }
        out
    }
}

struct TaskRunner {
    index: usize,
    task: SubagentTask,
    provider: Arc<dyn LLMProvider>,
    registry: Arc<ToolRegistry>,
    config: Config,
    verifier: Arc<Verifier>,
    trace: Arc<dyn TraceSink>,
}

impl TaskRunner {
    async fn run(self, cancel: CancellationToken) -> SubagentResult {
        let deadline = self.task.budget.max_duration;
        let result = tokio::time::timeout(deadline, self.run_inner(&cancel)).await;
        match result {
            Ok(done) => done,
            Err(_elapsed) => {
                cancel.cancel();
                warn!("subagent task {} exceeded its {deadline:?} deadline", self.index);
                SubagentResult {
                    task_index: self.index,
                    instructions: self.task.instructions,
                    status: SubagentStatus::TimedOut,
                    content: format!("task exceeded its {}s deadline", deadline.as_secs()),
                }
            }
        }
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> SubagentResult {
        let agent_loop = AgentLoop::new(LoopConfig {
            provider: self.provider.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            subagents: None,
            compactor: Some(Arc::new(Compactor::new(self.provider.clone()))),
            verifier: self.verifier.clone(),
            trace: self.trace.clone(),
            events: None,
        });

        // A fresh conversation per task: the isolated loop only ever sees the
        // instructions and the curated context string.
        let mut conversation = Conversation::new();
        let mut seed = self.task.instructions.clone();
        if !self.task.curated_context.is_empty() {
            seed.push_str("\n\nContext:\n");
            seed.push_str(&self.task.curated_context);
        }
        conversation.push(Message::user(seed));

        // The outer timeout in `run` owns the wall-clock deadline; the nested
        // loop keeps its configured bound so the two never race.
        let options = RunOptions {
            profile: RequestProfile::default(),
            deadline: None,
            cancel: cancel.clone(),
        };

        match agent_loop.run(conversation, options).await {
            // A degraded child answer is not a finding; report it as a
            // failure so the parent never synthesizes from filler text.
            Ok(response) if response.degraded => SubagentResult {
                task_index: self.index,
                instructions: self.task.instructions.clone(),
                status: SubagentStatus::Failed,
                content: "task failed: could not produce a validated result".to_string(),
            },
            Ok(response) => {
                let content = self.cap_result(response.text, cancel).await;
                SubagentResult {
                    task_index: self.index,
                    instructions: self.task.instructions.clone(),
                    status: SubagentStatus::Completed,
                    content,
                }
            }
            Err(e) => SubagentResult {
                task_index: self.index,
                instructions: self.task.instructions.clone(),
                status: SubagentStatus::Failed,
                content: format!("task failed: {e}"),
            },
        }
    }

    /// Enforce the result-size cap: oversized findings are condensed with one
    /// model call, falling back to hard truncation if that call fails.
    async fn cap_result(&self, text: String, cancel: &CancellationToken) -> String {
        let estimated = estimate_tokens(&Message::assistant_text(text.clone()));
        let cap = self.task.budget.max_tokens;
        if estimated <= cap {
            return text;
        }

        let prompt = format!(
            "Condense the following findings to under {cap} tokens, keeping every \
             concrete fact and figure:\n\n{text}"
        );
        let request = ChatRequest {
            messages: vec![Message::user(prompt)],
            tools: None,
            model: self.config.compaction.model.as_deref(),
            max_tokens: cap.min(u32::MAX as usize) as u32,
            temperature: 0.0,
        };
        match self
            .provider
            .chat_with_retry(request, Some(RetryConfig::default()), cancel.clone())
            .await
        {
            Ok(reply) if !reply.content_text().trim().is_empty() => reply.content_text(),
            _ => {
                warn!("subagent task {} result condensation failed, truncating", self.index);
                let max_chars = cap * CHARS_PER_TOKEN_ESTIMATE;
                let mut truncated: String = text.chars().take(max_chars).collect();
                truncated.push_str("\n[... findings truncated ...]");
                truncated
            }
        }
    }

    fn closed_result(&self) -> SubagentResult {
        SubagentResult {
            task_index: self.index,
            instructions: self.task.instructions.clone(),
            status: SubagentStatus::Failed,
            content: "orchestrator is shutting down".to_string(),
        }
    }
}
