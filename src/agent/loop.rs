use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use futures_util::future::BoxFuture;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::compaction::Compactor;
use crate::agent::conversation::Conversation;
use crate::agent::dispatch::ToolDispatcher;
use crate::agent::subagent::{parse_research_tasks, SubagentOrchestrator};
use crate::agent::tools::base::ExecutionContext;
use crate::agent::tools::registry::ToolRegistry;
use crate::agent::verify::{RequestProfile, VerificationOutcome, Verifier};
use crate::config::Config;
use crate::errors::{self, IronloomError};
use crate::providers::base::{
    Block, ChatRequest, FailureKind, LLMProvider, Message, RetryConfig, ToolCallRequest,
    ToolOutcome,
};
use crate::trace::TraceSink;

/// Fixed text returned when a turn exhausts its verification or iteration
/// budget. Deliberately static so a broken model can never smuggle an
/// unvalidated answer through the failure path.
pub const DEGRADED_RESPONSE: &str = "I wasn't able to produce an answer that passes validation \
for this request. Please try rephrasing or narrowing it.";

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\d+\]|https?://[^\s)\]]+").expect("static pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Gather,
    Act,
    Verify,
    Done,
    TerminalFailure,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gather => "gather",
            Self::Act => "act",
            Self::Verify => "verify",
            Self::Done => "done",
            Self::TerminalFailure => "terminal_failure",
        }
    }
}

/// One entry per dispatched tool call, kept for the final response.
#[derive(Debug, Clone)]
pub struct ToolTraceEntry {
    pub id: String,
    pub name: String,
    pub success: bool,
    pub attempts: usize,
}

#[derive(Debug, Clone)]
pub struct FinalResponse {
    pub text: String,
    pub citations: Vec<String>,
    pub tool_trace: Vec<ToolTraceEntry>,
    pub verification: Option<VerificationOutcome>,
    /// True when this is the fixed terminal-failure text, not a model answer.
    pub degraded: bool,
}

/// Progress notifications, delivered fire-and-forget. A closed or absent
/// receiver never affects the turn.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    PhaseChanged { phase: &'static str, iteration: usize },
    ModelResponded { tool_calls: usize },
    ToolStarted { id: String, name: String },
    ToolFinished { name: String, success: bool },
    SubagentsFinished { total: usize, succeeded: usize },
    Compacted { replaced_messages: usize },
    /// Validated answer text. Emitted as one chunk; providers here are not
    /// streaming, so the chunk carries the whole answer.
    TextChunk { text: String },
    Verified { passed: bool, attempt: usize },
    /// Last event of every turn that produces a response.
    Final { degraded: bool },
}

pub struct LoopConfig {
    pub provider: Arc<dyn LLMProvider>,
    pub registry: Arc<ToolRegistry>,
    pub config: Config,
    pub subagents: Option<Arc<SubagentOrchestrator>>,
    pub compactor: Option<Arc<Compactor>>,
    pub verifier: Arc<Verifier>,
    pub trace: Arc<dyn TraceSink>,
    pub events: Option<UnboundedSender<AgentEvent>>,
}

pub struct RunOptions {
    pub profile: RequestProfile,
    /// Hard wall-clock bound for this turn; `None` uses the configured value.
    pub deadline: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            profile: RequestProfile::default(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// The per-turn state machine: GATHER issues a model call, ACT settles any
/// tool use, VERIFY validates candidate text. Sequential within a turn;
/// concurrency lives entirely inside the dispatcher and orchestrator.
pub struct AgentLoop {
    provider: Arc<dyn LLMProvider>,
    dispatcher: ToolDispatcher,
    registry: Arc<ToolRegistry>,
    config: Config,
    subagents: Option<Arc<SubagentOrchestrator>>,
    compactor: Option<Arc<Compactor>>,
    verifier: Arc<Verifier>,
    trace: Arc<dyn TraceSink>,
    events: Option<UnboundedSender<AgentEvent>>,
}

impl AgentLoop {
    pub fn new(cfg: LoopConfig) -> Self {
        let dispatcher = ToolDispatcher::new(cfg.registry.clone(), cfg.config.dispatch.clone());
        Self {
            provider: cfg.provider,
            dispatcher,
            registry: cfg.registry,
            config: cfg.config,
            subagents: cfg.subagents,
            compactor: cfg.compactor,
            verifier: cfg.verifier,
            trace: cfg.trace,
            events: cfg.events,
        }
    }

    /// Run one conversational turn to completion. Fatal provider errors
    /// (auth, quota) abort with `Err`; every other exhaustion path resolves
    /// to a degraded `FinalResponse`.
    ///
    /// Boxed: subagent tasks run nested loops, so the future type refers to
    /// itself and must be erased for the compiler to prove it `Send`.
    pub fn run(
        &self,
        conversation: Conversation,
        options: RunOptions,
    ) -> BoxFuture<'_, Result<FinalResponse, IronloomError>> {
        Box::pin(self.run_inner(conversation, options))
    }

    async fn run_inner(
        &self,
        conversation: Conversation,
        options: RunOptions,
    ) -> Result<FinalResponse, IronloomError> {
        let deadline = options
            .deadline
            .unwrap_or_else(|| self.config.agent.turn_timeout());
        let cancel = options.cancel.child_token();
        let span = self.trace.start_span(
            "turn",
            serde_json::json!({
                "deadline_secs": deadline.as_secs(),
                "started_at": chrono::Utc::now().to_rfc3339(),
            }),
        );

        let result = tokio::time::timeout(
            deadline,
            self.run_turn(conversation, &options.profile, &cancel),
        )
        .await;

        match result {
            Ok(Ok(response)) => {
                self.trace
                    .end_span(span, if response.degraded { "degraded" } else { "done" });
                self.emit(AgentEvent::Final {
                    degraded: response.degraded,
                });
                Ok(response)
            }
            Ok(Err(e)) => {
                self.trace.end_span(span, "error");
                Err(e)
            }
            Err(_elapsed) => {
                cancel.cancel();
                warn!("turn exceeded its {deadline:?} hard bound");
                self.trace.end_span(span, "timeout");
                let response = self.degraded(Vec::new(), None);
                self.emit(AgentEvent::Final { degraded: true });
                Ok(response)
            }
        }
    }

    async fn run_turn(
        &self,
        mut conversation: Conversation,
        profile: &RequestProfile,
        cancel: &CancellationToken,
    ) -> Result<FinalResponse, IronloomError> {
        let invocation_id = Uuid::new_v4().to_string();
        let mut tool_trace: Vec<ToolTraceEntry> = Vec::new();
        let mut verify_attempts = 0usize;
        let mut used_call_ids: HashSet<String> = conversation
            .messages()
            .iter()
            .flat_map(|m| m.tool_uses().map(|(id, _)| id.to_string()))
            .collect();

        for iteration in 1..=self.config.agent.max_iterations {
            if cancel.is_cancelled() {
                return Err(IronloomError::Cancelled("turn cancelled".to_string()));
            }
            self.emit(AgentEvent::PhaseChanged {
                phase: Phase::Gather.as_str(),
                iteration,
            });
            let gather_span = self
                .trace
                .start_span("gather", serde_json::json!({ "iteration": iteration }));

            self.compact_if_needed(&mut conversation, cancel).await;

            debug_assert!(conversation.pairing_ok());
            let response = match self.model_call(&conversation, cancel).await {
                Ok(response) => {
                    self.trace.end_span(gather_span, "ok");
                    response
                }
                Err(e) if errors::is_fatal(&e) => {
                    self.trace.end_span(gather_span, "error");
                    return Err(into_ironloom(e));
                }
                Err(e) => {
                    self.trace.end_span(gather_span, "error");
                    warn!("model call exhausted retries: {e:#}");
                    return Ok(self.degraded(tool_trace, None));
                }
            };
            self.emit(AgentEvent::ModelResponded {
                tool_calls: response.tool_calls.len(),
            });

            if response.has_tool_calls() {
                self.emit(AgentEvent::PhaseChanged {
                    phase: Phase::Act.as_str(),
                    iteration,
                });
                let act_span = self.trace.start_span(
                    "act",
                    serde_json::json!({
                        "iteration": iteration,
                        "tool_calls": response.tool_calls.len(),
                    }),
                );
                let calls = sanitize_call_ids(response.tool_calls.clone(), &mut used_call_ids);
                conversation.push(Message::assistant(response.content.clone(), &calls));
                let blocks = self
                    .settle_tool_calls(&calls, &invocation_id, cancel, &mut tool_trace)
                    .await;
                conversation.push(Message::tool_results(blocks));
                self.trace.end_span(act_span, "ok");
                continue;
            }

            let candidate = response.content_text();
            conversation.push(Message::assistant_text(candidate.clone()));

            self.emit(AgentEvent::PhaseChanged {
                phase: Phase::Verify.as_str(),
                iteration,
            });
            verify_attempts += 1;
            let verify_span = self.trace.start_span(
                "verify",
                serde_json::json!({ "iteration": iteration, "attempt": verify_attempts }),
            );
            let outcome = self
                .verifier
                .verify(&candidate, profile, verify_attempts, cancel.clone())
                .await;
            self.trace
                .end_span(verify_span, if outcome.passed { "passed" } else { "failed" });
            self.emit(AgentEvent::Verified {
                passed: outcome.passed,
                attempt: outcome.attempt,
            });

            if outcome.passed {
                info!("turn complete after {iteration} iteration(s)");
                self.emit(AgentEvent::TextChunk {
                    text: candidate.clone(),
                });
                self.emit(AgentEvent::PhaseChanged {
                    phase: Phase::Done.as_str(),
                    iteration,
                });
                return Ok(FinalResponse {
                    citations: extract_citations(&candidate),
                    text: candidate,
                    tool_trace,
                    verification: Some(outcome),
                    degraded: false,
                });
            }
            if verify_attempts >= self.config.agent.max_verify_attempts {
                warn!("verification budget exhausted after {verify_attempts} attempt(s)");
                return Ok(self.degraded(tool_trace, Some(outcome)));
            }
            conversation.push(Message::user(format!(
                "Your previous answer was rejected: {}. Revise it and answer again.",
                outcome.feedback
            )));
        }

        warn!(
            "iteration budget of {} exhausted without a final answer",
            self.config.agent.max_iterations
        );
        Ok(self.degraded(tool_trace, None))
    }

    /// Produce exactly one result block per tool call, in call order. Research
    /// calls are routed to the orchestrator; everything else goes through the
    /// dispatcher as one bounded batch.
    async fn settle_tool_calls(
        &self,
        calls: &[ToolCallRequest],
        invocation_id: &str,
        cancel: &CancellationToken,
        tool_trace: &mut Vec<ToolTraceEntry>,
    ) -> Vec<Block> {
        for call in calls {
            self.emit(AgentEvent::ToolStarted {
                id: call.id.clone(),
                name: call.name.clone(),
            });
        }
        let research_tool = self.config.agent.research_tool.as_str();
        let (research, regular): (Vec<_>, Vec<_>) = calls
            .iter()
            .partition(|call| self.subagents.is_some() && call.name == research_tool);

        let mut settled: HashMap<String, ToolOutcome> = HashMap::new();

        for call in research {
            let outcome = self.settle_research_call(call, cancel).await;
            tool_trace.push(ToolTraceEntry {
                id: call.id.clone(),
                name: call.name.clone(),
                success: outcome.is_success(),
                attempts: 1,
            });
            settled.insert(call.id.clone(), outcome);
        }

        if !regular.is_empty() {
            let batch: Vec<ToolCallRequest> = regular.into_iter().cloned().collect();
            let ctx = ExecutionContext::new(invocation_id, cancel.clone());
            let aggregated = self.dispatcher.execute_batch(&batch, &ctx).await;
            for record in aggregated.records {
                self.emit(AgentEvent::ToolFinished {
                    name: record.name.clone(),
                    success: record.outcome.is_success(),
                });
                tool_trace.push(ToolTraceEntry {
                    id: record.id.clone(),
                    name: record.name,
                    success: record.outcome.is_success(),
                    attempts: record.attempts,
                });
                settled.insert(record.id, record.outcome);
            }
        }

        calls
            .iter()
            .map(|call| Block::ToolResult {
                tool_use_id: call.id.clone(),
                outcome: settled.remove(&call.id).unwrap_or_else(|| {
                    ToolOutcome::failure(
                        FailureKind::Internal,
                        format!("no outcome recorded for call '{}'", call.id),
                    )
                }),
            })
            .collect()
    }

    async fn settle_research_call(
        &self,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let Some(orchestrator) = &self.subagents else {
            return ToolOutcome::failure(
                FailureKind::NotFound,
                "research is not available in this context",
            );
        };
        let tasks = match parse_research_tasks(&call.arguments, orchestrator.limits()) {
            Ok(tasks) => tasks,
            Err(message) => {
                return ToolOutcome::failure(FailureKind::InvalidArguments, message);
            }
        };
        let results = orchestrator.spawn(tasks, cancel).await;
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        self.emit(AgentEvent::SubagentsFinished {
            total: results.len(),
            succeeded,
        });
        ToolOutcome::success(SubagentOrchestrator::aggregate(&results))
    }

    async fn model_call(
        &self,
        conversation: &Conversation,
        cancel: &CancellationToken,
    ) -> anyhow::Result<crate::providers::base::LLMResponse> {
        let request = ChatRequest {
            messages: conversation.messages().to_vec(),
            tools: Some(self.registry.tool_definitions()),
            model: self.config.agent.model.as_deref(),
            max_tokens: self.config.agent.max_tokens,
            temperature: self.config.agent.temperature,
        };
        self.provider
            .chat_with_retry(request, Some(RetryConfig::default()), cancel.clone())
            .await
    }

    /// Compaction is best-effort: a failed summarization leaves the history
    /// untouched and the turn continues with the full context.
    async fn compact_if_needed(&self, conversation: &mut Conversation, cancel: &CancellationToken) {
        let Some(compactor) = &self.compactor else {
            return;
        };
        match compactor
            .maybe_compact(conversation, &self.config.compaction, cancel.clone())
            .await
        {
            Ok(Some(checkpoint)) => {
                self.emit(AgentEvent::Compacted {
                    replaced_messages: checkpoint.cutoff_index,
                });
            }
            Ok(None) => {}
            Err(e) => warn!("compaction failed, continuing uncompacted: {e:#}"),
        }
    }

    fn degraded(
        &self,
        tool_trace: Vec<ToolTraceEntry>,
        verification: Option<VerificationOutcome>,
    ) -> FinalResponse {
        self.emit(AgentEvent::PhaseChanged {
            phase: Phase::TerminalFailure.as_str(),
            iteration: 0,
        });
        FinalResponse {
            text: DEGRADED_RESPONSE.to_string(),
            citations: Vec::new(),
            tool_trace,
            verification,
            degraded: true,
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Model output is untrusted: a response may reuse a tool-use id, within
/// itself or across iterations, which would break the use/result pairing.
/// Colliding ids are rewritten to fresh unique ones before entering the
/// conversation.
fn sanitize_call_ids(
    mut calls: Vec<ToolCallRequest>,
    used: &mut HashSet<String>,
) -> Vec<ToolCallRequest> {
    for call in &mut calls {
        if !used.insert(call.id.clone()) {
            let fresh = format!("{}-{}", call.id, Uuid::new_v4());
            warn!(
                "model reused tool call id '{}', rewriting to '{}'",
                call.id, fresh
            );
            used.insert(fresh.clone());
            call.id = fresh;
        }
    }
    calls
}

fn extract_citations(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for m in CITATION_RE.find_iter(text) {
        let citation = m.as_str().to_string();
        if !seen.contains(&citation) {
            seen.push(citation);
        }
    }
    seen
}

fn into_ironloom(err: anyhow::Error) -> IronloomError {
    match err.downcast::<IronloomError>() {
        Ok(e) => e,
        Err(e) => IronloomError::Internal(e),
    }
}
