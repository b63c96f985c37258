use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration. All limits have the orchestration defaults baked
/// in, so an empty TOML document yields a fully working config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub subagents: SubagentLimits,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field sanity checks that serde defaults can't express.
    pub fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == 0 {
            anyhow::bail!("agent.maxIterations must be at least 1");
        }
        if self.agent.max_verify_attempts == 0 {
            anyhow::bail!("agent.maxVerifyAttempts must be at least 1");
        }
        if self.dispatch.max_concurrent == 0 {
            anyhow::bail!("dispatch.maxConcurrent must be at least 1");
        }
        if self.subagents.max_concurrent == 0 {
            anyhow::bail!("subagents.maxConcurrent must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.compaction.threshold_fraction) {
            anyhow::bail!("compaction.thresholdFraction must be within [0, 1]");
        }
        if self.compaction.keep_recent == 0 {
            anyhow::bail!("compaction.keepRecent must be at least 1");
        }
        Ok(())
    }
}

/// Controller limits for one conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum controller iterations per turn (model call + tool round).
    #[serde(default = "default_max_iterations", rename = "maxIterations")]
    pub max_iterations: usize,
    /// Verification attempts per turn, counting the first attempt.
    #[serde(default = "default_max_verify_attempts", rename = "maxVerifyAttempts")]
    pub max_verify_attempts: usize,
    /// Hard wall-clock bound for the whole turn, in seconds.
    #[serde(default = "default_turn_timeout_secs", rename = "turnTimeoutSecs")]
    pub turn_timeout_secs: u64,
    #[serde(default = "default_max_tokens", rename = "maxTokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Model name passed to the provider; `None` uses the provider default.
    #[serde(default)]
    pub model: Option<String>,
    /// Registry name of the tool routed to the subagent orchestrator.
    #[serde(default = "default_research_tool", rename = "researchTool")]
    pub research_tool: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_verify_attempts: default_max_verify_attempts(),
            turn_timeout_secs: default_turn_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            model: None,
            research_tool: default_research_tool(),
        }
    }
}

impl AgentConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

fn default_max_iterations() -> usize {
    10
}

fn default_max_verify_attempts() -> usize {
    3
}

fn default_turn_timeout_secs() -> u64 {
    300
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.7
}

fn default_research_tool() -> String {
    "research".to_string()
}

/// Tool dispatcher limits: per-call timeout, batch concurrency, retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Per-tool-call timeout in seconds (tools may override upward or downward).
    #[serde(default = "default_tool_timeout_secs", rename = "timeoutSecs")]
    pub timeout_secs: u64,
    /// Maximum concurrently executing tool calls within one batch.
    #[serde(default = "default_dispatch_concurrent", rename = "maxConcurrent")]
    pub max_concurrent: usize,
    /// Total attempts per retryable call, counting the first.
    #[serde(default = "default_dispatch_attempts", rename = "maxAttempts")]
    pub max_attempts: usize,
    #[serde(default = "default_initial_backoff_ms", rename = "initialBackoffMs")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms", rename = "maxBackoffMs")]
    pub max_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            max_concurrent: default_dispatch_concurrent(),
            max_attempts: default_dispatch_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_dispatch_concurrent() -> usize {
    5
}

fn default_dispatch_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

/// Subagent orchestrator limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentLimits {
    /// Concurrently executing subagents; excess tasks queue.
    #[serde(default = "default_subagent_concurrent", rename = "maxConcurrent")]
    pub max_concurrent: usize,
    /// Wall-clock deadline per subagent, in seconds.
    #[serde(default = "default_subagent_deadline_secs", rename = "deadlineSecs")]
    pub deadline_secs: u64,
    /// Result-size cap in estimated tokens; oversized results are summarized.
    #[serde(default = "default_subagent_result_tokens", rename = "maxResultTokens")]
    pub max_result_tokens: usize,
    /// Iteration budget for the nested loop (smaller than the parent's).
    #[serde(default = "default_subagent_iterations", rename = "maxIterations")]
    pub max_iterations: usize,
}

impl Default for SubagentLimits {
    fn default() -> Self {
        Self {
            max_concurrent: default_subagent_concurrent(),
            deadline_secs: default_subagent_deadline_secs(),
            max_result_tokens: default_subagent_result_tokens(),
            max_iterations: default_subagent_iterations(),
        }
    }
}

impl SubagentLimits {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

fn default_subagent_concurrent() -> usize {
    3
}

fn default_subagent_deadline_secs() -> u64 {
    60
}

fn default_subagent_result_tokens() -> usize {
    2000
}

fn default_subagent_iterations() -> usize {
    6
}

/// Context compaction thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Model context budget the threshold fraction applies to.
    #[serde(default = "default_context_budget", rename = "contextBudgetTokens")]
    pub context_budget_tokens: usize,
    /// Fraction of the budget at which compaction triggers.
    #[serde(default = "default_threshold_fraction", rename = "thresholdFraction")]
    pub threshold_fraction: f64,
    /// Most recent messages always preserved verbatim.
    #[serde(default = "default_keep_recent", rename = "keepRecent")]
    pub keep_recent: usize,
    /// Model used for the summarization call; `None` uses the provider default.
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            context_budget_tokens: default_context_budget(),
            threshold_fraction: default_threshold_fraction(),
            keep_recent: default_keep_recent(),
            model: None,
        }
    }
}

impl CompactionConfig {
    /// Token count at which compaction triggers.
    pub fn threshold_tokens(&self) -> usize {
        (self.context_budget_tokens as f64 * self.threshold_fraction) as usize
    }
}

fn default_true() -> bool {
    true
}

fn default_context_budget() -> usize {
    100_000
}

fn default_threshold_fraction() -> f64 {
    0.75
}

fn default_keep_recent() -> usize {
    5
}

/// Verifier rules and semantic-judge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default = "default_min_chars", rename = "minChars")]
    pub min_chars: usize,
    #[serde(default = "default_max_chars", rename = "maxChars")]
    pub max_chars: usize,
    /// Extra forbidden regex patterns, merged with the built-in set.
    #[serde(default, rename = "forbiddenPatterns")]
    pub forbidden_patterns: Vec<String>,
    /// Whether the semantic judge runs for high-stakes requests.
    #[serde(default = "default_true", rename = "semanticEnabled")]
    pub semantic_enabled: bool,
    /// Cheaper judge model; `None` uses the provider default.
    #[serde(default, rename = "judgeModel")]
    pub judge_model: Option<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
            forbidden_patterns: vec![],
            semantic_enabled: true,
            judge_model: None,
        }
    }
}

fn default_min_chars() -> usize {
    1
}

fn default_max_chars() -> usize {
    20_000
}

#[cfg(test)]
mod tests;
