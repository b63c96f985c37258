use super::*;

#[test]
fn empty_toml_yields_spec_defaults() {
    let config = Config::from_toml_str("").unwrap();
    assert_eq!(config.agent.max_iterations, 10);
    assert_eq!(config.agent.max_verify_attempts, 3);
    assert_eq!(config.dispatch.max_concurrent, 5);
    assert_eq!(config.dispatch.timeout_secs, 30);
    assert_eq!(config.dispatch.max_attempts, 3);
    assert_eq!(config.subagents.max_concurrent, 3);
    assert_eq!(config.subagents.deadline_secs, 60);
    assert_eq!(config.subagents.max_result_tokens, 2000);
    assert_eq!(config.compaction.keep_recent, 5);
    assert!(config.compaction.enabled);
    assert_eq!(config.agent.research_tool, "research");
}

#[test]
fn camel_case_overrides() {
    let raw = r#"
[agent]
maxIterations = 4
researchTool = "deep_research"

[dispatch]
maxConcurrent = 2
timeoutSecs = 5

[compaction]
contextBudgetTokens = 8000
thresholdFraction = 0.5
keepRecent = 3

[verifier]
maxChars = 500
forbiddenPatterns = ["(?i)lorem ipsum"]
"#;
    let config = Config::from_toml_str(raw).unwrap();
    assert_eq!(config.agent.max_iterations, 4);
    assert_eq!(config.agent.research_tool, "deep_research");
    assert_eq!(config.dispatch.max_concurrent, 2);
    assert_eq!(config.dispatch.timeout().as_secs(), 5);
    assert_eq!(config.compaction.threshold_tokens(), 4000);
    assert_eq!(config.verifier.max_chars, 500);
    assert_eq!(config.verifier.forbidden_patterns.len(), 1);
}

#[test]
fn zero_iterations_rejected() {
    let err = Config::from_toml_str("[agent]\nmaxIterations = 0\n").unwrap_err();
    assert!(err.to_string().contains("maxIterations"));
}

#[test]
fn threshold_fraction_out_of_range_rejected() {
    let err = Config::from_toml_str("[compaction]\nthresholdFraction = 1.5\n").unwrap_err();
    assert!(err.to_string().contains("thresholdFraction"));
}

#[test]
fn zero_keep_recent_rejected() {
    assert!(Config::from_toml_str("[compaction]\nkeepRecent = 0\n").is_err());
}

#[test]
fn threshold_tokens_derivation() {
    let compaction = CompactionConfig {
        context_budget_tokens: 100_000,
        threshold_fraction: 0.75,
        ..CompactionConfig::default()
    };
    assert_eq!(compaction.threshold_tokens(), 75_000);
}
