use anyhow::Result;
use regex::Regex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::VerifierConfig;
use crate::errors::IronloomError;
use crate::providers::base::{ChatRequest, LLMProvider, Message, RetryConfig};

/// Shape of the request being answered, as far as verification cares.
#[derive(Debug, Clone, Default)]
pub struct RequestProfile {
    /// Runs the semantic judge after the rule tier passes.
    pub high_stakes: bool,
    /// Requires at least one citation marker in the response.
    pub require_citations: bool,
    /// Short restatement of what the user asked, fed to the judge.
    pub request_summary: String,
}

#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub feedback: String,
    /// 1-based attempt number within the current turn.
    pub attempt: usize,
}

/// Patterns rejected in any candidate response, regardless of configuration.
/// Each entry is (pattern, feedback shown to the model).
const BUILTIN_FORBIDDEN: &[(&str, &str)] = &[
    (
        r"(?i)\bas an ai( language)? model\b",
        "response contains boilerplate self-reference",
    ),
    (
        r"(?i)\blorem ipsum\b",
        "response contains placeholder filler text",
    ),
    (
        r"\{\{[a-zA-Z_]+\}\}",
        "response contains an unexpanded template variable",
    ),
];

const JUDGE_PROMPT: &str = "You are a strict reviewer. Given a user request and a candidate \
response, decide whether the response actually answers the request, is internally consistent, \
and makes no obviously unsupported claims. Reply with exactly one line: 'VERDICT: PASS' or \
'VERDICT: FAIL - <one sentence reason>'.";

struct ForbiddenRule {
    regex: Regex,
    feedback: String,
}

/// Two-tier response validator. The rule tier is pure and synchronous; the
/// judge tier costs one model call and only runs for high-stakes requests.
pub struct Verifier {
    config: VerifierConfig,
    rules: Vec<ForbiddenRule>,
    citation_re: Regex,
    provider: Option<Arc<dyn LLMProvider>>,
}

impl Verifier {
    pub fn new(
        config: VerifierConfig,
        provider: Option<Arc<dyn LLMProvider>>,
    ) -> Result<Self, IronloomError> {
        let mut rules = Vec::new();
        for (pattern, feedback) in BUILTIN_FORBIDDEN {
            rules.push(ForbiddenRule {
                regex: compile(pattern)?,
                feedback: (*feedback).to_string(),
            });
        }
        for pattern in &config.forbidden_patterns {
            rules.push(ForbiddenRule {
                regex: compile(pattern)?,
                feedback: format!("response matches forbidden pattern '{pattern}'"),
            });
        }
        // Bracketed numeric references or bare URLs both count as citations.
        let citation_re = compile(r"\[\d+\]|https?://\S+")?;
        Ok(Self {
            config,
            rules,
            citation_re,
            provider,
        })
    }

    /// Validate a candidate response. Rules short-circuit on first failure;
    /// the judge runs only when they all pass and the request is high-stakes.
    pub async fn verify(
        &self,
        response: &str,
        profile: &RequestProfile,
        attempt: usize,
        cancel: CancellationToken,
    ) -> VerificationOutcome {
        if let Some(feedback) = self.check_rules(response, profile) {
            debug!("verification attempt {attempt} failed rules: {feedback}");
            return VerificationOutcome {
                passed: false,
                feedback,
                attempt,
            };
        }

        if profile.high_stakes && self.config.semantic_enabled {
            if let Some(provider) = &self.provider {
                return self
                    .judge(provider, response, profile, attempt, cancel)
                    .await;
            }
        }

        VerificationOutcome {
            passed: true,
            feedback: String::new(),
            attempt,
        }
    }

    fn check_rules(&self, response: &str, profile: &RequestProfile) -> Option<String> {
        let len = response.chars().count();
        if len < self.config.min_chars {
            return Some(format!(
                "response is too short ({len} chars, minimum {})",
                self.config.min_chars
            ));
        }
        if len > self.config.max_chars {
            return Some(format!(
                "response is too long ({len} chars, maximum {})",
                self.config.max_chars
            ));
        }
        for rule in &self.rules {
            if rule.regex.is_match(response) {
                return Some(rule.feedback.clone());
            }
        }
        if profile.require_citations && !self.citation_re.is_match(response) {
            return Some(
                "response must cite its sources with [n] markers or URLs".to_string(),
            );
        }
        None
    }

    async fn judge(
        &self,
        provider: &Arc<dyn LLMProvider>,
        response: &str,
        profile: &RequestProfile,
        attempt: usize,
        cancel: CancellationToken,
    ) -> VerificationOutcome {
        let prompt = format!(
            "{JUDGE_PROMPT}\n\nREQUEST:\n{}\n\nRESPONSE:\n{}",
            profile.request_summary, response
        );
        let request = ChatRequest {
            messages: vec![Message::user(prompt)],
            tools: None,
            model: self.config.judge_model.as_deref(),
            max_tokens: 256,
            temperature: 0.0,
        };

        match provider
            .chat_with_retry(request, Some(RetryConfig::default()), cancel)
            .await
        {
            Ok(reply) => parse_verdict(&reply.content_text(), attempt),
            Err(err) => {
                // The judge is advisory. Losing it degrades to a rules-only
                // pass rather than blocking an otherwise valid response.
                warn!("semantic judge unavailable, passing on rules only: {err:#}");
                VerificationOutcome {
                    passed: true,
                    feedback: "semantic check skipped: judge unavailable".to_string(),
                    attempt,
                }
            }
        }
    }
}

fn parse_verdict(reply: &str, attempt: usize) -> VerificationOutcome {
    let line = reply
        .lines()
        .find(|l| l.contains("VERDICT:"))
        .unwrap_or(reply)
        .trim();
    if line.contains("VERDICT: PASS") {
        VerificationOutcome {
            passed: true,
            feedback: String::new(),
            attempt,
        }
    } else {
        let reason = line
            .split_once('-')
            .map(|(_, r)| r.trim())
            .filter(|r| !r.is_empty())
            .unwrap_or("judge rejected the response");
        VerificationOutcome {
            passed: false,
            feedback: format!("semantic check failed: {reason}"),
            attempt,
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, IronloomError> {
    Regex::new(pattern)
        .map_err(|e| IronloomError::Config(format!("invalid verifier pattern '{pattern}': {e}")))
}
