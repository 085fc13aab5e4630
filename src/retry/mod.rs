//! Retry policies for agent work.
//!
//! Two independent policies and one kill switch:
//!
//! - **Rate-limit backoff** wraps a single agent call. A failed call whose
//!   output looks like a rate limit is repeated after `min(2^n, cap)` seconds,
//!   up to a bounded number of times. Nothing else is retried here.
//! - **Feature retry** belongs to the pipeline: any validation failure waits
//!   a fixed minimum delay and rebuilds the same feature on a reset branch.
//! - **Credit exhaustion** in a failed call's output halts the whole run.

use crate::agent::{Agent, AgentOutput, AgentRequest};
use crate::project_config::RetrySection;
use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::warn;

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate.?limit|\b429\b|too many requests|overloaded|capacity").unwrap()
});

// A bare 429 is a rate limit; it only signals exhaustion next to payment words.
static CREDIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)insufficient_quota|quota exceeded|payment required|\b402\b|billing|credit|\b429\b[^\n]{0,60}(?:payment|billing|credit|quota)",
    )
    .unwrap()
});

/// Whether agent output looks like a rate-limit or overload rejection.
pub fn is_rate_limited(output: &str) -> bool {
    RATE_LIMIT_RE.is_match(output)
}

/// The billing/quota indicator found in `output`, if any.
pub fn detect_credit_exhaustion(output: &str) -> Option<String> {
    CREDIT_RE.find(output).map(|m| m.as_str().to_string())
}

/// Delay before rate-limit retry number `attempt` (1-based): `min(2^attempt, cap)`.
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(cap)
}

/// Resolved retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Feature retries after the first attempt
    pub max_retries: u32,
    pub min_retry_delay: Duration,
    pub rate_limit_max_retries: u32,
    pub backoff_cap: Duration,
    pub failure_context_chars: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            min_retry_delay: Duration::from_secs(section.min_retry_delay_secs),
            rate_limit_max_retries: section.rate_limit_max_retries,
            backoff_cap: Duration::from_secs(section.backoff_cap_secs),
            failure_context_chars: section.failure_context_chars,
        }
    }
}

impl RetryPolicy {
    /// Whether a feature whose attempt `attempt` (0-based) failed gets another.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    pub fn backoff(&self) -> BackoffController {
        BackoffController::new(self.rate_limit_max_retries, self.backoff_cap)
    }
}

/// Result of an agent call made through [`BackoffController`].
#[derive(Debug, Clone)]
pub struct BackoffOutcome {
    /// Output of the last call made
    pub output: AgentOutput,
    /// Delays slept before each retry, in order
    pub delays: Vec<Duration>,
    /// The last call was still rate limited when retries ran out
    pub exhausted: bool,
    /// Billing/quota indicator in a failed call; no retry follows it
    pub credit_exhausted: Option<String>,
}

impl BackoffOutcome {
    pub fn retries(&self) -> usize {
        self.delays.len()
    }
}

/// Repeats rate-limited agent calls with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct BackoffController {
    max_retries: u32,
    cap: Duration,
}

impl BackoffController {
    pub fn new(max_retries: u32, cap: Duration) -> Self {
        Self { max_retries, cap }
    }

    pub async fn invoke(
        &self,
        agent: &dyn Agent,
        request: &AgentRequest,
    ) -> Result<BackoffOutcome> {
        let mut delays = Vec::new();
        let mut attempt = 0u32;

        loop {
            let output = agent.invoke(request).await?;

            if output.success() {
                return Ok(BackoffOutcome {
                    output,
                    delays,
                    exhausted: false,
                    credit_exhausted: None,
                });
            }

            if let Some(matched) = detect_credit_exhaustion(&output.text) {
                return Ok(BackoffOutcome {
                    output,
                    delays,
                    exhausted: false,
                    credit_exhausted: Some(matched),
                });
            }

            if !is_rate_limited(&output.text) {
                return Ok(BackoffOutcome {
                    output,
                    delays,
                    exhausted: false,
                    credit_exhausted: None,
                });
            }

            if attempt >= self.max_retries {
                warn!(retries = self.max_retries, "Still rate limited after all retries");
                return Ok(BackoffOutcome {
                    output,
                    delays,
                    exhausted: true,
                    credit_exhausted: None,
                });
            }

            attempt += 1;
            let delay = backoff_delay(attempt, self.cap);
            warn!(
                attempt,
                max = self.max_retries,
                delay_secs = delay.as_secs(),
                "Rate limit detected, backing off"
            );
            tokio::time::sleep(delay).await;
            delays.push(delay);
        }
    }
}

/// Mechanical evidence gathered after an attempt without a success signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttemptEvidence {
    /// 0-based attempt number
    pub attempt: u32,
    pub head_advanced: bool,
    pub tree_clean: bool,
    pub build_passed: bool,
    pub test_passed: bool,
}

/// Whether a retry that never claimed success actually succeeded.
///
/// Only retries qualify; the first attempt must signal. The branch must
/// have moved past the attempt's starting commit, leave no uncommitted
/// changes, and pass build and test.
pub fn infer_success(evidence: &AttemptEvidence) -> bool {
    evidence.attempt > 0
        && evidence.head_advanced
        && evidence.tree_clean
        && evidence.build_passed
        && evidence.test_passed
}

/// Per-feature retry bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 0-based attempt currently running
    pub attempt: u32,
    /// Commit the feature started from; every retry resets to it
    pub start_sha: String,
    /// Tail of the previous attempt's failure output
    pub last_failure: Option<String>,
}

impl RetryContext {
    pub fn new(start_sha: impl Into<String>) -> Self {
        Self {
            attempt: 0,
            start_sha: start_sha.into(),
            last_failure: None,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 0
    }

    /// Record a failure and move to the next attempt, keeping the last
    /// `max_chars` characters of `output` for the next prompt.
    pub fn advance(&mut self, output: &str, max_chars: usize) {
        self.last_failure = Some(tail_chars(output, max_chars));
        self.attempt += 1;
    }
}

/// Last `max_chars` characters of `text`, on a char boundary.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedAgent;
    use tempfile::tempdir;

    #[test]
    fn test_rate_limit_patterns() {
        assert!(is_rate_limited("Error: Rate limit exceeded"));
        assert!(is_rate_limited("HTTP 429"));
        assert!(is_rate_limited("Too Many Requests"));
        assert!(is_rate_limited("API is overloaded"));
        assert!(is_rate_limited("server at capacity"));
        assert!(is_rate_limited("ratelimit hit"));
        assert!(!is_rate_limited("Connection timeout"));
        assert!(!is_rate_limited("error at line 4290"));
    }

    #[test]
    fn test_credit_patterns() {
        assert_eq!(
            detect_credit_exhaustion("Error: insufficient_quota reached").as_deref(),
            Some("insufficient_quota")
        );
        assert!(detect_credit_exhaustion("402 Payment Required").is_some());
        assert!(detect_credit_exhaustion("billing issue detected").is_some());
        assert!(detect_credit_exhaustion("credit limit exceeded").is_some());
        assert!(detect_credit_exhaustion("Quota exceeded for org").is_some());
        assert!(detect_credit_exhaustion("429: payment method declined").is_some());
        assert!(detect_credit_exhaustion("429 Too Many Requests").is_none());
        assert!(detect_credit_exhaustion("Connection timeout").is_none());
        assert!(detect_credit_exhaustion("").is_none());
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(1, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, cap), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, cap), Duration::from_secs(32));
        assert_eq!(backoff_delay(6, cap), cap);
        assert_eq!(backoff_delay(200, cap), cap);
    }

    #[test]
    fn test_policy_from_section() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.min_retry_delay, Duration::from_secs(30));
        assert!(policy.allows_retry(0));
        assert!(!policy.allows_retry(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_n_rate_limits_then_success() {
        let dir = tempdir().unwrap();
        let agent = ScriptedAgent::new()
            .respond("429 rate limit", 1)
            .respond("Too many requests", 1)
            .respond("overloaded", 1)
            .respond("FEATURE_BUILT: A", 0);
        let controller = BackoffController::new(5, Duration::from_secs(60));

        let outcome = controller
            .invoke(&agent, &AgentRequest::new("p", dir.path()))
            .await
            .unwrap();

        assert!(outcome.output.success());
        assert_eq!(outcome.retries(), 3);
        assert_eq!(
            outcome.delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
        assert!(outcome.delays.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(agent.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhaustion() {
        let dir = tempdir().unwrap();
        let agent = ScriptedAgent::new()
            .respond("rate limit", 1)
            .respond("rate limit", 1)
            .respond("rate limit", 1);
        let controller = BackoffController::new(2, Duration::from_secs(3));

        let outcome = controller
            .invoke(&agent, &AgentRequest::new("p", dir.path()))
            .await
            .unwrap();

        assert!(outcome.exhausted);
        assert_eq!(
            outcome.delays,
            vec![Duration::from_secs(2), Duration::from_secs(3)]
        );
        assert_eq!(agent.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failure_not_retried() {
        let dir = tempdir().unwrap();
        let agent = ScriptedAgent::new()
            .respond("BUILD_FAILED: syntax error", 1)
            .respond("never used", 0);
        let outcome = BackoffController::new(5, Duration::from_secs(60))
            .invoke(&agent, &AgentRequest::new("p", dir.path()))
            .await
            .unwrap();
        assert!(!outcome.output.success());
        assert_eq!(outcome.retries(), 0);
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credit_exhaustion_stops_retries() {
        let dir = tempdir().unwrap();
        let agent = ScriptedAgent::new()
            .respond("rate limit", 1)
            .respond("Error: insufficient_quota", 1)
            .respond("never used", 0);
        let outcome = BackoffController::new(5, Duration::from_secs(60))
            .invoke(&agent, &AgentRequest::new("p", dir.path()))
            .await
            .unwrap();
        assert_eq!(outcome.credit_exhausted.as_deref(), Some("insufficient_quota"));
        assert_eq!(agent.calls(), 2);
        assert_eq!(agent.remaining(), 1);
    }

    #[test]
    fn test_infer_success_requires_everything() {
        let all = AttemptEvidence {
            attempt: 1,
            head_advanced: true,
            tree_clean: true,
            build_passed: true,
            test_passed: true,
        };
        assert!(infer_success(&all));
        assert!(!infer_success(&AttemptEvidence { attempt: 0, ..all }));
        assert!(!infer_success(&AttemptEvidence {
            head_advanced: false,
            ..all
        }));
        assert!(!infer_success(&AttemptEvidence {
            tree_clean: false,
            ..all
        }));
        assert!(!infer_success(&AttemptEvidence {
            test_passed: false,
            ..all
        }));
    }

    #[test]
    fn test_retry_context_advance_truncates() {
        let mut ctx = RetryContext::new("abc");
        assert!(!ctx.is_retry());
        ctx.advance("0123456789", 4);
        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.last_failure.as_deref(), Some("6789"));
        assert_eq!(tail_chars("héllo", 10), "héllo");
        assert_eq!(tail_chars("héllo", 4), "éllo");
    }
}
