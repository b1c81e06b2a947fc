//! Decision Execution Pipeline
//!
//! Safety layers between "the optimizer wants a change" and "the ledger is
//! written": the should-act gate, per-invoice rate limiting, retry with
//! exponential backoff for transient failures, and the cycle-level circuit
//! breaker. Rate-limit and circuit-open skips are deliberate no-ops, kept
//! distinguishable from genuine errors.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::ledger::LedgerWriter;
use crate::models::{ExecutionReceipt, Strategy};

/// Extra confidence demanded when moving to a strictly riskier strategy.
const RISKIER_MOVE_MARGIN: f64 = 10.0;

/// The should-act gate: converts "recommended != current" plus confidence
/// into a binding action decision.
pub fn should_act(
    current: Strategy,
    recommended: Strategy,
    confidence: f64,
    min_confidence: f64,
) -> bool {
    if current == recommended {
        return false;
    }
    if confidence < min_confidence {
        return false;
    }
    if recommended.is_riskier_than(current) {
        return confidence >= min_confidence + RISKIER_MOVE_MARGIN;
    }
    true
}

/// Message-based transient classification. Contract-level rejections fall
/// through and are surfaced immediately.
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    const TRANSIENT_MARKERS: &[&str] = &[
        "network",
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "dns",
        "rate limit",
        "too many requests",
        "unavailable",
        "502",
        "503",
        "504",
    ];
    TRANSIENT_MARKERS.iter().any(|m| msg.contains(m))
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            max_attempts: cfg.retry_max_attempts,
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // min(base * 2^(attempt-1), max)
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Write a decision with bounded retry. Only transient-classified failures
/// are retried; rejections surface as a failed receipt on first sight.
pub async fn record_with_retry(
    writer: &Arc<dyn LedgerWriter>,
    token_id: &str,
    strategy: Strategy,
    confidence: f64,
    reasoning: &str,
    policy: RetryPolicy,
) -> ExecutionReceipt {
    let mut attempt = 1u32;
    loop {
        match writer
            .record_decision(token_id, strategy, confidence, reasoning)
            .await
        {
            Ok(receipt) => {
                if attempt > 1 {
                    info!(token_id, attempt, "ledger write succeeded after retry");
                }
                return receipt;
            }
            Err(e) => {
                let transient = is_transient_error(&e);
                if !transient || attempt >= policy.max_attempts {
                    if transient {
                        warn!(token_id, attempt, error = %e, "ledger write exhausted retries");
                    } else {
                        warn!(token_id, error = %e, "ledger write rejected; not retrying");
                    }
                    return ExecutionReceipt::failed(e.to_string());
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    token_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient ledger failure; backing off"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ============================================================================
// Per-invoice rate limiting
// ============================================================================

/// Maps token id to the instant of its last analysis. Pruned periodically so
/// the table does not grow with every invoice ever seen.
#[derive(Debug, Default)]
pub struct RateLimitTable {
    entries: HashMap<String, Instant>,
}

impl RateLimitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true (and stamps the entry) when the token may be analyzed;
    /// false when it is still inside the cooldown window.
    pub fn try_acquire(&mut self, token_id: &str, cooldown: Duration) -> bool {
        let now = Instant::now();
        if let Some(last) = self.entries.get(token_id) {
            if now.duration_since(*last) < cooldown {
                return false;
            }
        }
        self.entries.insert(token_id.to_string(), now);
        true
    }

    /// Drop entries idle for several cooldown windows.
    pub fn prune(&mut self, cooldown: Duration) {
        let horizon = cooldown.saturating_mul(4);
        let now = Instant::now();
        self.entries
            .retain(|_, last| now.duration_since(*last) < horizon);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Cycle-level circuit breaker
// ============================================================================

#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub consecutive_failures: u32,
    pub open: bool,
    pub reset_in_ms: Option<u64>,
}

/// Counts consecutive cycle failures; opens after `threshold` and skips
/// whole cycles until the cooldown elapses. Expiry auto-closes the breaker
/// and zeroes the counter, as does any successful cycle.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            open_until: None,
        }
    }

    /// True when cycles must be skipped. Auto-closes once the reset
    /// deadline has passed.
    pub fn is_open(&mut self) -> bool {
        match self.open_until {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    info!("circuit breaker cooldown elapsed; closing");
                    self.open_until = None;
                    self.consecutive_failures = 0;
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold && self.open_until.is_none() {
            warn!(
                failures = self.consecutive_failures,
                cooldown_sec = self.cooldown.as_secs(),
                "circuit breaker opened"
            );
            self.open_until = Some(Instant::now() + self.cooldown);
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        BreakerSnapshot {
            consecutive_failures: self.consecutive_failures,
            open: self.open_until.map(|d| d > now).unwrap_or(false),
            reset_in_ms: self
                .open_until
                .filter(|d| *d > now)
                .map(|d| d.duration_since(now).as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[test]
    fn should_act_false_when_unchanged() {
        for s in [Strategy::Hold, Strategy::Conservative, Strategy::Aggressive] {
            for c in [0.0, 50.0, 100.0] {
                assert!(!should_act(s, s, c, 70.0));
            }
        }
    }

    #[test]
    fn should_act_respects_min_confidence() {
        assert!(!should_act(Strategy::Aggressive, Strategy::Hold, 69.9, 70.0));
        assert!(should_act(Strategy::Aggressive, Strategy::Hold, 70.0, 70.0));
    }

    #[test]
    fn riskier_moves_need_the_extra_margin() {
        // Hold -> Aggressive is a riskier move: needs min + 10.
        assert!(!should_act(Strategy::Hold, Strategy::Aggressive, 75.0, 70.0));
        assert!(!should_act(Strategy::Hold, Strategy::Aggressive, 79.9, 70.0));
        assert!(should_act(Strategy::Hold, Strategy::Aggressive, 80.0, 70.0));
        // Safer move at exactly min is fine.
        assert!(should_act(Strategy::Aggressive, Strategy::Conservative, 70.0, 70.0));
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient_error(&anyhow!("request timed out")));
        assert!(is_transient_error(&anyhow!("ledger unavailable (503): busy")));
        assert!(is_transient_error(&anyhow!("dns resolution failed")));
        assert!(is_transient_error(&anyhow!("429 Too Many Requests")));
        assert!(!is_transient_error(&anyhow!("ledger rejected: strategy guard")));
        assert!(!is_transient_error(&anyhow!("missing token id")));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(3_000),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3_000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(3_000));
    }

    struct FlakyWriter {
        failures_left: Mutex<u32>,
        failure_message: &'static str,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl LedgerWriter for FlakyWriter {
        async fn record_decision(
            &self,
            _token_id: &str,
            _strategy: Strategy,
            _confidence: f64,
            _reasoning: &str,
        ) -> Result<ExecutionReceipt> {
            *self.calls.lock() += 1;
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(anyhow!("{}", self.failure_message));
            }
            Ok(ExecutionReceipt::succeeded("ref-2"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_after_base_delay() {
        let writer: Arc<dyn LedgerWriter> = Arc::new(FlakyWriter {
            failures_left: Mutex::new(1),
            failure_message: "connection refused",
            calls: Mutex::new(0),
        });
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
        };

        let start = Instant::now();
        let receipt =
            record_with_retry(&writer, "5", Strategy::Conservative, 80.0, "r", policy).await;

        assert!(receipt.success);
        assert_eq!(receipt.reference.as_deref(), Some("ref-2"));
        // One backoff of exactly the base delay elapsed (paused clock).
        assert!(start.elapsed() >= Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let writer = Arc::new(FlakyWriter {
            failures_left: Mutex::new(10),
            failure_message: "ledger rejected: strategy guard",
            calls: Mutex::new(0),
        });
        let as_writer: Arc<dyn LedgerWriter> = writer.clone();
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        };

        let receipt = record_with_retry(&as_writer, "5", Strategy::Hold, 90.0, "r", policy).await;
        assert!(!receipt.success);
        assert!(receipt.error.unwrap().contains("rejected"));
        assert_eq!(*writer.calls.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_bounded_by_max_attempts() {
        let writer = Arc::new(FlakyWriter {
            failures_left: Mutex::new(10),
            failure_message: "timeout",
            calls: Mutex::new(0),
        });
        let as_writer: Arc<dyn LedgerWriter> = writer.clone();
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };

        let receipt = record_with_retry(&as_writer, "5", Strategy::Hold, 90.0, "r", policy).await;
        assert!(!receipt.success);
        assert_eq!(*writer.calls.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_blocks_inside_cooldown() {
        let mut table = RateLimitTable::new();
        let cooldown = Duration::from_secs(300);

        assert!(table.try_acquire("5", cooldown));
        assert!(!table.try_acquire("5", cooldown));
        // Different token is unaffected.
        assert!(table.try_acquire("6", cooldown));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(table.try_acquire("5", cooldown));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_rate_limit_entries_are_pruned() {
        let mut table = RateLimitTable::new();
        let cooldown = Duration::from_secs(300);
        assert!(table.try_acquire("5", cooldown));
        assert_eq!(table.len(), 1);

        tokio::time::advance(Duration::from_secs(300 * 4 + 1)).await;
        table.prune(cooldown);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_after_threshold_and_auto_closes() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(breaker.snapshot().open);

        // Still open before the deadline.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.is_open());

        // Expiry closes it and zeroes the counter.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
        breaker.record_failure();
        assert!(!breaker.is_open());
    }
}
