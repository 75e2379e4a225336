use std::time::Duration;

use rand::Rng;

use crate::jobs::error_codes::ErrorCode;

/// Exponential backoff with jitter, used when a worker loop reconnects.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_millis: u64,
    pub max_millis: u64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_millis: 500,
            max_millis: 10_000,
            jitter_pct: 0.20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

pub fn classify_error(code: &str) -> ErrorClass {
    match ErrorCode::from_str(code) {
        ErrorCode::BadPayload | ErrorCode::Validation => ErrorClass::NonRetryable,
        _ => ErrorClass::Retryable,
    }
}

pub fn next_delay(attempt_no: u32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let attempt_no = attempt_no.max(1);

    // exponent = attempt_no - 1
    let exp = attempt_no.saturating_sub(1);

    // 2^exp, saturating; the cap below handles huge values
    let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);

    let delay = cfg.base_millis.saturating_mul(pow2).min(cfg.max_millis);

    // jitter in range [-jitter_pct, +jitter_pct]
    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay as f64 + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(cfg.max_millis))
}

/// Consecutive-failure counter feeding [`next_delay`].
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    cfg: RetryConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(cfg: RetryConfig) -> Self {
        Self { cfg, failures: 0 }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record one failure and return how long to wait before the next try.
    pub fn next(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        next_delay(self.failures, &self.cfg, &mut rand::thread_rng())
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// What the parent does when its current sub-job ends FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reset the parent and drive the whole sub-pipeline again.
    Restart,
    /// Fail the parent with the given code.
    Fail(ErrorCode),
}

/// Bounded full-restart policy for parent jobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub bound: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { bound: 5 }
    }
}

impl RetryPolicy {
    pub fn new(bound: i32) -> Self {
        Self {
            bound: bound.max(1),
        }
    }

    /// `attempt` is the parent's current `attempt_count` (1 on the first run).
    pub fn decide(&self, child_error_code: Option<&str>, attempt: i32) -> RetryDecision {
        let code = child_error_code.unwrap_or("UNKNOWN");
        if classify_error(code) == ErrorClass::NonRetryable {
            return RetryDecision::Fail(ErrorCode::StageFailed);
        }
        if attempt < self.bound {
            RetryDecision::Restart
        } else {
            RetryDecision::Fail(ErrorCode::RetriesExhausted)
        }
    }
}
