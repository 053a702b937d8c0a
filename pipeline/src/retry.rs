use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

/// Maps the number of retries already made for a record to whether another one is allowed.
///
/// Implementations must be pure: the same `attempt` always yields the same decision.
pub trait RetryPolicy: Send + Sync {
    fn decide(&self, attempt: u32) -> RetryDecision;
}

// 고정 간격 백오프. max_attempts는 첫 시도 이후의 재시도 횟수다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackOff {
    delay: Duration,
    max_attempts: u32,
}

impl FixedBackOff {
    pub const fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl RetryPolicy for FixedBackOff {
    fn decide(&self, attempt: u32) -> RetryDecision {
        RetryDecision {
            retry: attempt < self.max_attempts,
            delay: self.delay,
        }
    }
}

/// Per-record retry bookkeeping. Lives only while one record is being processed.
#[derive(Debug, Default)]
pub struct RetryState {
    attempt: u32,
    first_failure: Option<Instant>,
    last_error: Option<String>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries made so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Handler invocations made so far, the first try included.
    pub fn attempts_made(&self) -> u32 {
        self.attempt.saturating_add(1)
    }

    pub fn record_failure(&mut self, error: &anyhow::Error) {
        self.first_failure.get_or_insert_with(Instant::now);
        self.last_error = Some(format!("{:#}", error));
    }

    pub fn advance(&mut self) {
        self.attempt += 1;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn first_failure(&self) -> Option<Instant> {
        self.first_failure
    }

    pub fn failing_for(&self) -> Duration {
        self.first_failure
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }
}
