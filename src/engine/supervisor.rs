//! Retry with exponential backoff around a loop invocation.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use super::context::Context;
use super::Outcome;
use crate::utils::error::Result;

/// How a supervised loop is re-invoked after a retryable failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor between consecutive delays; values below 1 are treated
    /// as 1.
    pub multiplier: f64,
    /// Consecutive failures to open a session tolerated before giving up.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn never() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempts: 0,
            next: self.initial_delay.min(self.max_delay),
        }
    }
}

/// Retry state of one supervised loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
    next: Duration,
}

impl Backoff {
    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .policy
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
        {
            return None;
        }
        self.attempts += 1;
        let delay = self.next;
        let factor = self.policy.multiplier.max(1.0);
        self.next = Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .unwrap_or(self.policy.max_delay)
            .min(self.policy.max_delay);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next = self.policy.initial_delay.min(self.policy.max_delay);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Runs `run` until it completes, is cancelled or fails terminally.
///
/// Setup, declare and transport errors are retried after a backoff delay.
/// Whenever the failed attempt had got its session open the backoff starts
/// over from the initial delay, so only consecutive failures to open count
/// towards `max_attempts`. Sink and source errors are returned
/// immediately. Cancellation during the delay returns `Outcome::Cancelled`.
pub async fn supervise<F, Fut>(
    ctx: &Context,
    policy: &RetryPolicy,
    label: &str,
    mut run: F,
) -> Result<Outcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Outcome>>,
{
    let mut backoff = policy.backoff();
    loop {
        let err = match run().await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_retryable() => err,
            Err(err) => return Err(err),
        };
        if let Some(reason) = ctx.reason() {
            return Ok(Outcome::Cancelled(reason));
        }
        if err.session_opened() {
            backoff.reset();
        }
        let Some(delay) = backoff.next_delay() else {
            warn!(source = label, error = %err, attempts = backoff.attempts(), "giving up");
            return Err(err);
        };
        warn!(
            source = label,
            error = %err,
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "retrying after failure"
        );

        tokio::select! {
            biased;
            reason = ctx.cancelled() => return Ok(Outcome::Cancelled(reason)),
            _ = tokio::time::sleep(delay) => info!(source = label, "reconnecting"),
        }
    }
}
