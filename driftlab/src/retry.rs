//! Bounded exponential-backoff retry for fallible, rate-limited external
//! calls.
//!
//! The controller knows nothing about the error it is retrying: the caller
//! supplies a pure classifier over a closed set of error kinds. That keeps
//! one controller reusable for both LLM calls and tool invocations.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Backoff parameters for one family of external calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 3 means up to 4 attempts total.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// How a classifier judges one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Transient; safe to retry with backoff.
    Retriable,
    /// Malformed request, authorization failure, or similar; propagate now.
    Fatal,
}

/// Terminal outcome of a retried call.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: Display> {
    #[error("{0}")]
    Fatal(E),
    #[error("exhausted retries after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E: Display> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Invoke `op`, retrying failures the classifier marks retriable with delay
/// `min(initial_delay * 2^attempt, max_delay)` plus random jitter in
/// `[0, delay/4]`. Fatal failures and exhausted retries propagate
/// immediately. Every attempt is logged with its number and delay.
pub async fn call_with_retry<T, E, Op, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    mut op: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorDisposition,
    E: Display,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt = attempt + 1, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => match classify(&err) {
                ErrorDisposition::Fatal => {
                    tracing::warn!(attempt = attempt + 1, error = %err, "fatal error, not retrying");
                    return Err(RetryError::Fatal(err));
                }
                ErrorDisposition::Retriable if attempt >= policy.max_retries => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %err,
                        "retries exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }
                ErrorDisposition::Retriable => {
                    let delay = backoff_delay(policy, attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retriable error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            },
        }
    }
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponential = policy
        .initial_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let capped = exponential.min(policy.max_delay);
    let jitter_bound = (capped / 4).as_nanos() as u64;
    let jitter = if jitter_bound == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(rand::thread_rng().gen_range(0..=jitter_bound))
    };
    capped + jitter
}
