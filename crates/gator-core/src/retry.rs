//! Generic retry-with-backoff executor used by the task scheduler and
//! anywhere an agent invocation may transiently fail.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::budget::BudgetExceededError;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// The outcome of [`execute`].
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<String>,
    pub attempts: u32,
}

/// An error raised by the wrapped closure, distinguishing budget exhaustion
/// (which must propagate immediately, bypassing retry) from anything else.
#[derive(Debug)]
pub enum RetryableError {
    Budget(BudgetExceededError),
    Other(anyhow::Error),
}

impl std::fmt::Display for RetryableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryableError::Budget(e) => write!(f, "{e}"),
            RetryableError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl From<anyhow::Error> for RetryableError {
    fn from(e: anyhow::Error) -> Self {
        RetryableError::Other(e)
    }
}

impl From<BudgetExceededError> for RetryableError {
    fn from(e: BudgetExceededError) -> Self {
        RetryableError::Budget(e)
    }
}

/// Run `fn(attempt)` up to `max_attempts` times with exponential backoff
/// (base 1s, cap 30s, full jitter) between attempts. A `RetryableError::Budget`
/// propagates on the first occurrence without consuming further attempts.
pub async fn execute<T, F, Fut>(
    description: &str,
    max_attempts: u32,
    mut f: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RetryableError>>,
{
    let mut last_error: Option<String> = None;

    for attempt in 1..=max_attempts {
        match f(attempt).await {
            Ok(result) => {
                return RetryOutcome {
                    success: true,
                    result: Some(result),
                    error: None,
                    attempts: attempt,
                };
            }
            Err(RetryableError::Budget(e)) => {
                tracing::warn!(description, attempt, "budget exceeded, aborting retry loop");
                return RetryOutcome {
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                    attempts: attempt,
                };
            }
            Err(RetryableError::Other(e)) => {
                tracing::warn!(description, attempt, error = %e, "attempt failed");
                last_error = Some(e.to_string());

                if attempt < max_attempts {
                    let delay = backoff_delay(attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    RetryOutcome {
        success: false,
        result: None,
        error: last_error,
        attempts: max_attempts,
    }
}

/// Exponential backoff with full jitter: `random(0, min(cap, base * 2^(attempt-1)))`.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
    let capped = exp.min(MAX_DELAY);
    let jittered_ms = rand::rng().random_range(0..=capped.as_millis().max(1) as u64);
    Duration::from_millis(jittered_ms)
}
