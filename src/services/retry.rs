use anyhow::{anyhow, Error, Result};
use log::warn;
use std::future::Future;
use tokio::time::{sleep, Duration};

/// Result of a single attempt against a collaborator that signals
/// warm-up and throttling instead of failing outright.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Ready(T),
    /// The remote model is still loading.
    Loading,
    RateLimited,
    Failed(Error),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub loading_backoff: Duration,
    pub rate_limit_backoff: Duration,
}

impl RetryPolicy {
    /// Rate limiting waits twice as long as a loading model.
    pub fn from_backoff(max_attempts: u32, backoff_seconds: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            loading_backoff: Duration::from_secs(backoff_seconds),
            rate_limit_backoff: Duration::from_secs(backoff_seconds * 2),
        }
    }
}

#[derive(Debug)]
pub struct RetryReport<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Runs `op` until it returns `Ready`, fails hard, or the attempt cap is hit.
/// Only `Loading` and `RateLimited` are retried.
pub async fn run_with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> RetryReport<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
{
    let mut attempts = 0;

    while attempts < policy.max_attempts {
        attempts += 1;

        let backoff = match op(attempts).await {
            AttemptOutcome::Ready(value) => {
                return RetryReport {
                    result: Ok(value),
                    attempts,
                }
            }
            AttemptOutcome::Failed(e) => {
                return RetryReport {
                    result: Err(e.context(format!("{} failed on attempt {}", label, attempts))),
                    attempts,
                }
            }
            AttemptOutcome::Loading => {
                warn!("{} is still loading (attempt {}/{})", label, attempts, policy.max_attempts);
                policy.loading_backoff
            }
            AttemptOutcome::RateLimited => {
                warn!("{} rate limited (attempt {}/{})", label, attempts, policy.max_attempts);
                policy.rate_limit_backoff
            }
        };

        if attempts < policy.max_attempts {
            sleep(backoff).await;
        }
    }

    RetryReport {
        result: Err(anyhow!("{} still unavailable after {} attempts", label, attempts)),
        attempts,
    }
}
