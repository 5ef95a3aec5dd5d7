//! Retry-then-fail policy shared by every engine.
//!
//! A failing database call is retried in place with a fixed back-off. When
//! the budget is spent the last error is returned with context, and the
//! caller propagates it to the top of its engine, which ends the process.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;

pub const DEFAULT_RETRY_BUDGET: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// How many attempts an operation gets and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub budget: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: DEFAULT_RETRY_BUDGET,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(budget: u32, backoff: Duration) -> Self {
        Self {
            budget: budget.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds or the budget is exhausted.
    pub async fn run<T, F, Fut>(&self, what: impl Display, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let budget = self.budget.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("{what} succeeded after {attempt} attempts");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < budget => {
                    tracing::warn!(
                        "{what} failed (attempt {attempt}/{budget}): {e:#}. Retrying in {:?}...",
                        self.backoff
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("{what} failed after {budget} attempts"));
                }
            }
        }
    }
}
