//! Retry with capped exponential backoff.

use std::{future::Future, time::Duration};

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use bon::Builder;
use clients::ErrorKind;
use color_eyre::{Report, Result, eyre::Context};
use tracing::{debug, warn};

/// Governs how transient failures are retried.
///
/// Only failures classified [`ErrorKind::Transient`] are retried; everything
/// else is returned to the caller after the first attempt.
#[derive(Clone, Debug, Builder)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[builder(default = 5)]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[builder(default = Duration::from_millis(250))]
    pub initial_backoff: Duration,

    /// Factor applied to the delay after every retry.
    #[builder(default = 2.0)]
    pub multiplier: f64,

    /// Upper bound on any single delay.
    #[builder(default = Duration::from_secs(10))]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self::builder().max_attempts(1).build()
    }

    /// The delay schedule for one run of an operation.
    ///
    /// Delays are not jittered and never stop on elapsed time; `max_attempts`
    /// bounds the run instead.
    pub fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Whether the policy would retry this failure.
    pub fn is_retryable(report: &Report) -> bool {
        ErrorKind::of(report).is_retryable()
    }

    /// Run `operation` until it succeeds, fails with a non-transient error, or
    /// runs out of attempts.
    ///
    /// After exhaustion the last error is returned with the attempt count
    /// added as context; its classification is preserved.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut schedule = self.schedule();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation_name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !Self::is_retryable(&err) {
                debug!(operation = operation_name, attempt, error = %err, "not retryable");
                return Err(err);
            }
            let delay = match schedule.next_backoff() {
                Some(delay) if attempt < max_attempts => delay,
                _ => {
                    warn!(operation = operation_name, attempt, error = %err, "retries exhausted");
                    return Err(err).with_context(|| {
                        format!("{operation_name} failed after {attempt} attempts")
                    });
                }
            };
            warn!(
                operation = operation_name,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
