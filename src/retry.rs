//! Bounded retry with exponential backoff for remote calls.
//!
//! Used by the load-balancer engine for every Linode call and by the CSR
//! approver for the approval update. Only errors that report themselves as
//! [`Retryable`] are retried; everything else (not-found included) is
//! returned after the first attempt.

use std::{fmt::Display, future::Future, time::Duration};

use thiserror::Error;
use tokio::sync::watch;

/// Classifies errors into transient (retry) and permanent (give up).
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for kube::Error {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Api(response) => response.code == 429 || response.code >= 500,
            Self::HyperError(_) | Self::Service(_) => true,
            _ => false,
        }
    }
}

/// Outcome of a failed retried call. Every variant carries the last error.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("{0}")]
    Permanent(E),
    #[error("gave up after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: E },
    #[error("stopped after {attempts} attempts: {error}")]
    Cancelled { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    /// The last error, unchanged.
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(error)
            | Self::Exhausted { error, .. }
            | Self::Cancelled { error, .. } => error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, the first call included.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    stop: Option<watch::Receiver<bool>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
            max_delay: Duration::from_secs(10),
            multiplier: 2,
            stop: None,
        }
    }

    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Stop retrying once the channel flips to `true`.
    /// The signal is checked between attempts only.
    #[must_use]
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Delay before the retry that follows `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Run `operation`, logging every retry at debug level.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.run_observed(
            |attempt, err: &E| {
                tracing::debug!(
                    operation,
                    attempt,
                    error = %err,
                    "Remote call failed, retrying"
                );
            },
            op,
        )
        .await
    }

    /// Run `operation`, calling `on_retry` with the failed attempt number and
    /// its error before each retry. The observer cannot change control flow.
    pub async fn run_observed<T, E, F, Fut, O>(
        &self,
        mut on_retry: O,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
        O: FnMut(u32, &E),
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !error.is_retryable() {
                return Err(RetryError::Permanent(error));
            }
            if attempt >= attempts {
                return Err(RetryError::Exhausted { attempts: attempt, error });
            }
            on_retry(attempt, &error);
            if self.pause(self.delay_for(attempt)).await {
                return Err(RetryError::Cancelled { attempts: attempt, error });
            }
        }
    }

    /// Sleep for `delay`. Returns `true` when the stop signal fired instead.
    async fn pause(&self, delay: Duration) -> bool {
        let Some(stop) = &self.stop else {
            tokio::time::sleep(delay).await;
            return false;
        };
        let mut stop = stop.clone();
        if *stop.borrow_and_update() {
            return true;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => false,
            stopped = async { stop.wait_for(|stopped| *stopped).await.is_ok() } => {
                if stopped {
                    true
                } else {
                    // Sender is gone, nobody can stop us anymore.
                    tokio::time::sleep(delay).await;
                    false
                }
            }
        }
    }
}
