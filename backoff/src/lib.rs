//! Bounded retries with jittered exponential backoff.
//!
//! Transient failures (throttling, timeouts, temporary unavailability)
//! are retried up to a budget; anything else terminates the loop
//! immediately. The caller supplies the transience classifier so each
//! transport keeps its own contract.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use observability_deps::tracing::{debug, warn};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Exponential backoff with ±10% jitter, capped per sleep.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Sleep before the first retry.
    pub init_backoff: Duration,
    /// Per-sleep ceiling.
    pub max_backoff: Duration,
    /// Multiplier applied between attempts.
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        }
    }
}

/// Error returned by [`Backoff::retry`].
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// The operation failed with an error outside the transient set.
    #[error("'{task_name}' failed permanently on attempt {attempts}: {source}")]
    Permanent {
        task_name: String,
        attempts: usize,
        #[source]
        source: E,
    },

    /// The operation kept failing transiently until the budget ran out.
    #[error("'{task_name}' exhausted its retry budget after {attempts} attempts: {source}")]
    RetriesExceeded {
        task_name: String,
        attempts: usize,
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// The error from the final attempt.
    pub fn into_source(self) -> E {
        match self {
            Self::Permanent { source, .. } => source,
            Self::RetriesExceeded { source, .. } => source,
        }
    }

    pub fn attempts(&self) -> usize {
        match self {
            Self::Permanent { attempts, .. } => *attempts,
            Self::RetriesExceeded { attempts, .. } => *attempts,
        }
    }
}

/// Carries the sleep state of one retry loop.
#[derive(Debug)]
pub struct Backoff {
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            next_backoff_secs: config.init_backoff.as_secs_f64(),
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
        }
    }

    /// Returns the next sleep and advances the exponent. The jittered
    /// value never exceeds the per-sleep ceiling.
    pub fn next_sleep(&mut self) -> Duration {
        let capped = self.next_backoff_secs.min(self.max_backoff_secs);
        self.next_backoff_secs = self.next_backoff_secs * self.base;

        let jittered = capped * rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64(jittered.min(self.max_backoff_secs))
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or
    /// the budget of `max_retries` *additional* attempts is spent. Total
    /// attempts are therefore bounded by `max_retries + 1`.
    pub async fn retry<T, E, F, Fut, C>(
        &mut self,
        task_name: &str,
        max_retries: usize,
        is_transient: C,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        self.retry_with_cancel(task_name, max_retries, is_transient, || false, op)
            .await
    }

    /// Like [`retry`](Self::retry), but consults `is_cancelled` between
    /// attempts: the in-flight attempt always completes, and once
    /// cancellation is observed no fresh retry is started.
    pub async fn retry_with_cancel<T, E, F, Fut, C, X>(
        &mut self,
        task_name: &str,
        max_retries: usize,
        is_transient: C,
        is_cancelled: X,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        X: Fn() -> bool,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(v) => {
                    if attempts > 1 {
                        debug!(task_name, attempts, "succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) if !is_transient(&e) => {
                    return Err(RetryError::Permanent {
                        task_name: task_name.to_string(),
                        attempts,
                        source: e,
                    });
                }
                Err(e) if attempts > max_retries || is_cancelled() => {
                    if attempts <= max_retries {
                        debug!(task_name, attempts, "cancelled; not retrying");
                    }
                    return Err(RetryError::RetriesExceeded {
                        task_name: task_name.to_string(),
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    let sleep = self.next_sleep();
                    warn!(
                        task_name,
                        attempt = attempts,
                        sleep_ms = sleep.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off",
                    );
                    tokio::time::sleep(sleep).await;
                }
            }
        }
    }
}
