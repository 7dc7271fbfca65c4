//! Fixed-delay retry for store file I/O.
//!
//! Two call sites use this: the atomic save (`save_retry_count` attempts,
//! `save_retry_delay` apart) and reading a store file at startup
//! (`max_retries` attempts, `retry_delay` apart). Both use a fixed delay.
//!
//! Sleeping goes through [`Sleeper`] so tests can record delays instead of
//! waiting.
//!
//! ```rust,ignore
//! let policy = RetryPolicy::store_load(&config);
//! let bytes = with_retry(&policy, &TokioSleeper, |e: &io::Error| e.kind() != NotFound, || {
//!     tokio::fs::read(&path)
//! })
//! .await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::StorageConfig;

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// `attempts` tries, `delay` apart.
    #[must_use]
    pub fn fixed(delay: Duration, attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Policy for the atomic save of a store file.
    #[must_use]
    pub fn store_save(config: &StorageConfig) -> Self {
        Self::fixed(config.save_retry_delay(), config.save_retry_count())
    }

    /// Policy for reading a store file during initialization.
    #[must_use]
    pub fn store_load(config: &StorageConfig) -> Self {
        Self::fixed(config.retry_delay(), config.max_retries())
    }

}

/// Final result plus how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    /// Wall time on the tokio clock, pauses included.
    pub elapsed: Duration,
}

/// Run `operation` until it succeeds, fails with an error `retryable`
/// rejects, or attempts run out.
pub async fn with_retry<T, E, F, Fut, S, P>(
    policy: &RetryPolicy,
    sleeper: &S,
    retryable: P,
    operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    S: Sleeper,
    P: Fn(&E) -> bool,
{
    with_retry_outcome(policy, sleeper, retryable, operation)
        .await
        .result
}

/// [`with_retry`], also reporting the attempt count.
pub async fn with_retry_outcome<T, E, F, Fut, S, P>(
    policy: &RetryPolicy,
    sleeper: &S,
    retryable: P,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    S: Sleeper,
    P: Fn(&E) -> bool,
{
    let started = tokio::time::Instant::now();
    let limit = policy.attempts.max(1);
    let mut attempts = 0u32;

    let result = loop {
        attempts += 1;
        let err = match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(attempts, "I/O succeeded after retrying");
                }
                break Ok(value);
            }
            Err(err) => err,
        };

        if !retryable(&err) {
            debug!(attempt = attempts, error = %err, "Error is not retryable");
            break Err(err);
        }
        if attempts >= limit {
            warn!(attempt = attempts, error = %err, "Giving up after final attempt");
            break Err(err);
        }

        let pause = policy.delay;
        debug!(
            attempt = attempts,
            pause_ms = pause.as_millis() as u64,
            error = %err,
            "Attempt failed; retrying"
        );
        sleeper.sleep(pause).await;
    };

    RetryOutcome {
        result,
        attempts,
        elapsed: started.elapsed(),
    }
}
