//! Reconnect Policy
//!
//! Exponential backoff with jitter applied when a coordination session has
//! to be re-established. Attempts are bounded by `max_retries` (0 means
//! unbounded) and abort as soon as the owning component is stopped.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;
use crate::error::{Error, Result};
use crate::lifecycle::Done;

/// Backoff state for one reconnect episode
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_retries: u32,
    attempt: u32,
}

impl Backoff {
    /// Create a fresh backoff from the reconnect configuration
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: config.initial_backoff(),
            max: config.max_backoff(),
            max_retries: config.max_retries,
            attempt: 0,
        }
    }

    /// Failed attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, `None` once retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_retries > 0 && self.attempt >= self.max_retries {
            return None;
        }

        let exp = self.attempt.min(16);
        self.attempt += 1;

        let ceiling = self.initial.saturating_mul(1u32 << exp).min(self.max);
        let floor = ceiling / 2;
        let ms = rand::thread_rng().gen_range(floor.as_millis()..=ceiling.as_millis());
        Some(Duration::from_millis(ms as u64))
    }

    /// Start over after a successful attempt
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, the
/// backoff gives up, or `done` fires.
pub async fn with_backoff<T, F, Fut>(
    config: &ReconnectConfig,
    done: &Done,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(config);

    loop {
        if done.is_done() {
            return Err(Error::ShuttingDown);
        }

        let err = match op(backoff.attempts() + 1).await {
            Ok(value) => {
                if backoff.attempts() > 0 {
                    tracing::info!("{} succeeded after {} retries", what, backoff.attempts());
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if done.is_done() {
            return Err(Error::ShuttingDown);
        }
        if !err.is_retryable() {
            return Err(err);
        }

        let delay = match backoff.next_delay() {
            Some(delay) => delay,
            None => {
                tracing::error!("{} failed: {}. Giving up", what, err);
                return Err(Error::ReconnectExhausted {
                    attempts: backoff.attempts(),
                });
            }
        };

        tracing::warn!(
            "{} failed (attempt {}): {}. Retrying in {:?}",
            what,
            backoff.attempts(),
            err,
            delay
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = done.wait() => return Err(Error::ShuttingDown),
        }
    }
}
