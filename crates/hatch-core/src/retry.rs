//! ---
//! hatch_section: "01-core-functionality"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Retry policy with bounded exponential backoff."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use hatch_common::config::NetworkConfig;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::{Result, UpdateError};

/// Upper bound for a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Bounded exponential backoff with jitter for network operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(network: &NetworkConfig) -> Self {
        Self::new(network.max_retries, network.retry_base_delay)
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Sleep before retry number `retry` (1-based): `base * 2^(retry-1)` plus
    /// up to half of that again as jitter, capped at [`MAX_BACKOFF`].
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exponent);
        let jitter_cap = backoff.as_millis().min(u128::from(u64::MAX)) as u64 / 2;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        backoff
            .saturating_add(Duration::from_millis(jitter))
            .min(MAX_BACKOFF)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retries are exhausted. `on_retry` sees the failed attempt number, its
    /// error and the sleep that follows.
    pub async fn run<T, F, Fut, R>(&self, cancel: &CancellationToken, mut op: F, mut on_retry: R) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(u32, &UpdateError, Duration),
    {
        let mut attempt = 1;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                outcome = op(attempt) => outcome,
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt <= self.max_retries => {
                    let delay = self.delay_for(attempt);
                    on_retry(attempt, &err, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(2000));
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(2000) && first <= Duration::from_millis(3000));
        let second = policy.delay_for(2);
        assert!(second >= Duration::from_millis(4000) && second <= Duration::from_millis(6000));
        assert_eq!(policy.delay_for(10), MAX_BACKOFF);
        assert_eq!(RetryPolicy::none().delay_for(1), Duration::ZERO);
    }

    #[tokio::test]
    async fn retries_network_errors_up_to_limit() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let result: Result<()> = policy
            .run(
                &CancellationToken::new(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(UpdateError::Network("reset".into())) }
                },
                |attempt, _, _| retries.push(attempt),
            )
            .await;
        assert!(matches!(result, Err(UpdateError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run(
                &CancellationToken::new(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(UpdateError::NotFound("nothing".into())) }
                },
                |_, _, _| {},
            )
            .await;
        assert!(matches!(result, Err(UpdateError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let value = policy
            .run(
                &CancellationToken::new(),
                |attempt| async move {
                    if attempt < 2 {
                        Err(UpdateError::Network("flaky".into()))
                    } else {
                        Ok(attempt)
                    }
                },
                |_, _, _| {},
            )
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = RetryPolicy::default()
            .run(&cancel, |_| std::future::pending(), |_, _, _| {})
            .await;
        assert!(matches!(result, Err(UpdateError::Cancelled)));
    }
}
