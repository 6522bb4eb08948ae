//! Retry budgets for backend calls.
//!
//! Two failure classes are retried, each with its own counter:
//! connection failures back off exponentially, while a model that reports it
//! is still loading is retried after a fixed delay. Neither loop can consume
//! the other's budget.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use orca_config::BackendConfig;
use orca_core::{OrcaError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts for a request whose connection fails (>= 1).
    pub connect_attempts: u32,
    /// Delay after the first failed attempt; doubled after each further one.
    pub backoff_base: Duration,
    /// Extra attempts granted while the model is loading.
    pub load_retries: u32,
    /// Fixed wait between loading retries.
    pub load_delay: Duration,
    /// Overall wall-clock bound for one backend call, retries included.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BackendConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            connect_attempts: config.connect_retries.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            load_retries: config.load_retries,
            load_delay: Duration::from_millis(config.load_retry_delay_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// A policy with no waiting at all, for tests.
    pub fn immediate() -> Self {
        Self {
            backoff_base: Duration::ZERO,
            load_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Run `op` until it connects, retrying only connection-class failures.
    pub async fn send_with_retry<F, Fut>(&self, mut op: F) -> Result<reqwest::Response>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(resp) => return Ok(resp),
                Err(e) if is_connect_failure(&e) => {
                    if attempt >= self.connect_attempts {
                        return Err(OrcaError::BackendUnreachable {
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    let delay = self.backoff_for(attempt);
                    warn!(attempt, max = self.connect_attempts, ?delay, error = %e, "backend connection failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(OrcaError::Backend(e.to_string())),
            }
        }
    }

    /// Bound a whole backend call by the overall timeout.
    pub async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| OrcaError::BackendTimeout(self.timeout.as_secs()))?
    }
}

fn is_connect_failure(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout()
}

/// What a single provider round-trip produced.
#[derive(Debug)]
pub(crate) enum Attempt<T> {
    Ready(T),
    /// The provider answered, but the model is not loaded yet.
    Loading,
}

/// Repeat `op` while it reports `Loading`, using the policy's fixed delay.
pub(crate) async fn until_loaded<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    let mut reloads = 0;
    loop {
        match op().await? {
            Attempt::Ready(value) => return Ok(value),
            Attempt::Loading if reloads < policy.load_retries => {
                reloads += 1;
                warn!(
                    retry = reloads,
                    max = policy.load_retries,
                    delay = ?policy.load_delay,
                    "model is still loading, waiting before retry"
                );
                tokio::time::sleep(policy.load_delay).await;
            }
            Attempt::Loading => return Err(OrcaError::BackendLoading { attempts: reloads }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_zero_connect_retries_still_sends_once() {
        let config = BackendConfig {
            connect_retries: 0,
            ..BackendConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).connect_attempts, 1);
    }

    #[tokio::test]
    async fn test_until_loaded_succeeds_after_loading() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let out = until_loaded(&RetryPolicy::immediate(), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(Attempt::Loading)
                } else {
                    Ok(Attempt::Ready("loaded"))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, "loaded");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_until_loaded_gives_up() {
        let policy = RetryPolicy {
            load_retries: 2,
            ..RetryPolicy::immediate()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = until_loaded::<(), _, _>(&policy, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Attempt::Loading) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, OrcaError::BackendLoading { attempts: 2 }));
        // One initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let policy = RetryPolicy {
            timeout: Duration::from_millis(10),
            ..RetryPolicy::immediate()
        };
        let err = policy
            .bounded(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrcaError::BackendTimeout(_)));
    }
}
