//! Bounded retry with exponential backoff around adapter invocations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapter::{FetchRequest, ProviderAdapter};
use crate::artifact::MediaArtifact;
use crate::error::FetchError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 1000,
            max_delay_ms: 8000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);

        let delay_ms = base_delay.min(self.max_delay_ms as f64) as u64;

        let final_delay = if self.use_jitter {
            // Add up to 25% jitter
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay)
    }

    /// Check if another retry should be attempted.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

/// Result of a retried fetch plus how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<MediaArtifact, FetchError>,
    pub attempts: u32,
}

/// Invoke `adapter` until it succeeds, fails permanently, or the retry
/// budget is spent.
///
/// Only [`FetchError::is_retryable`] errors are retried. Backoff sleeps end
/// early on cancellation and never run past the request deadline.
pub async fn fetch_with_retry(
    adapter: &dyn ProviderAdapter,
    request: &FetchRequest,
    config: &RetryConfig,
) -> RetryOutcome {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = adapter.fetch(request).await;
        let err = match result {
            Ok(artifact) => {
                return RetryOutcome {
                    result: Ok(artifact),
                    attempts,
                };
            }
            Err(err) => err,
        };

        let retries_done = attempts - 1;
        if !err.is_retryable() || !config.should_retry(retries_done) {
            if err.is_retryable() {
                warn!(url = %request.url, attempts, error = %err, "retries exhausted");
            }
            return RetryOutcome {
                result: Err(err),
                attempts,
            };
        }

        let delay = config.delay_for_attempt(attempts);
        let remaining = match request.remaining() {
            Ok(r) => r,
            Err(timeout) => {
                return RetryOutcome {
                    result: Err(timeout),
                    attempts,
                };
            }
        };
        debug!(url = %request.url, attempt = attempts, ?delay, error = %err, "retrying fetch");

        tokio::select! {
            _ = tokio::time::sleep(delay.min(remaining)) => {}
            _ = request.cancel.cancelled() => {
                return RetryOutcome {
                    result: Err(FetchError::Cancelled),
                    attempts,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderTag;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Adapter replaying a fixed sequence of results.
    struct Script {
        results: Mutex<VecDeque<Result<MediaArtifact, FetchError>>>,
        calls: Mutex<u32>,
    }

    impl Script {
        fn new(results: Vec<Result<MediaArtifact, FetchError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ProviderAdapter for Script {
        fn name(&self) -> &'static str {
            "script"
        }

        async fn fetch(&self, _request: &FetchRequest) -> Result<MediaArtifact, FetchError> {
            *self.calls.lock().unwrap() += 1;
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Provider("script exhausted".into())))
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }

    fn request() -> FetchRequest {
        FetchRequest::new(
            ProviderTag::YouTube,
            "https://youtu.be/x",
            "/tmp/job",
            Duration::from_secs(30),
            CancellationToken::new(),
        )
    }

    fn video() -> MediaArtifact {
        MediaArtifact::Video {
            path: "v.mp4".into(),
            size_bytes: 1_000,
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let config = RetryConfig {
            use_jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let script = Script::new(vec![
            Err(FetchError::Transient("reset".into())),
            Err(FetchError::Transient("reset".into())),
            Ok(video()),
        ]);
        let outcome = fetch_with_retry(&script, &request(), &fast_config()).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let script = Script::new(
            (0..5)
                .map(|_| Err(FetchError::Transient("reset".into())))
                .collect(),
        );
        let outcome = fetch_with_retry(&script, &request(), &fast_config()).await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(script.calls(), 3);
        assert_eq!(
            outcome.result.unwrap_err().kind(),
            crate::error::FailureKind::ProviderError
        );
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        for err in [
            FetchError::AuthRequired("login".into()),
            FetchError::InvalidUrl("bad".into()),
            FetchError::Timeout(Duration::from_secs(1)),
        ] {
            let script = Script::new(vec![Err(err), Ok(video())]);
            let outcome = fetch_with_retry(&script, &request(), &fast_config()).await;
            assert!(outcome.result.is_err());
            assert_eq!(script.calls(), 1);
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let req = request();
        req.cancel.cancel();
        let script = Script::new(vec![Err(FetchError::Transient("reset".into())), Ok(video())]);
        let config = RetryConfig {
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..fast_config()
        };
        let outcome = fetch_with_retry(&script, &req, &config).await;
        assert!(matches!(outcome.result, Err(FetchError::Cancelled)));
        assert_eq!(script.calls(), 1);
    }
}
