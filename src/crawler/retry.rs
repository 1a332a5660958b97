//! Bounded retry of fetch attempts

use crate::config::EngineConfig;
use crate::crawler::transport::{Response, Transport, TransportError};
use crate::record::FetchRecord;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often, and how far apart, a record's fetch is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub delay: Duration,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn from_engine(config: &EngineConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay)
    }

    /// Decides after a failure at `attempt` (0-based)
    ///
    /// Attempts `0..=max_retries` are made; the failure at `max_retries` is final.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt < self.max_retries {
            RetryDecision::Retry { after: self.delay }
        } else {
            RetryDecision::GiveUp
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Result of fetching one record under a [`RetryPolicy`]
#[derive(Debug)]
pub enum FetchAttempt {
    Success { response: Response, retries: u32 },
    /// Every attempt failed; `error` is the last one
    Failed { error: TransportError, retries: u32 },
    /// A stop was requested between attempts
    Cancelled,
}

/// Fetches `record`, retrying transport failures per `policy`
///
/// An attempt in flight is never interrupted here; cancellation is observed
/// before the first attempt and while waiting out the retry delay.
pub async fn fetch_with_retry<T: Transport>(
    policy: &RetryPolicy,
    transport: &T,
    record: &FetchRecord,
    cancel: &CancellationToken,
) -> FetchAttempt {
    if cancel.is_cancelled() {
        return FetchAttempt::Cancelled;
    }

    let mut attempt = 0;
    loop {
        let error = match transport.fetch(record).await {
            Ok(response) => {
                return FetchAttempt::Success {
                    response,
                    retries: attempt,
                }
            }
            Err(error) => error,
        };

        let decision = if error.is_retryable() {
            policy.decide(attempt)
        } else {
            RetryDecision::GiveUp
        };

        match decision {
            RetryDecision::GiveUp => {
                return FetchAttempt::Failed {
                    error,
                    retries: attempt,
                }
            }
            RetryDecision::Retry { after } => {
                debug!(url = %record.url(), attempt, "Retrying after error: {}", error);
                tokio::select! {
                    _ = tokio::time::sleep(after) => {}
                    _ = cancel.cancelled() => return FetchAttempt::Cancelled,
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl Transport for Flaky {
        fn fetch(
            &self,
            record: &FetchRecord,
        ) -> impl Future<Output = Result<Response, TransportError>> + Send {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let url = record.url().to_string();
            let failures = self.failures;
            async move {
                if call < failures {
                    Err(TransportError::Timeout)
                } else {
                    Ok(Response {
                        code: 200,
                        final_url: url,
                        content_type: None,
                        headers: BTreeMap::new(),
                        body: Vec::new(),
                        truncated: false,
                    })
                }
            }
        }
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::new(2, Duration::from_millis(5));
        assert_eq!(
            policy.decide(0),
            RetryDecision::Retry {
                after: Duration::from_millis(5)
            }
        );
        assert!(matches!(policy.decide(1), RetryDecision::Retry { .. }));
        assert_eq!(policy.decide(2), RetryDecision::GiveUp);
        assert_eq!(policy.total_attempts(), 3);
    }

    #[test]
    fn test_zero_retries_means_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.decide(0), RetryDecision::GiveUp);
        assert_eq!(policy.total_attempts(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_all_attempts() {
        let transport = Flaky::new(u32::MAX);
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let record = FetchRecord::new("https://example.com/");

        let attempt =
            fetch_with_retry(&policy, &transport, &record, &CancellationToken::new()).await;

        assert!(matches!(
            attempt,
            FetchAttempt::Failed {
                error: TransportError::Timeout,
                retries: 3
            }
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_succeeds_after_retry() {
        let transport = Flaky::new(1);
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let record = FetchRecord::new("https://example.com/");

        let attempt =
            fetch_with_retry(&policy, &transport, &record, &CancellationToken::new()).await;

        assert!(matches!(attempt, FetchAttempt::Success { retries: 1, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_during_delay() {
        let transport = Flaky::new(u32::MAX);
        let policy = RetryPolicy::new(5, Duration::from_secs(60));
        let record = FetchRecord::new("https://example.com/");
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        });

        let attempt = fetch_with_retry(&policy, &transport, &record, &cancel).await;
        assert!(matches!(attempt, FetchAttempt::Cancelled));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_started_when_already_cancelled() {
        let transport = Flaky::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let attempt = fetch_with_retry(
            &RetryPolicy::new(3, Duration::ZERO),
            &transport,
            &FetchRecord::new("https://example.com/"),
            &cancel,
        )
        .await;
        assert!(matches!(attempt, FetchAttempt::Cancelled));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }
}
