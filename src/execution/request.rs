use crate::clock::ClockSync;
use crate::error::{ErrorKind, ExchangeError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Bounded-retry wrapper around single exchange calls
///
/// Failures are classified through [`ExchangeError::kind`]:
/// - `NoOp` propagates at once, the state change is already in effect
/// - `ClockSkew` resyncs the clock, then retries without recording the error
/// - everything else is remembered and retried
///
/// The same fixed delay separates every pair of attempts.
pub struct RequestExecutor {
    clock_sync: Arc<ClockSync>,
    max_retries: u32,
    retry_delay: Duration,
}

impl RequestExecutor {
    pub fn new(clock_sync: Arc<ClockSync>, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            clock_sync,
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `call` until it succeeds or the attempt budget is spent
    ///
    /// `what` only names the request in log lines.
    pub async fn execute<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut last_error: Option<ExchangeError> = None;

        for attempt in 1..=self.max_retries {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => match e.kind() {
                    ErrorKind::NoOp => return Err(e),
                    ErrorKind::ClockSkew => {
                        tracing::warn!(
                            "{} rejected for timestamp skew (attempt {}/{}), resyncing clock",
                            what,
                            attempt,
                            self.max_retries
                        );
                        self.clock_sync.sync().await;
                        tracing::info!(
                            offset_ms = self.clock_sync.offset_millis(),
                            "Offset after resync"
                        );
                    }
                    _ => {
                        tracing::warn!(
                            "{} failed (attempt {}/{}): {}",
                            what,
                            attempt,
                            self.max_retries,
                            e
                        );
                        last_error = Some(e);
                    }
                },
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(last_error.unwrap_or(ExchangeError::NoSuccessfulAttempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, TimeSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TimeSource for CountingSource {
        async fn server_time_millis(&self) -> Result<i64, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(1_000)
        }
    }

    fn executor() -> (RequestExecutor, Arc<CountingSource>) {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let clock_sync = Arc::new(ClockSync::new(
            source.clone(),
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(3600),
            1500,
        ));
        (RequestExecutor::new(clock_sync, 3, Duration::ZERO), source)
    }

    fn api(code: i64) -> ExchangeError {
        ExchangeError::Api {
            code,
            msg: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let (executor, _) = executor();
        let attempts = AtomicUsize::new(0);

        let result = executor
            .execute("test call", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(ExchangeError::Status {
                            status: 503,
                            body: "busy".into(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(assert_ok!(result), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_position_mode_noop_propagates_immediately() {
        let (executor, _) = executor();
        let attempts = AtomicUsize::new(0);

        let result: Result<(), _> = executor
            .execute("set position mode", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(api(-4059)) }
            })
            .await;

        let err = assert_err!(result);
        assert_eq!(err.code(), Some(-4059));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clock_skew_resyncs_and_retries() {
        let (executor, source) = executor();
        let attempts = AtomicUsize::new(0);

        let result = executor
            .execute("signed call", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(api(-1021))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(assert_ok!(result), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_only_clock_skew_ends_without_recorded_error() {
        let (executor, source) = executor();

        let result: Result<(), _> = executor
            .execute("skewed call", || async { Err(api(-1021)) })
            .await;

        assert!(matches!(
            assert_err!(result),
            ExchangeError::NoSuccessfulAttempt
        ));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let (executor, _) = executor();
        let attempts = AtomicUsize::new(0);

        let result: Result<(), _> = executor
            .execute("always failing", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) as i64;
                async move { Err(api(-2000 - n)) }
            })
            .await;

        let err = assert_err!(result);
        assert_eq!(err.code(), Some(-2002));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
