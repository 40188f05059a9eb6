//! Bounded retry around any dispatcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::DispatchError;

use super::{MessageDispatcher, RenderedMessage};

/// Upper bound on a single provider-requested wait.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Retries transient failures with exponential backoff.
///
/// Permanent failures (4xx rejections, missing credentials) return at once.
pub struct RetryingDispatcher {
    inner: Arc<dyn MessageDispatcher>,
    max_attempts: u32,
    backoff: Duration,
}

impl RetryingDispatcher {
    pub fn new(inner: Arc<dyn MessageDispatcher>, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    fn delay_for(&self, attempt: u32, err: &DispatchError) -> Duration {
        if let DispatchError::RateLimited {
            retry_after: Some(after),
        } = err
        {
            return (*after).min(MAX_RETRY_AFTER);
        }
        self.backoff.saturating_mul(2u32.saturating_pow(attempt - 1))
    }
}

#[async_trait]
impl MessageDispatcher for RetryingDispatcher {
    async fn send(
        &self,
        conversation_id: &str,
        message: &RenderedMessage,
    ) -> Result<String, DispatchError> {
        let mut attempt = 1;
        loop {
            match self.inner.send(conversation_id, message).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, &e);
                    warn!(
                        conversation_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Fails the first `failures` calls with the given error.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: DispatchError,
    }

    #[async_trait]
    impl MessageDispatcher for Flaky {
        async fn send(&self, _: &str, _: &RenderedMessage) -> Result<String, DispatchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(format!("sent-{n}"))
            }
        }
    }

    fn flaky(failures: u32, error: DispatchError) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
            error,
        })
    }

    fn text() -> RenderedMessage {
        RenderedMessage::Text { body: "hi".into() }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let inner = flaky(2, DispatchError::RequestFailed { reason: "reset".into() });
        let retrying = RetryingDispatcher::new(inner.clone(), 3, Duration::from_millis(1));

        assert_eq!(retrying.send("c", &text()).await.unwrap(), "sent-2");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let inner = flaky(10, DispatchError::Rejected { status: 503, body: String::new() });
        let retrying = RetryingDispatcher::new(inner.clone(), 3, Duration::from_millis(1));

        assert!(retrying.send("c", &text()).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let inner = flaky(10, DispatchError::Rejected { status: 400, body: "bad".into() });
        let retrying = RetryingDispatcher::new(inner.clone(), 5, Duration::from_millis(1));

        assert!(retrying.send("c", &text()).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_honours_retry_after() {
        let retrying = RetryingDispatcher::new(
            flaky(0, DispatchError::InvalidResponse(String::new())),
            4,
            Duration::from_millis(100),
        );
        let transient = DispatchError::RequestFailed {
            reason: String::new(),
        };
        assert_eq!(retrying.delay_for(1, &transient), Duration::from_millis(100));
        assert_eq!(retrying.delay_for(3, &transient), Duration::from_millis(400));

        let limited = DispatchError::RateLimited { retry_after: Some(Duration::from_secs(600)) };
        assert_eq!(retrying.delay_for(1, &limited), MAX_RETRY_AFTER);
    }
}
