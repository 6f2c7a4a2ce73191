/// Polling utilities for waiting on conditions with timeout
use anyhow::Result;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for polling operations
pub struct PollingConfig {
    pub timeout: Duration,
    pub interval: Duration,
    pub description: String,
}

impl PollingConfig {
    /// Create a new polling configuration
    pub fn new(timeout: Duration, interval: Duration, description: impl Into<String>) -> Self {
        Self {
            timeout,
            interval,
            description: description.into(),
        }
    }

    /// Poll until the condition is met, the timeout expires, or the
    /// cancellation token fires.
    ///
    /// The condition function should return:
    /// - Ok(Some(T)) when the condition is met (returns T)
    /// - Ok(None) when the condition is not yet met (continues polling)
    /// - Err(e) when an error occurs (stops polling and returns the error)
    pub async fn poll<F, Fut, T>(&self, cancel: &CancellationToken, condition: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        debug!("waiting: {}", self.description);

        let start = Instant::now();

        loop {
            if cancel.is_cancelled() {
                anyhow::bail!("cancelled while waiting for {}", self.description);
            }

            match condition().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(e) => return Err(e),
            }

            if start.elapsed() > self.timeout {
                anyhow::bail!("timeout waiting for {}", self.description);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    anyhow::bail!("cancelled while waiting for {}", self.description);
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Poll until the condition returns Ok(true) or the timeout expires.
    pub async fn poll_until<F, Fut>(&self, cancel: &CancellationToken, condition: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.poll(cancel, || async {
            match condition().await {
                Ok(true) => Ok(Some(())),
                Ok(false) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }
}
