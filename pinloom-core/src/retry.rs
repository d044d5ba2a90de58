//! Retry loop for transient failures
//!
//! Transient errors re-run the operation indefinitely with capped
//! exponential backoff; the ambient cancellation token is the only way
//! out of the loop. Terminal errors return immediately.

use crate::config::RetryConfig;
use crate::error::PipelineError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetryConfig,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `op` until it succeeds, fails terminally, or the token fires.
    pub async fn run<T, F, Fut>(
        &self,
        token: &CancellationToken,
        label: &str,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut delay = Duration::from_millis(self.config.initial_delay_ms.max(1));
        let max_delay = Duration::from_millis(self.config.max_delay_ms.max(1));
        let mut attempt: u64 = 0;

        loop {
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    warn!(%err, label, attempt, delay_ms = delay.as_millis() as u64, "transient failure, backing off");
                    tokio::select! {
                        _ = token.cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(max_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
