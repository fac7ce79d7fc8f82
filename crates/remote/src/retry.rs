//! Retry logic with exponential backoff for remote cache operations

use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use buildcache::{CacheKey, RemoteCacheService, RemoteError, RemoteResult, RetryConfig};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry a fallible async operation with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> RemoteResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = RemoteResult<T>>,
{
    let mut backoff = create_backoff(config);
    let mut attempts = 0;

    loop {
        attempts += 1;

        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts = attempts,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    debug!(
                        operation = operation_name,
                        error = %err,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(err);
                }

                if attempts >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts = attempts,
                        error = %err,
                        "Operation failed after maximum retries"
                    );
                    return Err(RemoteError::retry_exhausted(
                        operation_name,
                        attempts,
                        err.to_string(),
                    ));
                }

                if let Some(duration) = backoff.next_backoff() {
                    warn!(
                        operation = operation_name,
                        attempts = attempts,
                        error = %err,
                        retry_in_ms = duration.as_millis(),
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(duration).await;
                } else {
                    return Err(RemoteError::retry_exhausted(
                        operation_name,
                        attempts,
                        err.to_string(),
                    ));
                }
            }
        }
    }
}

/// Create exponential backoff from config
fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_multiplier(config.backoff_multiplier)
        .with_max_elapsed_time(None) // max_attempts bounds the loop
        .build()
}

/// Backend decorator retrying transient failures
pub struct RetryingRemote<S> {
    inner: S,
    config: RetryConfig,
}

impl<S: RemoteCacheService> RetryingRemote<S> {
    /// Wrap `inner`
    #[must_use]
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// The wrapped backend
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: RemoteCacheService> RemoteCacheService for RetryingRemote<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn contains(&self, key: &CacheKey) -> RemoteResult<bool> {
        retry_with_backoff(&self.config, "contains", || self.inner.contains(key)).await
    }

    async fn load(&self, key: &CacheKey) -> RemoteResult<Option<Bytes>> {
        retry_with_backoff(&self.config, "load", || self.inner.load(key)).await
    }

    async fn store(&self, key: &CacheKey, data: Bytes) -> RemoteResult<()> {
        // Bytes clones share the buffer
        retry_with_backoff(&self.config, "store", || self.inner.store(key, data.clone())).await
    }

    async fn close(&self) -> RemoteResult<()> {
        self.inner.close().await
    }
}
