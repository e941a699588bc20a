//! Bounded retry for object storage operations.
//!
//! Only failures the backend classifies as transient are retried. After
//! `max_attempts` tries the last failure surfaces as `BackendUnavailable`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::object::ObjectStorage;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts per operation, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt (default: 50ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 5 seconds).
    pub max_backoff: Duration,
}

impl RetryConfig {
    /// Config with the given attempt bound and default backoff.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Object storage wrapper that retries transient failures.
pub struct RetryStore {
    inner: Box<dyn ObjectStorage>,
    config: RetryConfig,
}

impl RetryStore {
    /// Wrap `inner` so each operation is tried up to `config.max_attempts` times.
    pub fn new(inner: Box<dyn ObjectStorage>, config: RetryConfig) -> Self {
        debug!(max_attempts = config.max_attempts, "created retry store");
        Self { inner, config }
    }

    /// Wrap `inner` only when `attempts > 1`; otherwise return it unchanged.
    pub fn wrap(inner: Box<dyn ObjectStorage>, attempts: u32) -> Box<dyn ObjectStorage> {
        if attempts > 1 {
            Box::new(Self::new(inner, RetryConfig::with_attempts(attempts)))
        } else {
            inner
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn compute_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.config
            .initial_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }

    async fn execute<T, F, Fut>(&self, op: &'static str, key: &str, operation: F) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    warn!(op, key, attempts = attempt, error = %e, "retries exhausted");
                    return Err(StorageError::BackendUnavailable {
                        reason: format!("{} {} failed after {} attempts: {}", op, key, attempt, e),
                        transient: true,
                    });
                }
                Err(e) => {
                    let backoff = self.compute_backoff(attempt - 1);
                    warn!(op, key, attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for RetryStore {
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.execute("get", key, || self.inner.get(key)).await
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        self.execute("put", key, || self.inner.put(key, data.clone()))
            .await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.execute("delete", key, || self.inner.delete(key)).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.execute("list", prefix, || self.inner.list(prefix)).await
    }
}
