//! Retrying request executor: a bounded permit pool gating concurrent
//! remote calls, plus the retry loop that absorbs transient failures.
//!
//! Shared acquisition takes one permit; exclusive acquisition drains the
//! whole pool (uploads are serialized relative to everything else).  Every
//! blocking point races against the caller's cancellation token and leaves
//! no permit behind when cancelled.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::retry::{self, RetryConfig};
use crate::types::RemoteError;

/// Configuration for the executor.  Defaults: 3 permits, 3 attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Number of remote calls allowed in flight at once.
    #[serde(default = "default_permits")]
    pub permits: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            permits: default_permits(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_permits() -> usize {
    3
}

/// Failure surface of an executor call.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The caller's cancellation fired first.
    #[error("operation cancelled")]
    Cancelled,
    /// The final attempt's remote failure (transient failures up to the
    /// attempt budget are absorbed; fatal ones propagate immediately).
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Holds every permit in the pool; dropping it releases them all.
#[derive(Debug)]
pub struct ExclusiveGuard {
    _permits: OwnedSemaphorePermit,
}

/// Bounded-concurrency retrying wrapper around remote calls.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    permits: Arc<Semaphore>,
    capacity: usize,
    retry: RetryConfig,
}

impl RequestExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let capacity = config.permits.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            retry: config.retry,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free.  Test and diagnostic hook.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Take one permit, or fail with `Cancelled` if the token fires first.
    pub async fn acquire_shared(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, ExecuteError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ExecuteError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                // The semaphore is owned by this executor and never closed.
                Ok(permit.expect("executor semaphore closed"))
            }
        }
    }

    /// Take every permit, serializing against all other remote calls.
    ///
    /// The whole batch is acquired atomically.  Incrementally collecting
    /// permits would let two exclusive acquirers each hold part of the
    /// pool and wait on each other forever; the batch acquire queues as
    /// one waiter, so concurrent exclusive acquirers are served in turn.
    /// Cancellation while queued releases anything reserved for us.
    pub async fn acquire_exclusive(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ExclusiveGuard, ExecuteError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ExecuteError::Cancelled),
            permits = self.permits.clone().acquire_many_owned(self.capacity as u32) => {
                Ok(ExclusiveGuard {
                    _permits: permits.expect("executor semaphore closed"),
                })
            }
        }
    }

    /// Invoke `op`, retrying transient failures up to the attempt budget.
    ///
    /// Only rate-limit (429) and server (5xx) failures retry; everything
    /// else propagates on first occurrence.  Exhausting the budget returns
    /// the last observed failure.  The inter-attempt wait honors a
    /// server-supplied `Retry-After` hint exactly and aborts immediately on
    /// cancellation.
    pub async fn do_with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ExecuteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let budget = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.is_retryable() || attempt >= budget {
                        return Err(err.into());
                    }
                    let wait = retry::delay_for(&self.retry, attempt - 1, err.retry_after);
                    debug!(
                        status = err.status,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "transient remote failure, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ExecuteError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// The full wrapper: one shared permit held across all attempts of `op`.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, ExecuteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let _permit = self.acquire_shared(cancel).await?;
        self.do_with_retry(cancel, op).await
    }
}
