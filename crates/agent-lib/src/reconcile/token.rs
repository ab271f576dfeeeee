//! Single-flight execution token

use crate::error::LockBusyError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Guarantees at most one reconciliation cycle runs at a time.
///
/// Cloning shares the same token. Acquisition never queues: a second
/// caller gets `LockBusyError` immediately.
#[derive(Debug, Clone)]
pub struct ExecutionToken {
    permits: Arc<Semaphore>,
    releases: Arc<AtomicU64>,
}

impl Default for ExecutionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionToken {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            releases: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn try_acquire(&self) -> Result<ExecutionGuard, LockBusyError> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| LockBusyError)?;
        Ok(ExecutionGuard {
            _permit: permit,
            releases: self.releases.clone(),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Wait until no cycle holds the token
    pub async fn wait_idle(&self) {
        // The permit is dropped right away; only the wait matters.
        let _ = self.permits.acquire().await;
    }

    /// Number of guards released so far
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }
}

/// Held for the duration of one cycle
#[derive(Debug)]
pub struct ExecutionGuard {
    _permit: OwnedSemaphorePermit,
    releases: Arc<AtomicU64>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_acquire_is_busy() {
        let token = ExecutionToken::new();
        let guard = token.try_acquire().unwrap();
        assert!(token.is_busy());
        assert_eq!(token.try_acquire().unwrap_err(), LockBusyError);

        drop(guard);
        assert!(!token.is_busy());
        assert_eq!(token.releases(), 1);
        assert!(token.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_after_release() {
        let token = ExecutionToken::new();
        let guard = token.try_acquire().unwrap();

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
