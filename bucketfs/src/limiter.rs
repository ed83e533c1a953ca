//! Bounded permit pool for outstanding transfers.
//!
//! One limiter gates block uploads, a second, independent one gates chunk
//! downloads. Holding a permit means holding a transfer slot (and, on the
//! write path, one block's worth of memory).

use crate::vfs::error::VfsError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct Limiter {
    sem: Arc<Semaphore>,
    capacity: u32,
}

impl Limiter {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            sem: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Wait for `n` permits at once, giving up when `cancel` fires.
    ///
    /// `n` is clamped to the pool size so a large request cannot wait forever.
    pub async fn acquire(
        &self,
        n: u32,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, VfsError> {
        let n = n.min(self.capacity);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(VfsError::Cancelled),
            permit = self.sem.clone().acquire_many_owned(n) => {
                permit.map_err(|_| VfsError::Anyhow(anyhow::anyhow!("limiter closed")))
            }
        }
    }

    /// Wait for a single permit without a way out.
    pub async fn acquire_one(&self) -> Result<OwnedSemaphorePermit, VfsError> {
        self.sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VfsError::Anyhow(anyhow::anyhow!("limiter closed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let limiter = Limiter::new(2);
        let never = CancellationToken::new();
        let held = limiter.acquire(2, &never).await.unwrap();
        assert_eq!(limiter.available(), 0);

        let l2 = limiter.clone();
        let waiter = tokio::spawn(async move {
            let token = CancellationToken::new();
            l2.acquire(1, &token).await.map(|p| p.num_permits())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let limiter = Limiter::new(1);
        let never = CancellationToken::new();
        let _held = limiter.acquire(1, &never).await.unwrap();

        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });
        let err = limiter.acquire(1, &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_oversized_request_is_clamped() {
        let limiter = Limiter::new(3);
        let never = CancellationToken::new();
        let permit = limiter.acquire(10, &never).await.unwrap();
        assert_eq!(permit.num_permits(), 3);
    }
}
