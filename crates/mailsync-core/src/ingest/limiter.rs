use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

pub const DEFAULT_INDEX_CONCURRENCY: usize = 10;

/// Caps how many wrapped futures make progress at once.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    permits: Arc<Semaphore>,
    width: usize,
}

impl ConcurrencyLimiter {
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            permits: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a slot, then drive `task` to completion while holding it.
    pub async fn run<F>(&self, task: F) -> F::Output
    where
        F: Future,
    {
        // The semaphore is never closed, so a failed acquire cannot happen.
        let _permit = self.permits.acquire().await.ok();
        task.await
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_INDEX_CONCURRENCY)
    }
}
