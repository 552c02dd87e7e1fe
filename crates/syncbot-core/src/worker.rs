use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinError;

/// Default number of concurrent blocking jobs.
pub const DEFAULT_WORKERS: usize = 10;

/// Bounded pool for CPU-bound or blocking work (image conversion, file IO).
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Runs `job` on the blocking pool once a worker slot is free.
    pub async fn run<F, R>(&self, job: F) -> Result<R, JoinError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        // The semaphore is never closed.
        let _permit = self.permits.acquire().await;
        tokio::task::spawn_blocking(job).await
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_jobs() {
        let pool = WorkerPool::new(2);
        let results = futures::future::join_all((0..5).map(|i| pool.run(move || i * 2))).await;
        let values: Vec<i32> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![0, 2, 4, 6, 8]);
        assert_eq!(pool.available(), 2);
    }
}
