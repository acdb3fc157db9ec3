//! Bounded pool for CPU-heavy work (similarity math, batch normalization).
//! Keeps long computations off the I/O workers without letting them fan out
//! across every core.

use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::errors::AppError;

pub struct CpuPool {
    permits: Arc<Semaphore>,
}

impl CpuPool {
    /// Pool bounded at `min(num_cpus, 8)`.
    pub fn with_default_size() -> Self {
        Self::new(num_cpus::get().min(8))
    }

    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Runs `f` on the blocking pool once a permit frees up.
    pub async fn run<F, T>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("cpu pool closed: {e}")))?;
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("cpu task panicked: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_runs_closure() {
        let pool = CpuPool::new(2);
        let out = pool.run(|| 2 + 2).await.unwrap();
        assert_eq!(out, 4);
    }

    #[tokio::test]
    async fn test_concurrency_bounded() {
        let pool = Arc::new(CpuPool::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
