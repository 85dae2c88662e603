//! Bounded worker pool over the tokio runtime.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::trace;

/// At most `size` submitted futures run at once; the rest wait for a slot.
///
/// A slot is held until the future finishes, even if nobody awaits its
/// handle any more.
#[derive(Clone)]
pub(crate) struct WorkerPool {
    name: &'static str,
    size: usize,
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            slots: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn submit<F>(&self, work: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let name = self.name;
        tokio::spawn(async move {
            // The semaphore is never closed, so this only waits.
            let _slot = slots.acquire_owned().await.ok();
            trace!(pool = name, "Worker slot taken");
            work.await
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently held by running work.
    pub fn busy(&self) -> usize {
        self.size - self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_bounds_parallelism() {
        let pool = WorkerPool::new("test", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.busy(), 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_keeps_slot_until_done() {
        let pool = WorkerPool::new("test", 1);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        drop(pool.submit(async move {
            let _ = rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.busy(), 1);

        tx.send(()).unwrap();
        pool.submit(async {}).await.unwrap();
        assert_eq!(pool.busy(), 0);
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let pool = WorkerPool::new("test", 0);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.name(), "test");
    }
}
