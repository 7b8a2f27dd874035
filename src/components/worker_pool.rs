//! Stop/stop-finished scaffolding shared by the long-running per-source
//! loops (crawl engine, download workers, integrity checker).
//!
//! Each spawned worker owns the pool's cancellation token; `drain` cancels
//! and then waits for one completion message per spawned worker, so unload
//! returns only after every loop has actually exited.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct WorkerPool {
    stop: CancellationToken,
    count: AtomicU32,
    done_tx: mpsc::Sender<()>,
    done_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        let (done_tx, done_rx) = mpsc::channel(64);
        Self {
            stop: CancellationToken::new(),
            count: AtomicU32::new(0),
            done_tx,
            done_rx: tokio::sync::Mutex::new(done_rx),
        }
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Spawn one worker loop; its exit is what `drain` waits for.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.count.fetch_add(1, Ordering::SeqCst);
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            task.await;
            let _ = done.send(()).await;
        });
    }

    /// Cancellable sleep. Returns false when the stop token fired first.
    pub async fn idle(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Signal stop and wait for every spawned worker to finish.
    pub async fn drain(&self) {
        self.stop.cancel();
        let mut done_rx = self.done_rx.lock().await;
        for _ in 0..self.count.swap(0, Ordering::SeqCst) {
            let _ = done_rx.recv().await;
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn drain_waits_for_every_worker() {
        let pool = Arc::new(WorkerPool::new());
        let finished = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let pool2 = pool.clone();
            let finished2 = finished.clone();
            pool.spawn(async move {
                while pool2.idle(Duration::from_millis(5)).await {}
                finished2.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.drain().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn idle_returns_false_once_stopped() {
        let pool = WorkerPool::new();
        pool.stop.cancel();
        assert!(!pool.idle(Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn drain_with_no_workers_returns_immediately() {
        let pool = WorkerPool::new();
        pool.drain().await;
        assert!(pool.is_stopped());
    }
}
