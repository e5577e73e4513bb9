use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info_span, warn, Instrument};

use crate::error::{Disposition, ReconcileError};
use crate::queue::RateLimitedQueue;

/// What to do after a successful reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration` even if no event arrives.
    #[must_use]
    pub fn requeue(duration: Duration) -> Self {
        Action {
            requeue_after: Some(duration),
        }
    }

    /// Do nothing until the next event for this key.
    #[must_use]
    pub fn await_change() -> Self {
        Action { requeue_after: None }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &str) -> Result<Action, ReconcileError>;
}

/// Runs `workers` cooperating loops draining one queue into a reconcile
/// function. The queue's in-flight marking guarantees that no two workers
/// run the same key concurrently; a panic inside one reconcile is recovered
/// and requeued with backoff without killing the worker.
pub struct Dispatcher {
    queue: Arc<RateLimitedQueue>,
    reconciler: Arc<dyn Reconciler>,
    workers: usize,
}

impl Dispatcher {
    pub fn new(queue: Arc<RateLimitedQueue>, reconciler: Arc<dyn Reconciler>, workers: usize) -> Self {
        Dispatcher {
            queue,
            reconciler,
            workers,
        }
    }

    /// Run until `shutdown` fires and all in-flight reconciles have drained.
    pub async fn run(self, shutdown: CancellationToken) {
        let queue = Arc::clone(&self.queue);
        let watchdog = tokio::spawn(async move {
            shutdown.cancelled().await;
            queue.shut_down();
        });

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            handles.push(tokio::spawn(worker_loop(queue, reconciler, worker)));
        }
        for handle in handles {
            let _ = handle.await;
        }
        watchdog.abort();
    }
}

async fn worker_loop(queue: Arc<RateLimitedQueue>, reconciler: Arc<dyn Reconciler>, worker: usize) {
    while let Some(key) = queue.get().await {
        let span = info_span!("reconcile", queue = %queue.name(), key = %key, worker);
        let fut = {
            let reconciler = Arc::clone(&reconciler);
            let key = key.clone();
            async move { reconciler.reconcile(&key).await }
        };
        // run in its own task so a panic is caught by the join handle
        let outcome = tokio::spawn(fut.instrument(span)).await;
        match outcome {
            Err(join_err) => {
                error!(key = %key, queue = %queue.name(), "reconcile panicked: {join_err}");
                queue.done(&key);
                queue.add_rate_limited(&key);
            }
            Ok(Ok(action)) => {
                queue.forget(&key);
                queue.done(&key);
                if let Some(after) = action.requeue_after() {
                    queue.add_after(&key, after);
                }
            }
            Ok(Err(err)) => {
                warn!(key = %key, queue = %queue.name(), "reconcile failed: {err}");
                match err.disposition() {
                    Disposition::Drop => {
                        queue.forget(&key);
                        queue.done(&key);
                    }
                    Disposition::RequeueImmediate => {
                        queue.done(&key);
                        queue.add(&key);
                    }
                    Disposition::RequeueRateLimited => {
                        queue.done(&key);
                        queue.add_rate_limited(&key);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recording {
        calls: AtomicUsize,
        fail_first: bool,
        panic_first: bool,
        in_flight: Mutex<HashSet<String>>,
        overlapped: AtomicUsize,
    }

    impl Recording {
        fn new(fail_first: bool, panic_first: bool) -> Arc<Self> {
            Arc::new(Recording {
                calls: AtomicUsize::new(0),
                fail_first,
                panic_first,
                in_flight: Mutex::new(HashSet::new()),
                overlapped: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Reconciler for Recording {
        async fn reconcile(&self, key: &str) -> Result<Action, ReconcileError> {
            let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
            if !self.in_flight.lock().unwrap().insert(key.to_string()) {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.lock().unwrap().remove(key);
            if first && self.panic_first {
                panic!("boom");
            }
            if first && self.fail_first {
                return Err(ReconcileError::Transient("upstream 503".into()));
            }
            Ok(Action::await_change())
        }
    }

    #[tokio::test]
    async fn transient_error_requeues_then_succeeds() {
        let queue = RateLimitedQueue::with_delays(
            "test",
            Duration::from_millis(1),
            Duration::from_millis(10),
        );
        let reconciler = Recording::new(true, false);
        queue.add("k");
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::new(Arc::clone(&queue), reconciler.clone(), 2);
        let stopper = shutdown.clone();
        let run = tokio::spawn(dispatcher.run(shutdown));
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.cancel();
        run.await.unwrap();
        assert!(reconciler.calls.load(Ordering::SeqCst) >= 2);
        // failure count was reset by the eventual success
        assert_eq!(queue.failures("k"), 0);
    }

    #[tokio::test]
    async fn panic_is_recovered_and_key_retried() {
        let queue = RateLimitedQueue::with_delays(
            "test",
            Duration::from_millis(1),
            Duration::from_millis(10),
        );
        let reconciler = Recording::new(false, true);
        queue.add("k");
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let run = tokio::spawn(Dispatcher::new(Arc::clone(&queue), reconciler.clone(), 1).run(shutdown));
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.cancel();
        run.await.unwrap();
        assert!(reconciler.calls.load(Ordering::SeqCst) >= 2, "worker died on panic");
    }

    #[tokio::test]
    async fn same_key_never_overlaps() {
        let queue = RateLimitedQueue::new("test");
        let reconciler = Recording::new(false, false);
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let run = tokio::spawn(Dispatcher::new(Arc::clone(&queue), reconciler.clone(), 4).run(shutdown));
        for _ in 0..20 {
            queue.add("hot");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.cancel();
        run.await.unwrap();
        assert_eq!(reconciler.overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn workers_drain_and_exit_on_cancel() {
        let queue = RateLimitedQueue::new("test");
        let reconciler = Recording::new(false, false);
        queue.add("a");
        queue.add("b");
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let run = tokio::spawn(Dispatcher::new(Arc::clone(&queue), reconciler.clone(), 2).run(shutdown));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("workers did not exit")
            .unwrap();
        assert!(reconciler.calls.load(Ordering::SeqCst) >= 2);
    }
}
