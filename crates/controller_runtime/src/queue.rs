use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Notify;

use crate::metrics::QueueMetrics;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Key-addressed work queue with dedup, in-flight marking and per-key
/// exponential backoff.
///
/// A key is never simultaneously in the ready list and in the in-flight
/// set: adds for an in-flight key only mark it dirty, and `done` re-enqueues
/// dirty keys. `shut_down` is terminal; blocked `get` calls return `None`
/// once the ready list has drained.
pub struct RateLimitedQueue {
    name: String,
    base_delay: Duration,
    max_delay: Duration,
    inner: Mutex<Inner>,
    notify: Notify,
    metrics: QueueMetrics,
}

#[derive(Default)]
struct Inner {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashMap<String, Instant>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

impl RateLimitedQueue {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_delays(name, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_delays(name: &str, base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(RateLimitedQueue {
            name: name.to_string(),
            base_delay,
            max_delay,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            metrics: QueueMetrics::new(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Enqueue a key. Duplicate adds while the key is queued are dropped;
    /// adds while the key is in flight set the dirty bit instead.
    pub fn add(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shut_down {
            return;
        }
        self.metrics.adds_total.inc();
        if inner.in_flight.contains_key(key) {
            inner.dirty.insert(key.to_string());
            return;
        }
        if !inner.queued.insert(key.to_string()) {
            return;
        }
        inner.ready.push_back(key.to_string());
        self.metrics.depth.set(inner.ready.len() as i64);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Enqueue a key once `delay` elapses.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Enqueue a key after its per-key backoff delay. The delay doubles with
    /// each call until `forget` resets the failure count, capped at the
    /// queue's max delay, with jitter in [0.5, 1.5).
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let backoff = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                return;
            }
            let failures = inner.failures.entry(key.to_string()).or_insert(0);
            let delay = backoff_for(self.base_delay, self.max_delay, *failures);
            *failures += 1;
            delay
        };
        self.metrics.retries_total.inc();
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(
            (backoff.as_secs_f64() * jitter).min(self.max_delay.as_secs_f64()),
        );
        self.add_after(key, delay);
    }

    /// Block until a key is available or the queue has shut down and
    /// drained. Returns `None` on shutdown.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.ready.pop_front() {
                    inner.queued.remove(&key);
                    inner.in_flight.insert(key.clone(), Instant::now());
                    self.metrics.depth.set(inner.ready.len() as i64);
                    self.refresh_unfinished(&inner);
                    return Some(key);
                }
                if inner.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release the in-flight mark. A key that went dirty while in flight is
    /// re-enqueued immediately.
    pub fn done(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(started) = inner.in_flight.remove(key) {
            self.metrics.work_duration.observe(started.elapsed().as_secs_f64());
        }
        let requeued = inner.dirty.remove(key) && !inner.shut_down;
        if requeued {
            inner.queued.insert(key.to_string());
            inner.ready.push_back(key.to_string());
            self.metrics.depth.set(inner.ready.len() as i64);
        }
        self.refresh_unfinished(&inner);
        drop(inner);
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Reset the failure count for a key.
    pub fn forget(&self, key: &str) {
        self.inner.lock().unwrap().failures.remove(key);
    }

    /// Refuse further adds and release blocked `get` calls once the ready
    /// list drains. Terminal.
    pub fn shut_down(&self) {
        self.inner.lock().unwrap().shut_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().unwrap().shut_down
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn refresh_unfinished(&self, inner: &Inner) {
        let mut total = 0.0;
        let mut longest = 0.0f64;
        for started in inner.in_flight.values() {
            let elapsed = started.elapsed().as_secs_f64();
            total += elapsed;
            longest = longest.max(elapsed);
        }
        self.metrics.unfinished_work_seconds.set(total);
        self.metrics.longest_running_processor_seconds.set(longest);
    }
}

/// Un-jittered exponential backoff for the given failure count.
fn backoff_for(base: Duration, max: Duration, failures: u32) -> Duration {
    let exp = failures.min(32);
    let delay = base.as_secs_f64() * 2f64.powi(exp as i32);
    Duration::from_secs_f64(delay.min(max.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_get_done_roundtrip() {
        let q = RateLimitedQueue::new("test");
        q.add("a");
        assert_eq!(q.len(), 1);
        let got = q.get().await.unwrap();
        assert_eq!(got, "a");
        assert_eq!(q.len(), 0);
        q.done("a");
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn duplicate_adds_are_deduped() {
        let q = RateLimitedQueue::new("test");
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn add_during_in_flight_marks_dirty() {
        let q = RateLimitedQueue::new("test");
        q.add("a");
        let key = q.get().await.unwrap();
        // adds while in flight must not surface the key again yet
        q.add("a");
        q.add("a");
        assert_eq!(q.len(), 0);
        q.done(&key);
        // the dirty bit collapses all adds into one requeue
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        assert_eq!(again, "a");
        q.done(&again);
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn backoff_is_monotone_until_cap() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(60);
        let mut prev = Duration::ZERO;
        for failures in 0..20 {
            let d = backoff_for(base, max, failures);
            assert!(d >= prev, "delay regressed at failure {failures}");
            assert!(d <= max);
            prev = d;
        }
        assert_eq!(backoff_for(base, max, 19), max);
    }

    #[tokio::test]
    async fn forget_resets_failures() {
        let q = RateLimitedQueue::new("test");
        q.add_rate_limited("k");
        q.add_rate_limited("k");
        assert_eq!(q.failures("k"), 2);
        q.forget("k");
        assert_eq!(q.failures("k"), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_blocked_get() {
        let q = RateLimitedQueue::new("test");
        let q2 = Arc::clone(&q);
        let getter = tokio::spawn(async move { q2.get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shut_down();
        assert_eq!(getter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_drains_ready_keys_first() {
        let q = RateLimitedQueue::new("test");
        q.add("a");
        q.shut_down();
        assert_eq!(q.get().await.as_deref(), Some("a"));
        q.done("a");
        assert_eq!(q.get().await, None);
        // adds after shutdown are refused
        q.add("b");
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn add_after_delays_delivery() {
        let q = RateLimitedQueue::new("test");
        q.add_after("a", Duration::from_millis(30));
        assert_eq!(q.len(), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn rate_limited_add_lands_after_base_delay() {
        let q = RateLimitedQueue::with_delays(
            "test",
            Duration::from_millis(20),
            Duration::from_secs(1),
        );
        let before = Instant::now();
        q.add_rate_limited("k");
        loop {
            if q.len() == 1 {
                break;
            }
            assert!(before.elapsed() < Duration::from_secs(2), "key never arrived");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // jitter floor is 0.5x the computed delay
        assert!(before.elapsed() >= Duration::from_millis(10));
    }
}
