use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Holds every accepted client connection so shutdown can sever the ones
/// that will not close on their own (upgraded tunnels).
#[derive(Default)]
pub struct ConnectionTracker {
    conns: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection. Dropping the returned guard deregisters it
    /// exactly once.
    pub fn track(self: &Arc<Self>) -> TrackedConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.conns.lock().unwrap().insert(id, token.clone());
        TrackedConnection {
            id,
            token,
            tracker: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sever every tracked connection.
    pub fn close_all(&self) {
        for token in self.conns.lock().unwrap().values() {
            token.cancel();
        }
    }

    fn release(&self, id: u64) {
        self.conns.lock().unwrap().remove(&id);
    }
}

pub struct TrackedConnection {
    id: u64,
    /// Fires when `close_all` severs this connection.
    pub token: CancellationToken,
    tracker: Arc<ConnectionTracker>,
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.tracker.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_the_guard_deregisters() {
        let tracker = ConnectionTracker::new();
        let a = tracker.track();
        let b = tracker.track();
        assert_eq!(tracker.len(), 2);
        drop(a);
        assert_eq!(tracker.len(), 1);
        drop(b);
        assert!(tracker.is_empty());
    }

    #[test]
    fn close_all_fires_every_token() {
        let tracker = ConnectionTracker::new();
        let a = tracker.track();
        let b = tracker.track();
        assert!(!a.token.is_cancelled());
        tracker.close_all();
        assert!(a.token.is_cancelled());
        assert!(b.token.is_cancelled());
        // severed connections still deregister on drop
        drop(a);
        drop(b);
        assert!(tracker.is_empty());
    }
}
