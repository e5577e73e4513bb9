/// Rate-limited, deduplicating key queue
pub mod queue;
pub use queue::RateLimitedQueue;

/// Worker pool draining queues into a reconcile function
pub mod dispatcher;
pub use dispatcher::{Action, Dispatcher, Reconciler};

/// Typed watch-cache surface with listers and event handlers
pub mod informer;
pub use informer::{EventHandler, Informer, Lister, ObjectKey, Tombstone};

/// Error classification consumed by the dispatcher
pub mod error;
pub use error::{Disposition, ReconcileError};

/// Work-queue metrics
mod metrics;
pub use metrics::QueueMetrics;
