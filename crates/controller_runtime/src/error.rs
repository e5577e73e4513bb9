use thiserror::Error;

/// Reconcile outcome classification, applied by the dispatcher at the
/// worker boundary.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Malformed key or resource id. Dropped, never retried.
    #[error("ParseError: {0}")]
    Parse(String),

    /// Network timeout, 5xx, watch lapse. Rate-limited requeue.
    #[error("TransientError: {0}")]
    Transient(String),

    /// Optimistic-concurrency write conflict. Immediate requeue.
    #[error("WriteConflict: {0}")]
    Conflict(String),

    /// Denied or invalid input already reported on the resource's
    /// conditions. Not requeued until the resource changes.
    #[error("PermanentDeny: {0}")]
    PermanentDeny(String),
}

/// What the dispatcher does with a failed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Drop,
    RequeueImmediate,
    RequeueRateLimited,
}

impl ReconcileError {
    pub fn disposition(&self) -> Disposition {
        match self {
            ReconcileError::Parse(_) | ReconcileError::PermanentDeny(_) => Disposition::Drop,
            ReconcileError::Conflict(_) => Disposition::RequeueImmediate,
            ReconcileError::Transient(_) => Disposition::RequeueRateLimited,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            ReconcileError::Parse(_) => "parse",
            ReconcileError::Transient(_) => "transient",
            ReconcileError::Conflict(_) => "conflict",
            ReconcileError::PermanentDeny(_) => "permanent_deny",
        }
    }
}
