/// ARM-style hierarchical resource identifiers
pub mod resource_id;
pub use resource_id::ResourceId;

/// Persisted document and subscription models
pub mod types;

/// Upstream interfaces: persistence, Cluster-Service, Maestro
pub mod upstream;

/// HTTP-backed Cluster-Service and Maestro clients
pub mod http;

/// In-memory persistence used by tests and local runs
pub mod memory;
pub use memory::MemoryStore;

/// Desired/realized merge policy
pub mod merge;

/// The actuator: queues, sources and the reconcile loop
pub mod actuator;
pub use actuator::{Actuator, ActuatorConfig, EnqueueSource};

/// Actuator metrics
mod metrics;
pub use metrics::Metrics;
