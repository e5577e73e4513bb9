/// CRD types for the breakglass plane
pub mod api;

/// Short-lived client certificate minting against the hosted signer
pub mod csr;
pub use csr::{CsrMinter, MintError, MintedCredentials};

/// Management-plane and data-plane controllers
pub mod controllers;

/// Per-session upstream registry shared with the proxy
pub mod registry;
pub use registry::{SessionOptions, SessionRegistry};

/// The per-session authenticating reverse proxy
pub mod proxy;

/// kube watcher to informer drivers
pub mod watch;

/// Shared utilities: errors, conditions, telemetry, metrics
pub mod util;
