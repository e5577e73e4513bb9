use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ResourceDoc, Subscription};

/// Errors from the desired/realized upstreams. `Denied` covers 4xx other
/// than 404; 404 is surfaced as `Ok(None)` by the clients.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error("upstream denied the request: {0}")]
    Denied(String),
}

/// Errors from the persistence layer. Conflicts come from the optimistic
/// revision check on writes.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("revision conflict on {0}")]
    Conflict(String),

    #[error("transient persistence error: {0}")]
    Transient(String),
}

/// Desired state as reported by Cluster-Service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesiredState {
    Provisioning,
    Updating,
    Ready,
    Deleting,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredSnapshot {
    pub state: DesiredState,
    #[serde(rename = "rev")]
    pub revision: i64,
}

/// Realized state as reported by Maestro.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RealizedState {
    Pending,
    Progressing,
    Applied,
    Deleting,
    Deleted,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealizedSnapshot {
    pub state: RealizedState,
    #[serde(rename = "rev")]
    pub revision: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

/// Cosmos persistence surface. The driver is external; the actuator only
/// sees documents keyed by canonical lowercase resource id with monotonic
/// revisions.
#[async_trait]
pub trait DbClient: Send + Sync + 'static {
    async fn get_doc(&self, key: &str) -> Result<Option<ResourceDoc>, DbError>;

    /// Compare-and-set write: succeeds only when the stored revision equals
    /// `doc.revision`, and returns the document with its new revision.
    async fn put_doc(&self, doc: &ResourceDoc) -> Result<ResourceDoc, DbError>;

    /// Idempotent delete.
    async fn delete_doc(&self, key: &str) -> Result<(), DbError>;

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, DbError>;

    /// Canonical keys of every cluster/node-pool doc under a subscription.
    async fn list_resource_keys(&self, subscription_id: &str) -> Result<Vec<String>, DbError>;
}

/// Desired-state authority.
#[async_trait]
pub trait ClusterServiceClient: Send + Sync + 'static {
    /// Lookup by the opaque Cluster-Service handle stored on the doc.
    async fn get_cluster(&self, cluster_service_id: &str) -> Result<Option<DesiredSnapshot>, UpstreamError>;

    /// Lookup by canonical resource key, for docs the persistence layer no
    /// longer has (absence verification).
    async fn find_cluster_by_resource(&self, resource_key: &str)
        -> Result<Option<DesiredSnapshot>, UpstreamError>;
}

/// Realized-state authority.
#[async_trait]
pub trait MaestroClient: Send + Sync + 'static {
    async fn get_manifest(&self, manifest_id: &str) -> Result<Option<RealizedSnapshot>, UpstreamError>;

    async fn find_manifest_by_resource(&self, resource_key: &str)
        -> Result<Option<RealizedSnapshot>, UpstreamError>;
}
