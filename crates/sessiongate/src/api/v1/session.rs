use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::conditions_schema;
use crate::api::v1::{SessionOwnerType, SessionPhase};

pub static SESSION_FINALIZER: &str = "sessions.sessiongate.hcp.azure.com/finalizer";

/// The identity that created the session. The proxy only accepts requests
/// whose claim matches this name.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionOwner {
    #[serde(rename = "type")]
    pub type_: SessionOwnerType,
    pub name: String,
}

/// Reference to the hosted control plane the session grants access to.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostedClusterRef {
    /// Management-cluster namespace holding the hosted control plane.
    pub namespace: String,
    pub name: String,
    /// Overrides the derived in-cluster API server URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_url: Option<String>,
}

impl HostedClusterRef {
    /// The hosted API server URL the proxy forwards to.
    pub fn kas_url(&self) -> String {
        self.api_server_url.clone().unwrap_or_else(|| {
            format!("https://kube-apiserver.{}.svc.cluster.local:6443", self.namespace)
        })
    }
}

/// Generate the Kubernetes wrapper struct `Session` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "Session", group = "sessiongate.hcp.azure.com", version = "v1", namespaced)]
#[kube(status = "SessionStatus", shortname = "bgsession")]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    pub owner: SessionOwner,
    pub hosted_cluster: HostedClusterRef,
    /// RBAC group embedded in the minted client certificate.
    pub group: String,
    /// Requested lifetime in seconds; clamped to the deployment's
    /// [minTTL, maxTTL] on first observation.
    pub ttl_seconds: i64,
}

/// The status object of `Session`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    pub phase: SessionPhase,
    /// Set exactly once, from creation time plus the clamped ttl.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_ref: Option<String>,
    #[serde(rename = "backendKASURL", default, skip_serializing_if = "Option::is_none")]
    pub backend_kas_url: Option<String>,
}

impl Session {
    pub fn phase(&self) -> SessionPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Name of the Secret holding the minted credentials.
    pub fn credentials_secret_name(&self) -> String {
        format!("{}-breakglass-credentials", self.metadata.name.as_deref().unwrap_or_default())
    }
}
