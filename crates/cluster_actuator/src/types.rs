use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ARM subscription registration states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    Registered,
    Unregistered,
    Warned,
    Suspended,
    Deleted,
}

impl SubscriptionState {
    /// Only non-Unregistered subscriptions may have operations reconciled.
    pub fn allows_reconcile(&self) -> bool {
        !matches!(self, SubscriptionState::Unregistered)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub subscription_id: String,
    pub state: SubscriptionState,
    pub tenant_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Cluster,
    NodePool,
}

/// Persisted provisioning state. Only the reconciler transitions it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningState {
    Provisioning,
    Updating,
    Ready,
    Deleting,
    Deleted,
    Failed,
}

impl ProvisioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningState::Provisioning => "Provisioning",
            ProvisioningState::Updating => "Updating",
            ProvisioningState::Ready => "Ready",
            ProvisioningState::Deleting => "Deleting",
            ProvisioningState::Deleted => "Deleted",
            ProvisioningState::Failed => "Failed",
        }
    }
}

/// A condition recorded on the persisted document, mirroring the Kubernetes
/// condition shape so the Admin API can surface it unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Cosmos-persisted cluster or node-pool document, keyed by the canonical
/// lowercase resource id. `revision` is the optimistic-concurrency etag.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDoc {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub cluster_service_id: String,
    pub maestro_manifest_id: String,
    pub provisioning_state: ProvisioningState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DocCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_observed_cluster_service_rev: i64,
    #[serde(default)]
    pub last_observed_maestro_rev: i64,
    /// Opaque to the actuator; owned by the Admin API.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "_etag", default)]
    pub revision: i64,
}

impl ResourceDoc {
    /// Set or update a condition, refreshing the transition time only when
    /// the status actually changes.
    pub fn set_condition(&mut self, type_: &str, status: &str, reason: &str, message: &str) {
        let now = Utc::now();
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            return;
        }
        self.conditions.push(DocCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    fn doc() -> ResourceDoc {
        ResourceDoc {
            resource_id: "/subscriptions/s/resourcegroups/rg/providers/p/t/n".into(),
            kind: ResourceKind::Cluster,
            cluster_service_id: "cs-1".into(),
            maestro_manifest_id: "mm-1".into(),
            provisioning_state: ProvisioningState::Provisioning,
            progress: None,
            conditions: Vec::new(),
            last_reconciled_at: None,
            last_observed_cluster_service_rev: 0,
            last_observed_maestro_rev: 0,
            payload: serde_json::Value::Null,
            revision: 0,
        }
    }

    #[test]
    fn doc_serializes_with_etag_field() {
        let actual = serde_json::to_value(doc()).unwrap();
        assert_json_include!(
            actual: actual,
            expected: json!({
                "resourceId": "/subscriptions/s/resourcegroups/rg/providers/p/t/n",
                "kind": "Cluster",
                "provisioningState": "Provisioning",
                "_etag": 0,
            })
        );
    }

    #[test]
    fn set_condition_updates_in_place() {
        let mut doc = doc();
        doc.set_condition("Ready", "False", "Waiting", "realized state lagging");
        let first_transition = doc.conditions[0].last_transition_time;
        doc.set_condition("Ready", "False", "StillWaiting", "still lagging");
        assert_eq!(doc.conditions.len(), 1);
        assert_eq!(doc.conditions[0].reason, "StillWaiting");
        assert_eq!(doc.conditions[0].last_transition_time, first_transition);
        doc.set_condition("Ready", "True", "Converged", "");
        assert!(doc.conditions[0].last_transition_time >= first_transition);
    }

    #[test]
    fn unregistered_subscriptions_are_excluded() {
        assert!(SubscriptionState::Registered.allows_reconcile());
        assert!(SubscriptionState::Warned.allows_reconcile());
        assert!(!SubscriptionState::Unregistered.allows_reconcile());
    }
}
