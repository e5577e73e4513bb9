use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::{ResourceDoc, Subscription};
use crate::upstream::{DbClient, DbError};

/// In-memory document store with CAS revisions, keyed by canonical
/// lowercase resource id. Backs tests and local runs; the Cosmos driver
/// plugs in through the same [`DbClient`] trait.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<String, ResourceDoc>,
    subscriptions: Vec<Subscription>,
    next_revision: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        self.inner.lock().unwrap().subscriptions.push(subscription);
    }

    /// Seed a document bypassing the CAS check, as the Admin API would on
    /// resource creation.
    pub fn seed_doc(&self, mut doc: ResourceDoc) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_revision += 1;
        doc.revision = inner.next_revision;
        inner.docs.insert(doc.resource_id.to_ascii_lowercase(), doc);
    }

    pub fn doc_count(&self) -> usize {
        self.inner.lock().unwrap().docs.len()
    }
}

#[async_trait]
impl DbClient for MemoryStore {
    async fn get_doc(&self, key: &str) -> Result<Option<ResourceDoc>, DbError> {
        Ok(self.inner.lock().unwrap().docs.get(key).cloned())
    }

    async fn put_doc(&self, doc: &ResourceDoc) -> Result<ResourceDoc, DbError> {
        let mut inner = self.inner.lock().unwrap();
        let key = doc.resource_id.to_ascii_lowercase();
        if let Some(stored) = inner.docs.get(&key) {
            if stored.revision != doc.revision {
                return Err(DbError::Conflict(key));
            }
        }
        inner.next_revision += 1;
        let mut updated = doc.clone();
        updated.revision = inner.next_revision;
        inner.docs.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete_doc(&self, key: &str) -> Result<(), DbError> {
        self.inner.lock().unwrap().docs.remove(key);
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, DbError> {
        Ok(self.inner.lock().unwrap().subscriptions.clone())
    }

    async fn list_resource_keys(&self, subscription_id: &str) -> Result<Vec<String>, DbError> {
        let needle = format!("/subscriptions/{}/", subscription_id.to_ascii_lowercase());
        Ok(self
            .inner
            .lock()
            .unwrap()
            .docs
            .keys()
            .filter(|k| k.starts_with(&needle))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProvisioningState, ResourceKind};

    fn doc(id: &str) -> ResourceDoc {
        ResourceDoc {
            resource_id: id.into(),
            kind: ResourceKind::Cluster,
            cluster_service_id: "cs".into(),
            maestro_manifest_id: "mm".into(),
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

    #[tokio::test]
    async fn put_doc_enforces_cas() {
        let store = MemoryStore::new();
        store.seed_doc(doc("/subscriptions/s/resourceGroups/rg/providers/p/t/n"));
        let key = "/subscriptions/s/resourcegroups/rg/providers/p/t/n";
        let current = store.get_doc(key).await.unwrap().unwrap();

        let mut stale = current.clone();
        stale.revision -= 1;
        assert!(matches!(store.put_doc(&stale).await, Err(DbError::Conflict(_))));

        let updated = store.put_doc(&current).await.unwrap();
        assert!(updated.revision > current.revision);
    }

    #[tokio::test]
    async fn list_resource_keys_filters_by_subscription() {
        let store = MemoryStore::new();
        store.seed_doc(doc("/subscriptions/a/resourceGroups/rg/providers/p/t/one"));
        store.seed_doc(doc("/subscriptions/b/resourceGroups/rg/providers/p/t/two"));
        let keys = store.list_resource_keys("a").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].contains("/subscriptions/a/"));
    }
}
