use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use controller_runtime::{
    Action, Dispatcher, Informer, Lister, ObjectKey, RateLimitedQueue, ReconcileError, Reconciler,
};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Diagnostics, State};
use crate::api::v1::{Session, SessionPhase};
use crate::registry::{SessionOptions, SessionRegistry};
use crate::util::metrics::Metrics;
use crate::watch::{object_key, spawn_watch, split_key, EnqueueKey, EnqueueMapped};

/// Data-plane reconciler, running on every replica: projects Ready sessions
/// and their credential Secrets into the local proxy registry, and removes
/// everything else.
pub struct DataplaneReconciler {
    session_lister: Lister<Session>,
    secret_lister: Lister<Secret>,
    registry: Arc<SessionRegistry>,
    metrics: Metrics,
    diagnostics: Arc<RwLock<Diagnostics>>,
}

#[async_trait::async_trait]
impl Reconciler for DataplaneReconciler {
    async fn reconcile(&self, key: &str) -> Result<Action, ReconcileError> {
        let _timer = self.metrics.count_and_measure("dataplane");
        self.diagnostics.write().await.last_event = Utc::now();

        let (namespace, name) = split_key(key)
            .ok_or_else(|| ReconcileError::Parse(format!("malformed session key {key:?}")))?;

        let result = self.sync(namespace, name).await;
        if let Err(err) = &result {
            self.metrics.reconcile_failure("dataplane", err.metric_label());
        }
        result
    }
}

impl DataplaneReconciler {
    async fn sync(&self, namespace: &str, name: &str) -> Result<Action, ReconcileError> {
        let Some(session) = self.session_lister.get_by_name(namespace, name) else {
            // tombstone: a delete event with no current object is still a
            // deregistration intent
            self.registry.unregister(name);
            return Ok(Action::await_change());
        };

        let status = session.status.clone().unwrap_or_default();
        let expired = status
            .expires_at
            .map(|t| Utc::now() >= t)
            .unwrap_or(false);
        let (Some(secret_ref), Some(backend_url)) =
            (status.credentials_secret_ref.clone(), status.backend_kas_url.clone())
        else {
            self.registry.unregister(name);
            return Ok(Action::await_change());
        };
        if session.phase() == SessionPhase::Terminated || expired {
            self.registry.unregister(name);
            return Ok(Action::await_change());
        }

        let Some(secret) = self.secret_lister.get_by_name(namespace, &secret_ref) else {
            // management plane has not finished minting; the Secret event
            // re-enqueues us, backoff covers a missed watch
            debug!(session = %name, "credential secret not in cache yet");
            return Err(ReconcileError::Transient(format!(
                "credential secret {secret_ref} not found"
            )));
        };
        let data = secret.data.clone().unwrap_or_default();
        let (Some(key_pem), Some(cert_pem)) = (data.get("tls.key"), data.get("tls.crt")) else {
            return Err(ReconcileError::Transient(format!(
                "credential secret {secret_ref} missing tls.key/tls.crt"
            )));
        };
        let key_pem = String::from_utf8(key_pem.0.clone())
            .map_err(|_| ReconcileError::PermanentDeny("tls.key is not valid UTF-8".into()))?;
        let cert_pem = String::from_utf8(cert_pem.0.clone())
            .map_err(|_| ReconcileError::PermanentDeny("tls.crt is not valid UTF-8".into()))?;
        let ca_pem = data
            .get("ca.crt")
            .and_then(|v| String::from_utf8(v.0.clone()).ok());

        let insecure_skip_verify = ca_pem.is_none();
        self.registry
            .register(SessionOptions {
                session_name: session.name_any(),
                owner: session.spec.owner.clone(),
                backend_url,
                cert_pem,
                key_pem,
                ca_pem,
                insecure_skip_verify,
            })
            .map_err(|e| ReconcileError::PermanentDeny(e.to_string()))?;
        Ok(Action::await_change())
    }
}

/// Maps a credential Secret back to its owning Session's cache key.
fn secret_to_session(secret: &Secret) -> Option<ObjectKey> {
    let namespace = secret.metadata.namespace.as_deref().unwrap_or("");
    secret
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.kind == "Session"))
        .map(|r| ObjectKey::new(namespace, &r.name))
        .or_else(|| {
            secret
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(super::session_controller::SESSION_LABEL))
                .map(|name| ObjectKey::new(namespace, name))
        })
}

/// Initialize the data-plane controller on this replica.
pub async fn run(
    client: kube::Client,
    state: State,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) {
    let sessions_api: Api<Session> = Api::all(client.clone());
    if let Err(e) = sessions_api.list(&ListParams::default().limit(1)).await {
        error!("Session CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    let secrets_api: Api<Secret> = Api::all(client.clone());

    let session_informer = Informer::new(object_key::<Session> as fn(&Session) -> ObjectKey);
    let secret_informer = Informer::new(object_key::<Secret> as fn(&Secret) -> ObjectKey);
    let queue = RateLimitedQueue::new("sessiongate_dataplane");
    if let Err(e) = queue.metrics().register(state.registry()) {
        warn!("failed to register dataplane queue metrics: {e}");
    }
    session_informer.add_event_handler(EnqueueKey::new(Arc::clone(&queue)));
    secret_informer.add_event_handler(EnqueueMapped::new(Arc::clone(&queue), secret_to_session));

    let session_watch = spawn_watch(
        sessions_api,
        kube::runtime::watcher::Config::default(),
        Arc::clone(&session_informer),
        shutdown.clone(),
    );
    let secret_watch = spawn_watch(
        secrets_api,
        kube::runtime::watcher::Config::default().labels(super::session_controller::SESSION_LABEL),
        Arc::clone(&secret_informer),
        shutdown.clone(),
    );

    let reconciler = Arc::new(DataplaneReconciler {
        session_lister: session_informer.lister(),
        secret_lister: secret_informer.lister(),
        registry,
        metrics: state.controller_metrics(),
        diagnostics: state.diagnostics_handle(),
    });

    while !(session_informer.has_synced() && secret_informer.has_synced()) && !shutdown.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!("dataplane caches synced, starting registry reconciliation");
    Dispatcher::new(queue, reconciler, 1).run(shutdown).await;
    let _ = session_watch.await;
    let _ = secret_watch.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    #[test]
    fn secret_maps_to_session_via_owner_reference() {
        let mut secret = Secret::default();
        secret.metadata.namespace = Some("sg".into());
        secret.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "sessiongate.hcp.azure.com/v1".into(),
            kind: "Session".into(),
            name: "s1".into(),
            uid: "u".into(),
            controller: Some(true),
            block_owner_deletion: None,
        }]);
        assert_eq!(secret_to_session(&secret).unwrap().to_string(), "sg/s1");
    }

    #[test]
    fn secret_maps_to_session_via_label_fallback() {
        let mut secret = Secret::default();
        secret.metadata.namespace = Some("sg".into());
        secret.metadata.labels = Some(
            [(super::super::session_controller::SESSION_LABEL.to_string(), "s2".to_string())]
                .into_iter()
                .collect(),
        );
        assert_eq!(secret_to_session(&secret).unwrap().to_string(), "sg/s2");
    }

    #[test]
    fn unrelated_secret_maps_to_nothing() {
        let secret = Secret::default();
        assert!(secret_to_session(&secret).is_none());
    }
}
