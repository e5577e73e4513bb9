use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use controller_runtime::{
    Action, Dispatcher, Informer, Lister, ObjectKey, RateLimitedQueue, ReconcileError, Reconciler,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Diagnostics, State};
use crate::api::v1::{Session, SessionPhase, SessionStatus, SESSION_FINALIZER};
use crate::csr::{CsrMinter, MintError, DEFAULT_CSR_TIMEOUT};
use crate::util::conditions::{new_condition, set_condition, READY_CONDITION};
use crate::util::metrics::Metrics;
use crate::watch::{object_key, spawn_watch, split_key, EnqueueKey};

pub const FIELD_MANAGER: &str = "sessiongate-controller";
pub const SESSION_LABEL: &str = "sessiongate.hcp.azure.com/session";

#[derive(Clone, Debug)]
pub struct SessionControllerConfig {
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    /// A Ready session inside this window of its expiry reports `Expiring`.
    pub grace_window: Duration,
    pub csr_timeout: Duration,
}

impl Default for SessionControllerConfig {
    fn default() -> Self {
        SessionControllerConfig {
            min_ttl: Duration::from_secs(5 * 60),
            max_ttl: Duration::from_secs(24 * 60 * 60),
            grace_window: Duration::from_secs(60),
            csr_timeout: DEFAULT_CSR_TIMEOUT,
        }
    }
}

/// Clamp a requested ttl into the deployment's bounds.
pub fn clamp_ttl(requested_seconds: i64, min: Duration, max: Duration) -> i64 {
    requested_seconds.clamp(min.as_secs() as i64, max.as_secs() as i64)
}

/// Phase of a live (non-deleted, credentialed) session derived from its
/// remaining lifetime.
pub fn lifecycle_phase(now: DateTime<Utc>, expires_at: DateTime<Utc>, grace: Duration) -> SessionPhase {
    if now >= expires_at {
        return SessionPhase::Terminated;
    }
    let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::seconds(60));
    if expires_at - now < grace {
        SessionPhase::Expiring
    } else {
        SessionPhase::Ready
    }
}

/// Management-plane reconciler: drives the Session state machine, mints
/// credentials through the CSR coordinator, owns the credential Secret and
/// the published backend URL, and tears everything down on expiry or delete.
pub struct SessionReconciler {
    client: kube::Client,
    lister: Lister<Session>,
    minter: CsrMinter,
    config: SessionControllerConfig,
    metrics: Metrics,
    diagnostics: Arc<RwLock<Diagnostics>>,
}

#[async_trait::async_trait]
impl Reconciler for SessionReconciler {
    async fn reconcile(&self, key: &str) -> Result<Action, ReconcileError> {
        let _timer = self.metrics.count_and_measure("session");
        self.diagnostics.write().await.last_event = Utc::now();

        let (namespace, name) = split_key(key)
            .ok_or_else(|| ReconcileError::Parse(format!("malformed session key {key:?}")))?;
        let Some(session) = self.lister.get_by_name(namespace, name) else {
            // deleted and finalized, or cache lag; nothing to converge
            return Ok(Action::await_change());
        };

        info!("Reconciling session \"{}\" in {}", name, namespace);
        let result = self.sync(&session).await;
        if let Err(err) = &result {
            self.metrics.reconcile_failure("session", err.metric_label());
            warn!("session reconcile failed: {err:?}");
        }
        result
    }
}

impl SessionReconciler {
    async fn sync(&self, session: &Session) -> Result<Action, ReconcileError> {
        let namespace = session.namespace().unwrap_or_default();
        let name = session.name_any();
        let sessions: Api<Session> = Api::namespaced(self.client.clone(), &namespace);
        let now = Utc::now();

        if session.metadata.deletion_timestamp.is_some() {
            self.terminate(&sessions, session, "Deleted", "session deleted").await?;
            self.remove_finalizer(&sessions, session).await?;
            return Ok(Action::await_change());
        }

        // the finalizer precedes every owned resource
        if !session.finalizers().iter().any(|f| f == SESSION_FINALIZER) {
            self.add_finalizer(&sessions, session).await?;
        }

        // expiresAt is pinned exactly once, from creation time + clamped ttl
        let expires_at = match session.status.as_ref().and_then(|s| s.expires_at.as_ref()) {
            Some(time) => *time,
            None => {
                let ttl = clamp_ttl(session.spec.ttl_seconds, self.config.min_ttl, self.config.max_ttl);
                let creation = session.creation_timestamp().map(|t| t.0).unwrap_or(now);
                let expires = creation + chrono::Duration::seconds(ttl);
                let status = merged_status(
                    session,
                    SessionPhase::Pending,
                    Some(expires),
                    None,
                    None,
                    new_condition(READY_CONDITION, false, "Pending", "session accepted"),
                );
                self.patch_status(&sessions, &name, &status).await?;
                expires
            }
        };

        if now >= expires_at {
            self.terminate(&sessions, session, "Expired", "session ttl elapsed").await?;
            return Ok(Action::await_change());
        }

        if session.phase() == SessionPhase::Terminated {
            // terminal; keep owned resources deleted no matter how often we
            // get re-enqueued
            self.delete_credentials(session).await?;
            return Ok(Action::await_change());
        }

        let credentialed = self.has_valid_credentials(session).await?;
        if !credentialed {
            let status = merged_status(
                session,
                SessionPhase::Provisioning,
                None,
                None,
                None,
                new_condition(READY_CONDITION, false, "Provisioning", "minting credentials"),
            );
            self.patch_status(&sessions, &name, &status).await?;
            self.provision(&sessions, session, expires_at).await?;
        } else {
            let phase = lifecycle_phase(now, expires_at, self.config.grace_window);
            if phase != session.phase() && phase == SessionPhase::Expiring {
                let status = merged_status(
                    session,
                    SessionPhase::Expiring,
                    None,
                    None,
                    None,
                    new_condition(READY_CONDITION, true, "Expiring", "session close to expiry"),
                );
                self.patch_status(&sessions, &name, &status).await?;
            }
        }

        // wake up at the grace boundary, then again at expiry
        let remaining = (expires_at - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        let grace = self.config.grace_window;
        let wake = if remaining > grace { remaining - grace } else { remaining };
        Ok(Action::requeue(wake.max(Duration::from_secs(1))))
    }

    /// Mint and publish credentials, moving the session to Ready. A signer
    /// deny terminates the session; transient failures bubble up for a
    /// rate-limited retry.
    async fn provision(
        &self,
        sessions: &Api<Session>,
        session: &Session,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let name = session.name_any();
        let minted = self
            .minter
            .mint(
                &session.spec.hosted_cluster,
                &session.spec.owner.name,
                &session.spec.group,
            )
            .await;

        let credentials = match minted {
            Ok(credentials) => credentials,
            Err(MintError::Denied(reason)) => {
                self.metrics
                    .sessions_terminated
                    .with_label_values(&["csr_denied"])
                    .inc();
                let status = merged_status(
                    session,
                    SessionPhase::Terminated,
                    None,
                    None,
                    None,
                    new_condition(READY_CONDITION, false, "CSRDenied", &reason),
                );
                self.patch_status(sessions, &name, &status).await?;
                self.publish_event(session, EventType::Warning, "CSRDenied", &reason).await;
                self.delete_credentials(session).await?;
                return Ok(());
            }
            Err(MintError::Timeout(what)) => {
                return Err(ReconcileError::Transient(format!("timed out waiting for {what}")))
            }
            Err(MintError::Transient(msg)) => return Err(ReconcileError::Transient(msg)),
            Err(MintError::Invalid(msg)) => {
                let status = merged_status(
                    session,
                    SessionPhase::Terminated,
                    None,
                    None,
                    None,
                    new_condition(READY_CONDITION, false, "InvalidRequest", &msg),
                );
                self.patch_status(sessions, &name, &status).await?;
                return Err(ReconcileError::PermanentDeny(msg));
            }
        };

        let namespace = session.namespace().unwrap_or_default();
        let secret_name = session.credentials_secret_name();
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                namespace: Some(namespace.clone()),
                owner_references: session.controller_owner_ref(&()).map(|o| vec![o]),
                labels: Some(
                    [
                        ("app.kubernetes.io/managed-by".to_string(), "sessiongate".to_string()),
                        (SESSION_LABEL.to_string(), name.clone()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            string_data: Some(
                [
                    ("tls.key".to_string(), credentials.key_pem.clone()),
                    ("tls.crt".to_string(), credentials.cert_pem.clone()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        };
        match secrets.create(&PostParams::default(), &secret).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // re-mint replaces the secret content wholesale
                let patch = json!({ "stringData": {
                    "tls.key": credentials.key_pem,
                    "tls.crt": credentials.cert_pem,
                }});
                secrets
                    .patch(&secret_name, &PatchParams::default(), &Patch::Merge(patch))
                    .await
                    .map_err(|e| ReconcileError::Transient(format!("failed to update secret: {e}")))?;
            }
            Err(e) => {
                return Err(ReconcileError::Transient(format!("failed to create secret: {e}")))
            }
        }

        let phase = lifecycle_phase(Utc::now(), expires_at, self.config.grace_window);
        let phase = if phase == SessionPhase::Terminated {
            // raced expiry during the mint; the next pass tears down
            SessionPhase::Expiring
        } else {
            phase
        };
        let status = merged_status(
            session,
            phase,
            None,
            Some(secret_name),
            Some(session.spec.hosted_cluster.kas_url()),
            new_condition(READY_CONDITION, true, "Provisioned", "credentials minted"),
        );
        self.patch_status(sessions, &name, &status).await?;
        self.publish_event(
            session,
            EventType::Normal,
            "CredentialsMinted",
            "break-glass credentials issued",
        )
        .await;
        Ok(())
    }

    /// True when the status references a Secret that exists and carries both
    /// PEM keys.
    async fn has_valid_credentials(&self, session: &Session) -> Result<bool, ReconcileError> {
        let Some(status) = &session.status else { return Ok(false) };
        if status.credentials_secret_ref.is_none() || status.backend_kas_url.is_none() {
            return Ok(false);
        }
        let namespace = session.namespace().unwrap_or_default();
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = secrets
            .get_opt(status.credentials_secret_ref.as_deref().unwrap_or_default())
            .await
            .map_err(|e| ReconcileError::Transient(format!("failed to read secret: {e}")))?;
        Ok(secret
            .and_then(|s| s.data)
            .map(|data| {
                data.get("tls.key").map(|v| !v.0.is_empty()).unwrap_or(false)
                    && data.get("tls.crt").map(|v| !v.0.is_empty()).unwrap_or(false)
            })
            .unwrap_or(false))
    }

    /// Idempotent teardown: Terminated status, deleted credentials, an event
    /// on the first transition only.
    async fn terminate(
        &self,
        sessions: &Api<Session>,
        session: &Session,
        reason: &str,
        message: &str,
    ) -> Result<(), ReconcileError> {
        let name = session.name_any();
        let first_transition = session.phase() != SessionPhase::Terminated;
        if first_transition {
            let status = merged_status(
                session,
                SessionPhase::Terminated,
                None,
                None,
                None,
                new_condition(READY_CONDITION, false, reason, message),
            );
            self.patch_status(sessions, &name, &status).await?;
            self.metrics
                .sessions_terminated
                .with_label_values(&[&reason.to_lowercase()])
                .inc();
            self.publish_event(session, EventType::Normal, reason, message).await;
        }
        self.delete_credentials(session).await?;
        // residual CSRs from a mint that died before its own cleanup
        self.minter.cleanup_residuals(&session.spec.hosted_cluster).await;
        Ok(())
    }

    async fn delete_credentials(&self, session: &Session) -> Result<(), ReconcileError> {
        let namespace = session.namespace().unwrap_or_default();
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        match secrets
            .delete(&session.credentials_secret_name(), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(ReconcileError::Transient(format!("failed to delete secret: {e}"))),
        }
    }

    async fn add_finalizer(&self, sessions: &Api<Session>, session: &Session) -> Result<(), ReconcileError> {
        let mut finalizers = session.finalizers().to_vec();
        finalizers.push(SESSION_FINALIZER.to_string());
        self.patch_finalizers(sessions, &session.name_any(), finalizers).await
    }

    async fn remove_finalizer(
        &self,
        sessions: &Api<Session>,
        session: &Session,
    ) -> Result<(), ReconcileError> {
        let finalizers: Vec<String> = session
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != SESSION_FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(sessions, &session.name_any(), finalizers).await
    }

    async fn patch_finalizers(
        &self,
        sessions: &Api<Session>,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ReconcileError> {
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        sessions
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| ReconcileError::Transient(format!("failed to patch finalizers: {e}")))?;
        Ok(())
    }

    async fn patch_status(
        &self,
        sessions: &Api<Session>,
        name: &str,
        status: &SessionStatus,
    ) -> Result<(), ReconcileError> {
        let patch = Patch::Merge(json!({ "status": status }));
        sessions
            .patch_status(name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| ReconcileError::Transient(format!("failed to patch status: {e}")))?;
        Ok(())
    }

    async fn publish_event(&self, session: &Session, type_: EventType, reason: &str, note: &str) {
        let reporter = self.diagnostics.read().await.reporter.clone();
        let recorder = Recorder::new(self.client.clone(), reporter);
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(note.into()),
            action: "Reconciling".into(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, &session.object_ref(&())).await {
            warn!("failed to publish event: {e}");
        }
    }
}

fn merged_status(
    session: &Session,
    phase: SessionPhase,
    expires_at: Option<DateTime<Utc>>,
    credentials_secret_ref: Option<String>,
    backend_kas_url: Option<String>,
    condition: k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition,
) -> SessionStatus {
    let existing = session.status.clone().unwrap_or_default();
    let (conditions, _) = set_condition(&existing.conditions, condition);
    SessionStatus {
        conditions,
        phase,
        expires_at: expires_at.or(existing.expires_at),
        credentials_secret_ref: credentials_secret_ref.or(existing.credentials_secret_ref),
        backend_kas_url: backend_kas_url.or(existing.backend_kas_url),
    }
}

/// Initialize the management-plane controller (given the crd is installed)
pub async fn run(
    client: kube::Client,
    state: State,
    config: SessionControllerConfig,
    shutdown: CancellationToken,
) {
    let sessions_api: Api<Session> = Api::all(client.clone());
    if let Err(e) = sessions_api.list(&ListParams::default().limit(1)).await {
        error!("Session CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let informer = Informer::new(object_key::<Session> as fn(&Session) -> ObjectKey);
    let queue = RateLimitedQueue::new("sessiongate_sessions");
    if let Err(e) = queue.metrics().register(state.registry()) {
        warn!("failed to register session queue metrics: {e}");
    }
    informer.add_event_handler(EnqueueKey::new(Arc::clone(&queue)));
    let watch = spawn_watch(
        sessions_api,
        kube::runtime::watcher::Config::default(),
        Arc::clone(&informer),
        shutdown.clone(),
    );

    let reconciler = Arc::new(SessionReconciler {
        lister: informer.lister(),
        minter: CsrMinter::new(client.clone(), config.csr_timeout),
        metrics: state.controller_metrics(),
        diagnostics: state.diagnostics_handle(),
        config,
        client,
    });

    while !informer.has_synced() && !shutdown.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Dispatcher::new(queue, reconciler, 1).run(shutdown).await;
    let _ = watch.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::{HostedClusterRef, SessionOwner, SessionOwnerType, SessionSpec};
    use kube::api::ObjectMeta;

    #[test]
    fn ttl_is_clamped_to_bounds() {
        let min = Duration::from_secs(5 * 60);
        let max = Duration::from_secs(24 * 60 * 60);
        assert_eq!(clamp_ttl(60, min, max), 300);
        assert_eq!(clamp_ttl(3600, min, max), 3600);
        assert_eq!(clamp_ttl(7 * 24 * 3600, min, max), 86400);
        assert_eq!(clamp_ttl(-1, min, max), 300);
    }

    #[test]
    fn lifecycle_phase_tracks_remaining_time() {
        let grace = Duration::from_secs(60);
        let now = Utc::now();
        let expires = now + chrono::Duration::seconds(3600);
        assert_eq!(lifecycle_phase(now, expires, grace), SessionPhase::Ready);

        let expires = now + chrono::Duration::seconds(30);
        assert_eq!(lifecycle_phase(now, expires, grace), SessionPhase::Expiring);

        let expires = now - chrono::Duration::seconds(1);
        assert_eq!(lifecycle_phase(now, expires, grace), SessionPhase::Terminated);

        assert_eq!(lifecycle_phase(now, now, grace), SessionPhase::Terminated);
    }

    #[test]
    fn merged_status_preserves_earlier_fields() {
        let mut session = Session::new(
            "s1",
            SessionSpec {
                owner: SessionOwner {
                    type_: SessionOwnerType::AzureUser,
                    name: "alice@x".into(),
                },
                hosted_cluster: HostedClusterRef {
                    namespace: "hcp".into(),
                    name: "c".into(),
                    api_server_url: None,
                },
                group: "sre".into(),
                ttl_seconds: 3600,
            },
        );
        session.metadata = ObjectMeta {
            name: Some("s1".into()),
            namespace: Some("sg".into()),
            ..Default::default()
        };
        let expires = Utc::now();
        session.status = Some(SessionStatus {
            conditions: Vec::new(),
            phase: SessionPhase::Pending,
            expires_at: Some(expires),
            credentials_secret_ref: None,
            backend_kas_url: None,
        });

        let status = merged_status(
            &session,
            SessionPhase::Ready,
            None,
            Some("s1-breakglass-credentials".into()),
            Some("https://kas:6443".into()),
            new_condition(READY_CONDITION, true, "Provisioned", ""),
        );
        // expiresAt written once is never replaced
        assert_eq!(status.expires_at, Some(expires));
        assert_eq!(status.phase, SessionPhase::Ready);
        assert_eq!(status.credentials_secret_ref.as_deref(), Some("s1-breakglass-credentials"));
        assert!(is_ready(&status));

        // a later patch without the refs keeps them
        session.status = Some(status);
        let status = merged_status(
            &session,
            SessionPhase::Expiring,
            None,
            None,
            None,
            new_condition(READY_CONDITION, true, "Expiring", ""),
        );
        assert_eq!(status.credentials_secret_ref.as_deref(), Some("s1-breakglass-credentials"));
        assert_eq!(status.backend_kas_url.as_deref(), Some("https://kas:6443"));
    }

    fn is_ready(status: &SessionStatus) -> bool {
        crate::util::conditions::is_condition_true(&status.conditions, READY_CONDITION)
    }

    #[tokio::test]
    #[ignore = "uses k8s current-context"]
    async fn integration_session_reaches_ready() {
        let client = kube::Client::try_default().await.unwrap();
        let sessions: Api<Session> = Api::namespaced(client.clone(), "default");
        let session = Session::new(
            "it-session",
            SessionSpec {
                owner: SessionOwner {
                    type_: SessionOwnerType::AzureUser,
                    name: "alice@x".into(),
                },
                hosted_cluster: HostedClusterRef {
                    namespace: "hcp".into(),
                    name: "c".into(),
                    api_server_url: None,
                },
                group: "sre-breakglass".into(),
                ttl_seconds: 3600,
            },
        );
        let ssapply = PatchParams::apply("ctrltest").force();
        sessions
            .patch("it-session", &ssapply, &Patch::Apply(&session))
            .await
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(15);
        loop {
            let current = sessions.get("it-session").await.unwrap();
            if current.phase() == SessionPhase::Ready {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "session never became Ready");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}
