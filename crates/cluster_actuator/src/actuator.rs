use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use controller_runtime::{Action, Dispatcher, RateLimitedQueue, ReconcileError, Reconciler};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::merge::{merge, ConvergenceIntent};
use crate::metrics::Metrics;
use crate::resource_id::ResourceId;
use crate::types::{ProvisioningState, SubscriptionState};
use crate::upstream::{ClusterServiceClient, DbClient, DbError, MaestroClient, UpstreamError};

pub const READY_CONDITION: &str = "Ready";

#[derive(Clone, Debug)]
pub struct ActuatorConfig {
    /// Full enumeration cadence; bounds staleness for resources that never
    /// see a change-feed or Maestro event.
    pub relist_interval: Duration,
    /// Relist-sourced reconciles inside this window are skipped.
    pub min_reconcile_gap: Duration,
    /// Workers per queue.
    pub num_workers: usize,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        ActuatorConfig {
            relist_interval: Duration::from_secs(10 * 60),
            min_reconcile_gap: Duration::from_secs(30),
            num_workers: 4,
        }
    }
}

/// Which queue produced the key being reconciled. Recent and Maestro events
/// are themselves a change signal, so only relist keys are throttled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueSource {
    Relist,
    Recent,
    Maestro,
}

impl EnqueueSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnqueueSource::Relist => "relist",
            EnqueueSource::Recent => "recent",
            EnqueueSource::Maestro => "maestro",
        }
    }
}

/// Keeps persisted cluster and node-pool documents convergent with
/// Cluster-Service (desired) and Maestro (realized), within one relist
/// interval of staleness.
///
/// Three queues share one reconcile function; the split only prevents a
/// backlog on one event source from starving the others. Cross-queue
/// concurrency on the same key is tolerated: reconciles are idempotent and
/// document writes are CAS-guarded.
pub struct Actuator {
    inner: Arc<Inner>,
    config: ActuatorConfig,
    relist_q: Arc<RateLimitedQueue>,
    recent_q: Arc<RateLimitedQueue>,
    maestro_q: Arc<RateLimitedQueue>,
}

struct Inner {
    db: Arc<dyn DbClient>,
    cluster_service: Arc<dyn ClusterServiceClient>,
    maestro: Arc<dyn MaestroClient>,
    metrics: Metrics,
    min_reconcile_gap: Duration,
}

impl Actuator {
    pub fn new(
        db: Arc<dyn DbClient>,
        cluster_service: Arc<dyn ClusterServiceClient>,
        maestro: Arc<dyn MaestroClient>,
        config: ActuatorConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            db,
            cluster_service,
            maestro,
            metrics: Metrics::default(),
            min_reconcile_gap: config.min_reconcile_gap,
        });
        Actuator {
            inner,
            config,
            relist_q: RateLimitedQueue::new("actuator_relist"),
            recent_q: RateLimitedQueue::new("actuator_recent"),
            maestro_q: RateLimitedQueue::new("actuator_maestro"),
        }
    }

    pub fn register_metrics(&self, registry: &prometheus::Registry) -> Result<(), prometheus::Error> {
        self.inner.metrics.clone().register(registry)?;
        self.relist_q.metrics().register(registry)?;
        self.recent_q.metrics().register(registry)?;
        self.maestro_q.metrics().register(registry)?;
        Ok(())
    }

    /// Sink for persistence change-feed deltas (canonical resource keys).
    pub fn recent_sink(&self) -> mpsc::Sender<String> {
        Self::sink_into(Arc::clone(&self.recent_q))
    }

    /// Sink for Maestro change notifications, from any polling or push
    /// adapter.
    pub fn maestro_sink(&self) -> mpsc::Sender<String> {
        Self::sink_into(Arc::clone(&self.maestro_q))
    }

    fn sink_into(queue: Arc<RateLimitedQueue>) -> mpsc::Sender<String> {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(key) = rx.recv().await {
                queue.add(&key.to_ascii_lowercase());
            }
        });
        tx
    }

    /// Enumerate every resource under every Registered subscription into the
    /// relist queue.
    pub async fn relist_now(&self) {
        let subscriptions = match self.inner.db.list_subscriptions().await {
            Ok(subs) => subs,
            Err(e) => {
                warn!("relist: failed to list subscriptions: {e}");
                return;
            }
        };
        for subscription in subscriptions
            .iter()
            .filter(|s| s.state == SubscriptionState::Registered)
        {
            match self.inner.db.list_resource_keys(&subscription.subscription_id).await {
                Ok(keys) => {
                    for key in keys {
                        self.relist_q.add(&key);
                    }
                }
                Err(e) => warn!(
                    "relist: failed to enumerate subscription {}: {e}",
                    subscription.subscription_id
                ),
            }
        }
    }

    pub fn relist_depth(&self) -> usize {
        self.relist_q.len()
    }

    /// Run the relist ticker and all three worker pools until `shutdown`
    /// fires, then drain.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            workers = self.config.num_workers,
            relist_interval_secs = self.config.relist_interval.as_secs(),
            "starting cluster actuator"
        );

        let dispatchers = [
            (Arc::clone(&self.relist_q), EnqueueSource::Relist),
            (Arc::clone(&self.recent_q), EnqueueSource::Recent),
            (Arc::clone(&self.maestro_q), EnqueueSource::Maestro),
        ]
        .map(|(queue, source)| {
            let reconciler: Arc<dyn Reconciler> = Arc::new(KeyReconciler {
                inner: Arc::clone(&self.inner),
                source,
            });
            tokio::spawn(Dispatcher::new(queue, reconciler, self.config.num_workers).run(shutdown.clone()))
        });

        let ticker = {
            let stop = shutdown.clone();
            let mut interval = tokio::time::interval(self.config.relist_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            async move {
                loop {
                    tokio::select! {
                        _ = interval.tick() => self.relist_now().await,
                        _ = stop.cancelled() => break,
                    }
                }
            }
        };
        ticker.await;

        for handle in dispatchers {
            let _ = handle.await;
        }
        info!("cluster actuator stopped");
    }
}

struct KeyReconciler {
    inner: Arc<Inner>,
    source: EnqueueSource,
}

#[async_trait::async_trait]
impl Reconciler for KeyReconciler {
    async fn reconcile(&self, key: &str) -> Result<Action, ReconcileError> {
        let result = self.inner.reconcile_key(self.source, key).await;
        if let Err(err) = &result {
            self.inner
                .metrics
                .reconcile_failure(self.source.as_str(), err.metric_label());
        }
        result
    }
}

impl Inner {
    async fn reconcile_key(&self, source: EnqueueSource, key: &str) -> Result<Action, ReconcileError> {
        let _timer = self.metrics.count_and_measure(source.as_str());

        let resource_id: ResourceId = key
            .parse()
            .map_err(|e| ReconcileError::Parse(format!("{e}")))?;
        let key = resource_id.canonical_key();

        let Some(doc) = self.db.get_doc(&key).await.map_err(db_error)? else {
            return self.verify_absence(&key).await;
        };

        // relist keys are only a staleness backstop; skip fresh docs
        if source == EnqueueSource::Relist {
            if let Some(last) = doc.last_reconciled_at {
                let gap = chrono::Duration::from_std(self.min_reconcile_gap)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
                if Utc::now() - last < gap {
                    self.metrics.throttled.inc();
                    return Ok(Action::await_change());
                }
            }
        }

        let desired = self
            .cluster_service
            .get_cluster(&doc.cluster_service_id)
            .await
            .map_err(|e| self.upstream_error(&doc, e))?;
        let realized = self
            .maestro
            .get_manifest(&doc.maestro_manifest_id)
            .await
            .map_err(|e| self.upstream_error(&doc, e))?;

        if desired.is_none() && realized.is_none() {
            // both authorities agree the resource is gone
            self.db.delete_doc(&key).await.map_err(db_error)?;
            self.metrics.deletions_confirmed.inc();
            info!(%key, "resource fully deleted upstream, document removed");
            return Ok(Action::await_change());
        }

        let outcome = merge(desired.as_ref(), realized.as_ref());
        if let Some(intent) = outcome.intent {
            let label = match intent {
                ConvergenceIntent::Reprovision => "reprovision",
                ConvergenceIntent::Deprovision => "deprovision",
            };
            self.metrics.convergence_intents.with_label_values(&[label]).inc();
        }

        let mut updated = doc.clone();
        updated.provisioning_state = outcome.state;
        updated.progress = outcome.progress.clone();
        if let Some(desired) = &desired {
            updated.last_observed_cluster_service_rev = desired.revision;
        }
        if let Some(realized) = &realized {
            updated.last_observed_maestro_rev = realized.revision;
        }
        match outcome.state {
            ProvisioningState::Ready => {
                updated.set_condition(READY_CONDITION, "True", "Converged", "");
            }
            ProvisioningState::Failed => {
                updated.set_condition(
                    READY_CONDITION,
                    "False",
                    "RealizedStateFailed",
                    outcome.progress.as_deref().unwrap_or(""),
                );
            }
            state => {
                updated.set_condition(
                    READY_CONDITION,
                    "False",
                    state.as_str(),
                    outcome.progress.as_deref().unwrap_or(""),
                );
            }
        }

        let changed = updated.provisioning_state != doc.provisioning_state
            || updated.progress != doc.progress
            || updated.conditions != doc.conditions
            || updated.last_observed_cluster_service_rev != doc.last_observed_cluster_service_rev
            || updated.last_observed_maestro_rev != doc.last_observed_maestro_rev;
        if changed {
            updated.last_reconciled_at = Some(Utc::now());
            self.db.put_doc(&updated).await.map_err(db_error)?;
        }
        Ok(Action::await_change())
    }

    /// The document is gone. If both upstreams agree, the deletion completed
    /// before we looked; live upstream state without a document is drift and
    /// is retried until it settles.
    async fn verify_absence(&self, key: &str) -> Result<Action, ReconcileError> {
        let desired = self
            .cluster_service
            .find_cluster_by_resource(key)
            .await
            .map_err(transient_upstream)?;
        let realized = self
            .maestro
            .find_manifest_by_resource(key)
            .await
            .map_err(transient_upstream)?;
        if desired.is_none() && realized.is_none() {
            self.metrics.deletions_confirmed.inc();
            return Ok(Action::await_change());
        }
        self.metrics.drift_detected.inc();
        warn!(%key, "document missing but upstream state still present");
        Err(ReconcileError::Transient(format!(
            "drift: no document for {key} but upstream state exists"
        )))
    }

    fn upstream_error(&self, doc: &crate::types::ResourceDoc, err: UpstreamError) -> ReconcileError {
        match err {
            UpstreamError::Transient(msg) => ReconcileError::Transient(msg),
            UpstreamError::Denied(msg) => {
                // record the deny on the document, best effort; the key is
                // not requeued until the resource changes
                let mut denied = doc.clone();
                denied.set_condition(READY_CONDITION, "False", "UpstreamDenied", &msg);
                let db = Arc::clone(&self.db);
                tokio::spawn(async move {
                    if let Err(e) = db.put_doc(&denied).await {
                        warn!("failed to record deny condition: {e}");
                    }
                });
                ReconcileError::PermanentDeny(msg)
            }
        }
    }
}

fn db_error(err: DbError) -> ReconcileError {
    match err {
        DbError::Conflict(key) => ReconcileError::Conflict(key),
        DbError::Transient(msg) => ReconcileError::Transient(msg),
    }
}

fn transient_upstream(err: UpstreamError) -> ReconcileError {
    match err {
        UpstreamError::Transient(msg) | UpstreamError::Denied(msg) => ReconcileError::Transient(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::types::{ResourceDoc, ResourceKind, Subscription};
    use crate::upstream::{DesiredSnapshot, DesiredState, RealizedSnapshot, RealizedState};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const CLUSTER_KEY: &str =
        "/subscriptions/s/resourcegroups/rg/providers/microsoft.redhatopenshift/hcpopenshiftclusters/c1";

    #[derive(Default)]
    struct FakeClusterService {
        by_id: Mutex<HashMap<String, DesiredSnapshot>>,
        by_resource: Mutex<HashMap<String, DesiredSnapshot>>,
        fail_next: Mutex<Vec<UpstreamError>>,
        calls: AtomicUsize,
    }

    impl FakeClusterService {
        fn set(&self, id: &str, snapshot: DesiredSnapshot) {
            self.by_id.lock().unwrap().insert(id.into(), snapshot);
        }
        fn fail_once(&self, err: UpstreamError) {
            self.fail_next.lock().unwrap().push(err);
        }
    }

    #[async_trait::async_trait]
    impl ClusterServiceClient for FakeClusterService {
        async fn get_cluster(&self, id: &str) -> Result<Option<DesiredSnapshot>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_next.lock().unwrap().pop() {
                return Err(err);
            }
            Ok(self.by_id.lock().unwrap().get(id).cloned())
        }
        async fn find_cluster_by_resource(
            &self,
            key: &str,
        ) -> Result<Option<DesiredSnapshot>, UpstreamError> {
            Ok(self.by_resource.lock().unwrap().get(key).cloned())
        }
    }

    #[derive(Default)]
    struct FakeMaestro {
        by_id: Mutex<HashMap<String, RealizedSnapshot>>,
        by_resource: Mutex<HashMap<String, RealizedSnapshot>>,
    }

    impl FakeMaestro {
        fn set(&self, id: &str, snapshot: RealizedSnapshot) {
            self.by_id.lock().unwrap().insert(id.into(), snapshot);
        }
    }

    #[async_trait::async_trait]
    impl MaestroClient for FakeMaestro {
        async fn get_manifest(&self, id: &str) -> Result<Option<RealizedSnapshot>, UpstreamError> {
            Ok(self.by_id.lock().unwrap().get(id).cloned())
        }
        async fn find_manifest_by_resource(
            &self,
            key: &str,
        ) -> Result<Option<RealizedSnapshot>, UpstreamError> {
            Ok(self.by_resource.lock().unwrap().get(key).cloned())
        }
    }

    struct Harness {
        db: Arc<MemoryStore>,
        cs: Arc<FakeClusterService>,
        maestro: Arc<FakeMaestro>,
        actuator: Actuator,
    }

    fn harness() -> Harness {
        let db = Arc::new(MemoryStore::new());
        let cs = Arc::new(FakeClusterService::default());
        let maestro = Arc::new(FakeMaestro::default());
        let actuator = Actuator::new(
            Arc::clone(&db) as Arc<dyn DbClient>,
            Arc::clone(&cs) as Arc<dyn ClusterServiceClient>,
            Arc::clone(&maestro) as Arc<dyn MaestroClient>,
            ActuatorConfig::default(),
        );
        Harness {
            db,
            cs,
            maestro,
            actuator,
        }
    }

    #[tokio::test]
    async fn recent_fast_path_merges_upstream_revisions() {
        let h = harness();
        h.db.seed_doc(doc_with_state(ProvisioningState::Provisioning));
        h.cs.set(
            "cs-1",
            DesiredSnapshot {
                state: DesiredState::Provisioning,
                revision: 7,
            },
        );
        h.maestro.set(
            "mm-1",
            RealizedSnapshot {
                state: RealizedState::Pending,
                revision: 3,
                progress: None,
            },
        );

        h.actuator
            .inner
            .reconcile_key(EnqueueSource::Recent, CLUSTER_KEY)
            .await
            .unwrap();

        let doc = h.db.get_doc(CLUSTER_KEY).await.unwrap().unwrap();
        assert_eq!(doc.provisioning_state, ProvisioningState::Provisioning);
        assert_eq!(doc.last_observed_cluster_service_rev, 7);
        assert_eq!(doc.last_observed_maestro_rev, 3);
        assert!(doc.last_reconciled_at.is_some());
    }

    #[tokio::test]
    async fn transient_upstream_error_is_classified_for_requeue() {
        let h = harness();
        h.db.seed_doc(doc_with_state(ProvisioningState::Provisioning));
        h.cs.fail_once(UpstreamError::Transient("503 service unavailable".into()));

        let err = h
            .actuator
            .inner
            .reconcile_key(EnqueueSource::Recent, CLUSTER_KEY)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Transient(_)));

        // upstream healthy again: the retry converges
        h.cs.set(
            "cs-1",
            DesiredSnapshot {
                state: DesiredState::Ready,
                revision: 8,
            },
        );
        h.maestro.set(
            "mm-1",
            RealizedSnapshot {
                state: RealizedState::Applied,
                revision: 8,
                progress: None,
            },
        );
        h.actuator
            .inner
            .reconcile_key(EnqueueSource::Recent, CLUSTER_KEY)
            .await
            .unwrap();
        let doc = h.db.get_doc(CLUSTER_KEY).await.unwrap().unwrap();
        assert_eq!(doc.provisioning_state, ProvisioningState::Ready);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_for_identical_snapshots() {
        let h = harness();
        h.db.seed_doc(doc_with_state(ProvisioningState::Provisioning));
        h.cs.set(
            "cs-1",
            DesiredSnapshot {
                state: DesiredState::Ready,
                revision: 5,
            },
        );
        h.maestro.set(
            "mm-1",
            RealizedSnapshot {
                state: RealizedState::Applied,
                revision: 5,
                progress: None,
            },
        );

        h.actuator
            .inner
            .reconcile_key(EnqueueSource::Recent, CLUSTER_KEY)
            .await
            .unwrap();
        let first = h.db.get_doc(CLUSTER_KEY).await.unwrap().unwrap();

        h.actuator
            .inner
            .reconcile_key(EnqueueSource::Recent, CLUSTER_KEY)
            .await
            .unwrap();
        let second = h.db.get_doc(CLUSTER_KEY).await.unwrap().unwrap();

        // no second write happened: same revision, same content
        assert_eq!(first.revision, second.revision);
        assert_eq!(first.provisioning_state, second.provisioning_state);
        assert_eq!(first.last_reconciled_at, second.last_reconciled_at);
    }

    #[tokio::test]
    async fn relist_source_is_throttled_inside_gap() {
        let h = harness();
        let mut doc = doc_with_state(ProvisioningState::Ready);
        doc.last_reconciled_at = Some(Utc::now());
        h.db.seed_doc(doc);

        h.actuator
            .inner
            .reconcile_key(EnqueueSource::Relist, CLUSTER_KEY)
            .await
            .unwrap();
        assert_eq!(h.cs.calls.load(Ordering::SeqCst), 0, "upstream fetched despite throttle");

        // the recent queue is itself a change signal and always proceeds
        h.cs.set(
            "cs-1",
            DesiredSnapshot {
                state: DesiredState::Ready,
                revision: 1,
            },
        );
        h.maestro.set(
            "mm-1",
            RealizedSnapshot {
                state: RealizedState::Applied,
                revision: 1,
                progress: None,
            },
        );
        h.actuator
            .inner
            .reconcile_key(EnqueueSource::Recent, CLUSTER_KEY)
            .await
            .unwrap();
        assert!(h.cs.calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn confirmed_absence_removes_document() {
        let h = harness();
        h.db.seed_doc(doc_with_state(ProvisioningState::Deleting));
        // neither upstream knows the resource
        h.actuator
            .inner
            .reconcile_key(EnqueueSource::Recent, CLUSTER_KEY)
            .await
            .unwrap();
        assert!(h.db.get_doc(CLUSTER_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_document_with_live_upstream_is_drift() {
        let h = harness();
        h.cs.by_resource.lock().unwrap().insert(
            CLUSTER_KEY.into(),
            DesiredSnapshot {
                state: DesiredState::Ready,
                revision: 1,
            },
        );
        let err = h
            .actuator
            .inner
            .reconcile_key(EnqueueSource::Recent, CLUSTER_KEY)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Transient(_)));
    }

    #[tokio::test]
    async fn missing_document_with_absent_upstreams_is_clean() {
        let h = harness();
        let action = h
            .actuator
            .inner
            .reconcile_key(EnqueueSource::Recent, CLUSTER_KEY)
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn unparseable_key_is_dropped() {
        let h = harness();
        let err = h
            .actuator
            .inner
            .reconcile_key(EnqueueSource::Recent, "not-a-resource-id")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Parse(_)));
    }

    #[tokio::test]
    async fn relist_of_empty_store_enqueues_nothing() {
        let h = harness();
        h.db.insert_subscription(Subscription {
            subscription_id: "s".into(),
            state: SubscriptionState::Registered,
            tenant_id: "t".into(),
        });
        h.actuator.relist_now().await;
        assert_eq!(h.actuator.relist_depth(), 0);
    }

    #[tokio::test]
    async fn relist_skips_unregistered_subscriptions() {
        let h = harness();
        h.db.insert_subscription(Subscription {
            subscription_id: "s".into(),
            state: SubscriptionState::Unregistered,
            tenant_id: "t".into(),
        });
        h.db.seed_doc(doc_with_state(ProvisioningState::Ready));
        h.actuator.relist_now().await;
        assert_eq!(h.actuator.relist_depth(), 0);
    }

    #[tokio::test]
    async fn relist_enumerates_registered_subscriptions() {
        let h = harness();
        h.db.insert_subscription(Subscription {
            subscription_id: "s".into(),
            state: SubscriptionState::Registered,
            tenant_id: "t".into(),
        });
        h.db.seed_doc(doc_with_state(ProvisioningState::Ready));
        h.actuator.relist_now().await;
        assert_eq!(h.actuator.relist_depth(), 1);
    }

    fn doc_with_state(state: ProvisioningState) -> ResourceDoc {
        ResourceDoc {
            resource_id: CLUSTER_KEY.into(),
            kind: ResourceKind::Cluster,
            cluster_service_id: "cs-1".into(),
            maestro_manifest_id: "mm-1".into(),
            provisioning_state: state,
            progress: None,
            conditions: Vec::new(),
            last_reconciled_at: None,
            last_observed_cluster_service_rev: 0,
            last_observed_maestro_rev: 0,
            payload: serde_json::Value::Null,
            revision: 0,
        }
    }
}
