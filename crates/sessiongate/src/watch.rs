use std::fmt::Debug;
use std::sync::Arc;

use controller_runtime::{EventHandler, Informer, ObjectKey, RateLimitedQueue, Tombstone};
use futures::TryStreamExt;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cache key for any Kubernetes object.
pub fn object_key<K: Resource>(obj: &K) -> ObjectKey {
    ObjectKey::new(
        obj.meta().namespace.as_deref().unwrap_or(""),
        obj.meta().name.as_deref().unwrap_or(""),
    )
}

/// Drive an informer from a kube watcher stream. The watcher handles list,
/// resume and relist; this task only translates its events into cache
/// applies and tombstoned deletes, in watch order.
pub fn spawn_watch<K>(
    api: Api<K>,
    config: watcher::Config,
    informer: Arc<Informer<K>>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let stream = watcher::watcher(api, config.any_semantic());
        futures::pin_mut!(stream);
        let mut pending: Vec<K> = Vec::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = stream.try_next() => match event {
                    Ok(Some(Event::Init)) => pending.clear(),
                    Ok(Some(Event::InitApply(obj))) => pending.push(obj),
                    Ok(Some(Event::InitDone)) => informer.replace(std::mem::take(&mut pending)),
                    Ok(Some(Event::Apply(obj))) => informer.apply(obj),
                    Ok(Some(Event::Delete(obj))) => informer.delete(object_key(&obj)),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("watch stream error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }
    })
}

/// Enqueues the cache key of every event into a work queue.
pub struct EnqueueKey {
    queue: Arc<RateLimitedQueue>,
}

impl EnqueueKey {
    pub fn new(queue: Arc<RateLimitedQueue>) -> Arc<Self> {
        Arc::new(EnqueueKey { queue })
    }
}

impl<K: Resource> EventHandler<K> for EnqueueKey {
    fn on_add(&self, new: &K) {
        self.queue.add(&object_key(new).to_string());
    }

    fn on_update(&self, _old: &K, new: &K) {
        self.queue.add(&object_key(new).to_string());
    }

    fn on_delete(&self, tombstone: &Tombstone<K>) {
        self.queue.add(&tombstone.key.to_string());
    }
}

/// Enqueues a key derived from the object, for watches on owned resources
/// (e.g. credential Secrets mapping back to their Session).
pub struct EnqueueMapped<K> {
    queue: Arc<RateLimitedQueue>,
    map: fn(&K) -> Option<ObjectKey>,
}

impl<K> EnqueueMapped<K> {
    pub fn new(queue: Arc<RateLimitedQueue>, map: fn(&K) -> Option<ObjectKey>) -> Arc<Self> {
        Arc::new(EnqueueMapped { queue, map })
    }
}

impl<K: Send + Sync> EventHandler<K> for EnqueueMapped<K> {
    fn on_add(&self, new: &K) {
        if let Some(key) = (self.map)(new) {
            self.queue.add(&key.to_string());
        }
    }

    fn on_update(&self, old: &K, new: &K) {
        for obj in [old, new] {
            if let Some(key) = (self.map)(obj) {
                self.queue.add(&key.to_string());
            }
        }
    }

    fn on_delete(&self, tombstone: &Tombstone<K>) {
        if let Some(obj) = &tombstone.last_known {
            if let Some(key) = (self.map)(obj) {
                self.queue.add(&key.to_string());
            }
        }
    }
}

/// Split a `namespace/name` queue key back into its parts.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}
