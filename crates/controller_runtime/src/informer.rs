use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Namespace + name identity of a cached object. Cluster-scoped objects use
/// an empty namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        ObjectKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn cluster_scoped(name: &str) -> Self {
        ObjectKey {
            namespace: String::new(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Delete notification carrying the last-known object, when the cache still
/// had one. Consumers treat a tombstone without an object as a bare deletion
/// intent (watch lapse).
#[derive(Clone, Debug)]
pub struct Tombstone<T> {
    pub key: ObjectKey,
    pub last_known: Option<T>,
}

pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, new: &T);
    fn on_update(&self, old: &T, new: &T);
    fn on_delete(&self, tombstone: &Tombstone<T>);
}

/// A typed watch cache: a local store fed by a single driver task, with
/// consistent snapshots through [`Lister`] and ordered event delivery to
/// registered handlers.
///
/// Delivery is single-threaded (the driver calls `apply`/`delete` in watch
/// order), which preserves causal order per key. Consumers must still
/// tolerate duplicate deliveries.
pub struct Informer<T> {
    key_for: fn(&T) -> ObjectKey,
    store: RwLock<HashMap<ObjectKey, T>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<T>>>>,
    synced: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> Informer<T> {
    pub fn new(key_for: fn(&T) -> ObjectKey) -> Arc<Self> {
        Arc::new(Informer {
            key_for,
            store: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
        })
    }

    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler<T>>) {
        self.handlers.write().unwrap().push(handler);
    }

    /// True once the initial list has been populated.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn lister(self: &Arc<Self>) -> Lister<T> {
        Lister {
            informer: Arc::clone(self),
        }
    }

    /// Upsert an object and deliver `on_add`/`on_update`.
    pub fn apply(&self, obj: T) {
        let key = (self.key_for)(&obj);
        let old = self.store.write().unwrap().insert(key, obj.clone());
        let handlers = self.handlers.read().unwrap().clone();
        match old {
            None => {
                for h in &handlers {
                    h.on_add(&obj);
                }
            }
            Some(old) => {
                for h in &handlers {
                    h.on_update(&old, &obj);
                }
            }
        }
    }

    /// Remove an object and deliver `on_delete` with a tombstone.
    pub fn delete(&self, key: ObjectKey) {
        let last_known = self.store.write().unwrap().remove(&key);
        let tombstone = Tombstone { key, last_known };
        let handlers = self.handlers.read().unwrap().clone();
        for h in &handlers {
            h.on_delete(&tombstone);
        }
    }

    /// Replace the cache with a full list snapshot, emitting the events that
    /// converge the old cache onto it, then mark the informer synced.
    pub fn replace(&self, objects: Vec<T>) {
        let fresh_keys: Vec<ObjectKey> = objects.iter().map(|o| (self.key_for)(o)).collect();
        let stale: Vec<ObjectKey> = {
            let store = self.store.read().unwrap();
            store
                .keys()
                .filter(|k| !fresh_keys.contains(*k))
                .cloned()
                .collect()
        };
        for obj in objects {
            self.apply(obj);
        }
        for key in stale {
            self.delete(key);
        }
        self.synced.store(true, Ordering::Release);
    }

    /// Mark synced without a list (empty initial state).
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    fn snapshot(&self) -> Vec<T> {
        self.store.read().unwrap().values().cloned().collect()
    }

    fn get(&self, key: &ObjectKey) -> Option<T> {
        self.store.read().unwrap().get(key).cloned()
    }
}

/// Point-in-time read access to an informer's cache.
pub struct Lister<T> {
    informer: Arc<Informer<T>>,
}

impl<T: Clone + Send + Sync + 'static> Lister<T> {
    pub fn list(&self) -> Vec<T> {
        self.informer.snapshot()
    }

    pub fn get_by_name(&self, namespace: &str, name: &str) -> Option<T> {
        self.informer.get(&ObjectKey::new(namespace, name))
    }

    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        self.informer.get(key)
    }
}

impl<T> Clone for Lister<T> {
    fn clone(&self) -> Self {
        Lister {
            informer: Arc::clone(&self.informer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    struct Obj {
        ns: String,
        name: String,
        rev: u32,
    }

    fn key_for(o: &Obj) -> ObjectKey {
        ObjectKey::new(&o.ns, &o.name)
    }

    fn obj(ns: &str, name: &str, rev: u32) -> Obj {
        Obj {
            ns: ns.into(),
            name: name.into(),
            rev,
        }
    }

    #[derive(Default)]
    struct Log {
        events: Mutex<Vec<String>>,
    }

    impl EventHandler<Obj> for Log {
        fn on_add(&self, new: &Obj) {
            self.events.lock().unwrap().push(format!("add {}", new.name));
        }
        fn on_update(&self, old: &Obj, new: &Obj) {
            self.events
                .lock()
                .unwrap()
                .push(format!("update {} {}->{}", new.name, old.rev, new.rev));
        }
        fn on_delete(&self, tombstone: &Tombstone<Obj>) {
            let known = tombstone.last_known.is_some();
            self.events
                .lock()
                .unwrap()
                .push(format!("delete {} known={known}", tombstone.key.name));
        }
    }

    #[test]
    fn apply_and_delete_drive_handlers_in_order() {
        let informer = Informer::new(key_for);
        let log = Arc::new(Log::default());
        informer.add_event_handler(log.clone());

        informer.apply(obj("ns", "a", 1));
        informer.apply(obj("ns", "a", 2));
        informer.delete(ObjectKey::new("ns", "a"));
        informer.delete(ObjectKey::new("ns", "gone"));

        let events = log.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "add a",
                "update a 1->2",
                "delete a known=true",
                "delete gone known=false",
            ]
        );
    }

    #[test]
    fn replace_syncs_and_prunes_stale_keys() {
        let informer = Informer::new(key_for);
        let log = Arc::new(Log::default());
        informer.add_event_handler(log.clone());
        assert!(!informer.has_synced());

        informer.apply(obj("ns", "stale", 1));
        informer.replace(vec![obj("ns", "a", 1), obj("ns", "b", 1)]);

        assert!(informer.has_synced());
        let lister = informer.lister();
        assert_eq!(lister.list().len(), 2);
        assert!(lister.get_by_name("ns", "stale").is_none());
        assert_eq!(lister.get_by_name("ns", "a").unwrap().rev, 1);
        let events = log.events.lock().unwrap().clone();
        assert!(events.contains(&"delete stale known=true".to_string()));
    }

    #[test]
    fn lister_snapshots_are_stable() {
        let informer = Informer::new(key_for);
        informer.apply(obj("ns", "a", 1));
        let lister = informer.lister();
        let snapshot = lister.list();
        informer.apply(obj("ns", "a", 2));
        assert_eq!(snapshot[0].rev, 1);
        assert_eq!(lister.get_by_name("ns", "a").unwrap().rev, 2);
    }
}
