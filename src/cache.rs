use crate::namespace::Namespace;
use crate::snapshot::Snapshot;

/// Hand-off seam for persisting a freshly loaded [`Snapshot`] to a
/// host-supplied disk cache. The core crate has no opinion on persisted
/// format or location; implementors own both.
pub trait SnapshotSink: Send + Sync {
    fn store(&self, snapshot: &Snapshot);
}

/// Hand-off seam for recovering a previously cached [`Snapshot`] when the
/// initial remote load fails, so a process can start serving the last known
/// good configuration instead of failing outright.
pub trait SnapshotSource: Send + Sync {
    fn load(&self, namespace: &Namespace) -> Option<Snapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryCache {
        stored: Mutex<HashMap<Namespace, Snapshot>>,
    }

    impl SnapshotSink for MemoryCache {
        fn store(&self, snapshot: &Snapshot) {
            self.stored
                .lock()
                .unwrap()
                .insert(snapshot.namespace.clone(), snapshot.clone());
        }
    }

    impl SnapshotSource for MemoryCache {
        fn load(&self, namespace: &Namespace) -> Option<Snapshot> {
            self.stored.lock().unwrap().get(namespace).cloned()
        }
    }

    #[test]
    fn store_then_load_round_trips_the_snapshot() {
        use crate::snapshot::ReleaseKey;

        let cache = MemoryCache::default();
        let ns = Namespace::new("app", "default", "application");
        let snapshot = Snapshot::new(ns.clone(), ReleaseKey("r1".into()), HashMap::new());

        cache.store(&snapshot);
        let loaded = cache.load(&ns).expect("snapshot was cached");
        assert_eq!(loaded.release_key, snapshot.release_key);
    }

    #[test]
    fn load_of_unknown_namespace_is_none() {
        let cache = MemoryCache::default();
        let ns = Namespace::new("app", "default", "application");
        assert!(cache.load(&ns).is_none());
    }
}
