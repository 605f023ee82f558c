//! Process-wide tracer registries keyed by function-pair identity.
//!
//! Entries are weak: a registry never keeps a tracer alive. Each tracer
//! removes its own entry when it is dropped.

use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

pub(crate) type PairKey = (usize, usize);

pub(crate) struct InstanceCache<T> {
    kind: &'static str,
    entries: Mutex<FxHashMap<PairKey, Weak<T>>>,
}

impl<T> InstanceCache<T> {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Live instance for `key`, or a fresh one from `build`.
    ///
    /// No strong reference is released while the lock is held, so a tracer's
    /// drop (which takes the lock to evict itself) cannot run under it.
    pub(crate) fn get_or_create(&self, key: PairKey, build: impl FnOnce() -> T) -> Arc<T> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&key).and_then(Weak::upgrade) {
            tracing::trace!(kind = self.kind, "reusing live tracer");
            return existing;
        }
        let created = Arc::new(build());
        entries.insert(key, Arc::downgrade(&created));
        tracing::debug!(kind = self.kind, live = entries.len(), "registered tracer");
        created
    }

    /// Remove `key` unless a live instance has already replaced the dead one.
    pub(crate) fn evict(&self, key: PairKey) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries
            .get(&key)
            .is_some_and(|entry| entry.strong_count() == 0)
        {
            entries.remove(&key);
            tracing::debug!(kind = self.kind, live = entries.len(), "evicted tracer");
        }
    }

    pub(crate) fn contains_live(&self, key: PairKey) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .is_some_and(|entry| entry.strong_count() > 0)
    }
}
