//! Reference-counted cache of file handlers.
//!
//! Opening a convolved file is expensive (decoder setup, filter lookup,
//! header synthesis), and media players love to open, close and re-open
//! files in quick succession while indexing. The cache keeps handlers
//! alive across such storms: an entry only becomes evictable once its pin
//! count drops to zero, and eviction removes the oldest unreferenced
//! entries until the cache fits its capacity again.

use crate::handler::{FileHandler, HandlerStats, HandlerStatus};
use crate::{current_time, lock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Observer for handler lifecycle events. Callbacks run under the cache
/// mutex; implementations must not call back into the cache.
pub trait CacheObserver: Send + Sync {
    /// A handler was inserted (or re-pinned on insert collision).
    fn insert_handler_event(&self, handler: &Arc<dyn FileHandler>);
    /// A handler is about to be dropped from the cache.
    fn retire_handler_event(&self, handler: &Arc<dyn FileHandler>);
}

struct Entry {
    handler: Arc<dyn FileHandler>,
    references: usize,
    last_access: f64,
}

struct Inner {
    map: HashMap<String, Entry>,
    observer: Option<Arc<dyn CacheObserver>>,
}

/// Map from cache key to pinned, LRU-evicted handlers.
pub struct FileHandlerCache {
    max_size: usize,
    inner: Mutex<Inner>,
}

impl FileHandlerCache {
    /// Cache keeping up to `max_size` handlers (more while pinned).
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                observer: None,
            }),
        }
    }

    /// Register the lifecycle observer. May only be set once.
    pub fn set_observer(&self, observer: Arc<dyn CacheObserver>) {
        let mut inner = lock(&self.inner);
        debug_assert!(inner.observer.is_none());
        inner.observer = Some(observer);
    }

    /// Insert `handler` under `key` and pin it. If the key is already
    /// present the passed handler is discarded and the existing one pinned
    /// and returned instead: there is at most one handler per key.
    pub fn insert_pinned(
        &self,
        key: &str,
        handler: Arc<dyn FileHandler>,
    ) -> Arc<dyn FileHandler> {
        // Evicted handlers must not be torn down while the cache mutex is
        // held: teardown flushes the conversion pipeline, and the producer
        // side (gapless hand-off) takes this cache's mutex.
        let mut evicted: Vec<Arc<dyn FileHandler>> = Vec::new();
        let result = {
            let mut inner = lock(&self.inner);
            let entry = inner.map.entry(key.to_string()).or_insert(Entry {
                handler,
                references: 0,
                last_access: 0.0,
            });
            entry.references += 1;
            entry.last_access = current_time();
            let result = Arc::clone(&entry.handler);
            if inner.map.len() > self.max_size {
                Self::evict_oldest_unreferenced(&mut inner, self.max_size, &mut evicted);
            }
            if let Some(observer) = inner.observer.clone() {
                observer.insert_handler_event(&result);
            }
            result
        };
        drop(evicted);
        result
    }

    /// Look up and pin the handler for `key`.
    pub fn find_and_pin(&self, key: &str) -> Option<Arc<dyn FileHandler>> {
        let mut inner = lock(&self.inner);
        let entry = inner.map.get_mut(key)?;
        entry.references += 1;
        entry.last_access = current_time();
        Some(Arc::clone(&entry.handler))
    }

    /// Release one pin on `key`. If the entry becomes unreferenced while
    /// the cache is over capacity it is evicted immediately; otherwise it
    /// stays cached as idle.
    pub fn unpin(&self, key: &str) {
        let mut evicted: Option<Arc<dyn FileHandler>> = None;
        {
            let mut inner = lock(&self.inner);
            let over_capacity = inner.map.len() > self.max_size;
            let Some(entry) = inner.map.get_mut(key) else {
                debug_assert!(false, "unpin of unknown key '{key}'");
                return;
            };
            entry.references = entry.references.saturating_sub(1);
            if entry.references == 0 && over_capacity {
                let entry = inner.map.remove(key).unwrap_or_else(|| unreachable!());
                if let Some(observer) = inner.observer.clone() {
                    observer.retire_handler_event(&entry.handler);
                }
                evicted = Some(entry.handler);
            }
        }
        // Teardown outside the lock, see insert_pinned.
        drop(evicted);
    }

    /// Stats of every cached handler, annotated with cache state.
    pub fn get_stats(&self) -> Vec<HandlerStats> {
        let inner = lock(&self.inner);
        inner
            .map
            .values()
            .map(|entry| {
                let mut stats = entry.handler.handler_stats();
                stats.status = if entry.references == 0 {
                    HandlerStatus::Idle
                } else {
                    HandlerStatus::Open
                };
                stats.last_access = entry.last_access;
                stats
            })
            .collect()
    }

    /// Number of cached entries (pinned or idle).
    pub fn len(&self) -> usize {
        lock(&self.inner).map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_oldest_unreferenced(
        inner: &mut Inner,
        max_size: usize,
        evicted: &mut Vec<Arc<dyn FileHandler>>,
    ) {
        let mut removable: Vec<(String, f64)> = inner
            .map
            .iter()
            .filter(|(_, e)| e.references == 0)
            .map(|(k, e)| (k.clone(), e.last_access))
            .collect();
        removable.sort_by(|a, b| a.1.total_cmp(&b.1));

        let to_erase = (inner.map.len() - max_size).min(removable.len());
        for (key, _) in removable.into_iter().take(to_erase) {
            let entry = inner.map.remove(&key).unwrap_or_else(|| unreachable!());
            if let Some(observer) = inner.observer.clone() {
                observer.retire_handler_event(&entry.handler);
            }
            evicted.push(entry.handler);
        }
    }
}
