//! Bounded LRU cache of loaded engines with single-flight construction.
//! The map lock covers bookkeeping only: loaders and inference run with it released.
//! Capacity is a hard ceiling on resident engines; eviction drops the cache's
//! handle while callers already holding one finish normally.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{EngineId, LoadError, TranslationEngine};

type LoadResult<E> = Result<Arc<E>, LoadError>;

/// Rendezvous for callers that arrive while the same engine is being built.
struct PendingLoad<E: ?Sized> {
    result: Mutex<Option<LoadResult<E>>>,
    ready: Condvar,
}

impl<E: ?Sized> PendingLoad<E> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, result: LoadResult<E>) {
        let mut slot = self.result.lock();
        *slot = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> LoadResult<E> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            self.ready.wait(&mut slot);
        }
    }
}

struct Inner<E: ?Sized> {
    /// Recency order lives in the LRU list: front is most recently used.
    resident: LruCache<EngineId, Arc<E>>,
    /// Loads currently in flight, one per engine id.
    pending: HashMap<EngineId, Arc<PendingLoad<E>>>,
}

enum Role<E: ?Sized> {
    Hit(Arc<E>),
    Wait(Arc<PendingLoad<E>>),
    Lead(Arc<PendingLoad<E>>),
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups served from a resident engine.
    pub hits: u64,
    /// Lookups that joined a load already in flight.
    pub coalesced: u64,
    /// Loader invocations.
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
    pub resident: usize,
    pub capacity: usize,
}

pub struct EngineCache<E: ?Sized = dyn TranslationEngine> {
    inner: Mutex<Inner<E>>,
    capacity: NonZeroUsize,
    hits: AtomicU64,
    coalesced: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
}

impl<E: ?Sized> EngineCache<E> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                resident: LruCache::new(capacity),
                pending: HashMap::new(),
            }),
            capacity,
            hits: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Return the engine for `id`, constructing it with `loader` on a miss.
    ///
    /// Concurrent callers for the same missing id wait for the first caller's
    /// load and share its result, success or failure. Failures are never cached.
    pub fn get_or_load<F>(&self, id: &EngineId, loader: F) -> Result<Arc<E>, LoadError>
    where
        F: FnOnce() -> Result<Arc<E>, LoadError>,
    {
        let role = {
            let mut inner = self.inner.lock();
            if let Some(engine) = inner.resident.get(id) {
                Role::Hit(Arc::clone(engine))
            } else if let Some(pending) = inner.pending.get(id) {
                Role::Wait(Arc::clone(pending))
            } else {
                let pending = Arc::new(PendingLoad::new());
                inner.pending.insert(id.clone(), Arc::clone(&pending));
                Role::Lead(pending)
            }
        };

        match role {
            Role::Hit(engine) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(engine = %id, "engine cache hit");
                Ok(engine)
            }
            Role::Wait(pending) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(engine = %id, "waiting on in-flight engine load");
                pending.wait()
            }
            Role::Lead(pending) => {
                self.loads.fetch_add(1, Ordering::Relaxed);
                info!(engine = %id, "loading engine");
                match panic::catch_unwind(AssertUnwindSafe(loader)) {
                    Ok(result) => {
                        self.finish_load(id, &pending, result.clone());
                        result
                    }
                    Err(payload) => {
                        self.finish_load(
                            id,
                            &pending,
                            Err(LoadError::Aborted {
                                engine_id: id.clone(),
                            }),
                        );
                        panic::resume_unwind(payload)
                    }
                }
            }
        }
    }

    /// Publish a load result: insert on success, release the pending slot, wake waiters.
    fn finish_load(&self, id: &EngineId, pending: &Arc<PendingLoad<E>>, result: LoadResult<E>) {
        let evicted = {
            let mut inner = self.inner.lock();
            inner.pending.remove(id);
            match &result {
                Ok(engine) => match inner.resident.push(id.clone(), Arc::clone(engine)) {
                    Some((evicted_id, evicted)) if evicted_id != *id => Some((evicted_id, evicted)),
                    _ => None,
                },
                Err(_) => None,
            }
        };

        match &result {
            Ok(_) => info!(engine = %id, "engine cached"),
            Err(e) => {
                self.load_failures.fetch_add(1, Ordering::Relaxed);
                warn!(engine = %id, error = %e, "engine load failed");
            }
        }

        // Released outside the lock; callers still holding a handle keep it alive.
        if let Some((evicted_id, evicted)) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            info!(engine = %evicted_id, "evicted least recently used engine");
            drop(evicted);
        }

        pending.complete(result);
    }

    /// Whether `id` is resident. Does not touch recency.
    pub fn contains(&self, id: &EngineId) -> bool {
        self.inner.lock().resident.contains(id)
    }

    /// Resident engine ids, most recently used first.
    pub fn resident(&self) -> Vec<EngineId> {
        self.inner
            .lock()
            .resident
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().resident.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Drop every resident engine. Loads already in flight still complete and insert.
    pub fn clear(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.resident, LruCache::new(self.capacity))
        };
        let cleared = drained.len();
        drop(drained);
        info!(cleared, "engine cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident: self.len(),
            capacity: self.capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> EngineCache<str> {
        EngineCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    fn load(cache: &EngineCache<str>, id: &str) -> Arc<str> {
        cache
            .get_or_load(&EngineId::from(id), || Ok(Arc::from(id)))
            .unwrap()
    }

    #[test]
    fn hit_returns_same_instance_without_loading() {
        let c = cache(2);
        let first = load(&c, "a");
        let second = c
            .get_or_load(&EngineId::from("a"), || panic!("loader must not run on a hit"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let stats = c.stats();
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let c = cache(2);
        load(&c, "a");
        load(&c, "b");
        // touch "a" so "b" becomes the eviction victim
        load(&c, "a");
        load(&c, "c");
        assert_eq!(c.len(), 2);
        assert!(c.contains(&EngineId::from("a")));
        assert!(!c.contains(&EngineId::from("b")));
        assert_eq!(
            c.resident(),
            vec![EngineId::from("c"), EngineId::from("a")]
        );
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn evicted_handle_stays_usable() {
        let c = cache(1);
        let held = load(&c, "a");
        load(&c, "b");
        assert!(!c.contains(&EngineId::from("a")));
        assert_eq!(&*held, "a");
    }

    #[test]
    fn failures_are_not_cached() {
        let c = cache(2);
        let id = EngineId::from("broken");
        let err = c
            .get_or_load(&id, || {
                Err(LoadError::Corrupt {
                    engine_id: EngineId::from("broken"),
                    message: "bad".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, LoadError::Corrupt { .. }));
        assert!(!c.contains(&id));

        let engine = c.get_or_load(&id, || Ok(Arc::from("fixed"))).unwrap();
        assert_eq!(&*engine, "fixed");
        let stats = c.stats();
        assert_eq!(stats.loads, 2);
        assert_eq!(stats.load_failures, 1);
    }

    #[test]
    fn clear_empties_cache() {
        let c = cache(2);
        load(&c, "a");
        load(&c, "b");
        c.clear();
        assert!(c.is_empty());
        load(&c, "a");
        assert_eq!(c.stats().loads, 3);
    }

    #[test]
    fn panicking_loader_releases_pending_slot() {
        let c = cache(1);
        let id = EngineId::from("a");
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = c.get_or_load(&id, || panic!("boom"));
        }));
        assert!(result.is_err());
        // next caller leads a fresh load instead of waiting forever
        let engine = c.get_or_load(&id, || Ok(Arc::from("a"))).unwrap();
        assert_eq!(&*engine, "a");
        assert_eq!(c.stats().load_failures, 1);
    }
}
