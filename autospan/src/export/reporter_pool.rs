//! LRU pool of per-service reporters
//!
//! Each instrumented service gets its own reporter (its own resource
//! attributes, its own buffer). Services come and go with the processes
//! behind them, so the pool keeps at most `capacity` reporters and hands the
//! least recently used one to an eviction callback (flush, close) before its
//! slot is reused.
//!
//! Lookup-or-create runs under one mutex: two producers asking for the same
//! new service never build two reporters.

use std::num::NonZeroUsize;
use std::sync::Arc;

use log::debug;
use lru::LruCache;
use parking_lot::Mutex;

use crate::domain::{BoxError, PoolError, ServiceId, Uid};

type Constructor<T> = Box<dyn Fn(&ServiceId) -> Result<T, BoxError> + Send + Sync>;
type EvictCallback<T> = Box<dyn Fn(&Uid, Arc<T>) + Send + Sync>;

pub struct ReporterPool<T> {
    cache: Mutex<LruCache<Uid, Arc<T>>>,
    construct: Constructor<T>,
    on_evict: EvictCallback<T>,
}

impl<T> ReporterPool<T> {
    /// `capacity` is clamped to at least one slot
    pub fn new(
        capacity: usize,
        construct: impl Fn(&ServiceId) -> Result<T, BoxError> + Send + Sync + 'static,
        on_evict: impl Fn(&Uid, Arc<T>) + Send + Sync + 'static,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            construct: Box::new(construct),
            on_evict: Box::new(on_evict),
        }
    }

    /// Reporter for `service`, constructing it on a miss
    ///
    /// # Errors
    ///
    /// `ConstructionFailed` when the constructor fails; nothing is cached, so
    /// the next call tries again.
    pub fn for_service(&self, service: &ServiceId) -> Result<Arc<T>, PoolError> {
        let uid = service.uid();
        let mut cache = self.cache.lock();

        if let Some(hit) = cache.get(&uid) {
            return Ok(Arc::clone(hit));
        }

        let value = (self.construct)(service).map(Arc::new).map_err(|source| {
            PoolError::ConstructionFailed {
                service: service.to_string(),
                source,
            }
        })?;

        // `push` hands back the least recently used entry when full
        if let Some((evicted, old)) = cache.push(uid, Arc::clone(&value)) {
            debug!("Reporter pool full, evicting {evicted}");
            (self.on_evict)(&evicted, old);
        }
        Ok(value)
    }

    /// Cached reporters, least recently used first
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        let cache = self.cache.lock();
        cache
            .iter()
            .rev()
            .map(|(_, value)| Arc::clone(value))
            .collect()
    }

    /// Evict everything, running the callback on each reporter
    pub fn close(&self) {
        let mut cache = self.cache.lock();
        while let Some((uid, value)) = cache.pop_lru() {
            (self.on_evict)(&uid, value);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
