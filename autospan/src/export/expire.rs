//! TTL-bounded map used as a label cache
//!
//! Every series a metric exporter has ever seen costs memory and export
//! bandwidth. `ExpiryMap` forgets keys nobody has touched for `ttl`, so
//! process churn (pids, ports, paths) cannot grow the series set forever.
//!
//! Time comes from an injected [`Clock`]; with [`ManualClock`] a test decides
//! exactly when an entry becomes stale.
//!
//! [`ManualClock`]: crate::clock::ManualClock

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;

struct Entry<V> {
    value: Arc<V>,
    last_access: Duration,
}

pub struct ExpiryMap<K, V> {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> ExpiryMap<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cell for `key`, creating it with `factory` on first use
    ///
    /// Either way the entry's last-access time becomes "now". The factory
    /// runs under the map's lock, so it is called at most once per key.
    pub fn get_or_create<Q>(&self, key: &Q, factory: impl FnOnce() -> V) -> Arc<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(key) {
            entry.last_access = now;
            return Arc::clone(&entry.value);
        }

        let value = Arc::new(factory());
        let entry = Entry {
            value: Arc::clone(&value),
            last_access: now,
        };
        entries.insert(key.to_owned(), entry);
        value
    }

    /// Remove entries whose last access is older than `now - ttl`
    ///
    /// An entry accessed exactly `ttl` ago survives. Returns the removed keys.
    pub fn delete_expired(&self) -> Vec<K> {
        let now = self.clock.now();
        let ttl = self.ttl;
        let mut removed = Vec::new();

        self.entries.lock().retain(|key, entry| {
            let expired = now.saturating_sub(entry.last_access) > ttl;
            if expired {
                removed.push(key.clone());
            }
            !expired
        });
        removed
    }

    /// Snapshot of the live cells
    ///
    /// Entries added or removed after the call are not reflected in the
    /// returned iterator.
    pub fn all(&self) -> impl Iterator<Item = Arc<V>> {
        let snapshot: Vec<Arc<V>> = self
            .entries
            .lock()
            .values()
            .map(|e| Arc::clone(&e.value))
            .collect();
        snapshot.into_iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    fn map(clock: &ManualClock, ttl_secs: u64) -> ExpiryMap<Vec<String>, AtomicUsize> {
        ExpiryMap::new(Arc::new(clock.clone()), Duration::from_secs(ttl_secs))
    }

    #[test]
    fn test_factory_called_once_per_key() {
        let clock = ManualClock::new();
        let m = map(&clock, 5);
        let calls = AtomicUsize::new(0);
        let factory = || {
            calls.fetch_add(1, Ordering::SeqCst);
            AtomicUsize::new(0)
        };

        let a = m.get_or_create(&key(&["GET", "/foo"]), factory);
        let b = m.get_or_create(key(&["GET", "/foo"]).as_slice(), factory);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        m.get_or_create(&key(&["POST", "/foo"]), factory);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_attribute_order_matters() {
        let m = map(&ManualClock::new(), 5);
        m.get_or_create(&key(&["GET", "/foo"]), || AtomicUsize::new(0));
        m.get_or_create(&key(&["/foo", "GET"]), || AtomicUsize::new(0));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_refresh_postpones_expiry() {
        let clock = ManualClock::new();
        let m = map(&clock, 5);
        let attrs = key(&["GET", "/foo"]);

        m.get_or_create(&attrs, || AtomicUsize::new(0));

        clock.set(Duration::from_secs(4));
        m.get_or_create(&attrs, || AtomicUsize::new(0));

        // Last access at 4s, window ends at 9s
        clock.set(Duration::from_secs(8));
        assert!(m.delete_expired().is_empty());
        assert_eq!(m.len(), 1);

        clock.set(Duration::from_secs(10));
        assert_eq!(m.delete_expired(), vec![attrs]);
        assert!(m.is_empty());
    }

    #[test]
    fn test_exact_ttl_boundary_survives() {
        let clock = ManualClock::new();
        let m = map(&clock, 5);
        m.get_or_create(&key(&["a"]), || AtomicUsize::new(0));
        clock.set(Duration::from_secs(5));
        assert!(m.delete_expired().is_empty());
        clock.advance(Duration::from_nanos(1));
        assert_eq!(m.delete_expired().len(), 1);
    }

    #[test]
    fn test_sweep_leaves_fresh_entries() {
        let clock = ManualClock::new();
        let m = map(&clock, 5);
        m.get_or_create(&key(&["old"]), || AtomicUsize::new(0));
        clock.set(Duration::from_secs(3));
        m.get_or_create(&key(&["new"]), || AtomicUsize::new(0));

        clock.set(Duration::from_secs(7));
        assert_eq!(m.delete_expired(), vec![key(&["old"])]);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_all_is_a_snapshot() {
        let clock = ManualClock::new();
        let m = map(&clock, 5);
        m.get_or_create(&key(&["a"]), || AtomicUsize::new(1));
        m.get_or_create(&key(&["b"]), || AtomicUsize::new(2));

        let snapshot = m.all();
        m.get_or_create(&key(&["c"]), || AtomicUsize::new(3));
        clock.set(Duration::from_secs(60));
        m.delete_expired();

        let mut values: Vec<usize> = snapshot.map(|c| c.load(Ordering::SeqCst)).collect();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2]);
        assert_eq!(m.all().count(), 0);
    }
}
