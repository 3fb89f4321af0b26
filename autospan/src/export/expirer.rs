//! Label-cached counters for streaming metric collection
//!
//! An [`Expirer`] turns a record into the counter for its label set. Label
//! values are read with the declared [`Attribute`] getters, in declaration
//! order, so the same attribute values always map to the same counter.
//!
//! Each collection cycle reports every live counter first and only then
//! sweeps the stale ones, so a counter is always reported at least once after
//! its last update.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use super::expire::ExpiryMap;
use crate::clock::Clock;

/// One label: a name plus how to read its value from a record
pub struct Attribute<R> {
    pub name: &'static str,
    get: Box<dyn Fn(&R) -> String + Send + Sync>,
}

impl<R> Attribute<R> {
    pub fn new(name: &'static str, get: impl Fn(&R) -> String + Send + Sync + 'static) -> Self {
        Self {
            name,
            get: Box::new(get),
        }
    }
}

/// Monotonic counter with its label set
#[derive(Debug)]
pub struct Counter {
    names: Arc<[&'static str]>,
    values: Vec<String>,
    count: AtomicU64,
}

impl Counter {
    pub fn add(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// `(name, value)` pairs in declaration order
    pub fn labels(&self) -> impl Iterator<Item = (&'static str, &str)> {
        let values = self.values.iter().map(String::as_str);
        self.names.iter().copied().zip(values)
    }
}

/// Outcome of one collection cycle
#[derive(Debug, Default)]
pub struct Collection {
    pub reported: usize,
    pub expired: Vec<Vec<String>>,
}

pub struct Expirer<R> {
    metric: &'static str,
    attributes: Vec<Attribute<R>>,
    names: Arc<[&'static str]>,
    cells: ExpiryMap<Vec<String>, Counter>,
}

impl<R> Expirer<R> {
    pub fn new(
        metric: &'static str,
        attributes: Vec<Attribute<R>>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        let names: Arc<[&'static str]> = attributes.iter().map(|a| a.name).collect();
        Self {
            metric,
            attributes,
            names,
            cells: ExpiryMap::new(clock, ttl),
        }
    }

    #[must_use]
    pub fn metric(&self) -> &'static str {
        self.metric
    }

    /// Counter for this record's label set, created on first use
    pub fn for_record(&self, record: &R) -> Arc<Counter> {
        let values: Vec<String> = self.attributes.iter().map(|a| (a.get)(record)).collect();
        self.cells.get_or_create(&values, || Counter {
            names: Arc::clone(&self.names),
            values: values.clone(),
            count: AtomicU64::new(0),
        })
    }

    /// Report every live counter, then drop the expired ones
    pub fn collect(&self, mut report: impl FnMut(&Counter)) -> Collection {
        let mut reported = 0;
        for counter in self.cells.all() {
            report(&counter);
            reported += 1;
        }

        let expired = self.cells.delete_expired();
        for labels in &expired {
            debug!("{}: expired series {:?}", self.metric, labels);
        }
        Collection { reported, expired }
    }

    #[must_use]
    pub fn series(&self) -> usize {
        self.cells.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    struct Req {
        method: &'static str,
        path: &'static str,
    }

    fn expirer(clock: &ManualClock) -> Expirer<Req> {
        Expirer::new(
            "requests",
            vec![
                Attribute::new("http.method", |r: &Req| r.method.to_string()),
                Attribute::new("http.route", |r: &Req| r.path.to_string()),
            ],
            Arc::new(clock.clone()),
            Duration::from_secs(5),
        )
    }

    fn req(method: &'static str, path: &'static str) -> Req {
        Req { method, path }
    }

    #[test]
    fn test_same_labels_same_counter() {
        let e = expirer(&ManualClock::new());
        e.for_record(&req("GET", "/foo")).add(1);
        e.for_record(&req("GET", "/foo")).add(2);
        e.for_record(&req("POST", "/foo")).add(1);

        assert_eq!(e.series(), 2);
        let c = e.for_record(&req("GET", "/foo"));
        assert_eq!(c.value(), 3);
        let labels: Vec<_> = c.labels().collect();
        assert_eq!(labels, vec![("http.method", "GET"), ("http.route", "/foo")]);
    }

    #[test]
    fn test_expired_counter_reported_before_removal() {
        let clock = ManualClock::new();
        let e = expirer(&clock);
        e.for_record(&req("GET", "/foo")).add(7);

        clock.set(Duration::from_secs(10));
        let mut seen = Vec::new();
        let cycle = e.collect(|c| seen.push(c.value()));

        assert_eq!(seen, vec![7]);
        assert_eq!(cycle.reported, 1);
        assert_eq!(cycle.expired, vec![vec!["GET".to_string(), "/foo".to_string()]]);
        assert_eq!(e.series(), 0);

        // Next cycle has nothing left
        let cycle = e.collect(|_| panic!("nothing to report"));
        assert_eq!(cycle.reported, 0);
    }

    #[test]
    fn test_recreated_counter_starts_from_zero() {
        let clock = ManualClock::new();
        let e = expirer(&clock);
        e.for_record(&req("GET", "/a")).add(5);
        clock.set(Duration::from_secs(6));
        e.collect(|_| {});

        assert_eq!(e.for_record(&req("GET", "/a")).value(), 0);
    }
}
