//! Span consumer: the single reader of the span queue
//!
//! For each span it looks up the service's reporter in the [`ReporterPool`]
//! and bumps the label-cached counters. On every collection tick it flushes
//! the reporters and reports then sweeps the counters.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::MissedTickBehavior;

use super::expirer::{Attribute, Counter, Expirer};
use super::reporter_pool::ReporterPool;
use super::span_writer::{SharedSink, SpanReporter};
use crate::clock::Clock;
use crate::domain::{RequestSpan, Uid};
use crate::queue::SpanReceiver;

/// Counters kept by the export stage itself
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportStats {
    pub spans: u64,

    /// Spans lost because the service's reporter could not be built
    pub unreported: u64,
    pub written: u64,
    pub write_errors: u64,
}

pub struct ExportStage {
    pool: ReporterPool<SpanReporter>,
    requests: Expirer<RequestSpan>,
    transferred: Expirer<RequestSpan>,
    stats: parking_lot::Mutex<ExportStats>,
}

fn request_attributes() -> Vec<Attribute<RequestSpan>> {
    vec![
        Attribute::new("service.name", |s: &RequestSpan| s.service.name.clone()),
        Attribute::new("service.instance.id", |s: &RequestSpan| s.service.instance.clone()),
        Attribute::new("protocol", |s: &RequestSpan| s.protocol.as_str().to_string()),
        Attribute::new("span.kind", |s: &RequestSpan| s.kind.as_str().to_string()),
        Attribute::new("request.method", |s: &RequestSpan| s.method.clone()),
        Attribute::new("url.path", |s: &RequestSpan| s.path.clone()),
        Attribute::new("response.status_code", |s: &RequestSpan| s.status.to_string()),
    ]
}

fn transfer_attributes() -> Vec<Attribute<RequestSpan>> {
    vec![
        Attribute::new("service.name", |s: &RequestSpan| s.service.name.clone()),
        Attribute::new("service.instance.id", |s: &RequestSpan| s.service.instance.clone()),
        Attribute::new("protocol", |s: &RequestSpan| s.protocol.as_str().to_string()),
    ]
}

impl ExportStage {
    pub fn new(
        sink: SharedSink,
        reporter_capacity: usize,
        clock: Arc<dyn Clock>,
        metrics_ttl: Duration,
    ) -> Self {
        let pool = ReporterPool::new(
            reporter_capacity,
            move |service| SpanReporter::new(service, Arc::clone(&sink)),
            |uid: &Uid, reporter: Arc<SpanReporter>| match reporter.flush() {
                Ok(n) => debug!("Evicted reporter {uid}, flushed {n} spans"),
                Err(e) => warn!("⚠️  Evicted reporter {uid} lost spans: {e}"),
            },
        );

        Self {
            pool,
            requests: Expirer::new(
                "requests",
                request_attributes(),
                Arc::clone(&clock),
                metrics_ttl,
            ),
            transferred: Expirer::new(
                "transferred_bytes",
                transfer_attributes(),
                clock,
                metrics_ttl,
            ),
            stats: parking_lot::Mutex::new(ExportStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> ExportStats {
        *self.stats.lock()
    }

    /// Hand a span to its service's reporter and update the counters
    pub fn record(&self, span: RequestSpan) {
        self.requests.for_record(&span).add(1);
        self.transferred
            .for_record(&span)
            .add(span.request_size + span.response_size);

        let reported = match self.pool.for_service(&span.service) {
            Ok(reporter) => {
                reporter.record(span);
                true
            }
            Err(e) => {
                warn!("⚠️  {e}");
                false
            }
        };

        let mut stats = self.stats.lock();
        stats.spans += 1;
        if !reported {
            stats.unreported += 1;
        }
    }

    /// Write every buffered span; returns how many were written
    pub fn flush(&self) -> u64 {
        let mut written = 0;
        for reporter in self.pool.snapshot() {
            match reporter.flush() {
                Ok(n) => written += n as u64,
                Err(e) => {
                    self.stats.lock().write_errors += 1;
                    warn!("⚠️  Failed to write spans of {}: {e}", reporter.service());
                }
            }
        }
        self.stats.lock().written += written;
        written
    }

    /// One collection cycle over both metrics
    ///
    /// Returns the number of series reported and the number expired.
    pub fn collect(&self, mut report: impl FnMut(&'static str, &Counter)) -> (usize, usize) {
        let mut reported = 0;
        let mut expired = 0;
        for expirer in [&self.requests, &self.transferred] {
            let metric = expirer.metric();
            let cycle = expirer.collect(|counter| report(metric, counter));
            reported += cycle.reported;
            expired += cycle.expired.len();
        }
        (reported, expired)
    }

    /// Flush and evict every reporter
    pub fn close(&self) {
        self.pool.close();
    }

    /// Consume spans until every producer is gone
    ///
    /// Flushes and collects every `every`; on exit collects one last time
    /// and closes the pool.
    pub async fn run(&self, mut spans: SpanReceiver, every: Duration) -> ExportStats {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                span = spans.recv() => match span {
                    Some(span) => self.record(span),
                    None => break,
                },
                _ = ticker.tick() => self.cycle(spans.dropped()),
            }
        }

        self.cycle(spans.dropped());
        self.close();
        self.stats()
    }

    fn cycle(&self, dropped: u64) {
        let written = self.flush();
        let (series, expired) = self.collect(|metric, counter| {
            info!("{}", metric_line(metric, counter));
        });
        debug!(
            "Collection: {written} spans written, {series} series reported, {expired} expired, {dropped} spans dropped so far"
        );
    }
}

/// `requests{service.name="checkout",protocol="http"} 12`
#[must_use]
pub fn metric_line(metric: &str, counter: &Counter) -> String {
    let labels: Vec<String> = counter
        .labels()
        .map(|(name, value)| format!("{name}={value:?}"))
        .collect();
    format!("{metric}{{{}}} {}", labels.join(","), counter.value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::ServiceId;
    use crate::queue::span_queue;
    use crate::queue::tests::test_span;
    use std::io::{self, Write};

    #[derive(Clone, Default)]
    struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn lines(&self) -> Vec<serde_json::Value> {
            let text = String::from_utf8(self.0.lock().clone()).unwrap();
            text.lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn stage(capacity: usize, clock: &ManualClock) -> (ExportStage, Captured) {
        let captured = Captured::default();
        let sink: SharedSink = Arc::new(parking_lot::Mutex::new(Box::new(captured.clone())));
        let clock = Arc::new(clock.clone());
        let stage = ExportStage::new(sink, capacity, clock, Duration::from_secs(5));
        (stage, captured)
    }

    fn span_for(service: &str, path: &str) -> RequestSpan {
        RequestSpan {
            service: Arc::new(ServiceId::new(service, "", format!("{service}-1"))),
            request_size: 10,
            response_size: 90,
            ..test_span(path)
        }
    }

    #[test]
    fn test_record_flush_and_collect() {
        let clock = ManualClock::new();
        let (stage, captured) = stage(4, &clock);
        stage.record(span_for("a", "/x"));
        stage.record(span_for("a", "/x"));
        stage.record(span_for("b", "/y"));

        assert_eq!(stage.flush(), 3);
        assert_eq!(captured.lines().len(), 3);

        let mut lines = Vec::new();
        let (reported, expired) = stage.collect(|metric, c| lines.push(metric_line(metric, c)));
        assert_eq!((reported, expired), (4, 0));
        let has = |prefix: &str, suffix: &str| {
            lines
                .iter()
                .any(|l| l.starts_with(prefix) && l.ends_with(suffix))
        };
        assert!(has(r#"requests{service.name="a""#, "} 2"));
        assert!(has(r#"transferred_bytes{service.name="a""#, "} 200"));
    }

    #[test]
    fn test_metric_line_format() {
        let clock = ManualClock::new();
        let (stage, _) = stage(4, &clock);
        stage.record(span_for("a", "/x"));

        let mut lines = Vec::new();
        stage.collect(|metric, c| lines.push(metric_line(metric, c)));
        let expected =
            r#"transferred_bytes{service.name="a",service.instance.id="a-1",protocol="http"} 100"#;
        assert!(lines.iter().any(|l| l == expected));
    }

    #[test]
    fn test_evicted_reporter_is_flushed() {
        let clock = ManualClock::new();
        let (stage, captured) = stage(1, &clock);
        stage.record(span_for("a", "/x"));
        // Second service evicts the first, whose buffer is flushed
        stage.record(span_for("b", "/y"));

        let lines = captured.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["resource"]["service.name"], "a");

        stage.close();
        assert_eq!(captured.lines().len(), 2);
    }

    #[test]
    fn test_unnamed_service_counted_not_cached() {
        let clock = ManualClock::new();
        let (stage, _) = stage(4, &clock);
        stage.record(span_for("", "/x"));
        assert_eq!(stage.stats().unreported, 1);
        assert_eq!(stage.stats().spans, 1);
    }

    #[test]
    fn test_stale_series_expire_after_report() {
        let clock = ManualClock::new();
        let (stage, _) = stage(4, &clock);
        stage.record(span_for("a", "/x"));

        clock.set(Duration::from_secs(6));
        let (reported, expired) = stage.collect(|_, _| {});
        assert_eq!((reported, expired), (2, 2));
        assert_eq!(stage.collect(|_, _| {}), (0, 0));
    }

    #[tokio::test]
    async fn test_run_until_producers_gone() {
        let clock = ManualClock::new();
        let (stage, captured) = stage(4, &clock);
        let (tx, rx) = span_queue(8, Duration::from_millis(5));

        tx.push(span_for("a", "/1")).await;
        tx.push(span_for("a", "/2")).await;
        drop(tx);

        let stats = stage.run(rx, Duration::from_secs(60)).await;
        assert_eq!(stats.spans, 2);
        assert_eq!(stats.written, 2);
        assert_eq!(captured.lines().len(), 2);
    }
}
