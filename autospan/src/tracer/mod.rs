//! Per-process tracer
//!
//! A tracer owns one [`EventSource`] and one [`Correlator`]. It pulls raw
//! records, decodes them, correlates fragments into spans and pushes the
//! spans into the shared queue.
//!
//! ```text
//!   Attached ──run()──► Running ──cancel / source closed / queue closed──► Detached
//! ```
//!
//! Decode failures never stop a tracer: each one is counted and skipped. A
//! long unbroken run of failures points at a layout mismatch with the
//! kernel-side program and is logged once as an error.

pub mod ebpf;
pub mod libssl;
pub mod source;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::correlate::Correlator;
use crate::decode::{self, DecodedEvent, RawEventRecord};
use crate::domain::{RequestSpan, ServiceId, TracerError};
use crate::queue::{PushOutcome, SpanSender};

pub use ebpf::{EbpfFactory, EbpfSource};
pub use source::{EventSource, ReplaySource};

/// Consecutive malformed records before the stream is reported as corrupt
const MALFORMED_RUN_LIMIT: u64 = 1000;

/// Lower bound on the eviction timer
const MIN_EVICT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerState {
    Attached,
    Running,
    Detached,
}

/// Why [`Tracer::run`] returned normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Cancelled,

    /// The traced process exited
    SourceClosed,

    /// Nobody consumes spans any more
    QueueClosed,
}

/// Statistics tracked per tracer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TracerStats {
    pub records: u64,
    pub spans: u64,
    pub malformed: u64,

    /// Spans dropped because the queue stayed full
    pub dropped: u64,

    /// Incomplete exchanges removed by idle eviction
    pub evicted: u64,
    pub unclassified: u64,
}

enum Step {
    Cancelled,
    Evict,
    Read(Result<(), TracerError>),
}

pub struct Tracer<S: EventSource> {
    source: S,
    service: Arc<ServiceId>,
    correlator: Correlator,
    state: TracerState,
    stats: TracerStats,
    malformed_run: u64,
    evict_every: Duration,
}

impl<S: EventSource> Tracer<S> {
    /// Wrap an already attached source
    pub fn new(
        source: S,
        service: Arc<ServiceId>,
        clock: Arc<dyn Clock>,
        correlation_ttl: Duration,
    ) -> Self {
        Self {
            source,
            correlator: Correlator::new(Arc::clone(&service), clock, correlation_ttl),
            service,
            state: TracerState::Attached,
            stats: TracerStats::default(),
            malformed_run: 0,
            evict_every: (correlation_ttl / 2).max(MIN_EVICT_INTERVAL),
        }
    }

    #[must_use]
    pub fn state(&self) -> TracerState {
        self.state
    }

    #[must_use]
    pub fn stats(&self) -> TracerStats {
        let correlator = self.correlator.stats();
        TracerStats {
            evicted: correlator.evicted,
            unclassified: correlator.unclassified,
            ..self.stats
        }
    }

    #[must_use]
    pub fn service(&self) -> &Arc<ServiceId> {
        &self.service
    }

    /// Read, decode and correlate until cancelled or the source closes
    ///
    /// The source is detached on every exit path, including errors.
    ///
    /// # Errors
    ///
    /// Any source error other than `SourceClosed`.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        out: &SpanSender,
    ) -> Result<ExitReason, TracerError> {
        self.state = TracerState::Running;
        debug!("{}: tracer running", self.service);

        let result = self.pump(cancel, out).await;

        self.source.detach();
        self.state = TracerState::Detached;

        let stats = self.stats();
        info!(
            "{}: detached ({}), {} records, {} spans, {} malformed, {} dropped",
            self.service,
            match &result {
                Ok(reason) => format!("{reason:?}"),
                Err(e) => e.to_string(),
            },
            stats.records,
            stats.spans,
            stats.malformed,
            stats.dropped
        );

        match result {
            Err(TracerError::SourceClosed) => Ok(ExitReason::SourceClosed),
            other => other,
        }
    }

    async fn pump(
        &mut self,
        cancel: &CancellationToken,
        out: &SpanSender,
    ) -> Result<ExitReason, TracerError> {
        let mut evict = tokio::time::interval(self.evict_every);
        evict.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        evict.tick().await;

        let mut batch = Vec::new();
        loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Cancelled,
                _ = evict.tick() => Step::Evict,
                read = self.source.read_records(&mut batch) => Step::Read(read),
            };

            match step {
                Step::Cancelled => return Ok(ExitReason::Cancelled),
                Step::Evict => {
                    self.correlator.evict_idle();
                }
                Step::Read(read) => {
                    read?;
                    for record in std::mem::take(&mut batch) {
                        for span in self.handle_record(&record) {
                            if self.push(out, span).await == PushOutcome::Closed {
                                return Ok(ExitReason::QueueClosed);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn push(&mut self, out: &SpanSender, span: RequestSpan) -> PushOutcome {
        let outcome = out.push(span).await;
        match outcome {
            PushOutcome::Sent => self.stats.spans += 1,
            PushOutcome::Dropped => self.stats.dropped += 1,
            PushOutcome::Closed => {}
        }
        outcome
    }

    /// Decode one record and feed it to the correlator
    pub fn handle_record(&mut self, bytes: &[u8]) -> Vec<RequestSpan> {
        self.stats.records += 1;

        let event = match decode::decode(bytes).and_then(RawEventRecord::into_event) {
            Ok(event) => {
                self.malformed_run = 0;
                event
            }
            Err(e) => {
                self.stats.malformed += 1;
                self.malformed_run += 1;
                if self.malformed_run == MALFORMED_RUN_LIMIT {
                    error!(
                        "{}: {} consecutive malformed records, kernel-side layout may not match (last: {e})",
                        self.service, self.malformed_run
                    );
                } else {
                    debug!("{}: skipping record: {e}", self.service);
                }
                return Vec::new();
            }
        };

        match event {
            DecodedEvent::Fragment(fragment) => {
                self.correlator.observe(fragment).into_iter().collect()
            }
            DecodedEvent::Tls(record) => self.correlator.handle_tls(record),
        }
    }
}

impl<S: EventSource> Drop for Tracer<S> {
    fn drop(&mut self) {
        if self.state != TracerState::Detached {
            self.source.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::decode::record_bytes;
    use crate::queue::span_queue;
    use autospan_common::{ConnectionInfo, HttpInfo, PidInfo, TcpRequest, TCP_SEND};
    use std::sync::atomic::Ordering;

    fn http_exchange(path: &str) -> Vec<u8> {
        let head = format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut r = HttpInfo::EMPTY;
        r.buf[..head.len()].copy_from_slice(head.as_bytes());
        r.len = u32::try_from(head.len()).unwrap();
        r.start_monotime_ns = 10;
        r.end_monotime_ns = 90;
        r.status = 204;
        r.pid = PidInfo {
            host_pid: 77,
            user_pid: 1,
            ns: 5,
        };
        r.conn_info = ConnectionInfo {
            s_port: 8080,
            d_port: 50000,
            ..ConnectionInfo::default()
        };
        record_bytes(&r).to_vec()
    }

    fn tcp_send(port: u16) -> Vec<u8> {
        let mut r = TcpRequest::EMPTY;
        r.buf[..4].copy_from_slice(b"PING");
        r.len = 4;
        r.direction = TCP_SEND;
        r.start_monotime_ns = 1;
        r.conn_info = ConnectionInfo {
            s_port: port,
            d_port: 6379,
            ..ConnectionInfo::default()
        };
        record_bytes(&r).to_vec()
    }

    fn tracer(source: ReplaySource) -> Tracer<ReplaySource> {
        Tracer::new(
            source,
            Arc::new(ServiceId::new("svc", "", "host-77")),
            Arc::new(ManualClock::new()),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_replay_to_spans_then_source_closed() {
        let source = ReplaySource::new(vec![
            vec![http_exchange("/a"), vec![0xEE; 4]],
            vec![http_exchange("/b")],
        ]);
        let detached = source.detached_flag();
        let mut tracer = tracer(source);
        let (tx, mut rx) = span_queue(16, Duration::from_millis(10));

        let exit = tracer.run(&CancellationToken::new(), &tx).await.unwrap();
        assert_eq!(exit, ExitReason::SourceClosed);
        assert_eq!(tracer.state(), TracerState::Detached);
        assert!(detached.load(Ordering::SeqCst));

        assert_eq!(rx.recv().await.unwrap().path, "/a");
        let b = rx.recv().await.unwrap();
        assert_eq!(b.path, "/b");
        assert_eq!(b.status, 204);
        assert_eq!(b.service.name, "svc");

        let stats = tracer.stats();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.spans, 2);
        assert_eq!(stats.malformed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_detaches() {
        let source = ReplaySource::open_ended(vec![vec![tcp_send(40000)]]);
        let detached = source.detached_flag();
        let mut tracer = tracer(source);
        let (tx, _rx) = span_queue(16, Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };

        let exit = tracer.run(&cancel, &tx).await.unwrap();
        stopper.await.unwrap();
        assert_eq!(exit, ExitReason::Cancelled);
        assert!(detached.load(Ordering::SeqCst));
        // Request half with no response is still waiting
        assert_eq!(tracer.stats().spans, 0);
    }

    #[tokio::test]
    async fn test_closed_queue_stops_tracer() {
        let mut tracer = tracer(ReplaySource::open_ended(vec![vec![http_exchange("/x")]]));
        let (tx, rx) = span_queue(4, Duration::from_millis(10));
        drop(rx);

        let exit = tracer.run(&CancellationToken::new(), &tx).await.unwrap();
        assert_eq!(exit, ExitReason::QueueClosed);
        assert_eq!(tracer.state(), TracerState::Detached);
    }

    #[test]
    fn test_drop_detaches_unstarted_tracer() {
        let source = ReplaySource::new(Vec::new());
        let detached = source.detached_flag();
        let tracer = tracer(source);
        assert_eq!(tracer.state(), TracerState::Attached);
        drop(tracer);
        assert!(detached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_handle_record_counts_malformed() {
        let mut tracer = tracer(ReplaySource::new(Vec::new()));
        let mut bad = http_exchange("/x");
        // declared length past the 160-byte head buffer
        let len_offset = std::mem::offset_of!(HttpInfo, len);
        bad[len_offset..len_offset + 4].copy_from_slice(&500u32.to_le_bytes());

        assert!(tracer.handle_record(&bad).is_empty());
        assert!(tracer.handle_record(&[]).is_empty());
        assert_eq!(tracer.stats().malformed, 2);
        assert_eq!(tracer.handle_record(&http_exchange("/ok")).len(), 1);
    }
}
