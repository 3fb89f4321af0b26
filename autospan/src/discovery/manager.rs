//! Lifecycle manager: one tracer worker per discovered process
//!
//! ```text
//!   finder ──DiscoveredProcess──► manager ──spawn──► Tracer::run ─┐
//!                                   │                Tracer::run ─┼──► span queue
//!                                   │                Tracer::run ─┘
//!                                   └── cancel ──► join workers (timeout) ──► abort stragglers
//! ```
//!
//! Workers live in a `JoinSet` and get a child of the manager's cancellation
//! token, so cancelling the manager stops every tracer and the manager waits
//! for their teardown before returning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::finder::DiscoveredProcess;
use super::scanner::ProcessInfo;
use crate::clock::Clock;
use crate::domain::{DiscoveryError, Pid, ServiceId, TracerError};
use crate::queue::SpanSender;
use crate::tracer::{EventSource, ExitReason, Tracer, TracerStats};

/// Produces an attached event source for a process
pub trait TracerFactory: Send + Sync {
    type Source: EventSource + 'static;

    /// # Errors
    ///
    /// `AttachFailed` skips this process; `ResourceExhausted` stops discovery
    fn attach(&self, process: &ProcessInfo) -> Result<Self::Source, TracerError>;
}

/// How one worker ended
#[derive(Debug)]
pub struct WorkerExit {
    pub pid: Pid,
    pub service: Arc<ServiceId>,
    pub result: Result<ExitReason, TracerError>,
    pub stats: TracerStats,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub started: u64,
    pub attach_failed: u64,

    /// Discovered again while a tracer was still live
    pub duplicates: u64,
    pub finished: u64,

    /// Workers that panicked or were aborted at shutdown
    pub lost: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub correlation_ttl: Duration,
    pub shutdown_timeout: Duration,
}

enum Step {
    Stop,
    InputClosed,
    Start(DiscoveredProcess),
    Reaped(Result<WorkerExit, JoinError>),
}

pub struct LifecycleManager<F: TracerFactory> {
    factory: F,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
    queue: SpanSender,
    workers: JoinSet<WorkerExit>,
    live: HashMap<Pid, AbortHandle>,
    stats: ManagerStats,
}

impl<F: TracerFactory> LifecycleManager<F> {
    pub fn new(
        factory: F,
        clock: Arc<dyn Clock>,
        config: ManagerConfig,
        queue: SpanSender,
    ) -> Self {
        Self {
            factory,
            clock,
            config,
            queue,
            workers: JoinSet::new(),
            live: HashMap::new(),
            stats: ManagerStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    /// Number of tracers currently running
    #[cfg(test)]
    fn live(&self) -> usize {
        self.live.values().filter(|h| !h.is_finished()).count()
    }

    /// Start a tracer for every discovered process until cancelled, then
    /// tear all tracers down
    ///
    /// A closed discovery channel only stops new attaches: the tracers
    /// already running keep going until their processes exit or `cancel`
    /// fires.
    ///
    /// # Errors
    ///
    /// `Fatal` when the kernel cannot allocate tracer resources at all. The
    /// running tracers are still shut down before returning.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        mut discovered: mpsc::Receiver<DiscoveredProcess>,
    ) -> Result<ManagerStats, DiscoveryError> {
        let workers_cancel = cancel.child_token();
        let mut outcome = Ok(());
        let mut accepting = true;

        loop {
            if !accepting && self.workers.is_empty() {
                break;
            }

            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Stop,
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => {
                    Step::Reaped(joined)
                }
                next = discovered.recv(), if accepting => {
                    next.map_or(Step::InputClosed, Step::Start)
                }
            };

            match step {
                Step::Stop => break,
                Step::InputClosed => {
                    info!(
                        "Discovery closed, waiting for {} tracers to finish",
                        self.workers.len()
                    );
                    accepting = false;
                }
                Step::Reaped(joined) => self.reap(joined),
                Step::Start(process) => {
                    if let Err(e) = self.start(process, &workers_cancel) {
                        error!("Stopping discovery: {e}");
                        outcome = Err(e);
                        break;
                    }
                }
            }
        }

        workers_cancel.cancel();
        self.shutdown().await;
        outcome.map(|()| self.stats)
    }

    fn start(
        &mut self,
        process: DiscoveredProcess,
        cancel: &CancellationToken,
    ) -> Result<(), DiscoveryError> {
        let DiscoveredProcess { info, service } = process;
        let pid = info.pid;

        if self.live.get(&pid).is_some_and(|h| !h.is_finished()) {
            debug!("{pid} already has a live tracer, skipping");
            self.stats.duplicates += 1;
            return Ok(());
        }

        let source = match self.factory.attach(&info) {
            Ok(source) => source,
            Err(e @ TracerError::ResourceExhausted(_)) => return Err(DiscoveryError::Fatal(e)),
            Err(e) => {
                warn!("⚠️  Not instrumenting {pid} ({}): {e}", info.comm);
                self.stats.attach_failed += 1;
                return Ok(());
            }
        };

        let mut tracer = Tracer::new(
            source,
            Arc::clone(&service),
            Arc::clone(&self.clock),
            self.config.correlation_ttl,
        );
        let cancel = cancel.clone();
        let out = self.queue.clone();

        info!("✓ Started tracer for {pid} as {service}");
        let handle = self.workers.spawn(async move {
            let result = tracer.run(&cancel, &out).await;
            WorkerExit {
                pid,
                service,
                result,
                stats: tracer.stats(),
            }
        });
        self.live.insert(pid, handle);
        self.stats.started += 1;
        Ok(())
    }

    fn reap(&mut self, joined: Result<WorkerExit, JoinError>) {
        match joined {
            Ok(exit) => {
                self.stats.finished += 1;
                match &exit.result {
                    Ok(reason) => debug!(
                        "{} ({}) finished: {reason:?}, {} spans",
                        exit.pid, exit.service, exit.stats.spans
                    ),
                    Err(e) => warn!("⚠️  Tracer for {} ({}) failed: {e}", exit.pid, exit.service),
                }
            }
            Err(e) if e.is_cancelled() => self.stats.lost += 1,
            Err(e) => {
                error!("Tracer worker panicked: {e}");
                self.stats.lost += 1;
            }
        }
        self.live.retain(|_, handle| !handle.is_finished());
    }

    /// Wait for every worker, aborting the ones still running at the timeout
    async fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        info!("Waiting for {} tracers to detach", self.workers.len());

        let timeout = self.config.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = self.workers.join_next().await {
                self.reap(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "⚠️  {} tracers still running after {timeout:?}, aborting",
                self.workers.len()
            );
            self.workers.abort_all();
            while let Some(joined) = self.workers.join_next().await {
                self.reap(joined);
            }
        }
        self.live.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::decode::record_bytes;
    use crate::queue::span_queue;
    use autospan_common::{ConnectionInfo, HttpInfo};
    use crate::tracer::ReplaySource;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Factory handing out replay sources and remembering their detach
    /// flags
    #[derive(Default)]
    struct FakeFactory {
        fail: HashMap<Pid, fn(Pid) -> TracerError>,

        /// Batches every source replays
        replay: Vec<Vec<Vec<u8>>>,

        /// Sources report the process gone once the batches are replayed
        exiting: bool,
        detached: parking_lot::Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl TracerFactory for Arc<FakeFactory> {
        type Source = ReplaySource;

        fn attach(&self, process: &ProcessInfo) -> Result<ReplaySource, TracerError> {
            if let Some(make) = self.fail.get(&process.pid) {
                return Err(make(process.pid));
            }
            let source = if self.exiting {
                ReplaySource::new(self.replay.clone())
            } else {
                ReplaySource::open_ended(self.replay.clone())
            };
            self.detached.lock().push(source.detached_flag());
            Ok(source)
        }
    }

    fn discovered(pid: u32) -> DiscoveredProcess {
        DiscoveredProcess {
            info: ProcessInfo {
                pid: Pid(pid),
                ns_pid: pid,
                pid_ns: 1,
                comm: "svc".into(),
                exe: PathBuf::from("/bin/svc"),
                ports: vec![80],
            },
            service: Arc::new(ServiceId::new("svc", "", format!("h-{pid}"))),
        }
    }

    fn manager(factory: &Arc<FakeFactory>) -> LifecycleManager<Arc<FakeFactory>> {
        let (tx, _rx) = span_queue(8, Duration::from_millis(5));
        LifecycleManager::new(
            Arc::clone(factory),
            Arc::new(ManualClock::new()),
            ManagerConfig {
                correlation_ttl: Duration::from_secs(30),
                shutdown_timeout: Duration::from_secs(5),
            },
            tx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_detaches_every_worker() {
        let factory = Arc::new(FakeFactory::default());
        let mut manager = manager(&factory);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        tx.send(discovered(10)).await.unwrap();
        tx.send(discovered(11)).await.unwrap();
        // Same pid again while its tracer is live
        tx.send(discovered(10)).await.unwrap();

        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };

        let stats = manager.run(&cancel, rx).await.unwrap();
        stopper.await.unwrap();

        assert_eq!(stats.started, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.finished, 2);
        assert_eq!(manager.live(), 0);
        let flags = factory.detached.lock();
        assert_eq!(flags.len(), 2);
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_failure_is_isolated() {
        let mut fail: HashMap<Pid, fn(Pid) -> TracerError> = HashMap::new();
        fail.insert(Pid(10), |pid| TracerError::AttachFailed {
            pid,
            reason: "EPERM".into(),
        });
        let factory = Arc::new(FakeFactory {
            fail,
            exiting: true,
            ..FakeFactory::default()
        });
        let mut manager = manager(&factory);

        let (tx, rx) = mpsc::channel(8);
        tx.send(discovered(10)).await.unwrap();
        tx.send(discovered(11)).await.unwrap();
        // The run ends once discovery is closed and every tracer has exited
        drop(tx);

        let stats = manager.run(&CancellationToken::new(), rx).await.unwrap();
        assert_eq!(stats.attach_failed, 1);
        assert_eq!(stats.started, 1);
        assert_eq!(stats.finished, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_exhaustion_is_fatal() {
        let mut fail: HashMap<Pid, fn(Pid) -> TracerError> = HashMap::new();
        fail.insert(Pid(12), |_| TracerError::ResourceExhausted("ENOMEM".into()));
        let factory = Arc::new(FakeFactory {
            fail,
            ..FakeFactory::default()
        });
        let mut manager = manager(&factory);

        let (tx, rx) = mpsc::channel(8);
        tx.send(discovered(11)).await.unwrap();
        tx.send(discovered(12)).await.unwrap();

        let err = manager
            .run(&CancellationToken::new(), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Fatal(TracerError::ResourceExhausted(_))));
        // The tracer started before the failure was still torn down
        assert!(factory.detached.lock()[0].load(Ordering::SeqCst));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exited_process_can_be_traced_again() {
        let factory = Arc::new(FakeFactory {
            exiting: true,
            ..FakeFactory::default()
        });
        let mut manager = manager(&factory);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let driver = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tx.send(discovered(10)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                tx.send(discovered(10)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };

        let stats = manager.run(&cancel, rx).await.unwrap();
        driver.await.unwrap();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.duplicates, 0);
        assert_eq!(stats.finished, 2);
    }

    fn http_record(path: &str) -> Vec<u8> {
        let head = format!("GET {path} HTTP/1.1\r\nHost: svc\r\n\r\n");
        let mut r = HttpInfo::EMPTY;
        r.buf[..head.len()].copy_from_slice(head.as_bytes());
        r.len = u32::try_from(head.len()).unwrap();
        r.start_monotime_ns = 100;
        r.end_monotime_ns = 900;
        r.status = 200;
        r.conn_info = ConnectionInfo {
            s_port: 80,
            d_port: 40000,
            ..ConnectionInfo::default()
        };
        record_bytes(&r).to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_input_lets_tracers_finish() {
        let factory = Arc::new(FakeFactory {
            replay: vec![vec![http_record("/a")], vec![http_record("/b")]],
            exiting: true,
            ..FakeFactory::default()
        });
        let (queue, mut spans) = span_queue(8, Duration::from_millis(5));
        let mut manager = LifecycleManager::new(
            Arc::clone(&factory),
            Arc::new(ManualClock::new()),
            ManagerConfig {
                correlation_ttl: Duration::from_secs(30),
                shutdown_timeout: Duration::from_secs(5),
            },
            queue,
        );

        let (tx, rx) = mpsc::channel(8);
        tx.send(discovered(10)).await.unwrap();
        tx.send(discovered(11)).await.unwrap();
        // Discovery goes away before either tracer has read anything
        drop(tx);

        let stats = manager.run(&CancellationToken::new(), rx).await.unwrap();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.finished, 2);
        assert_eq!(stats.lost, 0);
        drop(manager);

        let mut paths = Vec::new();
        while let Some(span) = spans.recv().await {
            paths.push(span.path);
        }
        paths.sort();
        assert_eq!(paths, vec!["/a", "/a", "/b", "/b"]);
    }
}
