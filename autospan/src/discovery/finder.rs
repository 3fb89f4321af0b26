//! Periodic process discovery
//!
//! Each poll scans the proc root, forgets pids that are gone (so a reused pid
//! is detected again) and reports processes that newly match the criteria.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::criteria::SelectionCriteria;
use super::scanner::{ProcScanner, ProcessInfo};
use crate::domain::{DiscoveryError, Pid, ServiceId};

/// Environment variable a process can use to name itself
pub const SERVICE_NAME_ENV: &str = "OTEL_SERVICE_NAME";

/// A newly matched process and the service it reports as
#[derive(Debug, Clone)]
pub struct DiscoveredProcess {
    pub info: ProcessInfo,
    pub service: Arc<ServiceId>,
}

pub struct ProcessFinder {
    scanner: ProcScanner,
    criteria: SelectionCriteria,
    namespace: String,
    hostname: String,
    self_pid: Pid,
    seen: HashSet<Pid>,
}

impl ProcessFinder {
    pub fn new(
        scanner: ProcScanner,
        criteria: SelectionCriteria,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            hostname: scanner.hostname(),
            scanner,
            criteria,
            namespace: namespace.into(),
            self_pid: Pid(std::process::id()),
            seen: HashSet::new(),
        }
    }

    /// Treat `pid` as this process (never reported)
    #[must_use]
    pub fn with_self_pid(mut self, pid: Pid) -> Self {
        self.self_pid = pid;
        self
    }

    /// Processes that matched since the previous poll
    ///
    /// # Errors
    ///
    /// `ProcUnavailable` when the proc root cannot be listed
    pub fn poll(&mut self) -> Result<Vec<DiscoveredProcess>, DiscoveryError> {
        let live = self.scanner.scan()?;

        let live_pids: HashSet<Pid> = live.iter().map(|p| p.pid).collect();
        let before = self.seen.len();
        self.seen.retain(|pid| live_pids.contains(pid));
        if self.seen.len() < before {
            debug!("Forgot {} exited processes", before - self.seen.len());
        }

        let mut found = Vec::new();
        for process in live {
            if process.pid == self.self_pid
                || self.seen.contains(&process.pid)
                || !self.criteria.matches(&process)
            {
                continue;
            }

            self.seen.insert(process.pid);
            let service = Arc::new(self.service_id(&process));
            info!(
                "Discovered {} ({}) listening on {:?} as {service}",
                process.pid, process.comm, process.ports
            );
            found.push(DiscoveredProcess {
                info: process,
                service,
            });
        }
        Ok(found)
    }

    /// Service identity of a process
    ///
    /// The name comes from the process's own `OTEL_SERVICE_NAME`, falling
    /// back to the executable's file name.
    #[must_use]
    pub fn service_id(&self, process: &ProcessInfo) -> ServiceId {
        let name = self
            .scanner
            .environ_var(process.pid, SERVICE_NAME_ENV)
            .or_else(|| exe_name(&process.exe))
            .unwrap_or_else(|| process.comm.clone());
        ServiceId::new(name, self.namespace.clone(), format!("{}-{}", self.hostname, process.pid.0))
    }

    /// Poll every `every` and send new matches until cancelled
    ///
    /// Stops quietly when the receiving side is gone.
    ///
    /// # Errors
    ///
    /// `ProcUnavailable` when the proc root disappears
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        tx: mpsc::Sender<DiscoveredProcess>,
        every: Duration,
    ) -> Result<(), DiscoveryError> {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            for process in self.poll()? {
                if tx.send(process).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

fn exe_name(exe: &Path) -> Option<String> {
    exe.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::scanner::tests::fake_process;
    use regex::Regex;
    use std::fs;

    fn finder(root: &Path) -> ProcessFinder {
        let criteria = SelectionCriteria {
            exec: Some(Regex::new("server").unwrap()),
            ..SelectionCriteria::default()
        };
        ProcessFinder::new(ProcScanner::new(root), criteria, "prod").with_self_pid(Pid(1))
    }

    #[test]
    fn test_reports_new_matches_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sys/kernel")).unwrap();
        fs::write(dir.path().join("sys/kernel/hostname"), "node-a\n").unwrap();
        fake_process(dir.path(), 20, "api-server", "/srv/api-server", &[8080]);
        fake_process(dir.path(), 21, "bash", "/bin/bash", &[]);

        let mut finder = finder(dir.path());
        let found = finder.poll().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].info.pid, Pid(20));
        assert_eq!(*found[0].service, ServiceId::new("api-server", "prod", "node-a-20"));

        assert!(finder.poll().unwrap().is_empty());
    }

    #[test]
    fn test_exited_pid_is_rediscovered() {
        let dir = tempfile::tempdir().unwrap();
        fake_process(dir.path(), 20, "api-server", "/srv/api-server", &[]);

        let mut finder = finder(dir.path());
        assert_eq!(finder.poll().unwrap().len(), 1);

        fs::remove_dir_all(dir.path().join("20")).unwrap();
        assert!(finder.poll().unwrap().is_empty());

        fake_process(dir.path(), 20, "api-server", "/srv/api-server", &[]);
        assert_eq!(finder.poll().unwrap().len(), 1);
    }

    #[test]
    fn test_never_reports_itself() {
        let dir = tempfile::tempdir().unwrap();
        fake_process(dir.path(), 1, "test-server", "/srv/test-server", &[]);
        assert!(finder(dir.path()).poll().unwrap().is_empty());
    }

    #[test]
    fn test_service_name_from_environment() {
        let dir = tempfile::tempdir().unwrap();
        fake_process(dir.path(), 30, "server", "/srv/server", &[]);
        fs::write(dir.path().join("30/environ"), b"OTEL_SERVICE_NAME=payments\0").unwrap();

        let found = finder(dir.path()).poll().unwrap();
        assert_eq!(found[0].service.name, "payments");
        assert_eq!(found[0].service.instance, "localhost-30");
    }

    #[tokio::test]
    async fn test_run_sends_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        fake_process(dir.path(), 40, "server", "/srv/server", &[]);

        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let every = Duration::from_millis(10);
        let task = tokio::spawn(finder(dir.path()).run(cancel.clone(), tx, every));

        assert_eq!(rx.recv().await.unwrap().info.pid, Pid(40));
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
