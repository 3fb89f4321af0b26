//! Reading process facts from a `/proc`-like tree
//!
//! The root is injectable so tests can lay out a fake tree with `tempfile`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::domain::{DiscoveryError, Pid};

/// TCP state code for LISTEN in `/proc/net/tcp`
const TCP_LISTEN: &str = "0A";

/// One live process as seen by the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,

    /// Pid inside the process's own pid namespace
    pub ns_pid: u32,

    /// Inode of the pid namespace, 0 when unreadable
    pub pid_ns: u32,
    pub comm: String,
    pub exe: PathBuf,

    /// Ports the process is listening on, sorted and deduplicated
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct ProcScanner {
    root: PathBuf,
}

impl Default for ProcScanner {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pid_dir(&self, pid: Pid) -> PathBuf {
        self.root.join(pid.0.to_string())
    }

    /// Every numeric entry of the root
    ///
    /// # Errors
    ///
    /// `ProcUnavailable` when the root itself cannot be listed
    pub fn pids(&self) -> Result<Vec<Pid>, DiscoveryError> {
        let entries = fs::read_dir(&self.root).map_err(|source| DiscoveryError::ProcUnavailable {
            path: self.root.display().to_string(),
            source,
        })?;

        let mut pids: Vec<Pid> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
            .map(Pid)
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    /// Scan every process that can be inspected
    ///
    /// Kernel threads and processes that exit mid-scan are skipped.
    ///
    /// # Errors
    ///
    /// `ProcUnavailable` when the root cannot be listed
    pub fn scan(&self) -> Result<Vec<ProcessInfo>, DiscoveryError> {
        Ok(self
            .pids()?
            .into_iter()
            .filter_map(|pid| self.inspect(pid).ok())
            .collect())
    }

    /// Facts about one process
    ///
    /// # Errors
    ///
    /// Fails if the process is gone, is a kernel thread, or `stat` is unreadable
    pub fn inspect(&self, pid: Pid) -> Result<ProcessInfo> {
        let dir = self.pid_dir(pid);

        // Kernel threads have no exe link
        let exe = fs::read_link(dir.join("exe"))
            .with_context(|| format!("Cannot read exe link of {pid}"))?;
        let stat = fs::read_to_string(dir.join("stat"))
            .with_context(|| format!("Cannot read stat of {pid}"))?;
        let comm = extract_comm(&stat)?;

        let ns_pid = fs::read_to_string(dir.join("status"))
            .ok()
            .and_then(|s| parse_ns_pid(&s))
            .unwrap_or(pid.0);
        let pid_ns = fs::read_link(dir.join("ns/pid"))
            .ok()
            .and_then(|link| parse_ns_inode(&link.to_string_lossy()))
            .unwrap_or(0);

        Ok(ProcessInfo {
            pid,
            ns_pid,
            pid_ns,
            comm,
            exe,
            ports: self.listening_ports(pid),
        })
    }

    /// Ports with a LISTEN socket owned by `pid`
    ///
    /// Socket inodes from the fd table are matched against the process's own
    /// view of `net/tcp` and `net/tcp6`, so containerised listeners are
    /// resolved in their network namespace.
    #[must_use]
    pub fn listening_ports(&self, pid: Pid) -> Vec<u16> {
        let dir = self.pid_dir(pid);

        let mut listeners = HashMap::new();
        for table in ["net/tcp", "net/tcp6"] {
            if let Ok(content) = fs::read_to_string(dir.join(table)) {
                listeners.extend(parse_listen_table(&content));
            }
        }
        if listeners.is_empty() {
            return Vec::new();
        }

        let Ok(fds) = fs::read_dir(dir.join("fd")) else {
            return Vec::new();
        };
        let mut ports: Vec<u16> = fds
            .flatten()
            .filter_map(|fd| fs::read_link(fd.path()).ok())
            .filter_map(|link| parse_socket_inode(&link.to_string_lossy()))
            .filter_map(|inode| listeners.get(&inode).copied())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Value of `name` in the process's initial environment
    #[must_use]
    pub fn environ_var(&self, pid: Pid, name: &str) -> Option<String> {
        let environ = fs::read(self.pid_dir(pid).join("environ")).ok()?;
        environ.split(|b| *b == 0).find_map(|entry| {
            let entry = std::str::from_utf8(entry).ok()?;
            let (key, value) = entry.split_once('=')?;
            (key == name && !value.is_empty()).then(|| value.to_string())
        })
    }

    /// Host name as seen through this root, `localhost` when unreadable
    #[must_use]
    pub fn hostname(&self) -> String {
        fs::read_to_string(self.root.join("sys/kernel/hostname"))
            .ok()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}

/// Innermost pid from the `NSpid:` line of `/proc/<pid>/status`
fn parse_ns_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|l| l.strip_prefix("NSpid:"))
        .and_then(|rest| rest.split_whitespace().last())
        .and_then(|p| p.parse().ok())
}

/// "pid:[4026531836]" -> 4026531836
fn parse_ns_inode(link: &str) -> Option<u32> {
    link.strip_prefix("pid:[")?.strip_suffix(']')?.parse().ok()
}

/// "socket:[12345]" -> 12345
fn parse_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

/// Map socket inode -> local port for every LISTEN row
fn parse_listen_table(content: &str) -> HashMap<u64, u16> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, port) = fields[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port, 16).ok()?;
            let inode = fields[9].parse().ok()?;
            Some((inode, port))
        })
        .collect()
}
