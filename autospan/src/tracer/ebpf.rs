//! # eBPF Program Loading and Attachment
//!
//! Loads the compiled kernel-side object for one process and attaches its
//! programs to kernel hook points.
//!
//! ## Attachment Points
//!
//! - **Kernel functions**: socket allocation, accept/connect, `tcp_sendmsg`,
//!   `tcp_recvmsg`, `tcp_close` (plain-socket HTTP, HTTP/2 and TCP records)
//! - **OpenSSL**: `SSL_*` entry/return points when `libssl` is
//!   mapped into the process (TLS plaintext records)
//!
//! Records arrive through the `EVENTS` ring buffer, which is polled through
//! tokio's `AsyncFd` so a quiet process costs nothing.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use autospan_common::PidKey;
use aya::{
    maps::{HashMap, MapData, RingBuf},
    programs::{KProbe, UProbe},
    Ebpf,
};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use tokio::io::unix::AsyncFd;
use tokio::time::{Interval, MissedTickBehavior};

use super::libssl::find_libssl;
use super::source::EventSource;
use crate::discovery::{ProcessInfo, TracerFactory};
use crate::domain::{Pid, TracerError};

/// How often a quiet source checks that its process still exists
const LIVENESS_INTERVAL: Duration = Duration::from_millis(500);

/// Kernel hooks every tracer needs: (program name, kernel function)
const KERNEL_HOOKS: &[(&str, &str)] = &[
    ("sock_alloc_ret_hook", "sock_alloc"),
    ("tcp_rcv_established_hook", "tcp_rcv_established"),
    ("tcp_connect_hook", "tcp_connect"),
    ("tcp_sendmsg_hook", "tcp_sendmsg"),
    ("tcp_sendmsg_ret_hook", "tcp_sendmsg"),
    ("tcp_recvmsg_hook", "tcp_recvmsg"),
    ("tcp_recvmsg_ret_hook", "tcp_recvmsg"),
    ("tcp_close_hook", "tcp_close"),
];

/// Syscall hooks; the symbol gets the architecture prefix at attach time
const SYSCALL_HOOKS: &[(&str, &str)] = &[
    ("sys_accept4_ret_hook", "sys_accept4"),
    ("sys_connect_ret_hook", "sys_connect"),
    ("sys_clone_ret_hook", "sys_clone"),
    ("sys_exit_hook", "sys_exit"),
];

/// OpenSSL hooks: (program name, library symbol)
const SSL_HOOKS: &[(&str, &str)] = &[
    ("ssl_do_handshake_hook", "SSL_do_handshake"),
    ("ssl_do_handshake_ret_hook", "SSL_do_handshake"),
    ("ssl_read_hook", "SSL_read"),
    ("ssl_read_ret_hook", "SSL_read"),
    ("ssl_read_ex_hook", "SSL_read_ex"),
    ("ssl_read_ex_ret_hook", "SSL_read_ex"),
    ("ssl_write_hook", "SSL_write"),
    ("ssl_write_ret_hook", "SSL_write"),
    ("ssl_write_ex_hook", "SSL_write_ex"),
    ("ssl_write_ex_ret_hook", "SSL_write_ex"),
    ("ssl_shutdown_hook", "SSL_shutdown"),
];

/// Kernel symbol of a syscall entry point on this architecture
#[must_use]
pub fn syscall_symbol(name: &str) -> String {
    let prefix = if cfg!(target_arch = "aarch64") {
        "__arm64_"
    } else if cfg!(target_arch = "x86_64") {
        "__x64_"
    } else {
        ""
    };
    format!("{prefix}{name}")
}

/// Ring-buffer backed source for one traced process
pub struct EbpfSource {
    pid: Pid,
    proc_root: PathBuf,
    ring: Option<AsyncFd<RingBuf<MapData>>>,
    bpf: Option<Ebpf>,
    liveness: Interval,
}

impl EbpfSource {
    /// Load `object`, scope it to `process` and attach every hook
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` when the kernel cannot allocate maps or programs
    /// (`ENOMEM`), `AttachFailed` for anything else.
    pub fn attach(
        object: &Path,
        proc_root: &Path,
        process: &ProcessInfo,
    ) -> Result<Self, TracerError> {
        let (bpf, ring) =
            setup(object, proc_root, process).map_err(|e| classify(process.pid, &e))?;

        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self {
            pid: process.pid,
            proc_root: proc_root.to_path_buf(),
            ring: Some(ring),
            bpf: Some(bpf),
            liveness,
        })
    }
}

fn process_alive(proc_root: &Path, pid: Pid) -> bool {
    proc_root.join(pid.0.to_string()).exists()
}

#[async_trait]
impl EventSource for EbpfSource {
    async fn read_records(&mut self, out: &mut Vec<Vec<u8>>) -> Result<(), TracerError> {
        let Self {
            pid,
            proc_root,
            ring,
            liveness,
            ..
        } = self;
        let ring = ring.as_mut().ok_or(TracerError::SourceClosed)?;

        loop {
            tokio::select! {
                guard = ring.readable_mut() => {
                    let mut guard = guard?;
                    while let Some(item) = guard.get_inner_mut().next() {
                        out.push(item.to_vec());
                    }
                    guard.clear_ready();
                    if !out.is_empty() {
                        return Ok(());
                    }
                }
                _ = liveness.tick() => {
                    if !process_alive(proc_root, *pid) {
                        return Err(TracerError::SourceClosed);
                    }
                }
            }
        }
    }

    fn detach(&mut self) {
        // Dropping the Ebpf handle unloads every program and closes the maps
        self.ring = None;
        if self.bpf.take().is_some() {
            debug!("{}: kernel programs released", self.pid);
        }
    }
}

impl Drop for EbpfSource {
    fn drop(&mut self) {
        self.detach();
    }
}

fn setup(
    object: &Path,
    proc_root: &Path,
    process: &ProcessInfo,
) -> Result<(Ebpf, AsyncFd<RingBuf<MapData>>)> {
    let mut bpf = Ebpf::load_file(object)
        .with_context(|| format!("Failed to load {}", object.display()))?;
    init_ebpf_logger(&mut bpf);

    register_pid(&mut bpf, process)?;

    for (program, function) in KERNEL_HOOKS {
        attach_kernel_hook(&mut bpf, program, function)?;
    }
    for (program, syscall) in SYSCALL_HOOKS {
        attach_kernel_hook(&mut bpf, program, &syscall_symbol(syscall))?;
    }
    let ssl = attach_ssl_hooks(&mut bpf, proc_root, process);

    let ring = RingBuf::try_from(bpf.take_map("EVENTS").context("EVENTS map not found")?)?;
    let ring = AsyncFd::new(ring).context("Failed to register EVENTS ring buffer")?;

    info!(
        "✓ Tracing {} ({}), {} kernel hooks, {ssl} TLS hooks",
        process.pid,
        process.comm,
        KERNEL_HOOKS.len() + SYSCALL_HOOKS.len()
    );
    Ok((bpf, ring))
}

/// Initialize eBPF logger
fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Tell the kernel side which (namespace pid, namespace) to report
fn register_pid(bpf: &mut Ebpf, process: &ProcessInfo) -> Result<()> {
    let map = bpf
        .map_mut("PID_FILTER")
        .context("PID_FILTER map not found")?;
    let mut filter: HashMap<_, PidKey, u8> = HashMap::try_from(map)?;
    let key = PidKey {
        pid: process.ns_pid,
        ns: process.pid_ns,
    };
    filter.insert(key, 1, 0)?;
    info!("✓ Registered {} (ns {} pid {})", process.pid, process.pid_ns, process.ns_pid);
    Ok(())
}

fn attach_kernel_hook(bpf: &mut Ebpf, program: &str, function: &str) -> Result<()> {
    let hook: &mut KProbe = bpf
        .program_mut(program)
        .with_context(|| format!("{program} program not found"))?
        .try_into()?;
    hook.load()
        .with_context(|| format!("Failed to load {program}"))?;
    hook.attach(function, 0)
        .with_context(|| format!("Failed to attach {program} to {function}"))?;
    debug!("✓ Attached {program}: {function}");
    Ok(())
}

/// Attach the OpenSSL hooks if the process maps libssl
///
/// TLS tracing is optional: every failure here is a warning. Returns the
/// number of hooks attached.
fn attach_ssl_hooks(bpf: &mut Ebpf, proc_root: &Path, process: &ProcessInfo) -> usize {
    let library = match find_libssl(proc_root, process.pid) {
        Ok(Some(library)) => library,
        Ok(None) => {
            info!("{}: libssl not mapped, TLS traffic will not be traced", process.pid);
            return 0;
        }
        Err(e) => {
            warn!("⚠️  {}: could not inspect mappings: {e:#}", process.pid);
            return 0;
        }
    };

    let pid = i32::try_from(process.pid.0).ok();
    let mut attached = 0;
    for (program, symbol) in SSL_HOOKS {
        let Some(program_ref) = bpf.program_mut(program) else {
            warn!("⚠️  {program} program not found");
            continue;
        };
        let hook: &mut UProbe = match program_ref.try_into() {
            Ok(hook) => hook,
            Err(e) => {
                warn!("⚠️  Failed to convert {program}: {e}");
                continue;
            }
        };
        if let Err(e) = hook.load() {
            warn!("⚠️  Failed to load {program}: {e}");
            continue;
        }
        match hook.attach(Some(*symbol), 0, &library, pid) {
            Ok(_) => {
                debug!("✓ Attached {program}: {symbol}");
                attached += 1;
            }
            // Older libssl builds have no *_ex variants
            Err(e) => warn!("⚠️  Could not attach {program} to {symbol}: {e}"),
        }
    }
    attached
}

/// Map a setup failure onto the tracer error taxonomy
fn classify(pid: Pid, err: &anyhow::Error) -> TracerError {
    let out_of_memory = err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io| io.raw_os_error() == Some(libc::ENOMEM))
    });

    if out_of_memory {
        TracerError::ResourceExhausted(format!("{pid}: {err:#}"))
    } else {
        TracerError::AttachFailed {
            pid,
            reason: format!("{err:#}"),
        }
    }
}

/// Attaches an [`EbpfSource`] per discovered process
#[derive(Debug, Clone)]
pub struct EbpfFactory {
    object: PathBuf,
    proc_root: PathBuf,
}

impl EbpfFactory {
    pub fn new(object: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            object: object.into(),
            proc_root: proc_root.into(),
        }
    }
}

impl TracerFactory for EbpfFactory {
    type Source = EbpfSource;

    fn attach(&self, process: &ProcessInfo) -> Result<EbpfSource, TracerError> {
        EbpfSource::attach(&self.object, &self.proc_root, process)
    }
}
