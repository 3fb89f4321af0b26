//! CLI argument definitions

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use regex::Regex;

use crate::discovery::{PortRanges, SelectionCriteria};

#[derive(Parser, Debug)]
#[command(
    name = "autospan",
    version,
    about = "Trace HTTP, HTTP/2, gRPC and TCP requests of running processes with eBPF",
    after_help = "\
EXAMPLES:
    sudo autospan --exec nginx                     Trace every nginx process
    sudo autospan --open-ports 8080-8089           Trace whatever listens on 8080-8089
    sudo autospan --exec java --spans-out spans.jsonl"
)]
pub struct Args {
    /// Regex matched against executable path and command name
    #[arg(long, env = "AUTOSPAN_EXECUTABLE_NAME", value_name = "REGEX")]
    pub exec: Option<String>,

    /// Listening ports to select on, e.g. "80,443,8080-8089"
    #[arg(long, env = "AUTOSPAN_OPEN_PORT", value_name = "PORTS")]
    pub open_ports: Option<String>,

    /// Only trace processes in this pid namespace (inode number)
    #[arg(long, env = "AUTOSPAN_PID_NAMESPACE", value_name = "INODE")]
    pub pid_namespace: Option<u32>,

    /// Compiled kernel-side object file
    #[arg(
        long,
        env = "AUTOSPAN_BPF_OBJECT",
        default_value = "/usr/lib/autospan/autospan.bpf.o",
        value_name = "FILE"
    )]
    pub bpf_object: PathBuf,

    /// Root of the proc filesystem
    #[arg(long, env = "AUTOSPAN_PROC_ROOT", default_value = "/proc", hide = true)]
    pub proc_root: PathBuf,

    /// Write spans as JSON lines to this file instead of stdout
    #[arg(long, env = "AUTOSPAN_SPANS_OUT", value_name = "FILE")]
    pub spans_out: Option<PathBuf>,

    /// Capacity of the span queue shared by all tracers
    #[arg(long, env = "AUTOSPAN_QUEUE_CAPACITY", default_value = "1000")]
    pub queue_capacity: usize,

    /// How long a tracer waits on a full queue before dropping a span
    #[arg(long, env = "AUTOSPAN_QUEUE_WAIT_MS", default_value = "50")]
    pub queue_wait_ms: u64,

    /// Maximum number of per-service reporters kept alive
    #[arg(long, env = "AUTOSPAN_REPORTER_CACHE_SIZE", default_value = "256")]
    pub reporter_cache_size: usize,

    /// Drop metric label sets not updated for this long
    #[arg(long, env = "AUTOSPAN_METRICS_TTL_SECS", default_value = "300")]
    pub metrics_ttl_secs: u64,

    /// Drop half-observed requests after this long
    #[arg(long, env = "AUTOSPAN_CORRELATION_TTL_SECS", default_value = "30")]
    pub correlation_ttl_secs: u64,

    /// Flush spans and collect metrics this often
    #[arg(long, env = "AUTOSPAN_COLLECT_INTERVAL_SECS", default_value = "10")]
    pub collect_interval_secs: u64,

    /// How often to scan for new processes
    #[arg(long, env = "AUTOSPAN_DISCOVERY_INTERVAL_MS", default_value = "1000")]
    pub discovery_interval_ms: u64,

    /// Wait this long for tracers to detach on shutdown
    #[arg(long, env = "AUTOSPAN_SHUTDOWN_TIMEOUT_SECS", default_value = "5")]
    pub shutdown_timeout_secs: u64,

    /// Value of the `service.namespace` resource attribute
    #[arg(long, env = "OTEL_SERVICE_NAMESPACE", default_value = "")]
    pub service_namespace: String,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Build selection criteria from `--exec`, `--open-ports` and
    /// `--pid-namespace`
    ///
    /// # Errors
    ///
    /// Missing required argument when no criterion is given, or an invalid
    /// regex or port list.
    pub fn criteria(&self) -> Result<SelectionCriteria> {
        let exec = self
            .exec
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("Invalid --exec regex '{pattern}'"))
            })
            .transpose()?;
        let ports: PortRanges = match self.open_ports.as_deref() {
            Some(list) => list.parse().context("Invalid --open-ports")?,
            None => PortRanges::default(),
        };

        let criteria = SelectionCriteria {
            exec,
            ports,
            pid_namespace: self.pid_namespace,
        };
        if criteria.is_empty() {
            bail!(
                "Missing required argument: --exec or --open-ports\n\n\
                 Usage:\n  \
                 autospan --exec nginx           Select by executable\n  \
                 autospan --open-ports 8080      Select by listening port\n\n\
                 Run 'autospan --help' for more options"
            );
        }
        Ok(criteria)
    }

    #[must_use]
    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }

    #[must_use]
    pub fn metrics_ttl(&self) -> Duration {
        Duration::from_secs(self.metrics_ttl_secs)
    }

    #[must_use]
    pub fn correlation_ttl(&self) -> Duration {
        Duration::from_secs(self.correlation_ttl_secs.max(1))
    }

    #[must_use]
    pub fn collect_interval(&self) -> Duration {
        Duration::from_secs(self.collect_interval_secs.max(1))
    }

    #[must_use]
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms.max(10))
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("autospan").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--exec", "nginx"]);
        assert_eq!(args.queue_capacity, 1000);
        assert_eq!(args.reporter_cache_size, 256);
        assert_eq!(args.metrics_ttl(), Duration::from_secs(300));
        assert_eq!(args.proc_root, PathBuf::from("/proc"));
    }

    #[test]
    fn test_criteria_from_ports() {
        let args = parse(&["--open-ports", "80,8080-8089"]);
        let criteria = args.criteria().unwrap();
        assert!(criteria.exec.is_none());
        assert!(criteria.ports.contains(8081));
    }

    #[test]
    fn test_missing_criteria_is_usage_error() {
        let err = parse(&[]).criteria().unwrap_err();
        assert!(err.to_string().contains("Missing required argument"));
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        assert!(parse(&["--exec", "(unclosed"]).criteria().is_err());
        assert!(parse(&["--open-ports", "80-70"]).criteria().is_err());
    }
}
