//! Structured error types for autospan
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::Pid;
use thiserror::Error;

/// Boxed error returned by user-supplied constructors
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Per-record decode failure
///
/// Never fatal: the tracer counts the record and moves on.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed {record} record: declared length {declared} exceeds capacity {capacity}")]
    MalformedRecord {
        record: &'static str,
        declared: i64,
        capacity: usize,
    },

    #[error("Truncated {record} record: got {got} bytes, need {need}")]
    Truncated {
        record: &'static str,
        got: usize,
        need: usize,
    },

    #[error("Empty record")]
    Empty,

    #[error("Unknown record type: {0}")]
    UnknownRecordType(u8),
}

#[derive(Error, Debug)]
pub enum TracerError {
    /// Insufficient privilege or incompatible kernel; only this process is affected
    #[error("Failed to attach hooks to {pid}: {reason}")]
    AttachFailed { pid: Pid, reason: String },

    /// The traced process exited
    #[error("Event source closed")]
    SourceClosed,

    /// Kernel-side state could not be allocated at all
    #[error("Kernel resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to construct reporter for service {service}")]
    ConstructionFailed {
        service: String,
        #[source]
        source: BoxError,
    },
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to read {path}")]
    ProcUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Discovery stopped: {0}")]
    Fatal(#[source] TracerError),
}
