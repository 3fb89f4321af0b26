//! Domain model for autospan
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{
    Connection, Pid, ProcessIdentity, Protocol, RequestSpan, ServiceId, SpanId, SpanKind, Tid,
    TraceContext, TraceId, Uid,
};

pub use errors::{BoxError, DecodeError, DiscoveryError, PoolError, TracerError};
