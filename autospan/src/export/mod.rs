//! Export stage: per-service reporters and cardinality-bounded metrics
//!
//! - [`ReporterPool`] caches one reporter per service, LRU-bounded
//! - [`SpanReporter`] buffers a service's spans and writes them as JSON lines
//! - [`ExpiryMap`] / [`Expirer`] keep metric label sets alive only while
//!   they are being updated
//! - [`ExportStage`] is the single consumer of the span queue tying them together

pub mod expire;
pub mod expirer;
pub mod reporter_pool;
pub mod span_writer;
pub mod stage;

pub use expire::ExpiryMap;
pub use expirer::{Attribute, Collection, Counter, Expirer};
pub use reporter_pool::ReporterPool;
pub use span_writer::{SharedSink, SpanReporter};
pub use stage::{metric_line, ExportStage, ExportStats};
