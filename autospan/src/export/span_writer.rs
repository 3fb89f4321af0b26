//! Per-service span reporter writing JSON lines
//!
//! One line per span:
//!
//! ```json
//! {"resource":{"service.name":"checkout",...},"name":"GET /cart","kind":"server",...}
//! ```
//!
//! Spans are buffered per reporter and written on [`SpanReporter::flush`],
//! which the consumer calls on a timer and the reporter pool calls on
//! eviction.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::{BoxError, RequestSpan, ServiceId};

/// Destination shared by all reporters
pub type SharedSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Reporters buffer at most this many spans; older ones are dropped first
const MAX_BUFFERED: usize = 4096;

#[derive(Debug, Serialize)]
struct SpanLine<'a> {
    resource: &'a BTreeMap<&'static str, String>,
    name: String,
    kind: &'static str,
    protocol: &'static str,
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    sampled: bool,
    start_ns: u64,
    end_ns: u64,
    duration_ns: u64,
    #[serde(skip_serializing_if = "str::is_empty")]
    method: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    path: &'a str,
    status: u16,
    request_size: u64,
    response_size: u64,
    encrypted: bool,
    src: String,
    dst: String,
    pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tid: Option<u32>,
}

impl<'a> SpanLine<'a> {
    fn new(resource: &'a BTreeMap<&'static str, String>, span: &'a RequestSpan) -> Self {
        let name = match (span.method.is_empty(), span.path.is_empty()) {
            (false, false) => format!("{} {}", span.method, span.path),
            (true, false) => span.path.clone(),
            (false, true) => span.method.clone(),
            (true, true) => span.protocol.as_str().to_string(),
        };

        Self {
            resource,
            name,
            kind: span.kind.as_str(),
            protocol: span.protocol.as_str(),
            trace_id: span.trace.trace_id.to_string(),
            span_id: span.trace.span_id.to_string(),
            parent_span_id: span
                .trace
                .parent_id
                .is_valid()
                .then(|| span.trace.parent_id.to_string()),
            sampled: span.trace.is_sampled(),
            start_ns: span.start_ns,
            end_ns: span.end_ns,
            duration_ns: span.duration_ns(),
            method: &span.method,
            path: &span.path,
            status: span.status,
            request_size: span.request_size,
            response_size: span.response_size,
            encrypted: span.encrypted,
            src: format!("{}:{}", span.connection.src, span.connection.src_port),
            dst: format!("{}:{}", span.connection.dst, span.connection.dst_port),
            pid: span.process.host_pid,
            tid: span.thread.map(|t| t.0),
        }
    }
}

pub struct SpanReporter {
    service: ServiceId,
    resource: BTreeMap<&'static str, String>,
    buffer: Mutex<VecDeque<RequestSpan>>,
    sink: SharedSink,
}

impl SpanReporter {
    /// # Errors
    ///
    /// Fails for a service without a name.
    pub fn new(service: &ServiceId, sink: SharedSink) -> Result<Self, BoxError> {
        if service.name.trim().is_empty() {
            return Err(format!("service instance {} has no name", service.instance).into());
        }

        let mut resource = BTreeMap::new();
        resource.insert("service.name", service.name.clone());
        if !service.namespace.is_empty() {
            resource.insert("service.namespace", service.namespace.clone());
        }
        resource.insert("service.instance.id", service.instance.clone());
        resource.insert("telemetry.sdk.name", "autospan".to_string());
        resource.insert("telemetry.sdk.version", env!("CARGO_PKG_VERSION").to_string());

        Ok(Self {
            service: service.clone(),
            resource,
            buffer: Mutex::new(VecDeque::new()),
            sink,
        })
    }

    #[must_use]
    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    /// Buffer a span until the next flush
    pub fn record(&self, span: RequestSpan) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= MAX_BUFFERED {
            buffer.pop_front();
        }
        buffer.push_back(span);
    }

    /// Write buffered spans; returns how many were written
    ///
    /// # Errors
    ///
    /// I/O or serialization failure; spans not yet written are dropped.
    pub fn flush(&self) -> io::Result<usize> {
        let spans = std::mem::take(&mut *self.buffer.lock());
        if spans.is_empty() {
            return Ok(0);
        }

        let mut out = Vec::with_capacity(spans.len() * 256);
        for span in &spans {
            serde_json::to_writer(&mut out, &SpanLine::new(&self.resource, span))?;
            out.push(b'\n');
        }

        let mut sink = self.sink.lock();
        sink.write_all(&out)?;
        sink.flush()?;
        Ok(spans.len())
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }
}
