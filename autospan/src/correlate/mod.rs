//! Connection correlation: fragments in, complete spans out
//!
//! A fragment carries a request half, a response half, or both. Incomplete
//! fragments wait in a map keyed by connection, process and (for HTTP/2)
//! stream id until the other half shows up. Anything left waiting longer
//! than the idle TTL is dropped by [`Correlator::evict_idle`]; a response
//! that never arrives is normal, so eviction is counted, not reported.
//!
//! ```text
//!   Fragment ──► complete? ──yes──────────────────────► RequestSpan
//!                  │ no
//!                  ▼
//!             pending[key] ──merge──► complete? ──yes──► RequestSpan
//!                  │
//!                  └── idle > ttl ──► evicted
//! ```

pub mod context;
mod tls;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::clock::Clock;
use crate::decode::{Fragment, TlsPlaintext, TlsRecord};
use crate::domain::{Connection, ProcessIdentity, Protocol, RequestSpan, ServiceId};

pub use tls::TlsTables;

/// Correlation key
///
/// The stream id is part of the key: HTTP/2 multiplexes many exchanges over
/// one connection and they must never be merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub connection: Connection,
    pub process: ProcessIdentity,
    pub stream_id: Option<u32>,
}

impl FragmentKey {
    #[must_use]
    pub fn of(fragment: &Fragment) -> Self {
        Self {
            connection: fragment.connection,
            process: fragment.process,
            stream_id: fragment.stream_id,
        }
    }
}

struct Pending {
    fragment: Fragment,
    last_seen: Duration,
}

/// Counters exposed to the tracer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub spans: u64,

    /// Fragments with neither half (e.g. non-HTTP plaintext)
    pub unclassified: u64,

    /// A half replaced by a newer half of the same kind
    pub superseded: u64,
    pub evicted: u64,
}

pub struct Correlator {
    service: Arc<ServiceId>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    pending: HashMap<FragmentKey, Pending>,
    tls: TlsTables,
    stats: CorrelatorStats,
}

impl Correlator {
    pub fn new(service: Arc<ServiceId>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            service,
            clock,
            ttl,
            pending: HashMap::new(),
            tls: TlsTables::default(),
            stats: CorrelatorStats::default(),
        }
    }

    /// Merge a fragment into pending state, returning a span if it completes
    pub fn observe(&mut self, fragment: Fragment) -> Option<RequestSpan> {
        if fragment.is_empty() {
            self.stats.unclassified += 1;
            return None;
        }
        if fragment.is_complete() {
            return Some(self.emit(fragment));
        }

        let key = FragmentKey::of(&fragment);
        let now = self.clock.now();

        let merged = match self.pending.remove(&key) {
            Some(waiting) => {
                let (merged, superseded) = merge(waiting.fragment, fragment);
                if superseded {
                    self.stats.superseded += 1;
                }
                merged
            }
            None => fragment,
        };

        if merged.is_complete() {
            return Some(self.emit(merged));
        }

        self.pending.insert(
            key,
            Pending {
                fragment: merged,
                last_seen: now,
            },
        );
        None
    }

    /// Feed a TLS record, returning any spans it completes
    ///
    /// A handle binding may release plaintext that arrived before it, so one
    /// record can complete several spans.
    pub fn handle_tls(&mut self, record: TlsRecord) -> Vec<RequestSpan> {
        match record {
            TlsRecord::Connection {
                handle,
                connection,
                host_pid,
            } => {
                let now = self.clock.now();
                let parked = self.tls.bind(host_pid, handle, connection, now);
                parked
                    .into_iter()
                    .filter_map(|plain| self.resolve_tls(&plain, connection))
                    .collect()
            }
            TlsRecord::Plaintext(plain) => {
                let now = self.clock.now();
                match self.tls.accept(plain, now) {
                    Some((plain, connection)) => {
                        self.resolve_tls(&plain, connection).into_iter().collect()
                    }
                    None => Vec::new(),
                }
            }
        }
    }

    /// Join decrypted bytes with their connection and correlate them as if
    /// they had been seen on a plain socket
    ///
    /// The fragment is attributed to the process and thread owning the
    /// handle, so both halves land on the same key whichever thread did the
    /// read or write.
    pub fn resolve_tls(
        &mut self,
        plain: &TlsPlaintext,
        connection: Connection,
    ) -> Option<RequestSpan> {
        let owner = self.tls.owner(plain.process.host_pid, plain.handle);
        match crate::decode::tls::plaintext_fragment(plain, connection) {
            Some(mut fragment) => {
                if let Some((process, thread)) = owner {
                    fragment.process = process;
                    fragment.thread = Some(thread);
                }
                self.observe(fragment)
            }
            None => {
                self.stats.unclassified += 1;
                None
            }
        }
    }

    /// Drop fragments and TLS state idle for longer than the TTL
    ///
    /// Returns the number of incomplete fragments removed.
    pub fn evict_idle(&mut self) -> usize {
        let now = self.clock.now();
        let ttl = self.ttl;
        let before = self.pending.len();
        self.pending
            .retain(|_, p| now.saturating_sub(p.last_seen) <= ttl);
        let evicted = before - self.pending.len();

        let tls_evicted = self.tls.evict_idle(now, ttl);
        if evicted > 0 || tls_evicted > 0 {
            debug!(
                "{}: evicted {} incomplete fragments, {} idle TLS entries",
                self.service, evicted, tls_evicted
            );
        }

        self.stats.evicted += evicted as u64;
        evicted
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn stats(&self) -> CorrelatorStats {
        self.stats
    }

    fn emit(&mut self, fragment: Fragment) -> RequestSpan {
        self.stats.spans += 1;

        let Fragment {
            protocol,
            kind,
            connection,
            process,
            request,
            response,
            encrypted,
            kernel_trace,
            thread,
            ..
        } = fragment;
        let request = request.unwrap_or_default();
        let response = response.unwrap_or_default();
        let start_ns = request.start_ns;
        let end_ns = response.end_ns.max(start_ns);

        RequestSpan {
            protocol,
            kind,
            connection,
            process,
            service: Arc::clone(&self.service),
            start_ns,
            end_ns,
            method: request.method,
            path: request.path,
            status: response.status,
            request_size: request.size,
            response_size: response.size,
            encrypted,
            thread,
            trace: context::resolve(kernel_trace, request.header_trace, start_ns),
        }
    }
}

/// Combine a waiting fragment with a new one for the same key
///
/// Returns the merged fragment and whether a half was overwritten. A newer
/// half of the same kind replaces the older one: the older exchange lost its
/// partner and would otherwise pair with the wrong one.
fn merge(waiting: Fragment, new: Fragment) -> (Fragment, bool) {
    let superseded = (waiting.request.is_some() && new.request.is_some())
        || (waiting.response.is_some() && new.response.is_some());

    let protocol = if waiting.protocol == Protocol::Grpc || new.protocol == Protocol::Grpc {
        Protocol::Grpc
    } else {
        new.protocol
    };
    // The side that saw the request knows who initiated the exchange
    let kind = if new.request.is_none() && waiting.request.is_some() {
        waiting.kind
    } else {
        new.kind
    };
    let encrypted = waiting.encrypted || new.encrypted;
    let kernel_trace = waiting.kernel_trace.or(new.kernel_trace);
    let thread = waiting.thread.or(new.thread);
    let request = new.request.or(waiting.request);
    let response = new.response.or(waiting.response);

    let merged = Fragment {
        protocol,
        kind,
        request,
        response,
        encrypted,
        kernel_trace,
        thread,
        ..new
    };
    (merged, superseded)
}
