//! Domain types providing compile-time safety and self-documentation
//!
//! These wrap the raw wire values so that a namespace-local pid can't be
//! passed where a host pid is expected, and so spans carry parsed addresses
//! instead of byte arrays.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

use autospan_common::{ConnectionInfo, PidInfo, TraceParent, TRACE_FLAG_SAMPLED};

/// Host process ID
///
/// Pid in the root pid namespace, as reported by `bpf_get_current_pid_tgid()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Process identity across container boundaries
///
/// Two identities with the same host pid but different namespaces are
/// different logical processes (the host pid was reused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessIdentity {
    pub host_pid: u32,
    pub user_pid: u32,
    pub ns: u32,
}

impl ProcessIdentity {
    #[must_use]
    pub fn pid(&self) -> Pid {
        Pid(self.host_pid)
    }
}

impl From<PidInfo> for ProcessIdentity {
    fn from(pid: PidInfo) -> Self {
        Self {
            host_pid: pid.host_pid,
            user_pid: pid.user_pid,
            ns: pid.ns,
        }
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (ns {} pid {})", self.pid(), self.ns, self.user_pid)
    }
}

/// Transport connection 4-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl From<&ConnectionInfo> for Connection {
    fn from(info: &ConnectionInfo) -> Self {
        Self {
            src: unmap_ip(info.s_addr),
            dst: unmap_ip(info.d_addr),
            src_port: info.s_port,
            dst_port: info.d_port,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> {}:{}", self.src, self.src_port, self.dst, self.dst_port)
    }
}

/// Convert a 16-byte wire address to an `IpAddr`, collapsing IPv4-mapped
/// addresses to plain IPv4.
fn unmap_ip(raw: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(raw);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

/// 16-byte W3C trace id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceId(pub [u8; 16]);

/// 8-byte W3C span id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpanId(pub [u8; 8]);

impl TraceId {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }
}

impl SpanId {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Resolved distributed-trace context of one span
///
/// Fixed once the span is emitted; see `correlate::context` for how it is
/// chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,

    /// All zeros for a root span
    pub parent_id: SpanId,
    pub start_ns: u64,
    pub flags: u8,
}

impl TraceContext {
    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.flags & TRACE_FLAG_SAMPLED != 0
    }

    /// Returns true if a trace id has been assigned
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.trace_id.is_valid()
    }
}

impl From<&TraceParent> for TraceContext {
    fn from(tp: &TraceParent) -> Self {
        Self {
            trace_id: TraceId(tp.trace_id),
            span_id: SpanId(tp.span_id),
            parent_id: SpanId(tp.parent_id),
            start_ns: tp.ts,
            flags: tp.flags,
        }
    }
}

/// Application protocol of a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Http2,
    Grpc,
    Tcp,
}

impl Protocol {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Http2 => "http2",
            Protocol::Grpc => "grpc",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the traced process served or issued the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanKind {
    Server,
    Client,
}

impl SpanKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Server => "server",
            SpanKind::Client => "client",
        }
    }
}

/// Identity of one instrumented service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId {
    pub name: String,

    /// Empty when no namespace is configured
    pub namespace: String,
    pub instance: String,
}

/// Cache key derived from a [`ServiceId`]
///
/// Equal for repeated observations of the same service instance and distinct
/// across instances, even when names contain separator characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid {
    namespace: String,
    name: String,
    instance: String,
}

impl ServiceId {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            instance: instance.into(),
        }
    }

    #[must_use]
    pub fn uid(&self) -> Uid {
        Uid {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            instance: self.instance.clone(),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.name, self.instance)
        } else {
            write!(f, "{}.{}/{}", self.namespace, self.name, self.instance)
        }
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}/{:?}", self.namespace, self.name, self.instance)
    }
}

/// One completed, protocol-agnostic request/response observation
///
/// Only built by the correlator; immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpan {
    pub protocol: Protocol,
    pub kind: SpanKind,
    pub connection: Connection,
    pub process: ProcessIdentity,
    pub service: Arc<ServiceId>,
    pub start_ns: u64,
    pub end_ns: u64,

    /// HTTP method, or empty for raw TCP
    pub method: String,

    /// Request path (without query), gRPC full method name, or empty
    pub path: String,

    /// HTTP status, gRPC status, or 0 when unknown
    pub status: u16,
    pub request_size: u64,
    pub response_size: u64,
    pub encrypted: bool,

    /// Thread owning the TLS session the span was decrypted from
    pub thread: Option<Tid>,
    pub trace: TraceContext,
}

impl RequestSpan {
    #[must_use]
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_mapped_connection() {
        let mut info = ConnectionInfo::default();
        info.s_addr[10] = 0xff;
        info.s_addr[11] = 0xff;
        info.s_addr[12..].copy_from_slice(&[10, 0, 0, 1]);
        info.d_addr[15] = 1; // ::1
        info.s_port = 45000;
        info.d_port = 8080;

        let conn = Connection::from(&info);
        assert_eq!(conn.src, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(conn.dst, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(conn.to_string(), "10.0.0.1:45000 -> ::1:8080");
    }

    #[test]
    fn test_uid_stable_and_distinct() {
        let a = ServiceId::new("checkout", "shop", "host-1");
        let again = ServiceId::new("checkout", "shop", "host-1");
        let b = ServiceId::new("checkout", "shop", "host-2");
        // Separator characters must not make distinct ids collide
        let c = ServiceId::new("a/b", "", "c");
        let d = ServiceId::new("a", "", "b/c");

        assert_eq!(a.uid(), again.uid());
        assert_ne!(a.uid(), b.uid());
        assert_ne!(c.uid(), d.uid());
    }

    #[test]
    fn test_sampled_flag() {
        let ctx = TraceContext {
            trace_id: TraceId([0xab; 16]),
            span_id: SpanId([0x01; 8]),
            parent_id: SpanId::default(),
            start_ns: 0,
            flags: TRACE_FLAG_SAMPLED,
        };
        assert!(ctx.is_sampled());
        assert!(!TraceContext { flags: 0, ..ctx }.is_sampled());
    }
}
