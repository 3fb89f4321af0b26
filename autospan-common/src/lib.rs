//! # Shared Wire Records (eBPF ↔ Userspace)
//!
//! Defines the fixed-layout records emitted by the kernel-side programs and the
//! keys userspace writes back into kernel maps. All types use `#[repr(C)]` so
//! the layout is identical on both sides of the ring buffer.
//!
//! ## Record Families
//!
//! Every record starts with a one-byte tag (`flags`) selecting its layout:
//!
//! 1. [`HttpInfo`] - HTTP/1.x exchange observed on a plain socket
//! 2. [`Http2GrpcRequest`] - HTTP/2 (and gRPC) frames for one stream
//! 3. [`TcpRequest`] - raw TCP request/response fallback
//! 4. [`SslConnectionEvent`] - binds an OpenSSL handle to its connection
//! 5. [`SslSmallBuffer`] / [`SslLargeBuffer`] - plaintext seen at `SSL_read`/`SSL_write`
//!
//! Explicit `_padding` fields mirror the compiler-inserted padding of the
//! kernel structs. The size assertions at the bottom of this file fail the
//! build if a field change shifts the layout.

#![no_std]

// ============================================================================
// Record Tags
// ============================================================================

/// HTTP/1.x request/response record ([`HttpInfo`])
pub const EVENT_HTTP: u8 = 1;

/// HTTP/2 or gRPC stream record ([`Http2GrpcRequest`])
pub const EVENT_HTTP2: u8 = 2;

/// Raw TCP fallback record ([`TcpRequest`])
pub const EVENT_TCP: u8 = 3;

/// OpenSSL handle → connection binding ([`SslConnectionEvent`])
pub const EVENT_SSL_CONNECTION: u8 = 4;

/// Plaintext captured at the OpenSSL boundary, small buffer ([`SslSmallBuffer`])
pub const EVENT_SSL_SMALL_BUFFER: u8 = 5;

/// Plaintext captured at the OpenSSL boundary, large buffer ([`SslLargeBuffer`])
pub const EVENT_SSL_LARGE_BUFFER: u8 = 6;

// ============================================================================
// Buffer Capacities
// ============================================================================

/// Head of an HTTP/1.x request (request line + first headers)
pub const HTTP_BUF_SIZE: usize = 160;

/// Outgoing HTTP/2 frames captured per stream
pub const HTTP2_BUF_SIZE: usize = 256;

/// Returning HTTP/2 frames captured per stream
pub const HTTP2_RET_BUF_SIZE: usize = 64;

/// Request bytes captured by the TCP fallback
pub const TCP_REQ_BUF_SIZE: usize = 256;

/// Response bytes captured by the TCP fallback
pub const TCP_RESP_BUF_SIZE: usize = 128;

/// Small OpenSSL plaintext buffer (handshakes, short reads)
pub const SSL_SMALL_BUF_SIZE: usize = 24;

/// Large OpenSSL plaintext buffer
pub const SSL_LARGE_BUF_SIZE: usize = 256;

// ============================================================================
// Field Values
// ============================================================================

/// [`HttpInfo::kind`]: the traced process served the request
pub const HTTP_KIND_SERVER: u8 = 1;

/// [`HttpInfo::kind`]: the traced process issued the request
pub const HTTP_KIND_CLIENT: u8 = 2;

/// [`TcpRequest::direction`]: first payload was received
pub const TCP_RECV: u8 = 0;

/// [`TcpRequest::direction`]: first payload was sent
pub const TCP_SEND: u8 = 1;

/// [`SslBufferEvent::op`]: `SSL_do_handshake`
pub const SSL_OP_HANDSHAKE: u8 = 0;

/// [`SslBufferEvent::op`]: `SSL_read` / `SSL_read_ex`
pub const SSL_OP_READ: u8 = 1;

/// [`SslBufferEvent::op`]: `SSL_write` / `SSL_write_ex`
pub const SSL_OP_WRITE: u8 = 2;

/// [`SslBufferEvent::op`]: `SSL_shutdown`
pub const SSL_OP_SHUTDOWN: u8 = 3;

/// [`TraceParent::flags`] bit set when the trace is sampled
pub const TRACE_FLAG_SAMPLED: u8 = 0x01;

// ============================================================================
// Identity Groups
// ============================================================================

/// Transport connection 4-tuple
///
/// Addresses are always 16 bytes: IPv4 peers are stored IPv4-mapped
/// (`::ffff:a.b.c.d`). The kernel side sorts the tuple so both directions of
/// a connection produce the same value.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnectionInfo {
    pub s_addr: [u8; 16],
    pub d_addr: [u8; 16],
    pub s_port: u16,
    pub d_port: u16,
}

/// Process identity as seen across pid namespaces
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PidInfo {
    /// Process id in the root (host) pid namespace
    pub host_pid: u32,

    /// Process id inside the process's own pid namespace
    pub user_pid: u32,

    /// Inode number of the pid namespace
    pub ns: u32,
}

/// Connection owned by a specific host process
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PidConnectionInfo {
    pub conn: ConnectionInfo,
    pub host_pid: u32,
}

/// W3C trace context captured or injected by the kernel side
///
/// An all-zero `trace_id` means the kernel found no `traceparent` and left
/// the decision to userspace.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub parent_id: [u8; 8],

    /// Monotonic timestamp when the context was recorded
    pub ts: u64,

    /// See [`TRACE_FLAG_SAMPLED`]
    pub flags: u8,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 7],
}

/// Key of the kernel `PID_FILTER` map
///
/// Written by userspace for every instrumented process; the kernel programs drop
/// events from any (pid, namespace) pair not present in the map.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PidKey {
    /// Namespace-local pid
    pub pid: u32,

    /// Pid namespace inode
    pub ns: u32,
}

// ============================================================================
// Protocol Records
// ============================================================================

/// HTTP/1.x exchange on a plain socket
///
/// Emitted when the kernel side has seen the request head and, usually, the
/// response status. `end_monotime_ns == 0` marks a request whose response has
/// not been observed yet.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HttpInfo {
    /// Always [`EVENT_HTTP`]
    pub flags: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding1: [u8; 1],
    pub conn_info: ConnectionInfo,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding2: [u8; 2],
    pub start_monotime_ns: u64,
    pub end_monotime_ns: u64,

    /// Request line and leading headers, valid up to `len` bytes
    pub buf: [u8; HTTP_BUF_SIZE],

    /// Bytes of `buf` that hold request data
    pub len: u32,

    /// Total response size as reported by the send path
    pub resp_len: u32,

    /// HTTP status code, 0 until the response is seen
    pub status: u16,

    /// [`HTTP_KIND_SERVER`] or [`HTTP_KIND_CLIENT`]
    pub kind: u8,

    /// 1 when the bytes came from an OpenSSL boundary
    pub ssl: u8,
    pub pid: PidInfo,
    pub tp: TraceParent,

    /// Runtime-specific request id (e.g. async context id), 0 if unused
    pub extra_id: u64,
    pub task_tid: u32,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding3: [u8; 4],
}

impl HttpInfo {
    pub const EMPTY: Self = Self {
        flags: EVENT_HTTP,
        _padding1: [0; 1],
        conn_info: ConnectionInfo {
            s_addr: [0; 16],
            d_addr: [0; 16],
            s_port: 0,
            d_port: 0,
        },
        _padding2: [0; 2],
        start_monotime_ns: 0,
        end_monotime_ns: 0,
        buf: [0; HTTP_BUF_SIZE],
        len: 0,
        resp_len: 0,
        status: 0,
        kind: HTTP_KIND_SERVER,
        ssl: 0,
        pid: PidInfo {
            host_pid: 0,
            user_pid: 0,
            ns: 0,
        },
        tp: TraceParent::EMPTY,
        extra_id: 0,
        task_tid: 0,
        _padding3: [0; 4],
    };
}

impl Default for HttpInfo {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// HTTP/2 frames for one stream of a multiplexed connection
///
/// `data` holds frames written by the request side (HEADERS first),
/// `ret_data` the first frames of the answer. The stream id lives in the
/// frame headers, not in a dedicated field.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Http2GrpcRequest {
    /// Always [`EVENT_HTTP2`]
    pub flags: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding1: [u8; 1],
    pub conn_info: ConnectionInfo,
    pub data: [u8; HTTP2_BUF_SIZE],
    pub ret_data: [u8; HTTP2_RET_BUF_SIZE],

    /// [`HTTP_KIND_SERVER`] or [`HTTP_KIND_CLIENT`]
    pub kind: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding2: [u8; 1],

    /// Bytes of `data` that hold frames; negative values are corrupt
    pub len: i32,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding3: [u8; 4],
    pub start_monotime_ns: u64,
    pub end_monotime_ns: u64,
    pub pid: PidInfo,
    pub ssl: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding4: [u8; 3],
    pub tp: TraceParent,
}

impl Http2GrpcRequest {
    pub const EMPTY: Self = Self {
        flags: EVENT_HTTP2,
        _padding1: [0; 1],
        conn_info: ConnectionInfo {
            s_addr: [0; 16],
            d_addr: [0; 16],
            s_port: 0,
            d_port: 0,
        },
        data: [0; HTTP2_BUF_SIZE],
        ret_data: [0; HTTP2_RET_BUF_SIZE],
        kind: HTTP_KIND_SERVER,
        _padding2: [0; 1],
        len: 0,
        _padding3: [0; 4],
        start_monotime_ns: 0,
        end_monotime_ns: 0,
        pid: PidInfo {
            host_pid: 0,
            user_pid: 0,
            ns: 0,
        },
        ssl: 0,
        _padding4: [0; 3],
        tp: TraceParent::EMPTY,
    };
}

impl Default for Http2GrpcRequest {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Raw TCP request/response pair for protocols the kernel could not classify
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TcpRequest {
    /// Always [`EVENT_TCP`]
    pub flags: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding1: [u8; 1],
    pub conn_info: ConnectionInfo,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding2: [u8; 2],
    pub start_monotime_ns: u64,
    pub end_monotime_ns: u64,
    pub buf: [u8; TCP_REQ_BUF_SIZE],
    pub rbuf: [u8; TCP_RESP_BUF_SIZE],

    /// Bytes of `buf` holding request data
    pub len: u32,

    /// Bytes of `rbuf` holding response data
    pub resp_len: u32,
    pub ssl: u8,

    /// [`TCP_RECV`] or [`TCP_SEND`]
    pub direction: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding3: [u8; 2],
    pub pid: PidInfo,
    pub tp: TraceParent,
}

impl TcpRequest {
    pub const EMPTY: Self = Self {
        flags: EVENT_TCP,
        _padding1: [0; 1],
        conn_info: ConnectionInfo {
            s_addr: [0; 16],
            d_addr: [0; 16],
            s_port: 0,
            d_port: 0,
        },
        _padding2: [0; 2],
        start_monotime_ns: 0,
        end_monotime_ns: 0,
        buf: [0; TCP_REQ_BUF_SIZE],
        rbuf: [0; TCP_RESP_BUF_SIZE],
        len: 0,
        resp_len: 0,
        ssl: 0,
        direction: TCP_RECV,
        _padding3: [0; 2],
        pid: PidInfo {
            host_pid: 0,
            user_pid: 0,
            ns: 0,
        },
        tp: TraceParent::EMPTY,
    };
}

impl Default for TcpRequest {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Binds an OpenSSL `SSL*` handle to the socket it reads from/writes to
///
/// Emitted from `tcp_sendmsg`/`tcp_recvmsg` when they run nested inside an
/// OpenSSL call, which is the only place both values are visible.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SslConnectionEvent {
    /// Always [`EVENT_SSL_CONNECTION`]
    pub flags: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding1: [u8; 3],
    pub p_conn: PidConnectionInfo,

    /// Destination port before the tuple was sorted
    pub orig_dport: u16,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding2: [u8; 2],

    /// `SSL*` pointer value, opaque outside the traced process
    pub ssl: u64,
}

/// Plaintext observed at an OpenSSL call boundary
///
/// `N` is the buffer capacity: [`SSL_SMALL_BUF_SIZE`] or [`SSL_LARGE_BUF_SIZE`].
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SslBufferEvent<const N: usize> {
    /// [`EVENT_SSL_SMALL_BUFFER`] or [`EVENT_SSL_LARGE_BUFFER`]
    pub flags: u8,

    /// One of the `SSL_OP_*` constants
    pub op: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding1: [u8; 2],

    /// Bytes of `buf` holding plaintext
    pub len: u32,

    /// `SSL*` pointer value
    pub ssl: u64,

    /// `bpf_get_current_pid_tgid()`: tgid in the high half, tid in the low half
    pub pid_tgid: u64,
    pub timestamp_ns: u64,
    pub pid: PidInfo,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding2: [u8; 4],
    pub buf: [u8; N],
}

impl<const N: usize> SslBufferEvent<N> {
    pub const EMPTY: Self = Self {
        flags: if N <= SSL_SMALL_BUF_SIZE {
            EVENT_SSL_SMALL_BUFFER
        } else {
            EVENT_SSL_LARGE_BUFFER
        },
        op: SSL_OP_READ,
        _padding1: [0; 2],
        len: 0,
        ssl: 0,
        pid_tgid: 0,
        timestamp_ns: 0,
        pid: PidInfo {
            host_pid: 0,
            user_pid: 0,
            ns: 0,
        },
        _padding2: [0; 4],
        buf: [0; N],
    };
}

impl<const N: usize> Default for SslBufferEvent<N> {
    fn default() -> Self {
        Self::EMPTY
    }
}

pub type SslSmallBuffer = SslBufferEvent<SSL_SMALL_BUF_SIZE>;
pub type SslLargeBuffer = SslBufferEvent<SSL_LARGE_BUF_SIZE>;

impl TraceParent {
    pub const EMPTY: Self = Self {
        trace_id: [0; 16],
        span_id: [0; 8],
        parent_id: [0; 8],
        ts: 0,
        flags: 0,
        _padding: [0; 7],
    };

    /// Returns true if the kernel side filled in a trace id
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.trace_id.iter().any(|b| *b != 0)
    }
}

// ============================================================================
// Layout Assertions
// ============================================================================

const _: () = assert!(core::mem::size_of::<ConnectionInfo>() == 36);
const _: () = assert!(core::mem::size_of::<PidInfo>() == 12);
const _: () = assert!(core::mem::size_of::<PidConnectionInfo>() == 40);
const _: () = assert!(core::mem::size_of::<TraceParent>() == 48);
const _: () = assert!(core::mem::size_of::<PidKey>() == 8);
const _: () = assert!(core::mem::size_of::<HttpInfo>() == 304);
const _: () = assert!(core::mem::size_of::<Http2GrpcRequest>() == 448);
const _: () = assert!(core::mem::size_of::<TcpRequest>() == 512);
const _: () = assert!(core::mem::size_of::<SslConnectionEvent>() == 56);
const _: () = assert!(core::mem::size_of::<SslSmallBuffer>() == 72);
const _: () = assert!(core::mem::size_of::<SslLargeBuffer>() == 304);

#[cfg(feature = "user")]
use aya::Pod;

// Pod lets aya copy these records in and out of kernel maps as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for PidKey {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for ConnectionInfo {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for PidConnectionInfo {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for PidInfo {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TraceParent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for HttpInfo {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for Http2GrpcRequest {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TcpRequest {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for SslConnectionEvent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl<const N: usize> Pod for SslBufferEvent<N> {}
