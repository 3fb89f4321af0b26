//! OpenSSL boundary records
//!
//! Plaintext captured at `SSL_read`/`SSL_write` knows the `SSL*` handle and
//! the calling thread but not the socket. The socket is learned separately
//! from an [`SslConnectionEvent`], so these records are only half of the
//! picture until the correlator joins them.

use std::fmt;

use autospan_common::{
    SslBufferEvent, SslConnectionEvent, SSL_OP_HANDSHAKE, SSL_OP_READ, SSL_OP_SHUTDOWN,
    SSL_OP_WRITE,
};

use super::http::{parse_request, parse_status};
use super::{Fragment, RequestHalf, ResponseHalf};
use crate::domain::{Connection, DecodeError, ProcessIdentity, Protocol, SpanKind, Tid};

/// Value of an `SSL*` pointer in the traced process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SslHandle(pub u64);

impl fmt::Display for SslHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ssl@{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslOp {
    Handshake,
    Read,
    Write,
    Shutdown,
}

impl SslOp {
    fn from_raw(op: u8) -> Option<Self> {
        match op {
            SSL_OP_HANDSHAKE => Some(SslOp::Handshake),
            SSL_OP_READ => Some(SslOp::Read),
            SSL_OP_WRITE => Some(SslOp::Write),
            SSL_OP_SHUTDOWN => Some(SslOp::Shutdown),
            _ => None,
        }
    }
}

/// Decrypted bytes seen on one side of an OpenSSL handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPlaintext {
    pub handle: SslHandle,
    pub op: SslOp,
    pub process: ProcessIdentity,
    pub thread: Tid,
    pub timestamp_ns: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TlsRecord {
    /// Handle → socket binding
    Connection {
        handle: SslHandle,
        connection: Connection,
        host_pid: u32,
    },

    Plaintext(TlsPlaintext),
}

pub(crate) fn connection(r: &SslConnectionEvent) -> TlsRecord {
    TlsRecord::Connection {
        handle: SslHandle(r.ssl),
        connection: Connection::from(&r.p_conn.conn),
        host_pid: r.p_conn.host_pid,
    }
}

pub(crate) fn plaintext<const N: usize>(r: &SslBufferEvent<N>) -> Result<TlsRecord, DecodeError> {
    let op = SslOp::from_raw(r.op).ok_or(DecodeError::MalformedRecord {
        record: "ssl buffer op",
        declared: i64::from(r.op),
        capacity: usize::from(SSL_OP_SHUTDOWN),
    })?;

    #[allow(clippy::cast_possible_truncation)]
    let thread = Tid(r.pid_tgid as u32);

    Ok(TlsRecord::Plaintext(TlsPlaintext {
        handle: SslHandle(r.ssl),
        op,
        process: ProcessIdentity::from(r.pid),
        thread,
        timestamp_ns: r.timestamp_ns,
        data: r.buf[..(r.len as usize).min(N)].to_vec(),
    }))
}

/// Classify decrypted bytes once their connection is known
///
/// A request read by the process means it is serving; a request it writes
/// means it is a client. Responses are the mirror image. Returns `None` for
/// plaintext that is not HTTP/1.x (handshakes, continuation bodies).
#[must_use]
pub fn plaintext_fragment(plain: &TlsPlaintext, connection: Connection) -> Option<Fragment> {
    let size = plain.data.len() as u64;

    let (kind, request, response) = if let Some(h) = parse_request(&plain.data) {
        let kind = if plain.op == SslOp::Write {
            SpanKind::Client
        } else {
            SpanKind::Server
        };
        let request = RequestHalf {
            start_ns: plain.timestamp_ns,
            method: h.method,
            path: h.path,
            size,
            header_trace: h.traceparent,
        };
        (kind, Some(request), None)
    } else if let Some(status) = parse_status(&plain.data) {
        let kind = if plain.op == SslOp::Read {
            SpanKind::Client
        } else {
            SpanKind::Server
        };
        let response = ResponseHalf {
            end_ns: plain.timestamp_ns,
            status,
            size,
        };
        (kind, None, Some(response))
    } else {
        return None;
    };

    Some(Fragment {
        protocol: Protocol::Http,
        kind,
        connection,
        process: plain.process,
        stream_id: None,
        request,
        response,
        encrypted: true,
        kernel_trace: None,
        thread: Some(plain.thread),
    })
}
