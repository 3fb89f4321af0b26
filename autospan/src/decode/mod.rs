//! Record decoding: kernel bytes → typed records → span fragments
//!
//! Decoding happens in two steps:
//!
//! 1. [`decode`] checks the tag byte and the record size, copies the bytes
//!    into the matching `#[repr(C)]` layout and validates every declared
//!    length against the physical buffer capacity.
//! 2. [`RawEventRecord::into_event`] turns the validated record into a span
//!    [`Fragment`] (HTTP, HTTP/2, TCP) or a [`TlsRecord`] that the correlator
//!    joins with its connection later.
//!
//! Nothing here keeps state; the correlator owns everything that spans more
//! than one record.

pub mod http;
pub mod http2;
pub mod tcp;
pub mod tls;

use std::mem::size_of;

use aya::Pod;
use autospan_common::{
    Http2GrpcRequest, HttpInfo, SslConnectionEvent, SslLargeBuffer, SslSmallBuffer, TcpRequest,
    EVENT_HTTP, EVENT_HTTP2, EVENT_SSL_CONNECTION, EVENT_SSL_LARGE_BUFFER,
    EVENT_SSL_SMALL_BUFFER, EVENT_TCP, HTTP_KIND_CLIENT,
};

use crate::domain::{
    Connection, DecodeError, ProcessIdentity, Protocol, SpanKind, Tid, TraceContext,
};

pub use tls::{SslHandle, SslOp, TlsPlaintext, TlsRecord};

/// One validated kernel record
///
/// Large layouts are boxed so the enum stays small when records are queued.
#[derive(Clone)]
pub enum RawEventRecord {
    Http(Box<HttpInfo>),
    Http2(Box<Http2GrpcRequest>),
    Tcp(Box<TcpRequest>),
    SslConnection(SslConnectionEvent),
    SslSmallBuffer(SslSmallBuffer),
    SslLargeBuffer(Box<SslLargeBuffer>),
}

/// What a record contributes to correlation
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Fragment(Fragment),
    Tls(TlsRecord),
}

/// Request side of an exchange
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestHalf {
    pub start_ns: u64,
    pub method: String,
    pub path: String,
    pub size: u64,

    /// Context parsed from a `traceparent` header in the request head
    pub header_trace: Option<TraceContext>,
}

/// Response side of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHalf {
    pub end_ns: u64,
    pub status: u16,
    pub size: u64,
}

/// Partially (or fully) populated span, keyed for correlation
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub protocol: Protocol,
    pub kind: SpanKind,
    pub connection: Connection,
    pub process: ProcessIdentity,

    /// HTTP/2 stream id; `None` for protocols without multiplexing
    pub stream_id: Option<u32>,
    pub request: Option<RequestHalf>,
    pub response: Option<ResponseHalf>,
    pub encrypted: bool,

    /// Context provided by the kernel side, if it set one
    pub kernel_trace: Option<TraceContext>,

    /// Thread that owns the TLS session, for decrypted traffic
    pub thread: Option<Tid>,
}

impl Fragment {
    /// True when neither half carries anything worth correlating
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.request.is_none() && self.response.is_none()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.request.is_some() && self.response.is_some()
    }
}

/// Decode one record from the ring buffer
///
/// # Errors
///
/// `Empty` for a zero-length slice, `UnknownRecordType` for an unknown tag,
/// `Truncated` when the slice is shorter than the layout, and
/// `MalformedRecord` when a declared length exceeds its buffer.
pub fn decode(bytes: &[u8]) -> Result<RawEventRecord, DecodeError> {
    let Some(&tag) = bytes.first() else {
        return Err(DecodeError::Empty);
    };

    let record = match tag {
        EVENT_HTTP => RawEventRecord::Http(Box::new(read_record(bytes, "http")?)),
        EVENT_HTTP2 => RawEventRecord::Http2(Box::new(read_record(bytes, "http2")?)),
        EVENT_TCP => RawEventRecord::Tcp(Box::new(read_record(bytes, "tcp")?)),
        EVENT_SSL_CONNECTION => {
            RawEventRecord::SslConnection(read_record(bytes, "ssl connection")?)
        }
        EVENT_SSL_SMALL_BUFFER => {
            RawEventRecord::SslSmallBuffer(read_record(bytes, "ssl small buffer")?)
        }
        EVENT_SSL_LARGE_BUFFER => {
            RawEventRecord::SslLargeBuffer(Box::new(read_record(bytes, "ssl large buffer")?))
        }
        other => return Err(DecodeError::UnknownRecordType(other)),
    };

    record.validate()?;
    Ok(record)
}

impl RawEventRecord {
    /// Check declared lengths against physical capacities
    fn validate(&self) -> Result<(), DecodeError> {
        match self {
            RawEventRecord::Http(r) => check_len("http", i64::from(r.len), r.buf.len()),
            RawEventRecord::Http2(r) => check_len("http2", i64::from(r.len), r.data.len()),
            RawEventRecord::Tcp(r) => {
                check_len("tcp", i64::from(r.len), r.buf.len())?;
                check_len("tcp response", i64::from(r.resp_len), r.rbuf.len())
            }
            RawEventRecord::SslConnection(_) => Ok(()),
            RawEventRecord::SslSmallBuffer(r) => {
                check_len("ssl small buffer", i64::from(r.len), r.buf.len())
            }
            RawEventRecord::SslLargeBuffer(r) => {
                check_len("ssl large buffer", i64::from(r.len), r.buf.len())
            }
        }
    }

    /// Short name used in logs and counters
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            RawEventRecord::Http(_) => "http",
            RawEventRecord::Http2(_) => "http2",
            RawEventRecord::Tcp(_) => "tcp",
            RawEventRecord::SslConnection(_) => "ssl_connection",
            RawEventRecord::SslSmallBuffer(_) | RawEventRecord::SslLargeBuffer(_) => "ssl_buffer",
        }
    }

    /// Convert into the form the correlator consumes
    ///
    /// # Errors
    ///
    /// `MalformedRecord` for a TLS buffer record with an unknown operation.
    pub fn into_event(self) -> Result<DecodedEvent, DecodeError> {
        Ok(match self {
            RawEventRecord::Http(r) => DecodedEvent::Fragment(http::fragment(&r)),
            RawEventRecord::Http2(r) => DecodedEvent::Fragment(http2::fragment(&r)),
            RawEventRecord::Tcp(r) => DecodedEvent::Fragment(tcp::fragment(&r)),
            RawEventRecord::SslConnection(r) => DecodedEvent::Tls(tls::connection(&r)),
            RawEventRecord::SslSmallBuffer(r) => DecodedEvent::Tls(tls::plaintext(&r)?),
            RawEventRecord::SslLargeBuffer(r) => DecodedEvent::Tls(tls::plaintext(&*r)?),
        })
    }

    /// Raw bytes of the record
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RawEventRecord::Http(r) => record_bytes(&**r),
            RawEventRecord::Http2(r) => record_bytes(&**r),
            RawEventRecord::Tcp(r) => record_bytes(&**r),
            RawEventRecord::SslConnection(r) => record_bytes(r),
            RawEventRecord::SslSmallBuffer(r) => record_bytes(r),
            RawEventRecord::SslLargeBuffer(r) => record_bytes(&**r),
        }
    }
}

impl std::fmt::Debug for RawEventRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawEventRecord::{}({} bytes)", self.kind_name(), self.as_bytes().len())
    }
}

fn check_len(record: &'static str, declared: i64, capacity: usize) -> Result<(), DecodeError> {
    let fits = usize::try_from(declared).is_ok_and(|len| len <= capacity);
    if fits {
        Ok(())
    } else {
        Err(DecodeError::MalformedRecord {
            record,
            declared,
            capacity,
        })
    }
}

/// Copy a fixed-layout record out of an arbitrarily aligned byte slice
fn read_record<T: Pod>(bytes: &[u8], record: &'static str) -> Result<T, DecodeError> {
    let need = size_of::<T>();
    if bytes.len() < need {
        return Err(DecodeError::Truncated {
            record,
            got: bytes.len(),
            need,
        });
    }

    // SAFETY: the slice holds at least size_of::<T>() bytes and T is Pod, so
    // every bit pattern is a valid value
    #[allow(unsafe_code)]
    let value = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) };
    Ok(value)
}

/// View a record as the bytes the kernel would have written
#[must_use]
pub fn record_bytes<T: Pod>(record: &T) -> &[u8] {
    // SAFETY: T is Pod (repr(C), explicit padding, no pointers), so all
    // size_of::<T>() bytes behind the reference are initialised
    #[allow(unsafe_code)]
    unsafe {
        std::slice::from_raw_parts(std::ptr::from_ref(record).cast::<u8>(), size_of::<T>())
    }
}

/// Map the kernel `kind` byte to a span kind; unknown values default to server
pub(crate) fn span_kind(kind: u8) -> SpanKind {
    if kind == HTTP_KIND_CLIENT {
        SpanKind::Client
    } else {
        SpanKind::Server
    }
}

/// `Some` when the kernel side filled in a trace context
pub(crate) fn kernel_trace(tp: &autospan_common::TraceParent) -> Option<TraceContext> {
    tp.is_set().then(|| TraceContext::from(tp))
}

/// Clamp a declared length (already validated) to its buffer
pub(crate) fn head(buf: &[u8], len: usize) -> &[u8] {
    &buf[..len.min(buf.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use autospan_common::{
        ConnectionInfo, PidInfo, HTTP2_BUF_SIZE, HTTP2_RET_BUF_SIZE, HTTP_BUF_SIZE,
        TCP_REQ_BUF_SIZE, TCP_RESP_BUF_SIZE,
    };
    use proptest::prelude::*;

    fn http_record(head: &[u8], len: u32) -> HttpInfo {
        let mut r = HttpInfo::EMPTY;
        r.buf[..head.len()].copy_from_slice(head);
        r.len = len;
        r.start_monotime_ns = 1_000;
        r.end_monotime_ns = 5_000;
        r.status = 200;
        r.resp_len = 42;
        r.pid = PidInfo {
            host_pid: 100,
            user_pid: 7,
            ns: 4_026_531_836,
        };
        r.conn_info = ConnectionInfo {
            s_port: 40000,
            d_port: 8080,
            ..ConnectionInfo::default()
        };
        r
    }

    #[test]
    fn test_empty_and_unknown() {
        assert_eq!(decode(&[]).unwrap_err(), DecodeError::Empty);
        let err = decode(&[42, 0, 0]).unwrap_err();
        assert_eq!(err, DecodeError::UnknownRecordType(42));
    }

    #[test]
    fn test_truncated_record() {
        let r = http_record(b"GET / HTTP/1.1\r\n", 16);
        let bytes = record_bytes(&r);
        let err = decode(&bytes[..100]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                record: "http",
                got: 100,
                need: size_of::<HttpInfo>(),
            }
        );
    }

    #[test]
    fn test_http_len_over_capacity_is_malformed() {
        let r = http_record(b"GET / HTTP/1.1\r\n", 161);
        let err = decode(record_bytes(&r)).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MalformedRecord {
                record: "http",
                declared: 161,
                capacity: HTTP_BUF_SIZE,
            }
        );
    }

    #[test]
    fn test_http2_negative_len_is_malformed() {
        let mut r = Http2GrpcRequest::EMPTY;
        r.len = -1;
        assert!(matches!(
            decode(record_bytes(&r)),
            Err(DecodeError::MalformedRecord { record: "http2", declared: -1, .. })
        ));
    }

    #[test]
    fn test_tcp_response_len_checked() {
        let mut r = TcpRequest::EMPTY;
        r.len = 10;
        r.resp_len = 129;
        assert!(matches!(
            decode(record_bytes(&r)),
            Err(DecodeError::MalformedRecord { record: "tcp response", .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        // Ring buffer entries may be padded past the layout size
        let r = http_record(b"GET /a HTTP/1.1\r\n", 17);
        let mut bytes = record_bytes(&r).to_vec();
        bytes.extend_from_slice(&[0xff; 8]);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.as_bytes(), record_bytes(&r));
    }

    #[test]
    fn test_http_into_fragment() {
        let r = http_record(b"POST /orders?id=3 HTTP/1.1\r\nHost: x\r\n", 37);
        let DecodedEvent::Fragment(f) = decode(record_bytes(&r)).unwrap().into_event().unwrap()
        else {
            panic!("expected fragment");
        };
        assert_eq!(f.protocol, Protocol::Http);
        assert!(f.is_complete());
        let req = f.request.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/orders");
        assert_eq!(f.response.unwrap().status, 200);
        assert_eq!(f.process.host_pid, 100);
        assert_eq!(f.stream_id, None);
    }

    proptest! {
        #[test]
        fn prop_http_declared_portion_roundtrips(
            payload in proptest::collection::vec(any::<u8>(), 0..=HTTP_BUF_SIZE),
            garbage in any::<u8>(),
        ) {
            let mut r = http_record(&payload, u32::try_from(payload.len()).unwrap());
            // Bytes past the declared length are undefined
            for b in &mut r.buf[payload.len()..] {
                *b = garbage;
            }
            let decoded = decode(record_bytes(&r)).unwrap();
            let RawEventRecord::Http(back) = &decoded else {
                panic!("expected http record");
            };
            prop_assert_eq!(&back.buf[..payload.len()], &payload[..]);
            prop_assert_eq!(back.len, r.len);
            prop_assert_eq!(decoded.as_bytes(), record_bytes(&r));
        }

        #[test]
        fn prop_tcp_declared_portion_roundtrips(
            request in proptest::collection::vec(any::<u8>(), 0..=TCP_REQ_BUF_SIZE),
            response in proptest::collection::vec(any::<u8>(), 0..=TCP_RESP_BUF_SIZE),
            garbage in any::<u8>(),
        ) {
            let mut r = TcpRequest::EMPTY;
            r.buf.fill(garbage);
            r.rbuf.fill(garbage);
            r.buf[..request.len()].copy_from_slice(&request);
            r.rbuf[..response.len()].copy_from_slice(&response);
            r.len = u32::try_from(request.len()).unwrap();
            r.resp_len = u32::try_from(response.len()).unwrap();
            r.start_monotime_ns = 10;
            r.end_monotime_ns = 20;

            let decoded = decode(record_bytes(&r)).unwrap();
            let RawEventRecord::Tcp(back) = &decoded else {
                panic!("expected tcp record");
            };
            prop_assert_eq!(&back.buf[..request.len()], &request[..]);
            prop_assert_eq!(&back.rbuf[..response.len()], &response[..]);
            prop_assert_eq!((back.len, back.resp_len), (r.len, r.resp_len));
            prop_assert_eq!(decoded.as_bytes(), record_bytes(&r));

            let DecodedEvent::Fragment(f) = decoded.into_event().unwrap() else {
                panic!("expected fragment");
            };
            prop_assert_eq!(
                f.request.map(|h| h.size),
                (!request.is_empty()).then_some(u64::from(r.len))
            );
            prop_assert_eq!(
                f.response.map(|h| h.size),
                (!response.is_empty()).then_some(u64::from(r.resp_len))
            );
        }

        #[test]
        fn prop_http2_declared_portion_roundtrips(
            data in proptest::collection::vec(any::<u8>(), 0..=HTTP2_BUF_SIZE),
            ret in proptest::collection::vec(any::<u8>(), HTTP2_RET_BUF_SIZE),
            garbage in any::<u8>(),
        ) {
            let mut r = Http2GrpcRequest::EMPTY;
            r.data.fill(garbage);
            r.data[..data.len()].copy_from_slice(&data);
            r.ret_data.copy_from_slice(&ret);
            r.len = i32::try_from(data.len()).unwrap();

            let decoded = decode(record_bytes(&r)).unwrap();
            let RawEventRecord::Http2(back) = &decoded else {
                panic!("expected http2 record");
            };
            prop_assert_eq!(&back.data[..data.len()], &data[..]);
            prop_assert_eq!(&back.ret_data[..], &ret[..]);
            prop_assert_eq!(back.len, r.len);
            prop_assert_eq!(decoded.as_bytes(), record_bytes(&r));
        }

        #[test]
        fn prop_http_oversized_len_is_malformed(len in 161u32..) {
            let r = http_record(b"", len);
            let is_malformed = matches!(
                decode(record_bytes(&r)),
                Err(DecodeError::MalformedRecord { .. })
            );
            prop_assert!(is_malformed);
        }

        #[test]
        fn prop_http2_len_bounds(len in any::<i32>()) {
            let mut r = Http2GrpcRequest::EMPTY;
            r.len = len;
            let result = decode(record_bytes(&r));
            if (0..=256).contains(&len) {
                prop_assert!(result.is_ok());
                prop_assert!(result.unwrap().into_event().is_ok());
            } else {
                let is_malformed = matches!(result, Err(DecodeError::MalformedRecord { .. }));
                prop_assert!(is_malformed);
            }
        }

        #[test]
        fn prop_tcp_arbitrary_bytes_never_panic(
            buf in proptest::collection::vec(any::<u8>(), 256),
            rbuf in proptest::collection::vec(any::<u8>(), 128),
            len in 0u32..=256,
            resp_len in 0u32..=128,
        ) {
            let mut r = TcpRequest::EMPTY;
            r.buf.copy_from_slice(&buf);
            r.rbuf.copy_from_slice(&rbuf);
            r.len = len;
            r.resp_len = resp_len;
            let decoded = decode(record_bytes(&r)).unwrap();
            prop_assert!(decoded.into_event().is_ok());
        }

        #[test]
        fn prop_http2_arbitrary_frames_never_panic(
            data in proptest::collection::vec(any::<u8>(), 256),
            ret in proptest::collection::vec(any::<u8>(), 64),
            len in 0i32..=256,
        ) {
            let mut r = Http2GrpcRequest::EMPTY;
            r.data.copy_from_slice(&data);
            r.ret_data.copy_from_slice(&ret);
            r.len = len;
            let decoded = decode(record_bytes(&r)).unwrap();
            prop_assert!(decoded.into_event().is_ok());
        }
    }
}
