//! Raw TCP fallback records
//!
//! The kernel emits these for traffic it could not classify. Some of it is
//! HTTP/1.x the kernel missed (e.g. a request split across writes), so the
//! request buffer is re-checked here and promoted when it parses.

use autospan_common::{TcpRequest, TCP_SEND};

use super::http::{parse_request, parse_status};
use super::{head, kernel_trace, Fragment, RequestHalf, ResponseHalf};
use crate::domain::{Connection, ProcessIdentity, Protocol, SpanKind};

pub(crate) fn fragment(r: &TcpRequest) -> Fragment {
    let req_buf = head(&r.buf, r.len as usize);
    let resp_buf = head(&r.rbuf, r.resp_len as usize);

    let parsed = parse_request(req_buf);
    let protocol = if parsed.is_some() {
        Protocol::Http
    } else {
        Protocol::Tcp
    };

    // Whoever sent the first payload initiated the exchange
    let kind = if r.direction == TCP_SEND {
        SpanKind::Client
    } else {
        SpanKind::Server
    };

    let request = (!req_buf.is_empty()).then(|| {
        let (method, path, header_trace) = match parsed {
            Some(h) => (h.method, h.path, h.traceparent),
            None => (String::new(), String::new(), None),
        };
        RequestHalf {
            start_ns: r.start_monotime_ns,
            method,
            path,
            size: u64::from(r.len),
            header_trace,
        }
    });

    let response = (!resp_buf.is_empty() && r.end_monotime_ns != 0).then(|| ResponseHalf {
        end_ns: r.end_monotime_ns,
        status: if protocol == Protocol::Http {
            parse_status(resp_buf).unwrap_or(0)
        } else {
            0
        },
        size: u64::from(r.resp_len),
    });

    Fragment {
        protocol,
        kind,
        connection: Connection::from(&r.conn_info),
        process: ProcessIdentity::from(r.pid),
        stream_id: None,
        request,
        response,
        encrypted: r.ssl != 0,
        kernel_trace: kernel_trace(&r.tp),
        thread: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autospan_common::TCP_RECV;

    fn record(req: &[u8], resp: &[u8], direction: u8) -> TcpRequest {
        let mut r = TcpRequest::EMPTY;
        r.buf[..req.len()].copy_from_slice(req);
        r.rbuf[..resp.len()].copy_from_slice(resp);
        r.len = u32::try_from(req.len()).unwrap();
        r.resp_len = u32::try_from(resp.len()).unwrap();
        r.start_monotime_ns = 1;
        r.end_monotime_ns = 2;
        r.direction = direction;
        r
    }

    #[test]
    fn test_raw_tcp_stays_tcp() {
        let f = fragment(&record(b"\x00\x01redis-ish", b"+OK\r\n", TCP_RECV));
        assert_eq!(f.protocol, Protocol::Tcp);
        assert_eq!(f.kind, SpanKind::Server);
        assert!(f.is_complete());
        assert_eq!(f.response.unwrap().status, 0);
        assert_eq!(f.request.unwrap().size, 11);
    }

    #[test]
    fn test_http_promoted() {
        let f = fragment(&record(
            b"GET /items HTTP/1.1\r\nHost: a\r\n",
            b"HTTP/1.1 503 Service Unavailable\r\n",
            TCP_SEND,
        ));
        assert_eq!(f.protocol, Protocol::Http);
        assert_eq!(f.kind, SpanKind::Client);
        assert_eq!(f.request.as_ref().unwrap().path, "/items");
        assert_eq!(f.response.unwrap().status, 503);
    }

    #[test]
    fn test_no_response_yet() {
        let mut r = record(b"PING", b"", TCP_SEND);
        r.end_monotime_ns = 0;
        let f = fragment(&r);
        assert!(f.request.is_some());
        assert!(f.response.is_none());
    }
}
