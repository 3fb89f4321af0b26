//! HTTP/1.x head parsing
//!
//! Operates on the first bytes of a request or response as captured by the
//! kernel side. Heads are frequently cut off mid-line, so every parser here
//! accepts a truncated final line.

use autospan_common::HttpInfo;

use super::{head, kernel_trace, span_kind, Fragment, RequestHalf, ResponseHalf};
use crate::domain::{Connection, ProcessIdentity, Protocol, SpanId, TraceContext, TraceId};

const METHODS: &[&str] =
    &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS", "CONNECT", "TRACE"];

/// Parsed request line plus the headers we care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,

    /// Target without query string or fragment
    pub path: String,
    pub traceparent: Option<TraceContext>,
}

/// Parse an HTTP/1.x request head
///
/// Returns `None` unless the buffer starts with a known method followed by a
/// space and a target.
#[must_use]
pub fn parse_request(buf: &[u8]) -> Option<RequestHead> {
    let mut lines = split_lines(buf);
    let line = lines.next()?;

    let sp = line.iter().position(|&b| b == b' ')?;
    let method = std::str::from_utf8(&line[..sp]).ok()?;
    if !METHODS.contains(&method) {
        return None;
    }

    let rest = &line[sp + 1..];
    let target_end = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
    let target = &rest[..target_end];
    if target.is_empty() {
        return None;
    }
    let path_end = target
        .iter()
        .position(|&b| b == b'?' || b == b'#')
        .unwrap_or(target.len());
    let path = String::from_utf8_lossy(&target[..path_end]).into_owned();

    let traceparent = lines.find_map(|line| {
        let (name, value) = split_header(line)?;
        if name.eq_ignore_ascii_case(b"traceparent") {
            parse_traceparent(value)
        } else {
            None
        }
    });

    Some(RequestHead {
        method: method.to_string(),
        path,
        traceparent,
    })
}

/// Parse the status code from an HTTP/1.x status line
#[must_use]
pub fn parse_status(buf: &[u8]) -> Option<u16> {
    let line = split_lines(buf).next()?;
    if !line.starts_with(b"HTTP/1.") {
        return None;
    }
    let sp = line.iter().position(|&b| b == b' ')?;
    let code = line.get(sp + 1..sp + 4)?;
    if !code.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(code).ok()?.parse().ok()
}

/// Parse a W3C `traceparent` value: `00-<trace id>-<parent id>-<flags>`
///
/// The remote span id becomes the parent of the local span; the local span id
/// is left zero for the correlator to assign.
#[must_use]
pub fn parse_traceparent(value: &[u8]) -> Option<TraceContext> {
    let value = trim(value);
    let mut parts = value.split(|&b| b == b'-');
    let version = parts.next()?;
    let trace_hex = parts.next()?;
    let parent_hex = parts.next()?;
    let flags_hex = parts.next()?;

    if version.len() != 2 || version == b"ff" {
        return None;
    }

    let mut trace_id = [0u8; 16];
    let mut parent_id = [0u8; 8];
    let mut flags = [0u8; 1];
    decode_hex(trace_hex, &mut trace_id)?;
    decode_hex(parent_hex, &mut parent_id)?;
    decode_hex(flags_hex, &mut flags)?;

    let ctx = TraceContext {
        trace_id: TraceId(trace_id),
        span_id: SpanId::default(),
        parent_id: SpanId(parent_id),
        start_ns: 0,
        flags: flags[0],
    };
    (ctx.trace_id.is_valid() && ctx.parent_id.is_valid()).then_some(ctx)
}

/// Build a fragment from a plain-socket HTTP/1.x record
pub(crate) fn fragment(r: &HttpInfo) -> Fragment {
    let buf = head(&r.buf, r.len as usize);

    let request = parse_request(buf).map(|h| RequestHalf {
        start_ns: r.start_monotime_ns,
        method: h.method,
        path: h.path,
        size: u64::from(r.len),
        header_trace: h.traceparent,
    });

    // The kernel fills `status` once it has seen the response; a record that
    // only captured a response carries the status line in `buf` instead
    let status = if r.status != 0 {
        Some(r.status)
    } else {
        parse_status(buf)
    };
    let response = status.filter(|_| r.end_monotime_ns != 0).map(|status| ResponseHalf {
        end_ns: r.end_monotime_ns,
        status,
        size: u64::from(r.resp_len),
    });

    Fragment {
        protocol: Protocol::Http,
        kind: span_kind(r.kind),
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

/// Split on `\n`, dropping a trailing `\r`; the last line may be partial
fn split_lines(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    buf.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn split_header(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|&b| b == b':')?;
    Some((trim(&line[..colon]), &line[colon + 1..]))
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end.max(start)]
}

fn decode_hex(hex: &[u8], out: &mut [u8]) -> Option<()> {
    if hex.len() != out.len() * 2 {
        return None;
    }
    for (slot, pair) in out.iter_mut().zip(hex.chunks_exact(2)) {
        let hi = hex_value(pair[0])?;
        let lo = hex_value(pair[1])?;
        *slot = (hi << 4) | lo;
    }
    Some(())
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
