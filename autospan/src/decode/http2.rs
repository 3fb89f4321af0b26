//! HTTP/2 frame walking and a minimal HPACK reader
//!
//! The kernel copies the first bytes written on a stream, which normally
//! start with a HEADERS frame. We only need a handful of pseudo headers, so
//! the HPACK side understands the static table and non-Huffman literals and
//! skips anything else (dynamic table references, Huffman strings) without
//! failing.

use autospan_common::Http2GrpcRequest;

use super::{head, kernel_trace, span_kind, Fragment, RequestHalf, ResponseHalf};
use crate::domain::{Connection, ProcessIdentity, Protocol};

const FRAME_HEADER_LEN: usize = 9;
const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// One frame header plus the part of its payload that was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,

    /// Declared payload length (may exceed `payload.len()`)
    pub length: usize,
    pub payload: &'a [u8],
}

/// Iterate frames in a captured buffer
///
/// Stops at the end of the buffer or at an all-zero header, which marks the
/// unused tail of the kernel buffer.
pub fn frames(buf: &[u8]) -> impl Iterator<Item = Frame<'_>> {
    let mut rest = buf.strip_prefix(CLIENT_PREFACE).unwrap_or(buf);
    std::iter::from_fn(move || {
        if rest.len() < FRAME_HEADER_LEN {
            return None;
        }
        let (hdr, body) = rest.split_at(FRAME_HEADER_LEN);
        if hdr.iter().all(|&b| b == 0) {
            return None;
        }

        let length = (usize::from(hdr[0]) << 16) | (usize::from(hdr[1]) << 8) | usize::from(hdr[2]);
        let stream_id = u32::from_be_bytes([hdr[5], hdr[6], hdr[7], hdr[8]]) & 0x7fff_ffff;
        let take = length.min(body.len());
        let frame = Frame {
            kind: hdr[3],
            flags: hdr[4],
            stream_id,
            length,
            payload: &body[..take],
        };
        rest = &body[take..];
        Some(frame)
    })
}

/// Headers recovered from one side of a stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeaders {
    pub stream_id: u32,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status: Option<u16>,
    pub grpc_status: Option<u16>,
    pub content_type: Option<String>,

    /// Sum of declared DATA frame lengths
    pub data_len: u64,
}

impl StreamHeaders {
    #[must_use]
    pub fn is_grpc(&self) -> bool {
        self.grpc_status.is_some()
            || self
                .content_type
                .as_deref()
                .is_some_and(|ct| ct.starts_with("application/grpc"))
    }
}

/// Read the headers of the first stream found in `buf`
///
/// Later HEADERS frames on the same stream (trailers) are merged in, which is
/// where gRPC puts `grpc-status`.
#[must_use]
pub fn parse_stream(buf: &[u8]) -> Option<StreamHeaders> {
    let mut out: Option<StreamHeaders> = None;

    for frame in frames(buf) {
        match frame.kind {
            FRAME_HEADERS | FRAME_CONTINUATION => {
                let stream = out.get_or_insert_with(|| StreamHeaders {
                    stream_id: frame.stream_id,
                    ..StreamHeaders::default()
                });
                if frame.stream_id != stream.stream_id {
                    continue;
                }
                let block = if frame.kind == FRAME_HEADERS {
                    let complete = frame.payload.len() == frame.length;
                    header_block(frame.flags, frame.payload, complete)
                } else {
                    frame.payload
                };
                read_header_block(block, stream);
            }
            FRAME_DATA => {
                if let Some(stream) = out.as_mut().filter(|s| s.stream_id == frame.stream_id) {
                    stream.data_len += frame.length as u64;
                }
            }
            _ => {}
        }
    }

    out
}

/// Strip padding length and priority fields from a HEADERS payload
///
/// Trailing padding is only visible when the whole frame was captured.
fn header_block(flags: u8, payload: &[u8], complete: bool) -> &[u8] {
    let mut block = payload;
    let mut pad = 0;
    if flags & FLAG_PADDED != 0 {
        let Some((&len, rest)) = block.split_first() else {
            return &[];
        };
        if complete {
            pad = usize::from(len);
        }
        block = rest;
    }
    if flags & FLAG_PRIORITY != 0 {
        block = block.get(5..).unwrap_or_default();
    }
    &block[..block.len().saturating_sub(pad)]
}

// ============================================================================
// HPACK subset (RFC 7541)
// ============================================================================

/// Static table entries we care about: (index, name, value)
const STATIC_TABLE: &[(usize, &str, &str)] = &[
    (1, ":authority", ""),
    (2, ":method", "GET"),
    (3, ":method", "POST"),
    (4, ":path", "/"),
    (5, ":path", "/index.html"),
    (6, ":scheme", "http"),
    (7, ":scheme", "https"),
    (8, ":status", "200"),
    (9, ":status", "204"),
    (10, ":status", "206"),
    (11, ":status", "304"),
    (12, ":status", "400"),
    (13, ":status", "404"),
    (14, ":status", "500"),
    (31, "content-type", ""),
];

fn static_entry(index: usize) -> Option<(&'static str, &'static str)> {
    STATIC_TABLE
        .iter()
        .find(|(i, _, _)| *i == index)
        .map(|(_, name, value)| (*name, *value))
}

/// Decode an HPACK prefixed integer, returning the value and bytes consumed
fn read_int(buf: &[u8], prefix_bits: u32) -> Option<(usize, usize)> {
    let mask = (1u16 << prefix_bits) - 1;
    let first = u16::from(*buf.first()?) & mask;
    if first < mask {
        return Some((usize::from(first), 1));
    }

    let mut value = usize::from(mask);
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate().skip(1) {
        value = value.checked_add(usize::from(b & 0x7f).checked_shl(shift)?)?;
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        if shift > 28 {
            return None;
        }
    }
    None
}

/// Decode a string literal; Huffman-coded strings yield `None` for the value
/// but still report the bytes consumed
fn read_string(buf: &[u8]) -> Option<(Option<&[u8]>, usize)> {
    let huffman = buf.first()? & 0x80 != 0;
    let (len, used) = read_int(buf, 7)?;
    let end = used.checked_add(len)?;
    if huffman {
        return Some((None, end));
    }
    // A string running past the capture is still usable up to the cut
    let bytes = buf.get(used..end.min(buf.len()))?;
    Some((Some(bytes), end))
}

fn read_header_block(mut block: &[u8], out: &mut StreamHeaders) {
    while let Some(&first) = block.first() {
        let consumed = if first & 0x80 != 0 {
            // Indexed header field
            let Some((index, used)) = read_int(block, 7) else { return };
            if let Some((name, value)) = static_entry(index) {
                apply(out, name, value.as_bytes());
            }
            used
        } else if first & 0xe0 == 0x20 {
            // Dynamic table size update
            let Some((_, used)) = read_int(block, 5) else { return };
            used
        } else {
            // Literal: 6-bit prefix with incremental indexing, 4-bit otherwise
            let prefix = if first & 0x40 != 0 { 6 } else { 4 };
            let Some((index, mut used)) = read_int(block, prefix) else { return };

            let name: Option<&[u8]> = if index == 0 {
                let Some((name, n)) = block.get(used..).and_then(read_string) else { return };
                used += n;
                name
            } else {
                static_entry(index).map(|(name, _)| name.as_bytes())
            };

            let Some((value, n)) = block.get(used..).and_then(read_string) else { return };
            used += n;

            if let (Some(name), Some(value)) = (name, value) {
                if let Ok(name) = std::str::from_utf8(name) {
                    apply(out, name, value);
                }
            }
            used
        };

        block = block.get(consumed..).unwrap_or_default();
    }
}

fn apply(out: &mut StreamHeaders, name: &str, value: &[u8]) {
    let text = || String::from_utf8_lossy(value).into_owned();
    let number = || {
        std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse().ok())
    };
    match name {
        ":method" => out.method = Some(text()),
        ":path" => out.path = Some(text()),
        ":status" => out.status = number(),
        "grpc-status" => out.grpc_status = number(),
        "content-type" => out.content_type = Some(text()),
        _ => {}
    }
}

/// Build a fragment from an HTTP/2 record
///
/// The stream id comes from the first HEADERS frame of the request buffer,
/// or of the return buffer when the request side carried none.
pub(crate) fn fragment(r: &Http2GrpcRequest) -> Fragment {
    let len = usize::try_from(r.len).unwrap_or(0);
    let req = parse_stream(head(&r.data, len));
    let resp = parse_stream(&r.ret_data);

    let stream_id = req.as_ref().or(resp.as_ref()).map(|s| s.stream_id);
    let grpc = req.as_ref().is_some_and(StreamHeaders::is_grpc)
        || resp.as_ref().is_some_and(StreamHeaders::is_grpc);

    let request = req
        .as_ref()
        .filter(|s| s.method.is_some() || s.path.is_some())
        .map(|s| RequestHalf {
            start_ns: r.start_monotime_ns,
            method: s.method.clone().unwrap_or_else(|| "POST".to_string()),
            path: s.path.clone().unwrap_or_default(),
            size: len as u64 + s.data_len,
            header_trace: None,
        });

    let response = resp
        .as_ref()
        .filter(|s| s.stream_id == stream_id.unwrap_or(s.stream_id))
        .and_then(|s| {
            // gRPC reports failures through grpc-status with HTTP 200
            let status = if grpc {
                s.grpc_status.or(s.status)
            } else {
                s.status
            };
            status.map(|status| ResponseHalf {
                end_ns: if r.end_monotime_ns != 0 {
                    r.end_monotime_ns
                } else {
                    r.start_monotime_ns
                },
                status,
                size: s.data_len,
            })
        });

    Fragment {
        protocol: if grpc {
            Protocol::Grpc
        } else {
            Protocol::Http2
        },
        kind: span_kind(r.kind),
        connection: Connection::from(&r.conn_info),
        process: ProcessIdentity::from(r.pid),
        stream_id,
        request,
        response,
        encrypted: r.ssl != 0,
        kernel_trace: kernel_trace(&r.tp),
        thread: None,
    }
}
