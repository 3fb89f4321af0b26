//! Trace context resolution
//!
//! Called exactly once per span, at emission. Precedence:
//!
//! 1. context written by the kernel side (it saw or injected a header)
//! 2. a `traceparent` header found in the captured request head
//! 3. a fresh root context, marked sampled

use rand::Rng;

use autospan_common::TRACE_FLAG_SAMPLED;

use crate::domain::{SpanId, TraceContext, TraceId};

#[must_use]
pub fn resolve(
    kernel: Option<TraceContext>,
    header: Option<TraceContext>,
    start_ns: u64,
) -> TraceContext {
    let mut rng = rand::thread_rng();

    let mut ctx = match (kernel.filter(TraceContext::is_valid), header) {
        (Some(kernel), _) => kernel,
        (None, Some(header)) => TraceContext {
            span_id: SpanId::default(),
            ..header
        },
        (None, None) => TraceContext {
            trace_id: TraceId(non_zero(&mut rng)),
            span_id: SpanId::default(),
            parent_id: SpanId::default(),
            start_ns,
            flags: TRACE_FLAG_SAMPLED,
        },
    };

    if !ctx.span_id.is_valid() {
        ctx.span_id = SpanId(non_zero(&mut rng));
    }
    if ctx.start_ns == 0 {
        ctx.start_ns = start_ns;
    }
    ctx
}

fn non_zero<const N: usize>(rng: &mut impl Rng) -> [u8; N] {
    let mut bytes = [0u8; N];
    while bytes.iter().all(|b| *b == 0) {
        rng.fill(&mut bytes[..]);
    }
    bytes
}
