//! Shared bounded span queue
//!
//! Every tracer pushes into the same queue; one consumer drains it. A full
//! queue makes a producer wait at most `max_wait`, after which the span is
//! dropped and counted. Tracers must keep draining the kernel ring buffer,
//! and a slow consumer would otherwise stall all of them at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};

use crate::domain::RequestSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Sent,

    /// Queue stayed full for the whole wait
    Dropped,

    /// Consumer is gone
    Closed,
}

/// Producer handle, cheap to clone per tracer
#[derive(Clone)]
pub struct SpanSender {
    tx: mpsc::Sender<RequestSpan>,
    max_wait: Duration,
    dropped: Arc<AtomicU64>,
}

pub struct SpanReceiver {
    rx: mpsc::Receiver<RequestSpan>,
    dropped: Arc<AtomicU64>,
}

/// Create the queue shared by all tracers
#[must_use]
pub fn span_queue(capacity: usize, max_wait: Duration) -> (SpanSender, SpanReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        SpanSender {
            tx,
            max_wait,
            dropped: Arc::clone(&dropped),
        },
        SpanReceiver { rx, dropped },
    )
}

impl SpanSender {
    pub async fn push(&self, span: RequestSpan) -> PushOutcome {
        let span = match self.tx.try_send(span) {
            Ok(()) => return PushOutcome::Sent,
            Err(TrySendError::Closed(_)) => return PushOutcome::Closed,
            Err(TrySendError::Full(span)) => span,
        };

        match self.tx.send_timeout(span, self.max_wait).await {
            Ok(()) => PushOutcome::Sent,
            Err(SendTimeoutError::Timeout(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Dropped
            }
            Err(SendTimeoutError::Closed(_)) => PushOutcome::Closed,
        }
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl SpanReceiver {
    /// Next span; `None` once every sender is gone and the queue is empty
    pub async fn recv(&mut self) -> Option<RequestSpan> {
        self.rx.recv().await
    }

    /// Spans dropped by all producers so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
