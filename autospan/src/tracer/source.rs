//! Where raw records come from
//!
//! The tracer only needs two things from the kernel side: "give me the next
//! batch of records" and "let go of everything". [`EbpfSource`] does this
//! with real kernel hooks; [`ReplaySource`] replays canned bytes in tests and in
//! offline runs.
//!
//! [`EbpfSource`]: super::ebpf::EbpfSource

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::TracerError;

#[async_trait]
pub trait EventSource: Send {
    /// Wait for at least one record and append every available one to `out`
    ///
    /// # Errors
    ///
    /// `SourceClosed` once the traced process is gone; any other error is
    /// fatal for this tracer.
    async fn read_records(&mut self, out: &mut Vec<Vec<u8>>) -> Result<(), TracerError>;

    /// Release every kernel-side resource; must be idempotent
    fn detach(&mut self);
}

/// In-memory source yielding pre-built batches
pub struct ReplaySource {
    batches: VecDeque<Vec<Vec<u8>>>,
    close_when_empty: bool,
    detached: Arc<AtomicBool>,
}

impl ReplaySource {
    /// Replays `batches`, then reports the source closed
    pub fn new(batches: impl IntoIterator<Item = Vec<Vec<u8>>>) -> Self {
        Self {
            batches: batches.into_iter().collect(),
            close_when_empty: true,
            detached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Like [`ReplaySource::new`] but waits forever once drained, like a live
    /// process that went quiet
    pub fn open_ended(batches: impl IntoIterator<Item = Vec<Vec<u8>>>) -> Self {
        Self {
            close_when_empty: false,
            ..Self::new(batches)
        }
    }

    /// Flag set when the source is detached
    #[must_use]
    pub fn detached_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.detached)
    }
}

#[async_trait]
impl EventSource for ReplaySource {
    async fn read_records(&mut self, out: &mut Vec<Vec<u8>>) -> Result<(), TracerError> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(TracerError::SourceClosed);
        }
        match self.batches.pop_front() {
            Some(batch) => {
                out.extend(batch);
                Ok(())
            }
            None if self.close_when_empty => Err(TracerError::SourceClosed),
            None => std::future::pending().await,
        }
    }

    fn detach(&mut self) {
        self.detached.store(true, Ordering::SeqCst);
    }
}
