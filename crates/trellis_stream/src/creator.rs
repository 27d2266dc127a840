//! Outstanding stream tracking.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Counts streams in flight and gates new ones
#[derive(Debug)]
pub struct StreamCreator {
    outstanding: AtomicUsize,
    stopped: AtomicBool,
    poll: Duration,
}

impl StreamCreator {
    /// Create a creator polling every `poll` while stopping
    #[must_use]
    pub fn new(poll: Duration) -> Arc<Self> {
        Arc::new(Self {
            outstanding: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            poll: poll.max(Duration::from_millis(1)),
        })
    }

    /// Reserve a slot for a new stream; `None` once stopped
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> Option<StreamGuard> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.stopped.load(Ordering::SeqCst) {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(StreamGuard(Arc::clone(self)))
    }

    /// Streams in flight
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Whether new streams are refused
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Refuse new streams, then wait until every outstanding one is released
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        tracing::info!(outstanding = self.outstanding(), "Stream creator stopping");
        while self.outstanding() > 0 {
            tokio::time::sleep(self.poll).await;
        }
        tracing::info!("Stream creator drained");
    }
}

/// Releases its stream slot on drop
#[derive(Debug)]
pub struct StreamGuard(Arc<StreamCreator>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}
