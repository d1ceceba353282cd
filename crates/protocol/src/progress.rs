#[cfg(test)]
#[path = "tests/progress.rs"]
mod tests;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_stream::wrappers::ReceiverStream;

mod reader;
mod writer;

pub use reader::ProgressReader;
pub use writer::ProgressWriter;

/// How often a transfer session samples its counters by default.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Shared counters for one transfer. Written by the stream wrapper on its
/// task, read by the ticking task; everything mutable is atomic.
#[derive(Debug)]
pub struct TransferProgress {
    transferred: AtomicU64,
    size: u64,
    started_at: Instant,
    complete: AtomicBool,
    error: Mutex<Option<String>>,
}

impl TransferProgress {
    #[must_use]
    pub fn new(size: u64) -> Arc<Self> {
        Arc::new(Self {
            transferred: AtomicU64::new(0),
            size,
            started_at: Instant::now(),
            complete: AtomicBool::new(false),
            error: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Relaxed)
    }

    pub(crate) fn record(&self, n: u64) {
        let _ = self.transferred.fetch_add(n, Ordering::Relaxed);
    }

    /// Latches the completion flag after a clean end of data.
    pub(crate) fn finish(&self) {
        self.complete.store(true, Ordering::Relaxed);
    }

    /// Latches the completion flag with a terminal error.
    pub(crate) fn fail(&self, error: &dyn fmt::Display) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error.to_string());
        }
        drop(slot);
        self.complete.store(true, Ordering::Relaxed);
    }

    /// An immutable point-in-time view of the transfer.
    #[must_use]
    pub fn snapshot(&self) -> Progress {
        Progress {
            transferred: self.transferred(),
            size: self.size,
            elapsed: self.started_at.elapsed(),
            complete: self.is_complete(),
            error: self.error.lock().clone(),
        }
    }
}

/// Immutable snapshot of a transfer in flight.
#[derive(Clone, Debug)]
pub struct Progress {
    pub transferred: u64,
    pub size: u64,
    pub elapsed: Duration,
    pub complete: bool,
    pub error: Option<String>,
}

impl Progress {
    /// Percentage of the declared size moved so far; 0 for a zero-sized
    /// transfer.
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }

        self.transferred as f64 / self.size as f64 * 100.0
    }

    /// Remaining time extrapolated linearly from the current throughput,
    /// or `None` before any bytes have moved.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        if self.complete {
            return Some(Duration::ZERO);
        }
        if self.transferred == 0 {
            return None;
        }

        let left = self.size.saturating_sub(self.transferred);
        Some(self.elapsed.mul_f64(left as f64 / self.transferred as f64))
    }
}

/// Samples the shared counters at a fixed interval and yields snapshots
/// until the transfer reaches a terminal state or the consumer hangs up.
/// The stream is finite and cannot be restarted; dropping it stops the
/// ticking task at its next tick.
pub fn watch(progress: &Arc<TransferProgress>, tick: Duration) -> ReceiverStream<Progress> {
    let (sender, receiver) = mpsc::channel(16);
    let progress = Arc::clone(progress);

    drop(tokio::spawn(async move {
        let mut ticker = interval(tick);

        loop {
            let _ = ticker.tick().await;

            let snapshot = progress.snapshot();
            let complete = snapshot.complete;

            if sender.send(snapshot).await.is_err() {
                break;
            }
            if complete {
                break;
            }
        }
    }));

    ReceiverStream::new(receiver)
}
