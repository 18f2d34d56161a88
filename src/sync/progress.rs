//! Depot-wide progress accounting and the periodic progress reporter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::Event;

/// Running byte totals for one sync, shared by every chunk worker.
#[derive(Debug)]
pub struct ProgressAccumulator {
    total_bytes: u64,
    bytes_compressed: AtomicU64,
    bytes_uncompressed: AtomicU64,
    files_completed: AtomicU64,
}

/// Point-in-time view of a [`ProgressAccumulator`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressSnapshot {
    /// Bytes transferred on the wire
    pub bytes_compressed: u64,
    /// Bytes written to disk
    pub bytes_uncompressed: u64,
    /// Files fully written and closed
    pub files_completed: u64,
    /// Depot completion (0.0 to 100.0)
    pub percent: f32,
}

impl ProgressAccumulator {
    /// Accumulator for a sync whose included files total `total_bytes`
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            bytes_compressed: AtomicU64::new(0),
            bytes_uncompressed: AtomicU64::new(0),
            files_completed: AtomicU64::new(0),
        }
    }

    /// Record one written chunk. Returns the new uncompressed total.
    pub fn add_chunk(&self, compressed: u64, uncompressed: u64) -> u64 {
        self.bytes_compressed.fetch_add(compressed, Ordering::Relaxed);
        self.bytes_uncompressed
            .fetch_add(uncompressed, Ordering::Relaxed)
            + uncompressed
    }

    /// Record one completed file
    pub fn file_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Completion percentage for a given uncompressed byte count
    pub fn percent_of(&self, bytes_uncompressed: u64) -> f32 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (bytes_uncompressed as f32 / self.total_bytes as f32) * 100.0
    }

    /// Current totals
    pub fn snapshot(&self) -> ProgressSnapshot {
        let bytes_uncompressed = self.bytes_uncompressed.load(Ordering::Relaxed);
        ProgressSnapshot {
            bytes_compressed: self.bytes_compressed.load(Ordering::Relaxed),
            bytes_uncompressed,
            files_completed: self.files_completed.load(Ordering::Relaxed),
            percent: self.percent_of(bytes_uncompressed),
        }
    }
}

/// Parameters for spawning a progress reporter background task
pub(crate) struct ProgressReporterParams {
    /// Shared byte counters
    pub progress: Arc<ProgressAccumulator>,
    /// Emission interval
    pub interval: Duration,
    /// Event broadcast sender
    pub event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Stops the reporter
    pub stop: tokio_util::sync::CancellationToken,
}

/// Spawn a background task that periodically emits [`Event::Progress`].
pub(crate) fn spawn_progress_reporter(
    params: ProgressReporterParams,
) -> tokio::task::JoinHandle<()> {
    let ProgressReporterParams {
        progress,
        interval,
        event_tx,
        stop,
    } = params;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = progress.snapshot();
                    event_tx
                        .send(Event::Progress {
                            bytes_compressed: snapshot.bytes_compressed,
                            bytes_uncompressed: snapshot.bytes_uncompressed,
                            percent: snapshot.percent,
                        })
                        .ok();
                }
                _ = stop.cancelled() => {
                    break;
                }
            }
        }
    })
}
