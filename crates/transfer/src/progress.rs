use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::{EventSink, TransferItem};

/// Default speed sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Turns byte deltas into throttled progress notifications.
///
/// Speed is resampled only once `interval` has passed since the previous
/// sample. An event goes out when a new sample is taken or when the whole
/// percentage has moved, so fast transfers emit a bounded number of events
/// while the percentage stays current.
pub struct ProgressTracker {
    sink: Arc<dyn EventSink>,
    interval: Duration,
}

impl ProgressTracker {
    /// Creates a tracker reporting to `sink`.
    ///
    /// If `interval` is `None`, defaults to 500 ms.
    pub fn new(sink: Arc<dyn EventSink>, interval: Option<Duration>) -> Self {
        Self {
            sink,
            interval: interval.unwrap_or(DEFAULT_SAMPLE_INTERVAL),
        }
    }

    /// Records that `delta` bytes were just added to `item`'s count.
    pub fn record_bytes(&self, item: &mut TransferItem, delta: u64) {
        self.record_bytes_at(item, delta, Instant::now());
    }

    /// Like [`record_bytes`](Self::record_bytes) with an explicit clock reading.
    ///
    /// Returns `true` if the speed was resampled.
    pub fn record_bytes_at(&self, item: &mut TransferItem, delta: u64, now: Instant) -> bool {
        let transferred = item.transferred_bytes();
        let previous_percent = percent_of(transferred.saturating_sub(delta), item.total_bytes());

        let window_start = *item.last_sample_at.get_or_insert(now);
        let elapsed = now.saturating_duration_since(window_start);
        let resampled = elapsed >= self.interval && !elapsed.is_zero();
        if resampled {
            let bytes = transferred.saturating_sub(item.bytes_at_last_sample);
            item.speed = bytes as f64 / elapsed.as_secs_f64();
            item.bytes_at_last_sample = transferred;
            item.last_sample_at = Some(now);
        }

        let percent = item.percent();
        if resampled || percent != previous_percent {
            self.sink.on_progress(item.id(), percent, item.speed);
        }
        resampled
    }
}

fn percent_of(transferred: u64, total: Option<u64>) -> Option<u8> {
    let total = total?;
    if total == 0 {
        return Some(100);
    }
    Some((u128::from(transferred) * 100 / u128::from(total)).min(100) as u8)
}
