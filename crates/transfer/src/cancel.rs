use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{EventSink, FailureReason, TaskQueue};

/// Global cooperative cancellation for one manager.
///
/// The flag is set once and never cleared. Workers read it before starting
/// each item and inside every chunk callback, so in-flight transfers stop
/// within one chunk's transfer time. Items still waiting in the queue are
/// cancelled on the spot.
#[derive(Clone)]
pub struct CancellationController {
    token: CancellationToken,
    queue: TaskQueue,
    sink: Arc<dyn EventSink>,
}

impl CancellationController {
    pub fn new(queue: TaskQueue, sink: Arc<dyn EventSink>) -> Self {
        Self {
            token: CancellationToken::new(),
            queue,
            sink,
        }
    }

    /// Signals cancellation and cancels every queued item. Never blocks.
    ///
    /// Safe to call repeatedly; later calls only sweep up items that were
    /// queued since. Returns how many queued items were cancelled.
    pub fn request_cancel(&self) -> usize {
        if !self.token.is_cancelled() {
            tracing::info!(queued = self.queue.len(), "cancelling all transfers");
        }
        // Set the flag before draining so anything a worker picks up
        // afterwards is seen as cancelled before it starts.
        self.token.cancel();

        let drained = self.queue.drain();
        let count = drained.len();
        for mut item in drained {
            item.cancel();
            tracing::debug!(item = %item.id(), key = %item.key(), "cancelled before start");
            self.sink.on_failed(item.id(), &FailureReason::Cancelled);
        }
        count
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns a token that fires when cancellation is requested.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
