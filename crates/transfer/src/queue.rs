//! Hand-off of pending items to workers.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::{TransferError, TransferItem};

/// What a worker gets back from [`TaskQueue::dequeue_or_shutdown`].
#[derive(Debug)]
pub enum Dequeued {
    Item(TransferItem),
    Shutdown,
}

/// Multi-producer, multi-consumer queue of pending transfers.
///
/// Items are handed out in FIFO order and each goes to exactly one worker.
/// Shutdown is a close signal seen by every waiting worker at once; items
/// already queued are still handed out first. Cloning shares the queue.
#[derive(Clone)]
pub struct TaskQueue {
    tx: flume::Sender<TransferItem>,
    rx: flume::Receiver<TransferItem>,
    // Guards admission so nothing can be enqueued once `close` returns.
    open: Arc<Mutex<bool>>,
    closed: CancellationToken,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            open: Arc::new(Mutex::new(true)),
            closed: CancellationToken::new(),
        }
    }

    /// Adds an item. Fails with [`TransferError::QueueClosed`] after [`close`](Self::close).
    pub fn enqueue(&self, item: TransferItem) -> Result<(), TransferError> {
        let open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if !*open {
            return Err(TransferError::QueueClosed);
        }
        // Unbounded and we hold a receiver, so this cannot fail.
        self.tx
            .send(item)
            .map_err(|_| TransferError::QueueClosed)
    }

    /// Waits for the next item, or for the queue to be closed and empty.
    pub async fn dequeue_or_shutdown(&self) -> Dequeued {
        tokio::select! {
            biased;
            item = self.rx.recv_async() => match item {
                Ok(item) => Dequeued::Item(item),
                Err(_) => Dequeued::Shutdown,
            },
            () = self.closed.cancelled() => match self.rx.try_recv() {
                Ok(item) => Dequeued::Item(item),
                Err(_) => Dequeued::Shutdown,
            },
        }
    }

    /// Removes and returns every item still waiting, without blocking.
    pub fn drain(&self) -> Vec<TransferItem> {
        self.rx.drain().collect()
    }

    /// Stops admission and wakes every waiting worker. Closing twice is a no-op.
    pub fn close(&self) {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        *open = false;
        self.closed.cancel();
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
