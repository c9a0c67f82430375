//! Concurrent object transfer between object storage and local disk.
//!
//! A [`TransferManager`] owns a fixed-size pool of workers that pull
//! [`TransferItem`]s from a shared queue and stream them through a
//! [`StorageClient`]. Progress, completion and failure are reported through
//! an [`EventSink`].
//!
//! Cancellation is cooperative: the flag is checked before each item starts
//! and inside every chunk callback, so an in-flight transfer stops within
//! one chunk's transfer time. Downloads are written to a `.part` sibling and
//! renamed into place only once complete; cancelled or failed downloads
//! leave no partial file behind.

mod cancel;
mod config;
mod events;
mod manager;
mod progress;
mod queue;
mod storage;
mod types;
mod validation;
mod worker;

#[cfg(test)]
mod mock;

pub use cancel::CancellationController;
pub use config::TransferConfig;
pub use events::{ChannelSink, EventSink, FailureReason, TracingSink, TransferEvent};
pub use manager::TransferManager;
pub use progress::ProgressTracker;
pub use queue::{Dequeued, TaskQueue};
pub use storage::{Aborted, ByteCallback, StorageClient, StorageError, StorageFuture};
pub use types::{Direction, ItemId, TransferItem, TransferStatus, resolve_filename};
pub use validation::validate_local_name;

use std::path::PathBuf;

/// Default number of concurrent workers.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Suffix appended to a download's filename while it is being written.
pub const PART_SUFFIX: &str = ".part";

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("failed to look up size of {bucket}/{key}: {source}")]
    SizeLookup {
        bucket: String,
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("failed to {op} {}: {source}", path.display())]
    LocalFs {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid object key: {0:?}")]
    InvalidKey(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid part suffix: {0:?} (must be non-empty with no path separator)")]
    InvalidPartSuffix(String),

    #[error("invalid concurrency: {0} (must be at least 1)")]
    InvalidConcurrency(usize),

    #[error("transfer manager already started")]
    AlreadyStarted,

    #[error("transfer manager is shut down")]
    ShutDown,

    #[error("task queue is closed")]
    QueueClosed,
}

impl From<StorageError> for TransferError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Aborted => Self::Cancelled,
            other => Self::Storage(other),
        }
    }
}

impl TransferError {
    /// Returns `true` if this error represents a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
