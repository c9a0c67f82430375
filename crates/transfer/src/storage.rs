//! Object-storage client seam.
//!
//! The transfer core never talks to a storage service directly. Binaries
//! plug in an implementation (see `finch-s3`); tests use an in-memory mock.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

/// Returned from a byte callback to abort the running transfer.
///
/// Storage clients propagate it with `?`, which converts it into
/// [`StorageError::Aborted`] and unwinds the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transfer aborted")]
pub struct Aborted;

/// Errors reported by a [`StorageClient`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The byte callback asked for the transfer to stop.
    #[error("transfer aborted")]
    Aborted,

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote error: {0}")]
    Remote(String),
}

impl From<Aborted> for StorageError {
    fn from(_: Aborted) -> Self {
        Self::Aborted
    }
}

/// Boxed future returned by [`StorageClient`] methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Per-chunk progress callback.
///
/// Invoked synchronously, inside the transfer call, with the number of bytes
/// moved by the chunk that just completed.
pub type ByteCallback<'a> = &'a mut (dyn FnMut(u64) -> Result<(), Aborted> + Send);

/// Abstract object-storage client.
///
/// Calls are chunked and may take as long as the transfer does. Retries,
/// authentication and transport are the implementation's concern.
pub trait StorageClient: Send + Sync {
    /// Returns the size in bytes of `bucket/key`.
    fn head_object_size<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, u64>;

    /// Streams `bucket/key` into `writer`, calling `on_bytes` after every chunk.
    ///
    /// An `Err(Aborted)` from `on_bytes` must end the call with
    /// [`StorageError::Aborted`].
    fn stream_download<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        writer: &'a mut (dyn AsyncWrite + Unpin + Send),
        on_bytes: ByteCallback<'a>,
    ) -> StorageFuture<'a, ()>;

    /// Streams `reader` to `bucket/key`, calling `on_bytes` for every chunk read.
    fn stream_upload<'a>(
        &'a self,
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
        bucket: &'a str,
        key: &'a str,
        on_bytes: ByteCallback<'a>,
    ) -> StorageFuture<'a, ()>;
}
