//! In-memory storage client for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;

use crate::{ByteCallback, StorageClient, StorageError, StorageFuture};

type ObjectKey = (String, String);

/// Serves objects from memory in fixed-size chunks.
pub(crate) struct MockStorage {
    objects: HashMap<ObjectKey, Vec<u8>>,
    reported_sizes: HashMap<String, u64>,
    failures: HashMap<String, usize>,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    // Every chunk after the first waits for a permit.
    gate: Option<Arc<Semaphore>>,

    uploads: Mutex<HashMap<ObjectKey, Vec<u8>>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
    chunks: AtomicUsize,
}

impl MockStorage {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self {
            objects: HashMap::new(),
            reported_sizes: HashMap::new(),
            failures: HashMap::new(),
            chunk_size: chunk_size.max(1),
            chunk_delay: None,
            gate: None,
            uploads: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            chunks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_object(mut self, bucket: &str, key: &str, data: Vec<u8>) -> Self {
        self.objects.insert((bucket.into(), key.into()), data);
        self
    }

    /// Makes `head_object_size` report `size` for `key` regardless of content.
    pub(crate) fn with_reported_size(mut self, key: &str, size: u64) -> Self {
        self.reported_sizes.insert(key.into(), size);
        self
    }

    /// Fails the download of `key` just before chunk `index` (zero-based).
    pub(crate) fn fail_at_chunk(mut self, key: &str, index: usize) -> Self {
        self.failures.insert(key.into(), index);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub(crate) fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn uploaded(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.uploads
            .lock()
            .unwrap()
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
    }

    /// Highest number of transfers that were streaming at the same time.
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn transfers_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn chunks_served(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveGuard<'_> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(&self.active)
    }

    async fn pace(&self, index: usize) -> Result<(), StorageError> {
        if index > 0
            && let Some(gate) = &self.gate
        {
            gate.acquire()
                .await
                .map_err(|e| StorageError::Remote(e.to_string()))?
                .forget();
        }
        if let Some(delay) = self.chunk_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StorageClient for MockStorage {
    fn head_object_size<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, u64> {
        Box::pin(async move {
            let data = self
                .objects
                .get(&(bucket.to_owned(), key.to_owned()))
                .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{key}")))?;
            Ok(self
                .reported_sizes
                .get(key)
                .copied()
                .unwrap_or(data.len() as u64))
        })
    }

    fn stream_download<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        writer: &'a mut (dyn AsyncWrite + Unpin + Send),
        on_bytes: ByteCallback<'a>,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let data = self
                .objects
                .get(&(bucket.to_owned(), key.to_owned()))
                .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{key}")))?;
            let _guard = self.enter();

            for (index, chunk) in data.chunks(self.chunk_size).enumerate() {
                self.pace(index).await?;
                if self.failures.get(key) == Some(&index) {
                    return Err(StorageError::Remote(format!(
                        "injected failure at chunk {index}"
                    )));
                }
                writer.write_all(chunk).await?;
                self.chunks.fetch_add(1, Ordering::SeqCst);
                on_bytes(chunk.len() as u64)?;
            }
            writer.flush().await?;
            Ok(())
        })
    }

    fn stream_upload<'a>(
        &'a self,
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
        bucket: &'a str,
        key: &'a str,
        on_bytes: ByteCallback<'a>,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.enter();
            let mut received = Vec::new();
            let mut buf = vec![0u8; self.chunk_size];
            let mut index = 0;
            loop {
                self.pace(index).await?;
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                self.chunks.fetch_add(1, Ordering::SeqCst);
                on_bytes(n as u64)?;
                index += 1;
            }
            self.uploads
                .lock()
                .unwrap()
                .insert((bucket.to_owned(), key.to_owned()), received);
            Ok(())
        })
    }
}
