use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::worker::{WorkerContext, WorkerPool};
use crate::{
    CancellationController, EventSink, ItemId, ProgressTracker, StorageClient, TaskQueue,
    TransferConfig, TransferError, TransferItem,
};

enum PoolState {
    Idle,
    Running(WorkerPool),
    ShutDown,
}

/// Entry point: submit transfers, run them on a worker pool, cancel or shut down.
///
/// Items may be submitted before or after [`start`](Self::start). Every
/// submitted item gets exactly one terminal notification on the sink.
/// Dropping the manager without calling [`shutdown`](Self::shutdown)
/// cancels outstanding work; workers then exit on their own.
pub struct TransferManager {
    storage: Arc<dyn StorageClient>,
    sink: Arc<dyn EventSink>,
    config: TransferConfig,
    queue: TaskQueue,
    cancel: CancellationController,
    next_id: AtomicU64,
    state: Mutex<PoolState>,
}

impl TransferManager {
    pub fn new(
        storage: Arc<dyn StorageClient>,
        sink: Arc<dyn EventSink>,
        config: TransferConfig,
    ) -> Self {
        let queue = TaskQueue::new();
        let cancel = CancellationController::new(queue.clone(), Arc::clone(&sink));
        Self {
            storage,
            sink,
            config,
            queue,
            cancel,
            next_id: AtomicU64::new(1),
            state: Mutex::new(PoolState::Idle),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Queues a download of `bucket/key` into `destination_dir`.
    ///
    /// The object's size is looked up first; if that fails the error is
    /// returned and nothing is queued or reported on the sink.
    pub async fn submit(
        &self,
        bucket: &str,
        key: &str,
        destination_dir: impl AsRef<Path>,
    ) -> Result<ItemId, TransferError> {
        self.ensure_accepting()?;

        let id = self.allocate_id();
        let mut item = TransferItem::download(id, bucket, key, destination_dir.as_ref(), None)?;

        let total = self
            .storage
            .head_object_size(bucket, key)
            .await
            .map_err(|source| TransferError::SizeLookup {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                source,
            })?;
        item.set_total_bytes(total);

        debug!(item = %id, bucket, key, total, file = %item.resolved_filename(), "download queued");
        self.enqueue(item)?;
        Ok(id)
    }

    /// Queues an upload of a local file to `bucket`.
    ///
    /// The object key is the file name, prefixed with `folder/` when a
    /// non-empty folder is given.
    pub async fn submit_upload(
        &self,
        source: impl AsRef<Path>,
        bucket: &str,
        folder: Option<&str>,
    ) -> Result<ItemId, TransferError> {
        self.ensure_accepting()?;

        let source = source.as_ref();
        let key = upload_key(source, folder)?;
        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| TransferError::LocalFs {
                op: "stat",
                path: source.to_path_buf(),
                source: e,
            })?;
        if !meta.is_file() {
            return Err(TransferError::InvalidPath(format!(
                "{} is not a regular file",
                source.display()
            )));
        }

        let id = self.allocate_id();
        let item = TransferItem::upload(id, source, bucket, key.as_str(), Some(meta.len()))?;
        debug!(item = %id, bucket, key = %key, total = meta.len(), "upload queued");
        self.enqueue(item)?;
        Ok(id)
    }

    /// Launches `concurrency` workers. Can only be done once.
    ///
    /// Fails with [`TransferError::InvalidPartSuffix`] if the configured
    /// part suffix is unusable; nothing is started in that case.
    pub fn start(&self, concurrency: usize) -> Result<(), TransferError> {
        self.config.validate()?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            PoolState::Running(_) => Err(TransferError::AlreadyStarted),
            PoolState::ShutDown => Err(TransferError::ShutDown),
            PoolState::Idle => {
                let pool = WorkerPool::start(concurrency, Arc::new(self.worker_context()))?;
                *state = PoolState::Running(pool);
                Ok(())
            }
        }
    }

    /// Cancels every queued and in-flight transfer. Returns immediately.
    ///
    /// Returns how many queued items were cancelled before starting.
    pub fn cancel_all(&self) -> usize {
        self.cancel.request_cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels everything and waits for all workers to exit.
    ///
    /// Calling it again, or without ever starting, returns promptly.
    pub async fn shutdown(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, PoolState::ShutDown)
        };

        match previous {
            PoolState::Running(pool) => {
                debug!(workers = pool.concurrency(), "stopping worker pool");
                pool.shutdown_and_join().await;
            }
            PoolState::Idle => {
                self.cancel.request_cancel();
                self.queue.close();
                self.cancel.request_cancel();
                info!("transfer manager shut down before starting");
            }
            PoolState::ShutDown => {}
        }
    }

    fn ensure_accepting(&self) -> Result<(), TransferError> {
        if matches!(
            *self.state.lock().unwrap_or_else(|e| e.into_inner()),
            PoolState::ShutDown
        ) {
            return Err(TransferError::ShutDown);
        }
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    fn enqueue(&self, item: TransferItem) -> Result<(), TransferError> {
        self.queue.enqueue(item).map_err(|_| TransferError::ShutDown)?;
        // A cancel that raced with this submit has already drained the
        // queue; sweep again so the item is not left behind.
        if self.cancel.is_cancelled() {
            self.cancel.request_cancel();
        }
        Ok(())
    }

    fn allocate_id(&self) -> ItemId {
        ItemId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            queue: self.queue.clone(),
            storage: Arc::clone(&self.storage),
            sink: Arc::clone(&self.sink),
            tracker: ProgressTracker::new(
                Arc::clone(&self.sink),
                Some(self.config.sample_interval()),
            ),
            cancel: self.cancel.clone(),
            part_suffix: self.config.part_suffix.clone(),
        }
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if !matches!(state, PoolState::ShutDown) {
            self.cancel.request_cancel();
            self.queue.close();
        }
    }
}

fn upload_key(source: &Path, folder: Option<&str>) -> Result<String, TransferError> {
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            TransferError::InvalidPath(format!("{} has no usable file name", source.display()))
        })?;

    match folder.map(|f| f.trim_end_matches('/')).filter(|f| !f.is_empty()) {
        Some(folder) => Ok(format!("{folder}/{name}")),
        None => Ok(name.to_owned()),
    }
}
