//! Fixed-size worker pool and the per-item transfer loop.

use std::path::Path;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    Aborted, CancellationController, Dequeued, Direction, EventSink, FailureReason,
    ProgressTracker, StorageClient, TaskQueue, TransferError, TransferItem,
};

/// Everything a worker needs, shared by all workers of a pool.
pub(crate) struct WorkerContext {
    pub(crate) queue: TaskQueue,
    pub(crate) storage: Arc<dyn StorageClient>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) tracker: ProgressTracker,
    pub(crate) cancel: CancellationController,
    pub(crate) part_suffix: String,
}

/// A running set of workers sharing one queue.
pub(crate) struct WorkerPool {
    ctx: Arc<WorkerContext>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `concurrency` workers. The count is fixed for the pool's lifetime.
    pub(crate) fn start(concurrency: usize, ctx: Arc<WorkerContext>) -> Result<Self, TransferError> {
        if concurrency == 0 {
            return Err(TransferError::InvalidConcurrency(concurrency));
        }

        let handles = (0..concurrency)
            .map(|index| tokio::spawn(run_worker(index, Arc::clone(&ctx))))
            .collect();

        info!(concurrency, "worker pool started");
        Ok(Self { ctx, handles })
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn cancel_all(&self) -> usize {
        self.ctx.cancel.request_cancel()
    }

    /// Cancels everything, closes the queue and waits for every worker to exit.
    pub(crate) async fn shutdown_and_join(self) {
        self.cancel_all();
        self.ctx.queue.close();
        // Anything admitted between the first sweep and the close.
        self.cancel_all();

        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn run_worker(index: usize, ctx: Arc<WorkerContext>) {
    debug!(worker = index, "worker started");
    loop {
        match ctx.queue.dequeue_or_shutdown().await {
            Dequeued::Item(item) => ctx.process(item).await,
            Dequeued::Shutdown => break,
        }
    }
    debug!(worker = index, "worker exiting");
}

impl WorkerContext {
    /// Runs one item to a terminal state and reports it exactly once.
    pub(crate) async fn process(&self, mut item: TransferItem) {
        let id = item.id();

        if self.cancel.is_cancelled() {
            item.cancel();
            self.sink.on_failed(id, &FailureReason::Cancelled);
            return;
        }

        item.begin(Instant::now());
        debug!(
            item = %id,
            direction = ?item.direction(),
            bucket = %item.bucket_name(),
            key = %item.key(),
            total = ?item.total_bytes(),
            "transfer started"
        );

        let result = match item.direction() {
            Direction::Download => self.download(&mut item).await,
            Direction::Upload => self.upload(&mut item).await,
        };

        match result {
            Ok(()) => {
                item.complete();
                let elapsed_ms = item
                    .started_at()
                    .map(|t| t.elapsed().as_millis() as u64)
                    .unwrap_or_default();
                info!(item = %id, bytes = item.transferred_bytes(), elapsed_ms, "transfer completed");
                self.sink.on_completed(id);
            }
            Err(TransferError::Cancelled) => {
                item.cancel();
                info!(item = %id, bytes = item.transferred_bytes(), "transfer cancelled");
                self.sink.on_failed(id, &FailureReason::Cancelled);
            }
            Err(e) => {
                item.fail();
                warn!(item = %id, key = %item.key(), error = %e, "transfer failed");
                self.sink.on_failed(id, &FailureReason::Error(e.to_string()));
            }
        }
    }

    async fn download(&self, item: &mut TransferItem) -> Result<(), TransferError> {
        let dir = item.destination_dir().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| TransferError::LocalFs {
                op: "create directory",
                path: dir,
                source,
            })?;

        let part = item.part_path(&self.part_suffix);
        let result = self.download_into(item, &part).await;
        if result.is_err() {
            remove_partial(&part).await;
        }
        result
    }

    /// Streams into `part`, then renames it over the final path.
    async fn download_into(&self, item: &mut TransferItem, part: &Path) -> Result<(), TransferError> {
        let file = File::create(part)
            .await
            .map_err(|source| TransferError::LocalFs {
                op: "create",
                path: part.to_path_buf(),
                source,
            })?;
        let mut writer = BufWriter::new(file);

        let bucket = item.bucket_name().to_owned();
        let key = item.key().to_owned();
        let mut overflow = None;
        let mut on_bytes = |delta: u64| self.on_chunk(item, delta, &mut overflow);
        let streamed = self
            .storage
            .stream_download(&bucket, &key, &mut writer, &mut on_bytes)
            .await;

        if let Some(err) = overflow {
            return Err(err);
        }
        streamed?;

        let write_err = |source| TransferError::LocalFs {
            op: "write",
            path: part.to_path_buf(),
            source,
        };
        writer.flush().await.map_err(write_err)?;
        writer.into_inner().sync_all().await.map_err(write_err)?;

        check_complete(item)?;
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let target = item.local_path();
        tokio::fs::rename(part, &target)
            .await
            .map_err(|source| TransferError::LocalFs {
                op: "rename",
                path: target,
                source,
            })
    }

    async fn upload(&self, item: &mut TransferItem) -> Result<(), TransferError> {
        let source_path = item.local_path();
        let file = File::open(&source_path)
            .await
            .map_err(|source| TransferError::LocalFs {
                op: "open",
                path: source_path,
                source,
            })?;
        let mut reader = BufReader::new(file);

        let bucket = item.bucket_name().to_owned();
        let key = item.key().to_owned();
        let mut overflow = None;
        let mut on_bytes = |delta: u64| self.on_chunk(item, delta, &mut overflow);
        let streamed = self
            .storage
            .stream_upload(&mut reader, &bucket, &key, &mut on_bytes)
            .await;

        if let Some(err) = overflow {
            return Err(err);
        }
        streamed?;
        check_complete(item)
    }

    /// Byte callback body: abort on cancellation, otherwise count and report.
    fn on_chunk(
        &self,
        item: &mut TransferItem,
        delta: u64,
        overflow: &mut Option<TransferError>,
    ) -> Result<(), Aborted> {
        if self.cancel.is_cancelled() {
            return Err(Aborted);
        }
        if let Err(e) = item.add_transferred(delta) {
            *overflow = Some(e);
            return Err(Aborted);
        }
        self.tracker.record_bytes(item, delta);
        Ok(())
    }
}

fn check_complete(item: &TransferItem) -> Result<(), TransferError> {
    match item.total_bytes() {
        Some(expected) if expected != item.transferred_bytes() => Err(TransferError::SizeMismatch {
            expected,
            actual: item.transferred_bytes(),
        }),
        _ => Ok(()),
    }
}

/// Best-effort removal of a partial download.
async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial file"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::mock::MockStorage;
    use crate::{ChannelSink, ItemId, TransferEvent};

    fn context(storage: Arc<MockStorage>) -> (Arc<WorkerContext>, UnboundedReceiver<TransferEvent>) {
        let (sink, rx) = ChannelSink::new();
        let sink: Arc<dyn EventSink> = Arc::new(sink);
        let queue = TaskQueue::new();
        let ctx = WorkerContext {
            queue: queue.clone(),
            storage,
            sink: Arc::clone(&sink),
            tracker: ProgressTracker::new(Arc::clone(&sink), None),
            cancel: CancellationController::new(queue, sink),
            part_suffix: ".part".into(),
        };
        (Arc::new(ctx), rx)
    }

    fn download(dir: &Path, key: &str, total: u64) -> TransferItem {
        TransferItem::download(ItemId::new(1), "bkt", key, dir, Some(total)).unwrap()
    }

    fn last_event(rx: &mut UnboundedReceiver<TransferEvent>) -> TransferEvent {
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        last.expect("no events")
    }

    /// Drains `rx`, asserting exactly one terminal event, and returns it.
    fn only_terminal(rx: &mut UnboundedReceiver<TransferEvent>) -> TransferEvent {
        let mut terminal: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(TransferEvent::is_terminal)
            .collect();
        assert_eq!(terminal.len(), 1, "expected one terminal event: {terminal:?}");
        terminal.remove(0)
    }

    fn failure_reason(event: TransferEvent) -> String {
        match event {
            TransferEvent::Failed {
                reason, cancelled, ..
            } => {
                assert!(!cancelled);
                reason.as_str().to_owned()
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    fn part_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".part"))
            .count()
    }

    #[tokio::test]
    async fn download_lands_under_resolved_name() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; 5000];
        let storage = Arc::new(MockStorage::new(1024).with_object("bkt", "x/y.bin", data.clone()));
        let (ctx, mut rx) = context(storage);

        ctx.process(download(dir.path(), "x/y.bin", 5000)).await;

        assert_eq!(last_event(&mut rx), TransferEvent::Completed { id: ItemId::new(1) });
        let target = dir.path().join("bkt_x_y.bin");
        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert!(!dir.path().join("bkt_x_y.bin.part").exists());
    }

    #[tokio::test]
    async fn missing_destination_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let storage = Arc::new(MockStorage::new(4).with_object("bkt", "k", b"data".to_vec()));
        let (ctx, mut rx) = context(storage);

        ctx.process(download(&nested, "k", 4)).await;

        assert!(last_event(&mut rx).is_terminal());
        assert_eq!(std::fs::read(nested.join("bkt_k")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn remote_error_removes_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            MockStorage::new(10)
                .with_object("bkt", "k", vec![1u8; 100])
                .fail_at_chunk("k", 3),
        );
        let (ctx, mut rx) = context(storage);

        ctx.process(download(dir.path(), "k", 100)).await;

        match last_event(&mut rx) {
            TransferEvent::Failed {
                reason, cancelled, ..
            } => {
                assert!(!cancelled);
                assert!(reason.as_str().contains("injected failure"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!dir.path().join("bkt_k.part").exists());
        assert!(!dir.path().join("bkt_k").exists());
    }

    #[tokio::test]
    async fn short_stream_is_a_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new(10).with_object("bkt", "k", vec![1u8; 50]));
        let (ctx, mut rx) = context(storage);

        ctx.process(download(dir.path(), "k", 80)).await;

        match last_event(&mut rx) {
            TransferEvent::Failed { reason, .. } => {
                assert!(reason.as_str().contains("size mismatch"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!dir.path().join("bkt_k").exists());
        assert!(!dir.path().join("bkt_k.part").exists());
    }

    #[tokio::test]
    async fn oversized_stream_stops_at_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new(10).with_object("bkt", "k", vec![1u8; 100]));
        let (ctx, mut rx) = context(Arc::clone(&storage));

        ctx.process(download(dir.path(), "k", 25)).await;

        match last_event(&mut rx) {
            TransferEvent::Failed {
                reason, cancelled, ..
            } => {
                assert!(!cancelled);
                assert!(reason.as_str().contains("expected 25"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        // Third chunk would have gone past 25 bytes; the fourth never ran.
        assert_eq!(storage.chunks_served(), 3);
        assert!(!dir.path().join("bkt_k.part").exists());
    }

    #[tokio::test]
    async fn item_picked_up_after_cancel_never_starts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new(10).with_object("bkt", "k", vec![0u8; 10]));
        let (ctx, mut rx) = context(Arc::clone(&storage));

        ctx.cancel.request_cancel();
        ctx.process(download(dir.path(), "k", 10)).await;

        match last_event(&mut rx) {
            TransferEvent::Failed { cancelled, .. } => assert!(cancelled),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(storage.transfers_started(), 0);
    }

    #[tokio::test]
    async fn cancel_during_stream_discards_output() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let storage = Arc::new(
            MockStorage::new(10)
                .with_object("bkt", "k", vec![0u8; 40])
                .with_gate(Arc::clone(&gate)),
        );
        let (ctx, mut rx) = context(storage);

        let worker = {
            let ctx = Arc::clone(&ctx);
            let item = download(dir.path(), "k", 40);
            tokio::spawn(async move { ctx.process(item).await })
        };

        // First chunk moves the percentage to 25 and emits progress.
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first,
            TransferEvent::Progress {
                id: ItemId::new(1),
                percent: Some(25),
                speed: 0.0
            }
        );
        assert!(dir.path().join("bkt_k.part").exists());

        ctx.cancel.request_cancel();
        gate.add_permits(10);
        worker.await.unwrap();

        match last_event(&mut rx) {
            TransferEvent::Failed {
                reason, cancelled, ..
            } => {
                assert!(cancelled);
                assert_eq!(reason.as_str(), "transfer cancelled");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!dir.path().join("bkt_k.part").exists());
        assert!(!dir.path().join("bkt_k").exists());
    }

    #[tokio::test]
    async fn destination_that_is_a_file_fails_directory_creation() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let storage = Arc::new(MockStorage::new(4).with_object("bkt", "k", b"data".to_vec()));
        let (ctx, mut rx) = context(Arc::clone(&storage));

        ctx.process(download(&blocker, "k", 4)).await;

        let reason = failure_reason(only_terminal(&mut rx));
        assert!(reason.starts_with("failed to create directory"), "{reason}");
        assert_eq!(storage.transfers_started(), 0);
        assert_eq!(std::fs::read(&blocker).unwrap(), b"x");
        assert_eq!(part_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn rename_failure_removes_part_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory squatting on the final name makes the rename fail.
        let target = dir.path().join("bkt_k");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"x").unwrap();
        let storage = Arc::new(MockStorage::new(4).with_object("bkt", "k", b"data".to_vec()));
        let (ctx, mut rx) = context(storage);

        ctx.process(download(dir.path(), "k", 4)).await;

        let reason = failure_reason(only_terminal(&mut rx));
        assert!(reason.starts_with("failed to rename"), "{reason}");
        assert!(target.join("keep").exists());
        assert_eq!(part_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn cancel_during_upload_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("big.bin");
        std::fs::write(&src, vec![5u8; 40]).unwrap();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let storage = Arc::new(MockStorage::new(10).with_gate(Arc::clone(&gate)));
        let (ctx, mut rx) = context(Arc::clone(&storage));

        let worker = {
            let ctx = Arc::clone(&ctx);
            let item = TransferItem::upload(ItemId::new(3), &src, "bkt", "big.bin", Some(40)).unwrap();
            tokio::spawn(async move { ctx.process(item).await })
        };

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            first,
            TransferEvent::Progress {
                percent: Some(25),
                ..
            }
        ));

        ctx.cancel.request_cancel();
        gate.add_permits(10);
        worker.await.unwrap();

        match only_terminal(&mut rx) {
            TransferEvent::Failed {
                id,
                reason,
                cancelled,
            } => {
                assert_eq!(id, ItemId::new(3));
                assert!(cancelled);
                assert_eq!(reason, FailureReason::Cancelled);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(storage.uploaded("bkt", "big.bin").is_none());
        assert_eq!(std::fs::read(&src).unwrap().len(), 40);
        assert_eq!(part_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn upload_reads_whole_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("notes.txt");
        std::fs::write(&src, vec![9u8; 2500]).unwrap();

        let storage = Arc::new(MockStorage::new(1000));
        let (ctx, mut rx) = context(Arc::clone(&storage));
        let item =
            TransferItem::upload(ItemId::new(4), &src, "bkt", "docs/notes.txt", Some(2500)).unwrap();

        ctx.process(item).await;

        assert_eq!(last_event(&mut rx), TransferEvent::Completed { id: ItemId::new(4) });
        assert_eq!(storage.uploaded("bkt", "docs/notes.txt").unwrap().len(), 2500);
    }

    #[tokio::test]
    async fn upload_of_vanished_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("gone.txt");
        let storage = Arc::new(MockStorage::new(1000));
        let (ctx, mut rx) = context(storage);
        let item = TransferItem::upload(ItemId::new(2), &src, "bkt", "gone.txt", Some(1)).unwrap();

        ctx.process(item).await;

        match last_event(&mut rx) {
            TransferEvent::Failed { reason, .. } => {
                assert!(reason.as_str().starts_with("failed to open"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn pool_rejects_zero_workers() {
        let storage = Arc::new(MockStorage::new(1));
        let (ctx, _rx) = context(storage);
        assert!(matches!(
            WorkerPool::start(0, ctx),
            Err(TransferError::InvalidConcurrency(0))
        ));
    }

    #[tokio::test]
    async fn pool_spawns_requested_workers_and_joins() {
        let storage = Arc::new(MockStorage::new(1));
        let (ctx, _rx) = context(storage);
        let pool = WorkerPool::start(4, ctx).unwrap();
        assert_eq!(pool.concurrency(), 4);
        tokio::time::timeout(Duration::from_secs(5), pool.shutdown_and_join())
            .await
            .expect("pool did not join");
    }
}
