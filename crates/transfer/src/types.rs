use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::TransferError;

/// Identifier of a submitted transfer, unique within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(u64);

impl ItemId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Returns `true` for states that are never left.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn can_become(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::InProgress | Self::Cancelled) => true,
            (Self::InProgress, Self::Completed | Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }
}

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Remote object to local file.
    Download,
    /// Local file to remote object.
    Upload,
}

/// Builds the local filename for `bucket/key`.
///
/// Path separators in the key are flattened to `_` and the result is
/// prefixed with the bucket name, so `a/b.txt` and `c/b.txt` in bucket `x`
/// become `x_a_b.txt` and `x_c_b.txt`. Only separators change, so the
/// key's extension is preserved. Keys such as `a/b_c` and `a_b/c` still
/// collide.
///
/// Colliding names, or the same key submitted twice into one directory,
/// also share a `.part` file. Run concurrently, one of them fails at the
/// rename or the two writes interleave.
pub fn resolve_filename(bucket: &str, key: &str) -> String {
    let flattened: String = key
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{bucket}_{flattened}")
}

/// One requested transfer and its mutable progress state.
///
/// Owned by exactly one party at a time: the caller while submitting, the
/// queue while pending, then the worker running it.
#[derive(Debug)]
pub struct TransferItem {
    id: ItemId,
    direction: Direction,
    bucket_name: String,
    key: String,
    destination_dir: PathBuf,
    resolved_filename: String,
    total_bytes: Option<u64>,
    transferred_bytes: u64,
    status: TransferStatus,
    started_at: Option<Instant>,
    pub(crate) last_sample_at: Option<Instant>,
    pub(crate) bytes_at_last_sample: u64,
    pub(crate) speed: f64,
}

impl TransferItem {
    /// Creates a pending download of `bucket/key` into `destination_dir`.
    pub fn download(
        id: ItemId,
        bucket: impl Into<String>,
        key: impl Into<String>,
        destination_dir: impl Into<PathBuf>,
        total_bytes: Option<u64>,
    ) -> Result<Self, TransferError> {
        let bucket_name = bucket.into();
        let key = key.into();
        if key.is_empty() {
            return Err(TransferError::InvalidKey(key));
        }
        let resolved_filename = resolve_filename(&bucket_name, &key);
        crate::validate_local_name(&resolved_filename)?;

        Ok(Self::new(
            id,
            Direction::Download,
            bucket_name,
            key,
            destination_dir.into(),
            resolved_filename,
            total_bytes,
        ))
    }

    /// Creates a pending upload of the local file at `source` to `bucket/key`.
    pub fn upload(
        id: ItemId,
        source: &Path,
        bucket: impl Into<String>,
        key: impl Into<String>,
        total_bytes: Option<u64>,
    ) -> Result<Self, TransferError> {
        let key = key.into();
        if key.is_empty() {
            return Err(TransferError::InvalidKey(key));
        }
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidPath(source.display().to_string()))?;
        let dir = source.parent().map(Path::to_path_buf).unwrap_or_default();

        Ok(Self::new(
            id,
            Direction::Upload,
            bucket.into(),
            key,
            dir,
            file_name,
            total_bytes,
        ))
    }

    fn new(
        id: ItemId,
        direction: Direction,
        bucket_name: String,
        key: String,
        destination_dir: PathBuf,
        resolved_filename: String,
        total_bytes: Option<u64>,
    ) -> Self {
        Self {
            id,
            direction,
            bucket_name,
            key,
            destination_dir,
            resolved_filename,
            total_bytes,
            transferred_bytes: 0,
            status: TransferStatus::Pending,
            started_at: None,
            last_sample_at: None,
            bytes_at_last_sample: 0,
            speed: 0.0,
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Download target directory, or the source file's directory for uploads.
    pub fn destination_dir(&self) -> &Path {
        &self.destination_dir
    }

    pub fn resolved_filename(&self) -> &str {
        &self.resolved_filename
    }

    /// Final local path: the download target or the upload source.
    pub fn local_path(&self) -> PathBuf {
        self.destination_dir.join(&self.resolved_filename)
    }

    /// Temporary sibling a download is written to before the rename.
    pub fn part_path(&self, suffix: &str) -> PathBuf {
        self.destination_dir
            .join(format!("{}{suffix}", self.resolved_filename))
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub(crate) fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Most recently sampled speed in bytes per second.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Whole-number percentage, or `None` while the size is unknown.
    ///
    /// A zero-byte object reports 100.
    pub fn percent(&self) -> Option<u8> {
        let total = self.total_bytes?;
        if total == 0 {
            return Some(100);
        }
        let pct = u128::from(self.transferred_bytes) * 100 / u128::from(total);
        Some(pct.min(100) as u8)
    }

    pub(crate) fn set_total_bytes(&mut self, total: u64) {
        self.total_bytes = Some(total);
    }

    /// Marks the item in progress and opens its first sampling window.
    pub fn begin(&mut self, now: Instant) {
        if self.transition(TransferStatus::InProgress) {
            self.started_at = Some(now);
            self.last_sample_at = Some(now);
            self.bytes_at_last_sample = self.transferred_bytes;
        }
    }

    /// Adds `delta` to the transferred count.
    ///
    /// Fails without recording anything if the new count would exceed a
    /// known total.
    pub fn add_transferred(&mut self, delta: u64) -> Result<u64, TransferError> {
        let next = self.transferred_bytes.saturating_add(delta);
        if let Some(total) = self.total_bytes
            && next > total
        {
            return Err(TransferError::SizeMismatch {
                expected: total,
                actual: next,
            });
        }
        self.transferred_bytes = next;
        Ok(next)
    }

    pub fn complete(&mut self) -> bool {
        self.transition(TransferStatus::Completed)
    }

    pub fn fail(&mut self) -> bool {
        self.transition(TransferStatus::Failed)
    }

    pub fn cancel(&mut self) -> bool {
        self.transition(TransferStatus::Cancelled)
    }

    fn transition(&mut self, next: TransferStatus) -> bool {
        if !self.status.can_become(next) {
            tracing::warn!(
                item = %self.id,
                from = ?self.status,
                to = ?next,
                "ignoring invalid status transition"
            );
            return false;
        }
        self.status = next;
        true
    }
}
