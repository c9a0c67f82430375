use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_CONCURRENCY, PART_SUFFIX, TransferError};

/// Tunables for a [`TransferManager`](crate::TransferManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Minimum time between speed samples, in milliseconds.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Suffix of the temporary file a download is written to. Must be
    /// non-empty and free of path separators.
    #[serde(default = "default_part_suffix")]
    pub part_suffix: String,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_sample_interval_ms() -> u64 {
    500
}

fn default_part_suffix() -> String {
    PART_SUFFIX.into()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            sample_interval_ms: default_sample_interval_ms(),
            part_suffix: default_part_suffix(),
        }
    }
}

impl TransferConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Rejects a part suffix that would put the temp file anywhere but
    /// beside the final one.
    pub fn validate(&self) -> Result<(), TransferError> {
        let suffix = &self.part_suffix;
        if suffix.is_empty() || suffix.contains(['/', '\\']) {
            return Err(TransferError::InvalidPartSuffix(suffix.clone()));
        }
        Ok(())
    }
}
