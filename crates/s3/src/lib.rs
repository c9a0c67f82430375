//! S3-compatible [`StorageClient`](finch_transfer::StorageClient) built on `aws-sdk-s3`.

mod client;

pub use client::S3Storage;

use serde::{Deserialize, Serialize};

/// Smallest part S3 accepts for all but the last part of a multipart upload.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Default multipart part size.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Connection settings for an S3-compatible endpoint.
///
/// Unset fields fall back to the standard AWS environment and profile
/// chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub region: Option<String>,
    /// Custom endpoint for R2, MinIO and similar services.
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Multipart part size in bytes. Values below 5 MiB are raised to 5 MiB.
    pub part_size: Option<usize>,
}

impl S3Settings {
    pub fn effective_part_size(&self) -> usize {
        self.part_size.unwrap_or(DEFAULT_PART_SIZE).max(MIN_PART_SIZE)
    }

    /// Static credentials, when both halves are configured.
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                Some((id.as_str(), secret.as_str()))
            }
            _ => None,
        }
    }
}
