//! CLI configuration: `~/.config/finch/config.toml` (`%APPDATA%\finch\config.toml` on Windows).

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use finch_s3::S3Settings;
use finch_transfer::TransferConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinchConfig {
    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub s3: S3Settings,
}

impl FinchConfig {
    /// Loads `explicit` if given, otherwise the platform default path.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        match explicit {
            Some(path) => Self::load_from(path),
            None => {
                let path = default_path();
                if !path.exists() {
                    tracing::debug!(path = %path.display(), "no config file, using defaults");
                    return Ok(Self::default());
                }
                Self::load_from(&path)
            }
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

pub fn default_path() -> PathBuf {
    config_base_dir().join("finch").join("config.toml")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }
}
