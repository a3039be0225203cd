//! Run configuration
//!
//! A [`BackupConfig`] can be loaded from a JSON file and is then overridden
//! by command-line flags. Only `backups_root` is required:
//!
//! ```json
//! {
//!   "backups_root": "/mnt/backups",
//!   "sources": ["/home/me/documents", "/home/me/photos"],
//!   "retention": { "keep_all": 7, "keep_daily": 30, "keep_weekly": null }
//! }
//! ```
//!
//! Retention tiers left out of the file keep their defaults; `null`
//! disables a tier.

use crate::backup::BackupBuilder;
use crate::error::{LinkbackError, Result};
use crate::retention::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Everything one invocation needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding the snapshots and the lock file
    pub backups_root: PathBuf,
    /// Directories to back up
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    /// Report only, keep nothing
    #[serde(default)]
    pub dry_run: bool,
    /// Terminate a running backup holding the lock
    #[serde(default)]
    pub force: bool,
    /// Retention tiers
    #[serde(default)]
    pub retention: RetentionPolicy,
}

impl BackupConfig {
    /// Configuration with defaults for everything but the backups root
    pub fn new(backups_root: impl Into<PathBuf>) -> Self {
        Self {
            backups_root: backups_root.into(),
            sources: Vec::new(),
            dry_run: false,
            force: false,
            retention: RetentionPolicy::default(),
        }
    }

    /// Read a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Check the configuration against the filesystem
    ///
    /// Runs exactly the checks [`BackupBuilder::build`] runs, without
    /// touching the backups root.
    ///
    /// # Errors
    ///
    /// See [`BackupBuilder::build`].
    pub fn validate(&self) -> Result<()> {
        self.backup_builder().build().map(drop)
    }

    /// Builder for a backup run over this configuration
    pub fn backup_builder(&self) -> BackupBuilder {
        BackupBuilder::new(&self.backups_root)
            .sources(&self.sources)
            .dry_run(self.dry_run)
    }
}

/// Operating systems with the hardlink and ownership semantics backups need
pub const SUPPORTED_PLATFORMS: &[&str] = &["linux", "macos"];

/// Fail with [`LinkbackError::UnsupportedPlatform`] outside Linux and macOS
pub fn check_platform() -> Result<()> {
    let os = std::env::consts::OS;
    if SUPPORTED_PLATFORMS.contains(&os) {
        Ok(())
    } else {
        Err(LinkbackError::UnsupportedPlatform(format!(
            "{} (supported: {})",
            os,
            SUPPORTED_PLATFORMS.join(", ")
        )))
    }
}
