use crate::models::revision::DEFAULT_REVISION_ID;
use crate::utils::error::{MigrationError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_REVISION_ID: &str = "STEPWISE_REVISION_ID";
pub const ENV_LOCK: &str = "STEPWISE_LOCK";
pub const ENV_STALE_LOCK_SECS: &str = "STEPWISE_STALE_LOCK_SECS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Identity of the tracking record in the target store
    pub revision_id: i64,
    /// Hold the revision lock for the duration of a run
    pub lock: bool,
    /// A lock older than this is treated as abandoned and taken over.
    /// `None` never takes over a held lock.
    pub stale_lock_after_secs: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            revision_id: DEFAULT_REVISION_ID,
            lock: false,
            stale_lock_after_secs: None,
        }
    }
}

impl RunnerConfig {
    /// Load from a JSON file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            MigrationError::InvalidConfig(format!("{}: {}", path.display(), e))
        })
    }

    /// Defaults overridden by `STEPWISE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env(|key| std::env::var(key).ok())
    }

    fn merge_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_REVISION_ID) {
            self.revision_id = raw.trim().parse().map_err(|_| {
                MigrationError::InvalidConfig(format!("{} must be an integer, got {:?}", ENV_REVISION_ID, raw))
            })?;
        }

        if let Some(raw) = lookup(ENV_LOCK) {
            self.lock = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(MigrationError::InvalidConfig(format!(
                        "{} must be a boolean, got {:?}",
                        ENV_LOCK, raw
                    )))
                }
            };
        }

        if let Some(raw) = lookup(ENV_STALE_LOCK_SECS) {
            let secs = raw.trim().parse().map_err(|_| {
                MigrationError::InvalidConfig(format!(
                    "{} must be a number of seconds, got {:?}",
                    ENV_STALE_LOCK_SECS, raw
                ))
            })?;
            self.stale_lock_after_secs = Some(secs);
        }

        Ok(self)
    }

    pub fn stale_lock_after(&self) -> Option<Duration> {
        self.stale_lock_after_secs.map(Duration::from_secs)
    }
}

/// Where the CLI keeps its SQLite store when no path is given
pub fn default_store_path() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("com", "stepwise", "Stepwise").ok_or_else(|| {
        MigrationError::InvalidConfig("Failed to get project directory".to_string())
    })?;

    Ok(project_dirs.data_dir().join("stepwise.db"))
}
