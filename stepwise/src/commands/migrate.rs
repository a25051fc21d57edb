use crate::core::config::{default_store_path, RunnerConfig};
use crate::core::loader::load_sql_dir;
use crate::core::runner::{MigrationRunner, MigrationStatus};
use crate::models::revision::Revision;
use crate::providers::sqlite::SqliteStore;
use crate::utils::error::{MigrationError, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

/// Where migrations come from and which store they apply to
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Directory of `*.sql` migration files
    #[arg(long)]
    pub dir: PathBuf,

    /// SQLite database file; defaults to the per-user data directory
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// JSON runner configuration; `STEPWISE_*` variables are used without it
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl TargetArgs {
    fn runner_config(&self) -> Result<RunnerConfig> {
        match &self.config {
            Some(path) => RunnerConfig::load(path),
            None => RunnerConfig::from_env(),
        }
    }

    fn build_runner(&self, config: RunnerConfig) -> Result<MigrationRunner> {
        let db_path = match &self.db {
            Some(path) => path.clone(),
            None => default_store_path()?,
        };
        tracing::info!("Using store {}", db_path.display());

        let store = SqliteStore::open(&db_path).map_err(MigrationError::StoreUnavailable)?;
        let migrations = load_sql_dir(&self.dir)?;

        Ok(MigrationRunner::new(Arc::new(store), migrations).with_config(config))
    }
}

pub async fn up(target: &TargetArgs, lock: bool) -> Result<Revision> {
    tracing::info!("Up command called for {}", target.dir.display());

    let result = async {
        let mut config = target.runner_config()?;
        config.lock |= lock;
        target.build_runner(config)?.up().await
    }
    .await;

    result.map_err(|e| {
        tracing::error!("Migration failed: {}", e);
        e
    })
}

pub async fn status(target: &TargetArgs) -> Result<MigrationStatus> {
    tracing::info!("Status command called for {}", target.dir.display());

    let result = async {
        let config = target.runner_config()?;
        target.build_runner(config)?.status().await
    }
    .await;

    result.map_err(|e| {
        tracing::error!("Status check failed: {}", e);
        e
    })
}

pub fn describe_status(status: &MigrationStatus) -> String {
    match status {
        MigrationStatus::UpToDate { version } => {
            format!("Up to date at revision {}", version)
        }
        MigrationStatus::Pending {
            current,
            target,
            pending,
        } => format!(
            "At revision {}, {} migration(s) pending up to revision {}",
            current, pending, target
        ),
        MigrationStatus::Ahead { current, known } => format!(
            "At revision {}, ahead of the {} known migration(s)",
            current, known
        ),
    }
}
