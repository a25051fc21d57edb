use crate::core::config::RunnerConfig;
use crate::db::revision_store::RevisionStore;
use crate::models::migration::Migration;
use crate::models::revision::Revision;
use crate::providers::traits::Store;
use crate::utils::error::{MigrationError, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

/// Where a store stands relative to a migration list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Every migration in the list has been applied
    UpToDate { version: i64 },

    /// Migrations need to be applied
    Pending {
        /// Last applied index, -1 for none
        current: i64,
        /// Index of the last migration in the list
        target: i64,
        /// Number of migrations left to run
        pending: usize,
    },

    /// The store has applied more migrations than the list holds
    Ahead { current: i64, known: usize },
}

impl MigrationStatus {
    pub fn of(revision: &Revision, migration_count: usize) -> Self {
        let applied = revision.applied_count();

        if applied == migration_count {
            MigrationStatus::UpToDate {
                version: revision.version,
            }
        } else if applied < migration_count {
            MigrationStatus::Pending {
                current: revision.version,
                target: migration_count as i64 - 1,
                pending: migration_count - applied,
            }
        } else {
            MigrationStatus::Ahead {
                current: revision.version,
                known: migration_count,
            }
        }
    }

    pub fn pending(&self) -> usize {
        match self {
            MigrationStatus::Pending { pending, .. } => *pending,
            _ => 0,
        }
    }
}

/// Applies an ordered migration list to a store exactly once per entry,
/// recording progress in the store's revision record.
///
/// Only one runner may run [`up`](Self::up) against a store at a time unless
/// [`RunnerConfig::lock`] is set.
pub struct MigrationRunner {
    store: Arc<dyn Store>,
    migrations: Vec<Migration>,
    config: RunnerConfig,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn Store>, migrations: Vec<Migration>) -> Self {
        Self {
            store,
            migrations,
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn revisions(&self) -> RevisionStore<'_> {
        RevisionStore::new(self.store.as_ref(), self.config.revision_id)
    }

    /// Check where the store stands without running anything
    pub async fn status(&self) -> Result<MigrationStatus> {
        let revision = self
            .revisions()
            .ensure_schema_and_load()
            .await
            .map_err(MigrationError::initialization)?;

        Ok(MigrationStatus::of(&revision, self.migrations.len()))
    }

    /// Apply every pending migration in order.
    ///
    /// Stops at the first failure; the revision then still names the last
    /// migration that completed, so calling `up` again resumes from there.
    /// Returns the revision as persisted at the end of the run.
    pub async fn up(&self) -> Result<Revision> {
        let revisions = self.revisions();
        let mut current = revisions
            .ensure_schema_and_load()
            .await
            .map_err(MigrationError::initialization)?;

        match MigrationStatus::of(&current, self.migrations.len()) {
            MigrationStatus::UpToDate { .. } => {
                tracing::info!(
                    current_revision = current.version,
                    "Store is up to date, there are no migrations to run"
                );
                return Ok(current);
            }
            MigrationStatus::Ahead { current: version, known } => {
                tracing::warn!(
                    current_revision = version,
                    known,
                    "Store revision is ahead of the migration list, nothing to run"
                );
                return Ok(current);
            }
            MigrationStatus::Pending { pending, target, .. } => {
                tracing::info!(
                    current_revision = current.version,
                    target_revision = target,
                    pending,
                    "Current store revision"
                );
            }
        }

        if self.config.lock {
            current = revisions
                .acquire_lock(self.config.stale_lock_after())
                .await?;

            let outcome = self.apply_pending(&revisions, &mut current).await;
            if let Err(e) = revisions.release_lock(&mut current).await {
                if outcome.is_ok() {
                    return Err(e);
                }
                tracing::error!("Failed to release revision lock after failed run: {}", e);
            }
            outcome?;
        } else {
            self.apply_pending(&revisions, &mut current).await?;
        }

        tracing::info!(
            current_revision = current.version,
            "Completed migrations"
        );
        Ok(current)
    }

    async fn apply_pending(
        &self,
        revisions: &RevisionStore<'_>,
        current: &mut Revision,
    ) -> Result<()> {
        let first_pending = current.applied_count();

        for (index, migration) in self.migrations.iter().enumerate().skip(first_pending) {
            tracing::info!(revision = index, name = ?migration.name, "Running migration");
            let started = Instant::now();

            self.execute(index, migration).await?;

            tracing::info!(
                revision = index,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Completed migration"
            );

            // Only adopt the new version once it is recorded
            let mut next = current.clone();
            next.advance(index, Utc::now());
            if let Err(e) = revisions.save(&next).await {
                tracing::error!(
                    revision = index,
                    "Migration {} was applied but could not be recorded",
                    migration.label(index)
                );
                return Err(e);
            }
            *current = next;
        }

        Ok(())
    }

    /// Run one migration: its structural change first, then its transform.
    ///
    /// The two phases are not atomic. A structural change whose transform
    /// fails stays applied and is applied again on the next run.
    pub async fn execute(&self, index: usize, migration: &Migration) -> Result<()> {
        if let Some(op) = &migration.structural {
            if let Err(e) = self.store.alter(op).await {
                tracing::error!(revision = index, "Error altering schema: {}", e);
                return Err(MigrationError::Schema {
                    context: format!("migration {}", migration.label(index)),
                    source: e,
                });
            }
        }

        if let Some(transform) = &migration.transform {
            let mut txn = self.store.new_txn().await.map_err(|e| {
                tracing::error!(revision = index, "Error opening migration transaction: {}", e);
                MigrationError::Transform {
                    index,
                    source: e.into(),
                }
            })?;

            let result = transform(txn.as_mut()).await;
            if let Err(e) = txn.discard().await {
                tracing::warn!(revision = index, "Error discarding migration transaction: {}", e);
            }

            if let Err(e) = result {
                tracing::error!(revision = index, "Error running migration transform: {:#}", e);
                return Err(MigrationError::Transform { index, source: e });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RunnerConfig;
    use crate::models::revision::DEFAULT_REVISION_ID;
    use crate::providers::testing::{Call, Faults, RecordingStore};
    use crate::providers::traits::{Mutation, Query, SchemaOperation};
    use serde_json::Value;

    /// Creates table `t{index}` and logs its index into `applied`
    fn tracked(index: usize) -> Migration {
        Migration::new()
            .with_name(format!("create_t{}", index))
            .with_schema(SchemaOperation::Raw(format!(
                "CREATE TABLE IF NOT EXISTS applied (idx INTEGER); \
                 CREATE TABLE IF NOT EXISTS t{} (id INTEGER);",
                index
            )))
            .with_transform(move |txn| {
                Box::pin(async move {
                    txn.mutate(&Mutation::raw(format!(
                        "INSERT INTO applied (idx) VALUES ({})",
                        index
                    )))
                    .await?;
                    txn.commit().await?;
                    Ok::<(), anyhow::Error>(())
                })
            })
    }

    fn tracked_list(count: usize) -> Vec<Migration> {
        (0..count).map(tracked).collect()
    }

    fn runner(store: &RecordingStore, migrations: Vec<Migration>) -> MigrationRunner {
        MigrationRunner::new(Arc::new(store.clone()), migrations)
    }

    async fn seed_version(store: &RecordingStore, version: i64) {
        let revisions = RevisionStore::new(store, DEFAULT_REVISION_ID);
        let mut rev = revisions.ensure_schema_and_load().await.unwrap();
        rev.version = version;
        rev.applied_at = Some(Utc::now());
        revisions.save(&rev).await.unwrap();
        store.clear_calls();
    }

    async fn persisted_version(store: &RecordingStore) -> i64 {
        RevisionStore::new(store, DEFAULT_REVISION_ID)
            .load()
            .await
            .unwrap()
            .version
    }

    async fn applied_order(store: &RecordingStore) -> Vec<i64> {
        let mut txn = store.new_read_only_txn().await.unwrap();
        let response = txn
            .query(&Query::Raw(
                "SELECT idx FROM applied ORDER BY rowid".to_string(),
            ))
            .await
            .unwrap();
        txn.discard().await.unwrap();

        let body: Value = serde_json::from_slice(&response.json).unwrap();
        body["rows"]
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["idx"].as_i64().unwrap())
            .collect()
    }

    fn bootstrap_calls() -> Vec<Call> {
        vec![
            Call::Alter("define Revision".to_string()),
            Call::NewReadOnlyTxn,
            Call::Query,
            Call::Discard,
        ]
    }

    #[test]
    fn test_status_of_revision() {
        let mut rev = Revision::initial(1);
        assert_eq!(
            MigrationStatus::of(&rev, 3),
            MigrationStatus::Pending {
                current: -1,
                target: 2,
                pending: 3
            }
        );
        assert_eq!(
            MigrationStatus::of(&rev, 0),
            MigrationStatus::UpToDate { version: -1 }
        );

        rev.version = 2;
        assert_eq!(
            MigrationStatus::of(&rev, 3),
            MigrationStatus::UpToDate { version: 2 }
        );
        assert_eq!(
            MigrationStatus::of(&rev, 2),
            MigrationStatus::Ahead {
                current: 2,
                known: 2
            }
        );
        assert_eq!(MigrationStatus::of(&rev, 5).pending(), 2);
    }

    #[tokio::test]
    async fn test_up_applies_all_in_order_on_empty_store() {
        let store = RecordingStore::new();

        let rev = runner(&store, tracked_list(3)).up().await.unwrap();

        assert_eq!(rev.version, 2);
        assert_eq!(persisted_version(&store).await, 2);
        assert_eq!(applied_order(&store).await, vec![0, 1, 2]);

        let alters = store.raw_alters();
        assert_eq!(alters.len(), 3);
        for (i, sql) in alters.iter().enumerate() {
            assert!(sql.contains(&format!("t{} ", i)));
        }
    }

    #[tokio::test]
    async fn test_up_resumes_after_recorded_version() {
        let store = RecordingStore::new();
        seed_version(&store, 1).await;

        let rev = runner(&store, tracked_list(3)).up().await.unwrap();

        assert_eq!(rev.version, 2);
        assert_eq!(applied_order(&store).await, vec![2]);
        assert_eq!(store.raw_alters().len(), 1);
        assert!(store.raw_alters()[0].contains("t2 "));
    }

    #[tokio::test]
    async fn test_up_to_date_makes_no_further_calls() {
        let store = RecordingStore::new();
        seed_version(&store, 1).await;

        let rev = runner(&store, tracked_list(2)).up().await.unwrap();

        assert_eq!(rev.version, 1);
        assert_eq!(store.calls(), bootstrap_calls());
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let store = RecordingStore::new();
        let runner = runner(&store, tracked_list(3));

        runner.up().await.unwrap();
        store.clear_calls();
        let rev = runner.up().await.unwrap();

        assert_eq!(rev.version, 2);
        assert_eq!(store.calls(), bootstrap_calls());
        assert_eq!(applied_order(&store).await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_default_bootstrap_then_first_migration() {
        let store = RecordingStore::new();
        let runner = runner(&store, tracked_list(1));

        assert_eq!(
            runner.status().await.unwrap(),
            MigrationStatus::Pending {
                current: -1,
                target: 0,
                pending: 1
            }
        );
        assert_eq!(store.count(&Call::Mutate), 0);

        runner.up().await.unwrap();
        assert_eq!(persisted_version(&store).await, 0);
        assert_eq!(
            runner.status().await.unwrap(),
            MigrationStatus::UpToDate { version: 0 }
        );
    }

    #[tokio::test]
    async fn test_schema_failure_stops_the_run() {
        let store = RecordingStore::new();
        store.set_faults(Faults {
            alter_containing: Some("t1 ".to_string()),
            ..Faults::default()
        });
        let runner = runner(&store, tracked_list(3));

        let err = runner.up().await.unwrap_err();
        assert!(matches!(err, MigrationError::Schema { .. }));
        assert!(err.to_string().contains("create_t1"));

        assert_eq!(persisted_version(&store).await, 0);
        assert_eq!(applied_order(&store).await, vec![0]);
        // Index 2 was never attempted
        assert!(store.raw_alters().iter().all(|sql| !sql.contains("t2 ")));

        store.set_faults(Faults::default());
        let rev = runner.up().await.unwrap();
        assert_eq!(rev.version, 2);
        assert_eq!(applied_order(&store).await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_transform_failure_keeps_structure_but_not_progress() {
        let store = RecordingStore::new();
        let mut migrations = tracked_list(1);
        migrations.push(
            Migration::new()
                .with_schema(SchemaOperation::Raw(
                    "CREATE TABLE IF NOT EXISTS half_done (id INTEGER);".to_string(),
                ))
                .with_transform(|txn| {
                    Box::pin(async move {
                        txn.mutate(&Mutation::raw("INSERT INTO half_done (id) VALUES (1)"))
                            .await?;
                        Err::<(), anyhow::Error>(anyhow::anyhow!("transform exploded"))
                    })
                }),
        );
        migrations.push(tracked(2));

        let err = runner(&store, migrations).up().await.unwrap_err();
        match err {
            MigrationError::Transform { index, source } => {
                assert_eq!(index, 1);
                assert!(source.to_string().contains("exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(persisted_version(&store).await, 0);
        assert_eq!(applied_order(&store).await, vec![0]);

        // Structure stays, the uncommitted write was discarded
        let mut txn = store.new_read_only_txn().await.unwrap();
        let response = txn
            .query(&Query::Raw("SELECT COUNT(*) AS n FROM half_done".to_string()))
            .await
            .unwrap();
        drop(txn);
        let body: Value = serde_json::from_slice(&response.json).unwrap();
        assert_eq!(body["rows"][0]["n"], 0);
    }

    #[tokio::test]
    async fn test_transform_transaction_is_always_discarded() {
        let store = RecordingStore::new();
        let migrations = vec![Migration::new().with_transform(|txn| {
            Box::pin(async move {
                txn.mutate(&Mutation::raw(
                    "CREATE TABLE scratch (id INTEGER); INSERT INTO scratch VALUES (1);",
                ))
                .await?;
                // No commit: the write must not survive
                Ok::<(), anyhow::Error>(())
            })
        })];

        store.clear_calls();
        let rev = runner(&store, migrations).up().await.unwrap();
        assert_eq!(rev.version, 0);

        let calls = store.calls();
        let txn_start = calls.iter().position(|c| *c == Call::NewTxn).unwrap();
        assert_eq!(calls[txn_start + 1], Call::Mutate);
        assert_eq!(calls[txn_start + 2], Call::Discard);

        let mut txn = store.new_read_only_txn().await.unwrap();
        assert!(txn
            .query(&Query::Raw("SELECT * FROM scratch".to_string()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_noop_migration_advances_revision() {
        let store = RecordingStore::new();
        let rev = runner(&store, vec![Migration::new(), Migration::new()])
            .up()
            .await
            .unwrap();

        assert_eq!(rev.version, 1);
        assert_eq!(persisted_version(&store).await, 1);
        assert!(store.raw_alters().is_empty());
        assert_eq!(store.count(&Call::Mutate), 2);
    }

    #[tokio::test]
    async fn test_list_shorter_than_revision_is_a_noop() {
        let store = RecordingStore::new();
        seed_version(&store, 4).await;

        let runner = runner(&store, tracked_list(2));
        let rev = runner.up().await.unwrap();

        assert_eq!(rev.version, 4);
        assert_eq!(store.calls(), bootstrap_calls());
        assert_eq!(
            runner.status().await.unwrap(),
            MigrationStatus::Ahead {
                current: 4,
                known: 2
            }
        );
    }

    #[tokio::test]
    async fn test_revision_write_failure_is_fatal() {
        let store = RecordingStore::new();
        let migrations = vec![
            Migration::new().with_schema(SchemaOperation::Raw(
                "CREATE TABLE IF NOT EXISTS first (id INTEGER);".to_string(),
            )),
            Migration::new().with_schema(SchemaOperation::Raw(
                "CREATE TABLE IF NOT EXISTS second (id INTEGER);".to_string(),
            )),
        ];
        store.set_faults(Faults {
            mutations: true,
            ..Faults::default()
        });

        let err = runner(&store, migrations).up().await.unwrap_err();
        assert!(matches!(err, MigrationError::Mutation(_)));
        assert_eq!(store.raw_alters().len(), 1);

        store.set_faults(Faults::default());
        assert_eq!(persisted_version(&store).await, -1);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_initialization_error() {
        let store = RecordingStore::new();
        store.set_faults(Faults {
            alter_containing: Some("Revision".to_string()),
            ..Faults::default()
        });

        let err = runner(&store, tracked_list(2)).up().await.unwrap_err();
        match err {
            MigrationError::Initialization(inner) => {
                assert!(matches!(*inner, MigrationError::Schema { .. }))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_locked_run_releases_lock() {
        let store = RecordingStore::new();
        let config = RunnerConfig {
            lock: true,
            ..RunnerConfig::default()
        };

        let rev = runner(&store, tracked_list(2))
            .with_config(config)
            .up()
            .await
            .unwrap();

        assert_eq!(rev.version, 1);
        assert!(!rev.locked);
        let stored = RevisionStore::new(&store, DEFAULT_REVISION_ID)
            .load()
            .await
            .unwrap();
        assert!(!stored.locked);
        assert!(stored.locked_at.is_none());
    }

    #[tokio::test]
    async fn test_locked_run_refuses_held_lock() {
        let store = RecordingStore::new();
        let revisions = RevisionStore::new(&store, DEFAULT_REVISION_ID);
        revisions.ensure_schema_and_load().await.unwrap();
        revisions.acquire_lock(None).await.unwrap();
        store.clear_calls();

        let config = RunnerConfig {
            lock: true,
            ..RunnerConfig::default()
        };
        let err = runner(&store, tracked_list(2))
            .with_config(config)
            .up()
            .await
            .unwrap_err();

        assert!(matches!(err, MigrationError::Locked { .. }));
        assert!(store.raw_alters().is_empty());
        assert_eq!(persisted_version(&store).await, -1);
    }

    #[tokio::test]
    async fn test_locked_run_releases_lock_after_failure() {
        let store = RecordingStore::new();
        store.set_faults(Faults {
            alter_containing: Some("t1 ".to_string()),
            ..Faults::default()
        });
        let config = RunnerConfig {
            lock: true,
            ..RunnerConfig::default()
        };

        let err = runner(&store, tracked_list(2))
            .with_config(config)
            .up()
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Schema { .. }));

        let stored = RevisionStore::new(&store, DEFAULT_REVISION_ID)
            .load()
            .await
            .unwrap();
        assert_eq!(stored.version, 0);
        assert!(!stored.locked);
    }

    #[tokio::test]
    async fn test_lock_fields_stay_dormant_by_default() {
        let store = RecordingStore::new();
        runner(&store, tracked_list(1)).up().await.unwrap();

        let stored = RevisionStore::new(&store, DEFAULT_REVISION_ID)
            .load()
            .await
            .unwrap();
        assert!(!stored.locked);
        assert!(stored.locked_at.is_none());
    }

    #[tokio::test]
    async fn test_custom_revision_identity() {
        let store = RecordingStore::new();
        let config = RunnerConfig {
            revision_id: 42,
            ..RunnerConfig::default()
        };

        runner(&store, tracked_list(2))
            .with_config(config)
            .up()
            .await
            .unwrap();

        assert_eq!(persisted_version(&store).await, -1);
        assert_eq!(
            RevisionStore::new(&store, 42).load().await.unwrap().version,
            1
        );
    }
}
