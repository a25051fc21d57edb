use crate::models::migration::Migration;
use crate::providers::traits::{Mutation, SchemaOperation};
use crate::utils::error::Result;
use std::path::{Path, PathBuf};

const SQL_EXTENSION: &str = "sql";
const DATA_SUFFIX: &str = ".data";

/// Build a migration list from the `*.sql` files of a directory.
///
/// Files run in file-name order, so prefix them with a zero-padded sequence
/// number (`0001_create_users.sql`). A file named `*.data.sql` is a data
/// transform: its SQL runs in the migration's transaction and is committed.
/// Any other file is a structural change.
pub fn load_sql_dir(dir: &Path) -> Result<Vec<Migration>> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_sql = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(SQL_EXTENSION));
        if path.is_file() && is_sql {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let mut migrations = Vec::with_capacity(files.len());
    for path in files {
        let sql = std::fs::read_to_string(&path)?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let migration = match stem.strip_suffix(DATA_SUFFIX) {
            Some(name) => data_migration(name, sql),
            None => Migration::new()
                .with_name(stem.clone())
                .with_schema(SchemaOperation::Raw(sql)),
        };

        tracing::debug!("Loaded migration {} from {}", migrations.len(), path.display());
        migrations.push(migration);
    }

    tracing::info!("Loaded {} migration(s) from {}", migrations.len(), dir.display());
    Ok(migrations)
}

fn data_migration(name: &str, sql: String) -> Migration {
    let mutation = Mutation::raw(sql);

    Migration::new()
        .with_name(name)
        .with_transform(move |txn| {
            let mutation = mutation.clone();
            Box::pin(async move {
                txn.mutate(&mutation).await?;
                txn.commit().await?;
                Ok::<(), anyhow::Error>(())
            })
        })
}
