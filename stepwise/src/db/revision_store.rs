// Persistence of the revision record that tracks migration progress

use crate::models::revision::{tracking_schema, Revision, FIELD_ID, REVISION_TYPE};
use crate::providers::traits::{Mutation, Query, Response, Store, Transaction};
use crate::utils::error::{MigrationError, Result, StoreError};
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;

const QUERY_ALIAS: &str = "revisions";

#[derive(Debug, Deserialize)]
struct Revisions {
    #[serde(default)]
    revisions: Vec<Revision>,
}

pub struct RevisionStore<'a> {
    store: &'a dyn Store,
    revision_id: i64,
}

impl<'a> RevisionStore<'a> {
    pub fn new(store: &'a dyn Store, revision_id: i64) -> Self {
        Self { store, revision_id }
    }

    pub fn revision_id(&self) -> i64 {
        self.revision_id
    }

    /// Apply the tracking schema, then read the revision record.
    ///
    /// A store without a record yields [`Revision::initial`]; nothing is
    /// written here.
    pub async fn ensure_schema_and_load(&self) -> Result<Revision> {
        if let Err(e) = self.store.alter(&tracking_schema()).await {
            tracing::error!("Error creating revision schema: {}", e);
            return Err(MigrationError::Schema {
                context: "revision tracking schema".to_string(),
                source: e,
            });
        }

        self.load().await
    }

    /// Read the revision record in a read-only transaction
    pub async fn load(&self) -> Result<Revision> {
        let mut txn = self.store.new_read_only_txn().await.map_err(|e| {
            tracing::error!("Error opening transaction for revision lookup: {}", e);
            MigrationError::Query(e)
        })?;

        let result = self.read(txn.as_mut()).await;
        discard(txn.as_mut()).await;

        Ok(result?.unwrap_or_else(|| Revision::initial(self.revision_id)))
    }

    /// Upsert the revision record in its own transaction, committed at once
    pub async fn save(&self, revision: &Revision) -> Result<()> {
        let mut txn = self.store.new_txn().await.map_err(|e| {
            tracing::error!("Error opening transaction for revision update: {}", e);
            MigrationError::Mutation(e)
        })?;

        let result = self.write(txn.as_mut(), revision).await;
        discard(txn.as_mut()).await;

        let response = result?;
        tracing::info!(
            revision = revision.version,
            response = %String::from_utf8_lossy(&response.json),
            "Updated current revision"
        );
        Ok(())
    }

    /// Take the revision lock, creating the record if needed.
    ///
    /// The read and the write happen in one read-write transaction, so two
    /// runners cannot both observe the record unlocked. A held lock is taken
    /// over only when it is older than `stale_after`.
    pub async fn acquire_lock(&self, stale_after: Option<Duration>) -> Result<Revision> {
        let mut txn = self.store.new_txn().await.map_err(|e| {
            tracing::error!("Error opening transaction for revision lock: {}", e);
            MigrationError::Mutation(e)
        })?;

        let result = self.lock_in(txn.as_mut(), stale_after).await;
        discard(txn.as_mut()).await;

        let revision = result?;
        tracing::info!(revision = revision.version, "Acquired revision lock");
        Ok(revision)
    }

    /// Clear the lock fields and persist the record
    pub async fn release_lock(&self, revision: &mut Revision) -> Result<()> {
        revision.locked = false;
        revision.locked_at = None;
        self.save(revision).await?;
        tracing::info!(revision = revision.version, "Released revision lock");
        Ok(())
    }

    fn lookup(&self) -> Query {
        Query::Eq {
            alias: QUERY_ALIAS.to_string(),
            type_name: REVISION_TYPE.to_string(),
            field: FIELD_ID.to_string(),
            value: self.revision_id.into(),
        }
    }

    async fn read(&self, txn: &mut dyn Transaction) -> Result<Option<Revision>> {
        let response = txn.query(&self.lookup()).await.map_err(|e| {
            tracing::error!("Error getting current revision: {}", e);
            MigrationError::Query(e)
        })?;

        decode(&response)
    }

    async fn write(&self, txn: &mut dyn Transaction, revision: &Revision) -> Result<Response> {
        let document = match serde_json::to_value(revision) {
            Ok(serde_json::Value::Object(document)) => document,
            Ok(other) => {
                return Err(MigrationError::Mutation(StoreError::InvalidDocument(
                    format!("revision serialized to {}", other),
                )))
            }
            Err(e) => {
                tracing::error!("Error serializing revision: {}", e);
                return Err(MigrationError::Mutation(e.into()));
            }
        };

        let mutation = Mutation::set(REVISION_TYPE, FIELD_ID, document).commit_now();
        txn.mutate(&mutation).await.map_err(|e| {
            tracing::error!("Error updating current revision: {}", e);
            MigrationError::Mutation(e)
        })
    }

    async fn lock_in(
        &self,
        txn: &mut dyn Transaction,
        stale_after: Option<Duration>,
    ) -> Result<Revision> {
        let mut revision = self
            .read(txn)
            .await?
            .unwrap_or_else(|| Revision::initial(self.revision_id));

        let now = Utc::now();
        if revision.locked {
            let stale = match (stale_after, revision.locked_at) {
                (Some(limit), Some(at)) => (now - at)
                    .to_std()
                    .map(|age| age > limit)
                    .unwrap_or(false),
                // Held without a timestamp: its age is unknown
                (Some(_), None) => true,
                (None, _) => false,
            };

            if !stale {
                tracing::warn!(
                    locked_at = ?revision.locked_at,
                    "Revision is locked by another runner"
                );
                return Err(MigrationError::Locked {
                    locked_at: revision.locked_at,
                });
            }

            tracing::warn!(
                locked_at = ?revision.locked_at,
                "Taking over stale revision lock"
            );
        }

        revision.locked = true;
        revision.locked_at = Some(now);
        self.write(txn, &revision).await?;
        Ok(revision)
    }
}

fn decode(response: &Response) -> Result<Option<Revision>> {
    let parsed: Revisions = serde_json::from_slice(&response.json).map_err(|e| {
        tracing::error!("Error decoding revision payload: {}", e);
        MigrationError::Decode(e)
    })?;

    // The store keeps the identity unique; take the first match regardless
    Ok(parsed.revisions.into_iter().next())
}

async fn discard(txn: &mut dyn Transaction) {
    if let Err(e) = txn.discard().await {
        tracing::warn!("Error discarding transaction: {}", e);
    }
}
