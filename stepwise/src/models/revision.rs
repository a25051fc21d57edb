use crate::providers::traits::{FieldDef, FieldKind, SchemaOperation, TypeDef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Identity of the tracking record when none is configured.
pub const DEFAULT_REVISION_ID: i64 = 1;

/// Type name of the tracking record in the target store.
pub const REVISION_TYPE: &str = "Revision";

pub const FIELD_ID: &str = "revision.id";
pub const FIELD_VERSION: &str = "revision.version";
pub const FIELD_APPLIED_AT: &str = "revision.appliedAt";
pub const FIELD_LOCKED: &str = "revision.locked";
pub const FIELD_LOCKED_AT: &str = "revision.lockedAt";

/// Migration progress of one target store.
///
/// `version` is the index of the last migration applied, `-1` when none has
/// been. It only ever moves forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    #[serde(rename = "revision.id")]
    pub id: i64,
    #[serde(rename = "revision.version")]
    pub version: i64,
    #[serde(rename = "revision.appliedAt", default)]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(rename = "revision.locked", default, deserialize_with = "null_as_false")]
    pub locked: bool,
    #[serde(rename = "revision.lockedAt", default)]
    pub locked_at: Option<DateTime<Utc>>,
}

impl Revision {
    /// The record of a store no migration has touched yet
    pub fn initial(id: i64) -> Self {
        Self {
            id,
            version: -1,
            applied_at: None,
            locked: false,
            locked_at: None,
        }
    }

    /// Number of leading migrations already applied
    pub fn applied_count(&self) -> usize {
        usize::try_from(self.version.saturating_add(1)).unwrap_or(0)
    }

    pub fn is_applied(&self, index: usize) -> bool {
        index < self.applied_count()
    }

    /// Record that the migration at `index` has been applied
    pub fn advance(&mut self, index: usize, at: DateTime<Utc>) {
        self.version = index as i64;
        self.applied_at = Some(at);
    }
}

// A column added to an existing table reads back as null
fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// The tracking schema, applied on every startup
pub fn tracking_schema() -> SchemaOperation {
    SchemaOperation::DefineType(TypeDef {
        name: REVISION_TYPE.to_string(),
        fields: vec![
            FieldDef::new(FIELD_ID, FieldKind::Int).indexed().upsert(),
            FieldDef::new(FIELD_VERSION, FieldKind::Int),
            FieldDef::new(FIELD_APPLIED_AT, FieldKind::DateTime),
            FieldDef::new(FIELD_LOCKED, FieldKind::Bool),
            FieldDef::new(FIELD_LOCKED_AT, FieldKind::DateTime),
        ],
    })
}
