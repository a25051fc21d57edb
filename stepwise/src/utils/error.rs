use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by a store provider while serving a capability call.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Transaction is read-only")]
    ReadOnly,

    #[error("Transaction already finished")]
    Finished,

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Unknown field {field} on type {type_name}")]
    UnknownField { type_name: String, field: String },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Schema alteration failed ({context}): {source}")]
    Schema {
        context: String,
        #[source]
        source: StoreError,
    },

    #[error("Revision query failed: {0}")]
    Query(#[source] StoreError),

    #[error("Revision payload could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Revision mutation failed: {0}")]
    Mutation(#[source] StoreError),

    #[error("Transform of migration {index} failed: {source}")]
    Transform {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("Migration bootstrap failed: {0}")]
    Initialization(#[source] Box<MigrationError>),

    #[error("Revision is locked by another runner (locked at {locked_at:?})")]
    Locked { locked_at: Option<DateTime<Utc>> },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl MigrationError {
    /// Wraps a bootstrap failure, leaving already wrapped errors alone.
    pub fn initialization(error: MigrationError) -> Self {
        match error {
            MigrationError::Initialization(_) => error,
            other => MigrationError::Initialization(Box::new(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;
