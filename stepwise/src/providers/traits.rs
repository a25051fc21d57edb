use crate::utils::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage class of a declared field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Int,
    Bool,
    DateTime,
    Text,
}

/// One field of a declared type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    /// Build a lookup index on this field
    pub index: bool,
    /// Field identifies a record: writes keyed by it replace instead of duplicating
    pub upsert: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            index: false,
            upsert: false,
        }
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }
}

/// A named record type and its fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

/// Structural change applied through [`Store::alter`].
///
/// Alterations must be idempotent: the same operation may be applied again
/// after a crash between the alteration and the revision write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaOperation {
    DefineType(TypeDef),
    /// Store-native schema text, passed through untouched
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Records of `type_name` whose `field` equals `value`, answered as
    /// `{ "<alias>": [record, ...] }`
    Eq {
        alias: String,
        type_name: String,
        field: String,
        value: serde_json::Value,
    },
    /// Store-native read, answered as `{ "rows": [record, ...] }`
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationKind {
    /// Upsert keyed by `key`, writing only the fields present in `document`
    Set {
        type_name: String,
        key: String,
        document: serde_json::Map<String, serde_json::Value>,
    },
    /// Store-native write
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub kind: MutationKind,
    /// Commit the transaction as soon as the write succeeds
    pub commit_now: bool,
}

impl Mutation {
    pub fn set(
        type_name: impl Into<String>,
        key: impl Into<String>,
        document: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            kind: MutationKind::Set {
                type_name: type_name.into(),
                key: key.into(),
                document,
            },
            commit_now: false,
        }
    }

    pub fn raw(statement: impl Into<String>) -> Self {
        Self {
            kind: MutationKind::Raw(statement.into()),
            commit_now: false,
        }
    }

    pub fn commit_now(mut self) -> Self {
        self.commit_now = true;
        self
    }
}

/// Raw JSON answer of a query or mutation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub json: Vec<u8>,
}

/// A unit of work against a store.
///
/// A transaction that is neither committed nor discarded is rolled back when
/// it is dropped.
#[async_trait]
pub trait Transaction: Send {
    /// Run a read
    async fn query(&mut self, query: &Query) -> StoreResult<Response>;

    /// Run a write; finishes the transaction when the mutation commits now
    async fn mutate(&mut self, mutation: &Mutation) -> StoreResult<Response>;

    async fn commit(&mut self) -> StoreResult<()>;

    /// Roll back unless already finished. Calling it on a finished
    /// transaction is a no-op.
    async fn discard(&mut self) -> StoreResult<()>;
}

/// Capabilities the migration core needs from a transactional store
#[async_trait]
pub trait Store: Send + Sync {
    /// Get the name of this store
    fn name(&self) -> &str;

    /// Apply a structural change outside any transaction
    async fn alter(&self, op: &SchemaOperation) -> StoreResult<()>;

    /// Open a read-write transaction
    async fn new_txn(&self) -> StoreResult<Box<dyn Transaction>>;

    /// Open a read-only transaction
    async fn new_read_only_txn(&self) -> StoreResult<Box<dyn Transaction>>;
}
