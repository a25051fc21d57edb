pub mod sqlite;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use sqlite::SqliteStore;
pub use traits::{
    FieldDef, FieldKind, Mutation, MutationKind, Query, Response, SchemaOperation, Store,
    StoreResult, Transaction, TypeDef,
};
