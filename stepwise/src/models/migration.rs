use crate::providers::traits::{SchemaOperation, Transaction};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Data transform run inside a dedicated read-write transaction.
///
/// The transform commits whatever it wants to keep; the transaction is
/// discarded once it returns.
pub type TransformFn = Arc<
    dyn for<'t> Fn(&'t mut dyn Transaction) -> BoxFuture<'t, anyhow::Result<()>> + Send + Sync,
>;

/// One step of an ordered migration list. Its position in the list is its
/// version.
#[derive(Clone, Default)]
pub struct Migration {
    pub name: Option<String>,
    pub structural: Option<SchemaOperation>,
    pub transform: Option<TransformFn>,
}

impl Migration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_schema(mut self, op: SchemaOperation) -> Self {
        self.structural = Some(op);
        self
    }

    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: for<'t> Fn(&'t mut dyn Transaction) -> BoxFuture<'t, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Neither a structural change nor a transform
    pub fn is_noop(&self) -> bool {
        self.structural.is_none() && self.transform.is_none()
    }

    pub fn label(&self, index: usize) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", index, name),
            None => index.to_string(),
        }
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("name", &self.name)
            .field("structural", &self.structural)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}
