//! Store wrapper for tests: records every capability call and injects faults.

use crate::providers::sqlite::SqliteStore;
use crate::providers::traits::{
    Mutation, Query, Response, SchemaOperation, Store, StoreResult, Transaction,
};
use crate::utils::error::StoreError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Alter(String),
    NewTxn,
    NewReadOnlyTxn,
    Query,
    Mutate,
    Commit,
    Discard,
}

#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// Fail alterations whose description contains this text
    pub alter_containing: Option<String>,
    pub queries: bool,
    pub mutations: bool,
}

#[derive(Clone)]
pub struct RecordingStore {
    inner: Arc<SqliteStore>,
    calls: Arc<Mutex<Vec<Call>>>,
    faults: Arc<Mutex<Faults>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::wrap(SqliteStore::open_in_memory().unwrap())
    }

    pub fn wrap(inner: SqliteStore) -> Self {
        Self {
            inner: Arc::new(inner),
            calls: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Raw schema payloads applied so far, in order
    pub fn raw_alters(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Alter(desc) if !desc.starts_with("define ") => Some(desc),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock().unwrap() = faults;
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn wrap_txn(&self, inner: Box<dyn Transaction>) -> Box<dyn Transaction> {
        Box::new(RecordingTransaction {
            inner,
            calls: self.calls.clone(),
            faults: self.faults.clone(),
        })
    }
}

fn describe(op: &SchemaOperation) -> String {
    match op {
        SchemaOperation::DefineType(def) => format!("define {}", def.name),
        SchemaOperation::Raw(sql) => sql.clone(),
    }
}

fn injected() -> StoreError {
    StoreError::InvalidDocument("injected fault".to_string())
}

#[async_trait]
impl Store for RecordingStore {
    fn name(&self) -> &str {
        "recording"
    }

    async fn alter(&self, op: &SchemaOperation) -> StoreResult<()> {
        let desc = describe(op);
        self.record(Call::Alter(desc.clone()));

        let fail = self
            .faults
            .lock()
            .unwrap()
            .alter_containing
            .as_ref()
            .is_some_and(|needle| desc.contains(needle.as_str()));
        if fail {
            return Err(injected());
        }
        self.inner.alter(op).await
    }

    async fn new_txn(&self) -> StoreResult<Box<dyn Transaction>> {
        self.record(Call::NewTxn);
        let txn = self.inner.new_txn().await?;
        Ok(self.wrap_txn(txn))
    }

    async fn new_read_only_txn(&self) -> StoreResult<Box<dyn Transaction>> {
        self.record(Call::NewReadOnlyTxn);
        let txn = self.inner.new_read_only_txn().await?;
        Ok(self.wrap_txn(txn))
    }
}

struct RecordingTransaction {
    inner: Box<dyn Transaction>,
    calls: Arc<Mutex<Vec<Call>>>,
    faults: Arc<Mutex<Faults>>,
}

impl RecordingTransaction {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transaction for RecordingTransaction {
    async fn query(&mut self, query: &Query) -> StoreResult<Response> {
        self.record(Call::Query);
        let fail = self.faults.lock().unwrap().queries;
        if fail {
            return Err(injected());
        }
        self.inner.query(query).await
    }

    async fn mutate(&mut self, mutation: &Mutation) -> StoreResult<Response> {
        self.record(Call::Mutate);
        let fail = self.faults.lock().unwrap().mutations;
        if fail {
            return Err(injected());
        }
        self.inner.mutate(mutation).await
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.record(Call::Commit);
        self.inner.commit().await
    }

    async fn discard(&mut self) -> StoreResult<()> {
        self.record(Call::Discard);
        self.inner.discard().await
    }
}
