use crate::providers::traits::{
    FieldKind, Mutation, MutationKind, Query, Response, SchemaOperation, Store, StoreResult,
    Transaction, TypeDef,
};
use crate::utils::error::StoreError;
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, Params, Statement};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// SQLite-backed store. Types map to tables, fields to columns.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        tracing::debug!("Opened sqlite store at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn alter(&self, op: &SchemaOperation) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        match op {
            SchemaOperation::DefineType(def) => define_type(&conn, def),
            SchemaOperation::Raw(sql) => {
                conn.execute_batch(sql)?;
                Ok(())
            }
        }
    }

    async fn new_txn(&self) -> StoreResult<Box<dyn Transaction>> {
        let txn = SqliteTransaction::begin(self.conn.clone(), false).await?;
        Ok(Box::new(txn))
    }

    async fn new_read_only_txn(&self) -> StoreResult<Box<dyn Transaction>> {
        let txn = SqliteTransaction::begin(self.conn.clone(), true).await?;
        Ok(Box::new(txn))
    }
}

/// Holds the connection for its whole life, so no other transaction or
/// alteration can interleave with it.
pub struct SqliteTransaction {
    conn: OwnedMutexGuard<Connection>,
    read_only: bool,
    open: bool,
}

impl SqliteTransaction {
    async fn begin(conn: Arc<Mutex<Connection>>, read_only: bool) -> StoreResult<Self> {
        let conn = conn.lock_owned().await;
        conn.execute_batch(if read_only {
            "BEGIN DEFERRED"
        } else {
            "BEGIN IMMEDIATE"
        })?;

        Ok(Self {
            conn,
            read_only,
            open: true,
        })
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::Finished)
        }
    }

    fn finish_with_commit(&mut self) -> StoreResult<()> {
        self.open = false;
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            // A failed COMMIT can leave SQLite inside the transaction
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(e.into());
        }
        Ok(())
    }

    fn run_mutation(&self, mutation: &Mutation) -> StoreResult<i64> {
        match &mutation.kind {
            MutationKind::Set {
                type_name,
                key,
                document,
            } => upsert(&self.conn, type_name, key, document),
            MutationKind::Raw(sql) => {
                let before = total_changes(&self.conn)?;
                self.conn.execute_batch(sql)?;
                Ok(total_changes(&self.conn)? - before)
            }
        }
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn query(&mut self, query: &Query) -> StoreResult<Response> {
        self.ensure_open()?;

        let body = match query {
            Query::Eq {
                alias,
                type_name,
                field,
                value,
            } => {
                let records = select_eq(&self.conn, type_name, field, value)?;
                let mut body = Map::new();
                body.insert(alias.clone(), Value::Array(records));
                Value::Object(body)
            }
            Query::Raw(sql) => {
                let mut stmt = self.conn.prepare(sql)?;
                let rows = render_rows(&mut stmt, [], &HashMap::new())?;
                json!({ "rows": rows })
            }
        };

        Ok(Response {
            json: serde_json::to_vec(&body)?,
        })
    }

    async fn mutate(&mut self, mutation: &Mutation) -> StoreResult<Response> {
        self.ensure_open()?;
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }

        let affected = self.run_mutation(mutation)?;
        if mutation.commit_now {
            self.finish_with_commit()?;
        }

        Ok(Response {
            json: serde_json::to_vec(&json!({ "affected": affected }))?,
        })
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.finish_with_commit()
    }

    async fn discard(&mut self) -> StoreResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("Failed to roll back abandoned transaction: {}", e);
            }
        }
    }
}

fn quote_ident(name: &str) -> StoreResult<String> {
    if name.is_empty() || name.contains('"') || name.contains('\0') {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name))
}

fn column_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Int => "INTEGER",
        FieldKind::Bool => "BOOLEAN",
        FieldKind::DateTime => "DATETIME",
        FieldKind::Text => "TEXT",
    }
}

/// Declared column types of a table, keyed by column name. Empty when the
/// table does not exist.
fn column_types(conn: &Connection, table: &str) -> StoreResult<HashMap<String, String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)?))?;
    let columns = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;
    Ok(columns)
}

fn define_type(conn: &Connection, def: &TypeDef) -> StoreResult<()> {
    if def.fields.is_empty() {
        return Err(StoreError::InvalidDocument(format!(
            "type {} declares no fields",
            def.name
        )));
    }

    let table = quote_ident(&def.name)?;
    let columns = def
        .fields
        .iter()
        .map(|f| Ok(format!("{} {}", quote_ident(&f.name)?, column_type(f.kind))))
        .collect::<StoreResult<Vec<_>>>()?;

    conn.execute(
        &format!("CREATE TABLE IF NOT EXISTS {} ({})", table, columns.join(", ")),
        [],
    )?;

    // Re-applying a definition with new fields extends the existing table
    let existing = column_types(conn, &def.name)?;
    for field in &def.fields {
        let column = quote_ident(&field.name)?;
        if !existing.contains_key(&field.name) {
            conn.execute(
                &format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    table,
                    column,
                    column_type(field.kind)
                ),
                [],
            )?;
        }

        if field.upsert {
            let index = quote_ident(&format!("uidx_{}_{}", def.name, field.name))?;
            conn.execute(
                &format!("CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})", index, table, column),
                [],
            )?;
        } else if field.index {
            let index = quote_ident(&format!("idx_{}_{}", def.name, field.name))?;
            conn.execute(
                &format!("CREATE INDEX IF NOT EXISTS {} ON {} ({})", index, table, column),
                [],
            )?;
        }
    }

    Ok(())
}

fn select_eq(
    conn: &Connection,
    type_name: &str,
    field: &str,
    value: &Value,
) -> StoreResult<Vec<Value>> {
    let columns = column_types(conn, type_name)?;
    // Nothing of this type has been declared yet, so nothing can match
    if columns.is_empty() {
        return Ok(Vec::new());
    }
    if !columns.contains_key(field) {
        return Err(StoreError::UnknownField {
            type_name: type_name.to_string(),
            field: field.to_string(),
        });
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {} WHERE {} = ?1",
        quote_ident(type_name)?,
        quote_ident(field)?
    ))?;
    render_rows(&mut stmt, [to_sql_value(value)?], &columns)
}

fn upsert(
    conn: &Connection,
    type_name: &str,
    key: &str,
    document: &Map<String, Value>,
) -> StoreResult<i64> {
    let columns = column_types(conn, type_name)?;
    if columns.is_empty() {
        return Err(StoreError::UnknownType(type_name.to_string()));
    }
    if !document.contains_key(key) {
        return Err(StoreError::InvalidDocument(format!(
            "document for {} is missing key field {}",
            type_name, key
        )));
    }

    let mut names = Vec::with_capacity(document.len());
    let mut values = Vec::with_capacity(document.len());
    for (field, value) in document {
        if !columns.contains_key(field) {
            return Err(StoreError::UnknownField {
                type_name: type_name.to_string(),
                field: field.clone(),
            });
        }
        names.push(quote_ident(field)?);
        values.push(to_sql_value(value)?);
    }

    let key_column = quote_ident(key)?;
    let placeholders = (1..=names.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = names
        .iter()
        .filter(|name| **name != key_column)
        .map(|name| format!("{name} = excluded.{name}"))
        .collect::<Vec<_>>();

    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
        quote_ident(type_name)?,
        names.join(", "),
        placeholders,
        key_column,
        conflict
    );

    let affected = conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(affected as i64)
}

fn total_changes(conn: &Connection) -> StoreResult<i64> {
    Ok(conn.query_row("SELECT total_changes()", [], |row| row.get(0))?)
}

fn to_sql_value(value: &Value) -> StoreResult<SqlValue> {
    let converted = match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                return Err(StoreError::InvalidDocument(format!(
                    "number out of range: {}",
                    n
                )));
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    };
    Ok(converted)
}

fn to_json(value: ValueRef<'_>, declared: &str) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) if declared.eq_ignore_ascii_case("BOOLEAN") => Value::Bool(i != 0),
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

fn render_rows<P: Params>(
    stmt: &mut Statement<'_>,
    params: P,
    declared: &HashMap<String, String>,
) -> StoreResult<Vec<Value>> {
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query(params)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Map::new();
        for (i, name) in names.iter().enumerate() {
            let kind = declared.get(name).map(String::as_str).unwrap_or("");
            record.insert(name.clone(), to_json(row.get_ref(i)?, kind));
        }
        records.push(Value::Object(record));
    }

    Ok(records)
}
