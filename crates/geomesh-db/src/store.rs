//! Durable record storage.
//!
//! [`RecordStore`] is the seam between the real-time core and persistence.
//! Every entity kind shares one `records` table keyed by `(kind, record_id)`
//! with its fields stored as a JSON object, so new kinds need no migration.

use crate::DbPool;
use geomesh_types::JsonMap;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during record operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The row's fields are not valid JSON or not an object.
    #[error("stored record {kind}/{id} is not a JSON object")]
    CorruptRecord { kind: String, id: String },
}

/// One stored entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub kind: String,
    pub id: String,
    pub fields: JsonMap,
    /// Creation timestamp (SQLite `datetime`, UTC).
    pub created_at: String,
    pub updated_at: String,
}

/// Equality constraints on top-level record fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `field == value` constraint.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

/// Durable storage for entity records.
///
/// Implementations are blocking; async callers wrap calls in
/// `tokio::task::spawn_blocking`.
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces the fields of `kind/id`, returning the stored row.
    fn save(&self, kind: &str, id: &str, fields: &JsonMap) -> Result<Record, StoreError>;

    fn find_by_id(&self, kind: &str, id: &str) -> Result<Option<Record>, StoreError>;

    /// Returns up to `limit` records of `kind` matching `filter`, newest first.
    fn find_by_filter(
        &self,
        kind: &str,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;

    /// Deletes `kind/id`. Returns `false` if nothing was stored under that key.
    fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError>;
}

/// [`RecordStore`] backed by the SQLite pool.
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: DbPool,
}

impl SqliteRecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

const SELECT_COLUMNS: &str = "SELECT kind, record_id, fields_json, created_at, updated_at FROM records";

impl RecordStore for SqliteRecordStore {
    fn save(&self, kind: &str, id: &str, fields: &JsonMap) -> Result<Record, StoreError> {
        let conn = self.pool.get()?;
        let fields_json = serde_json::to_string(fields)?;
        conn.execute(
            "INSERT INTO records (kind, record_id, fields_json) VALUES (?1, ?2, ?3)
             ON CONFLICT (kind, record_id) DO UPDATE SET
                fields_json = excluded.fields_json,
                updated_at = datetime('now')",
            params![kind, id, fields_json],
        )?;

        let stored = conn.query_row(
            &format!("{SELECT_COLUMNS} WHERE kind = ?1 AND record_id = ?2"),
            params![kind, id],
            map_row,
        )?;
        into_record(stored)
    }

    fn find_by_id(&self, kind: &str, id: &str) -> Result<Option<Record>, StoreError> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!("{SELECT_COLUMNS} WHERE kind = ?1 AND record_id = ?2"),
            params![kind, id],
            map_row,
        )
        .optional()?
        .map(into_record)
        .transpose()
    }

    fn find_by_filter(
        &self,
        kind: &str,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let conn = self.pool.get()?;

        let mut sql = format!("{SELECT_COLUMNS} WHERE kind = ?1");
        let mut values: Vec<SqlValue> = vec![SqlValue::Text(kind.to_string())];
        for (field, value) in &filter.clauses {
            values.push(SqlValue::Text(json_path(field)));
            let path_idx = values.len();
            values.push(to_sql_value(value));
            sql.push_str(&format!(
                " AND json_extract(fields_json, ?{}) IS ?{}",
                path_idx,
                values.len()
            ));
        }
        values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        sql.push_str(&format!(
            " ORDER BY created_at DESC, id DESC LIMIT ?{}",
            values.len()
        ));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), map_row)?;
        let mut records = Vec::new();
        for row in rows {
            match into_record(row?) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(kind = %kind, error = %e, "skipping unreadable record"),
            }
        }
        Ok(records)
    }

    fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "DELETE FROM records WHERE kind = ?1 AND record_id = ?2",
            params![kind, id],
        )?;
        Ok(changed > 0)
    }
}

type RawRow = (String, String, String, String, String);

fn map_row(row: &Row) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn into_record((kind, id, fields_json, created_at, updated_at): RawRow) -> Result<Record, StoreError> {
    match serde_json::from_str::<Value>(&fields_json) {
        Ok(Value::Object(fields)) => Ok(Record {
            kind,
            id,
            fields,
            created_at,
            updated_at,
        }),
        _ => Err(StoreError::CorruptRecord { kind, id }),
    }
}

/// Builds a JSON path addressing a top-level key, quoting it so keys with
/// dots or spaces are matched literally.
fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', ""))
}

/// Maps a JSON value to the SQL value `json_extract` yields for it.
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
