//! SQLite-backed document store.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use super::{eval, Document, DocumentStore, Fields, Filter, FilterOp, Query, QueryResult};

/// Integers beyond this magnitude are compared as floats in memory, so their
/// equality filters stay out of SQL.
const MAX_EXACT_INT: u64 = 1 << 53;

/// Documents persisted as JSON rows, one table for every collection.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open document database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }

  /// Rows of the query's collection that can match it. Equality filters on
  /// strings, booleans and integers run in SQL; everything else, plus the exact
  /// comparison, is left to the in-memory evaluator.
  fn load_candidates(&self, query: &Query) -> Result<Vec<Document>> {
    let mut sql = String::from("SELECT id, data FROM documents WHERE collection = ?");
    let mut args = vec![SqlValue::Text(query.collection.clone())];
    for filter in &query.filters {
      if let Some(arg) = sql_equality(filter) {
        sql.push_str(&format!(" AND json_extract(data, '$.{}') = ?", filter.field));
        args.push(arg);
      }
    }

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params_from_iter(args.iter()), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })
      .map_err(|e| eyre!("Failed to query {}: {}", query.collection, e))?;

    let mut docs = Vec::new();
    for row in rows {
      let (id, data) = row.map_err(|e| eyre!("Failed to read row: {}", e))?;
      docs.push(decode(id, &data)?);
    }
    Ok(docs)
  }
}

/// SQL argument for an equality filter that can be pushed into the query, if
/// any. Only plain dotted paths are embedded in the JSON path literal.
fn sql_equality(filter: &Filter) -> Option<SqlValue> {
  if filter.op != FilterOp::Eq || !is_plain_path(&filter.field) {
    return None;
  }
  match &filter.value {
    Value::String(s) => Some(SqlValue::Text(s.clone())),
    Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
    Value::Number(n) => n
      .as_i64()
      .filter(|i| i.unsigned_abs() <= MAX_EXACT_INT)
      .map(SqlValue::Integer),
    _ => None,
  }
}

fn is_plain_path(field: &str) -> bool {
  field.split('.').all(|segment| {
    !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
  })
}

fn decode(id: String, data: &str) -> Result<Document> {
  let fields: Fields = serde_json::from_str(data)
    .map_err(|e| eyre!("Failed to deserialize document {}: {}", id, e))?;
  Ok(Document::new(id, fields))
}

#[async_trait]
impl DocumentStore for SqliteStore {
  async fn query(&self, query: Query) -> Result<QueryResult> {
    let docs = self.load_candidates(&query)?;
    Ok(eval::run(docs, &query))
  }

  async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let data: Option<String> = conn
      .query_row(
        "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
        params![collection, id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to get document: {}", e))?;

    data.map(|d| decode(id.to_string(), &d)).transpose()
  }

  async fn put(&self, collection: &str, doc: Document) -> Result<()> {
    let data =
      serde_json::to_string(&doc.data).map_err(|e| eyre!("Failed to serialize document: {}", e))?;

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO documents (collection, id, data, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))",
        params![collection, doc.id, data],
      )
      .map_err(|e| eyre!("Failed to store document: {}", e))?;

    Ok(())
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let changed = conn
      .execute(
        "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
        params![collection, id],
      )
      .map_err(|e| eyre!("Failed to delete document: {}", e))?;

    Ok(changed > 0)
  }
}

/// Schema for the document table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
"#;
