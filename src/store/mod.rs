//! Document store the cache reads through.
//!
//! Collections hold JSON documents keyed by id. Queries support field
//! filters, a single ordering field (ties broken by id), a limit and a
//! start-after cursor. Both adapters share the evaluation in `eval`.

mod eval;
mod memory;
mod sqlite;

use async_trait::async_trait;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Document body.
pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id: String,
  pub data: Fields,
}

impl Document {
  pub fn new(id: impl Into<String>, data: Fields) -> Self {
    Self {
      id: id.into(),
      data,
    }
  }

  /// Build a document from a JSON object. Non-object values yield an empty body.
  pub fn from_value(id: impl Into<String>, value: Value) -> Self {
    let data = match value {
      Value::Object(map) => map,
      _ => Map::new(),
    };
    Self::new(id, data)
  }

  /// Look up a field by dotted path (`"company.name"`).
  pub fn field(&self, path: &str) -> Option<&Value> {
    let mut parts = path.split('.');
    let mut current = self.data.get(parts.next()?)?;
    for part in parts {
      current = current.as_object()?.get(part)?;
    }
    Some(current)
  }

  pub fn str_field(&self, path: &str) -> Option<&str> {
    self.field(path).and_then(Value::as_str)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
  Eq,
  Ne,
  Lt,
  Lte,
  Gt,
  Gte,
  In,
  ArrayContains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
  pub field: String,
  pub op: FilterOp,
  pub value: Value,
}

impl Filter {
  pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
    Self {
      field: field.into(),
      op,
      value: value.into(),
    }
  }

  pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::new(field, FilterOp::Eq, value)
  }

  pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
    Self::new(field, FilterOp::In, Value::Array(values))
  }

  pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::new(field, FilterOp::ArrayContains, value)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  Asc,
  Desc,
}

impl Direction {
  pub fn as_str(&self) -> &'static str {
    match self {
      Direction::Asc => "asc",
      Direction::Desc => "desc",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
  pub field: String,
  pub direction: Direction,
}

impl OrderBy {
  pub fn asc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: Direction::Asc,
    }
  }

  pub fn desc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: Direction::Desc,
    }
  }
}

/// Position of a document in an ordered result: its ordering value and id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocCursor {
  pub order_value: Value,
  pub id: String,
}

impl DocCursor {
  pub fn from_document(doc: &Document, order: Option<&OrderBy>) -> Self {
    let order_value = order
      .and_then(|o| doc.field(&o.field).cloned())
      .unwrap_or(Value::Null);
    Self {
      order_value,
      id: doc.id.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
  pub collection: String,
  pub filters: Vec<Filter>,
  pub order_by: Option<OrderBy>,
  pub limit: Option<usize>,
  pub start_after: Option<DocCursor>,
}

impl Query {
  pub fn collection(name: impl Into<String>) -> Self {
    Self {
      collection: name.into(),
      filters: Vec::new(),
      order_by: None,
      limit: None,
      start_after: None,
    }
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn order_by(mut self, order: OrderBy) -> Self {
    self.order_by = Some(order);
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn start_after(mut self, cursor: Option<DocCursor>) -> Self {
    self.start_after = cursor;
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
  pub items: Vec<Document>,
  /// Start-after position of the final item, if any
  #[serde(skip)]
  pub last_cursor: Option<DocCursor>,
  pub size: usize,
}

/// Async document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
  async fn query(&self, query: Query) -> Result<QueryResult>;

  async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

  /// Insert or replace a document.
  async fn put(&self, collection: &str, doc: Document) -> Result<()>;

  /// Returns whether a document was removed.
  async fn delete(&self, collection: &str, id: &str) -> Result<bool>;
}
