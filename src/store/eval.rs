//! Query evaluation over an in-memory set of documents.

use std::cmp::Ordering;

use serde_json::Value;

use super::{DocCursor, Direction, Document, Filter, FilterOp, OrderBy, Query, QueryResult};

/// Cross-type rank: null < bool < number < string < array < object.
fn type_rank(value: &Value) -> u8 {
  match value {
    Value::Null => 0,
    Value::Bool(_) => 1,
    Value::Number(_) => 2,
    Value::String(_) => 3,
    Value::Array(_) => 4,
    Value::Object(_) => 5,
  }
}

/// Total order over JSON values.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
  match (a, b) {
    (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
    (Value::Number(x), Value::Number(y)) => {
      let x = x.as_f64().unwrap_or(f64::NAN);
      let y = y.as_f64().unwrap_or(f64::NAN);
      x.total_cmp(&y)
    }
    (Value::String(x), Value::String(y)) => x.cmp(y),
    (Value::Array(x), Value::Array(y)) => {
      for (l, r) in x.iter().zip(y) {
        let ord = compare_values(l, r);
        if ord != Ordering::Equal {
          return ord;
        }
      }
      x.len().cmp(&y.len())
    }
    (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
    _ => type_rank(a).cmp(&type_rank(b)),
  }
}

fn same_type(a: &Value, b: &Value) -> bool {
  type_rank(a) == type_rank(b)
}

fn values_equal(a: &Value, b: &Value) -> bool {
  match (a, b) {
    (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Ordering::Equal,
    _ => a == b,
  }
}

/// Whether `doc` passes `filter`. A missing field never matches.
pub(crate) fn matches(doc: &Document, filter: &Filter) -> bool {
  let Some(field) = doc.field(&filter.field) else {
    return false;
  };
  let target = &filter.value;
  match filter.op {
    FilterOp::Eq => values_equal(field, target),
    FilterOp::Ne => !values_equal(field, target),
    FilterOp::Lt => same_type(field, target) && compare_values(field, target) == Ordering::Less,
    FilterOp::Lte => same_type(field, target) && compare_values(field, target) != Ordering::Greater,
    FilterOp::Gt => same_type(field, target) && compare_values(field, target) == Ordering::Greater,
    FilterOp::Gte => same_type(field, target) && compare_values(field, target) != Ordering::Less,
    FilterOp::In => target
      .as_array()
      .is_some_and(|candidates| candidates.iter().any(|c| values_equal(field, c))),
    FilterOp::ArrayContains => field
      .as_array()
      .is_some_and(|items| items.iter().any(|i| values_equal(i, target))),
  }
}

/// Compare two positions in the direction of `order`.
fn compare_positions(a: &DocCursor, b: &DocCursor, order: Option<&OrderBy>) -> Ordering {
  let ord = compare_values(&a.order_value, &b.order_value).then_with(|| a.id.cmp(&b.id));
  match order.map(|o| o.direction) {
    Some(Direction::Desc) => ord.reverse(),
    _ => ord,
  }
}

/// Evaluate `query` against every document of its collection.
pub(crate) fn run(docs: impl IntoIterator<Item = Document>, query: &Query) -> QueryResult {
  let order = query.order_by.as_ref();

  let mut rows: Vec<(DocCursor, Document)> = docs
    .into_iter()
    .filter(|doc| query.filters.iter().all(|f| matches(doc, f)))
    .map(|doc| (DocCursor::from_document(&doc, order), doc))
    .collect();
  rows.sort_by(|(a, _), (b, _)| compare_positions(a, b, order));

  if let Some(after) = &query.start_after {
    rows.retain(|(pos, _)| compare_positions(pos, after, order) == Ordering::Greater);
  }
  if let Some(limit) = query.limit {
    rows.truncate(limit);
  }

  let last_cursor = rows.last().map(|(pos, _)| pos.clone());
  let items: Vec<Document> = rows.into_iter().map(|(_, doc)| doc).collect();
  QueryResult {
    size: items.len(),
    items,
    last_cursor,
  }
}
