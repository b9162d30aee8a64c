//! Query shapes and the cursors bound to them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::{CacheKey, EntityKind, OwnerScope};
use crate::error::{CacheError, Result};
use crate::store::{DocCursor, Filter, OrderBy, Query};

/// The shape of a paginated query: whose data, which entity, in what order,
/// how many per page. A cursor is only valid for the shape it was issued under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageQuery {
  pub owner: OwnerScope,
  pub kind: EntityKind,
  pub order: OrderBy,
  pub page_size: usize,
}

impl PageQuery {
  /// Page sizes below 1 are raised to 1.
  pub fn new(owner: OwnerScope, kind: EntityKind, order: OrderBy, page_size: usize) -> Self {
    Self {
      owner,
      kind,
      order,
      page_size: page_size.max(1),
    }
  }

  /// Cache key of one page of this query.
  pub fn page_key(&self, position: &str) -> CacheKey {
    let size = self.page_size.to_string();
    CacheKey::page(
      &self.owner,
      self.kind,
      &[self.order.field.as_str(), self.order.direction.as_str(), size.as_str()],
      position,
    )
  }

  /// Store query for the page after `after`, asking for one extra document
  /// to learn whether another page follows.
  pub(crate) fn store_query(&self, owner_field: &str, after: Option<DocCursor>) -> Query {
    Query::collection(self.kind.collection())
      .filter(Filter::eq(owner_field, self.owner.uid()))
      .order_by(self.order.clone())
      .limit(self.page_size + 1)
      .start_after(after)
  }
}

/// Continuation point of a paginated query, carrying the shape it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCursor {
  query: PageQuery,
  position: DocCursor,
}

impl StreamCursor {
  pub(crate) fn new(query: PageQuery, position: DocCursor) -> Self {
    Self { query, position }
  }

  pub fn query(&self) -> &PageQuery {
    &self.query
  }

  pub fn position(&self) -> &DocCursor {
    &self.position
  }

  /// Fail with `InvalidCursor` unless this cursor was issued for `query`.
  pub fn check(&self, query: &PageQuery) -> Result<()> {
    if self.query == *query {
      return Ok(());
    }
    Err(CacheError::InvalidCursor(format!(
      "cursor issued for {}/{} ordered by {} {} with page size {}, used with {}/{} ordered by {} {} with page size {}",
      self.query.owner,
      self.query.kind,
      self.query.order.field,
      self.query.order.direction.as_str(),
      self.query.page_size,
      query.owner,
      query.kind,
      query.order.field,
      query.order.direction.as_str(),
      query.page_size,
    )))
  }

  /// Short stable digest of the position, used in page cache keys.
  pub fn fingerprint(&self) -> String {
    let bytes = serde_json::to_vec(&self.position).unwrap_or_default();
    digest(&bytes)
  }

  /// Export as an opaque token: hex-encoded JSON plus a checksum.
  pub fn to_token(&self) -> String {
    let bytes = serde_json::to_vec(self).unwrap_or_default();
    format!("{}.{}", hex::encode(&bytes), digest(&bytes))
  }

  pub fn from_token(token: &str) -> Result<Self> {
    let invalid = |why: &str| CacheError::InvalidCursor(format!("{} in token {:?}", why, token));

    let (payload, checksum) = token
      .split_once('.')
      .ok_or_else(|| invalid("missing checksum"))?;
    let bytes = hex::decode(payload).map_err(|_| invalid("malformed payload"))?;
    if digest(&bytes) != checksum {
      return Err(invalid("checksum mismatch"));
    }
    serde_json::from_slice(&bytes).map_err(|e| invalid(&format!("undecodable cursor ({})", e)))
  }
}

fn digest(bytes: &[u8]) -> String {
  let hash = Sha256::digest(bytes);
  hex::encode(&hash[..8])
}
