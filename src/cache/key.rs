//! Typed cache keys for tracker entities.
//!
//! Keys render as `user_<uid>_<entity>[_<qualifier>...]`. Every caller-supplied
//! segment is escaped so that `_` only ever appears as a separator, which makes
//! the rendering injective: two different (owner, entity, qualifier) triples can
//! never produce the same string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Entity types the tracker caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
  Applications,
  Resumes,
  Settings,
  Targets,
  Schedules,
}

impl EntityKind {
  pub const ALL: [EntityKind; 5] = [
    EntityKind::Applications,
    EntityKind::Resumes,
    EntityKind::Settings,
    EntityKind::Targets,
    EntityKind::Schedules,
  ];

  /// Fixed key segment and document-store collection name.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Applications => "applications",
      Self::Resumes => "resumes",
      Self::Settings => "settings",
      Self::Targets => "targets",
      Self::Schedules => "schedules",
    }
  }

  pub fn collection(&self) -> &'static str {
    self.as_str()
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let lower = s.trim().to_lowercase();
    EntityKind::ALL
      .into_iter()
      .find(|k| k.as_str() == lower || k.as_str().trim_end_matches('s') == lower)
      .ok_or_else(|| format!("unknown entity type: {}", s))
  }
}

/// Identity that partitions the cache so one user's data never answers
/// another user's request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerScope {
  uid: String,
}

impl OwnerScope {
  pub fn user(uid: impl Into<String>) -> Self {
    Self { uid: uid.into() }
  }

  pub fn uid(&self) -> &str {
    &self.uid
  }

  /// Rendered key prefix, e.g. `user_u1`.
  pub fn prefix(&self) -> String {
    format!("user_{}", escape_segment(&self.uid))
  }
}

impl fmt::Display for OwnerScope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.prefix())
  }
}

/// A cache key.
///
/// Built only through the constructors below; the owner and entity kind are
/// kept next to the rendered string so invalidation can match on them exactly
/// instead of by string prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  rendered: String,
  owner: Option<OwnerScope>,
  kind: Option<EntityKind>,
}

impl CacheKey {
  /// Key for an owner's whole collection of one entity type.
  pub fn collection(owner: &OwnerScope, kind: EntityKind) -> Self {
    Self {
      rendered: format!("{}_{}", owner.prefix(), kind.as_str()),
      owner: Some(owner.clone()),
      kind: Some(kind),
    }
  }

  /// Key for a single record.
  pub fn record(owner: &OwnerScope, kind: EntityKind, id: &str) -> Self {
    Self::qualified(owner, kind, &[id])
  }

  /// Key for one page of a paginated query.
  pub fn page(owner: &OwnerScope, kind: EntityKind, shape: &[&str], position: &str) -> Self {
    let mut parts = Vec::with_capacity(shape.len() + 2);
    parts.push("page");
    parts.extend_from_slice(shape);
    parts.push(position);
    Self::qualified(owner, kind, &parts)
  }

  /// Key outside the entity registry. Resolves to the default TTL.
  pub fn custom(name: &str) -> Self {
    Self {
      rendered: format!("global_{}", escape_segment(name)),
      owner: None,
      kind: None,
    }
  }

  fn qualified(owner: &OwnerScope, kind: EntityKind, qualifiers: &[&str]) -> Self {
    let mut rendered = format!("{}_{}", owner.prefix(), kind.as_str());
    for q in qualifiers {
      rendered.push('_');
      rendered.push_str(&escape_segment(q));
    }
    Self {
      rendered,
      owner: Some(owner.clone()),
      kind: Some(kind),
    }
  }

  pub fn as_str(&self) -> &str {
    &self.rendered
  }

  pub fn owner(&self) -> Option<&OwnerScope> {
    self.owner.as_ref()
  }

  pub fn kind(&self) -> Option<EntityKind> {
    self.kind
  }

  pub fn belongs_to(&self, owner: &OwnerScope) -> bool {
    self.owner.as_ref() == Some(owner)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.rendered)
  }
}

pub fn applications(owner: &OwnerScope) -> CacheKey {
  CacheKey::collection(owner, EntityKind::Applications)
}

pub fn resumes(owner: &OwnerScope) -> CacheKey {
  CacheKey::collection(owner, EntityKind::Resumes)
}

pub fn settings(owner: &OwnerScope) -> CacheKey {
  CacheKey::collection(owner, EntityKind::Settings)
}

pub fn targets(owner: &OwnerScope) -> CacheKey {
  CacheKey::collection(owner, EntityKind::Targets)
}

pub fn schedules(owner: &OwnerScope) -> CacheKey {
  CacheKey::collection(owner, EntityKind::Schedules)
}

/// Escape `%` and `_` so a segment never contains a separator.
pub(crate) fn escape_segment(raw: &str) -> String {
  let mut out = String::with_capacity(raw.len());
  for c in raw.chars() {
    match c {
      '%' => out.push_str("%25"),
      '_' => out.push_str("%5F"),
      other => out.push(other),
    }
  }
  out
}
