//! TTL policy table: how long each entity type stays fresh.

use std::collections::HashMap;
use std::time::Duration;

use super::key::{CacheKey, EntityKind};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const APPLICATIONS_TTL: Duration = Duration::from_secs(5 * 60);
pub const RESUMES_TTL: Duration = Duration::from_secs(10 * 60);
pub const SETTINGS_TTL: Duration = Duration::from_secs(15 * 60);
pub const TARGETS_TTL: Duration = Duration::from_secs(10 * 60);
pub const SCHEDULES_TTL: Duration = Duration::from_secs(5 * 60);

/// Maps entity types to their TTL, with a fallback for unregistered keys.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
  default: Duration,
  per_kind: HashMap<EntityKind, Duration>,
}

impl TtlPolicy {
  /// Policy with only a default TTL and no per-entity entries.
  pub fn uniform(default: Duration) -> Self {
    Self {
      default,
      per_kind: HashMap::new(),
    }
  }

  pub fn with_default(mut self, ttl: Duration) -> Self {
    self.default = ttl;
    self
  }

  pub fn with_kind(mut self, kind: EntityKind, ttl: Duration) -> Self {
    self.per_kind.insert(kind, ttl);
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.default
  }

  pub fn ttl_for_kind(&self, kind: EntityKind) -> Duration {
    self.per_kind.get(&kind).copied().unwrap_or(self.default)
  }

  /// TTL for a key: its entity's entry, or the default.
  pub fn ttl_for(&self, key: &CacheKey) -> Duration {
    key
      .kind()
      .map(|kind| self.ttl_for_kind(kind))
      .unwrap_or(self.default)
  }
}

impl Default for TtlPolicy {
  fn default() -> Self {
    Self::uniform(DEFAULT_TTL)
      .with_kind(EntityKind::Applications, APPLICATIONS_TTL)
      .with_kind(EntityKind::Resumes, RESUMES_TTL)
      .with_kind(EntityKind::Settings, SETTINGS_TTL)
      .with_kind(EntityKind::Targets, TARGETS_TTL)
      .with_kind(EntityKind::Schedules, SCHEDULES_TTL)
  }
}
