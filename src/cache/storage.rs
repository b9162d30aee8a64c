//! In-memory TTL entry store.
//!
//! Expiry is lazy: `lookup` treats an expired entry as a miss but leaves it in
//! place, and `purge_expired` does the actual deletion on the maintenance path.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::key::CacheKey;
use super::traits::ErasedValue;

/// A single stored value.
#[derive(Clone)]
pub(crate) struct CacheEntry {
  pub key: CacheKey,
  pub value: ErasedValue,
  pub created_at: Instant,
  pub ttl: Duration,
  pub last_access: Instant,
  pub approx_bytes: usize,
}

impl CacheEntry {
  pub fn new(key: CacheKey, value: ErasedValue, ttl: Duration, approx_bytes: usize) -> Self {
    let now = Instant::now();
    Self {
      key,
      value,
      created_at: now,
      ttl,
      last_access: now,
      approx_bytes,
    }
  }

  pub fn age(&self, now: Instant) -> Duration {
    now.saturating_duration_since(self.created_at)
  }

  pub fn is_expired(&self, now: Instant) -> bool {
    self.age(now) >= self.ttl
  }
}

/// Key-value map of entries, bounded by `max_entries`.
pub(crate) struct EntryStore {
  entries: HashMap<String, CacheEntry>,
  max_entries: usize,
}

impl EntryStore {
  pub fn new(max_entries: usize) -> Self {
    Self {
      entries: HashMap::new(),
      max_entries: max_entries.max(1),
    }
  }

  /// Fresh entry for `key`, recording the access. Expired entries are a miss.
  pub fn lookup(&mut self, key: &str, now: Instant) -> Option<&CacheEntry> {
    let entry = self.entries.get_mut(key)?;
    if entry.is_expired(now) {
      return None;
    }
    entry.last_access = now;
    Some(entry)
  }

  /// Insert or replace an entry wholesale. Returns the key evicted to make
  /// room, if any.
  pub fn insert(&mut self, entry: CacheEntry) -> Option<String> {
    let key = entry.key.as_str().to_string();
    let evicted = if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
      self.evict_one(entry.created_at)
    } else {
      None
    };
    self.entries.insert(key, entry);
    evicted
  }

  /// Evict an expired entry if there is one, otherwise the least recently
  /// accessed entry.
  fn evict_one(&mut self, now: Instant) -> Option<String> {
    let victim = self
      .entries
      .iter()
      .find(|(_, e)| e.is_expired(now))
      .or_else(|| self.entries.iter().min_by_key(|(_, e)| e.last_access))
      .map(|(k, _)| k.clone())?;
    self.entries.remove(&victim);
    Some(victim)
  }

  pub fn remove(&mut self, key: &str) -> bool {
    self.entries.remove(key).is_some()
  }

  /// Remove every entry whose key matches. Returns how many were removed.
  pub fn remove_where(&mut self, mut matches: impl FnMut(&CacheKey) -> bool) -> usize {
    let before = self.entries.len();
    self.entries.retain(|_, e| !matches(&e.key));
    before - self.entries.len()
  }

  pub fn purge_expired(&mut self, now: Instant) -> usize {
    let before = self.entries.len();
    self.entries.retain(|_, e| !e.is_expired(now));
    before - self.entries.len()
  }

  pub fn clear(&mut self) -> usize {
    let n = self.entries.len();
    self.entries.clear();
    n
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn expired_count(&self, now: Instant) -> usize {
    self.entries.values().filter(|e| e.is_expired(now)).count()
  }

  pub fn approx_bytes(&self) -> usize {
    self
      .entries
      .iter()
      .map(|(k, e)| k.len() + e.approx_bytes)
      .sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::key::{CacheKey, EntityKind, OwnerScope};
  use std::sync::Arc;

  fn entry(name: &str, ttl_ms: u64) -> CacheEntry {
    CacheEntry::new(
      CacheKey::custom(name),
      Arc::new(name.to_string()),
      Duration::from_millis(ttl_ms),
      name.len(),
    )
  }

  #[tokio::test(start_paused = true)]
  async fn test_lookup_respects_ttl_boundary() {
    let mut store = EntryStore::new(10);
    store.insert(entry("a", 1000));

    tokio::time::advance(Duration::from_millis(999)).await;
    assert!(store.lookup("global_a", Instant::now()).is_some());

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(store.lookup("global_a", Instant::now()).is_none());
    // Lazy expiry: still stored until purged
    assert_eq!(store.len(), 1);
    assert_eq!(store.expired_count(Instant::now()), 1);

    assert_eq!(store.purge_expired(Instant::now()), 1);
    assert_eq!(store.len(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_insert_replaces_and_resets_created_at() {
    let mut store = EntryStore::new(10);
    store.insert(entry("a", 1000));
    tokio::time::advance(Duration::from_millis(900)).await;
    store.insert(entry("a", 1000));
    tokio::time::advance(Duration::from_millis(500)).await;

    assert!(store.lookup("global_a", Instant::now()).is_some());
    assert_eq!(store.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_lru_eviction_prefers_least_recently_used() {
    let mut store = EntryStore::new(2);
    store.insert(entry("a", 60_000));
    tokio::time::advance(Duration::from_millis(10)).await;
    store.insert(entry("b", 60_000));
    tokio::time::advance(Duration::from_millis(10)).await;

    // Touch "a" so "b" becomes the eviction candidate
    assert!(store.lookup("global_a", Instant::now()).is_some());

    let evicted = store.insert(entry("c", 60_000));
    assert_eq!(evicted.as_deref(), Some("global_b"));
    assert_eq!(store.len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_eviction_prefers_expired_entries() {
    let mut store = EntryStore::new(2);
    store.insert(entry("short", 5));
    store.insert(entry("long", 60_000));
    tokio::time::advance(Duration::from_millis(10)).await;
    assert!(store.lookup("global_long", Instant::now()).is_some());

    let evicted = store.insert(entry("new", 60_000));
    assert_eq!(evicted.as_deref(), Some("global_short"));
  }

  #[test]
  fn test_remove_where_matches_owner() {
    let mut store = EntryStore::new(10);
    let u1 = OwnerScope::user("u1");
    let u2 = OwnerScope::user("u2");
    for (owner, kind) in [
      (&u1, EntityKind::Applications),
      (&u1, EntityKind::Resumes),
      (&u2, EntityKind::Applications),
    ] {
      store.insert(CacheEntry::new(
        CacheKey::collection(owner, kind),
        Arc::new(0u8),
        Duration::from_secs(60),
        1,
      ));
    }

    assert_eq!(store.remove_where(|k| k.belongs_to(&u1)), 2);
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn test_approx_bytes_includes_keys() {
    let mut store = EntryStore::new(10);
    store.insert(entry("abc", 1000));
    assert_eq!(store.approx_bytes(), "global_abc".len() + 3);
  }
}
