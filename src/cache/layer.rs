//! Cache layer that orchestrates caching logic with document-store fetching.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result as EyreResult};
use futures::FutureExt;
use parking_lot::Mutex;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::coalesce::{Coalescer, PendingRequest, SharedFetch};
use super::key::{CacheKey, EntityKind, OwnerScope};
use super::policy::TtlPolicy;
use super::storage::{CacheEntry, EntryStore};
use super::traits::{approx_size, CacheResult, CacheSource, CacheValue, ErasedValue};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

/// Introspection snapshot. Taking it has no side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
  pub total_entries: usize,
  pub valid_entries: usize,
  pub expired_entries: usize,
  pub pending_requests: usize,
  pub approx_memory_bytes: usize,
}

struct CacheState {
  entries: EntryStore,
  pending: Coalescer,
}

struct Inner {
  state: Mutex<CacheState>,
  policy: TtlPolicy,
  stale_ratio: f64,
  next_request: AtomicU64,
}

const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of the synchronous lookup step of a fetch.
enum Lookup {
  Join(SharedFetch),
  Hit(ErasedValue, Duration),
  Stale(ErasedValue, Duration),
  Miss,
}

/// Memory-only TTL cache with request coalescing and stale-while-revalidate.
///
/// Cheap to clone; clones share state. Build one per process at startup and
/// hand it to everything that reads through it; tests build their own.
#[derive(Clone)]
pub struct DataCache {
  inner: Arc<Inner>,
}

impl DataCache {
  pub fn new(config: &CacheConfig) -> Self {
    Self::with_policy(config.policy(), config.max_entries, config.stale_ratio)
  }

  pub fn with_policy(policy: TtlPolicy, max_entries: usize, stale_ratio: f64) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(CacheState {
          entries: EntryStore::new(max_entries),
          pending: Coalescer::default(),
        }),
        policy,
        stale_ratio: stale_ratio.clamp(0.0, 1.0),
        next_request: AtomicU64::new(1),
      }),
    }
  }

  pub fn policy(&self) -> &TtlPolicy {
    &self.inner.policy
  }

  /// Fetch through the cache.
  ///
  /// 1. An in-flight fetch for `key` is joined.
  /// 2. A fresh entry is returned without calling `fetcher`.
  /// 3. Otherwise `fetcher` runs once, coalesced, and a success is stored
  ///    for `ttl` (or the policy TTL of the key). Failures are not cached.
  pub async fn fetch_cached<T, F, Fut>(
    &self,
    key: &CacheKey,
    fetcher: F,
    ttl: Option<Duration>,
  ) -> Result<Arc<T>>
  where
    T: CacheValue,
    F: FnOnce() -> Fut,
    Fut: Future<Output = EyreResult<T>> + Send + 'static,
  {
    Ok(self.fetch_with_source(key, fetcher, ttl).await?.data)
  }

  /// Like [`fetch_cached`](Self::fetch_cached), also reporting where the
  /// value came from.
  pub async fn fetch_with_source<T, F, Fut>(
    &self,
    key: &CacheKey,
    fetcher: F,
    ttl: Option<Duration>,
  ) -> Result<CacheResult<T>>
  where
    T: CacheValue,
    F: FnOnce() -> Fut,
    Fut: Future<Output = EyreResult<T>> + Send + 'static,
  {
    let ttl = ttl.unwrap_or_else(|| self.inner.policy.ttl_for(key));

    match self.lookup(key) {
      Lookup::Join(shared) => {
        trace!(key = %key, "joining in-flight fetch");
        let value = shared.await?;
        Ok(CacheResult::from_network(downcast(key, value)?, CacheSource::Coalesced))
      }
      Lookup::Hit(value, age) => {
        debug!(key = %key, age_ms = age.as_millis() as u64, "cache hit");
        Ok(CacheResult::from_cache(downcast(key, value)?, age, false))
      }
      Lookup::Stale(value, age) => {
        let data = downcast::<T>(key, value)?;
        debug!(key = %key, age_ms = age.as_millis() as u64, "cache hit (stale), refreshing in background");
        self.spawn_refresh(key, fetcher(), ttl);
        Ok(CacheResult::from_cache(data, age, true))
      }
      Lookup::Miss => {
        debug!(key = %key, "cache miss");
        let (shared, started) = self.start_or_join(key, fetcher(), Some(ttl), false);
        let value = shared.await?;
        let source = if started {
          CacheSource::Network
        } else {
          CacheSource::Coalesced
        };
        Ok(CacheResult::from_network(downcast(key, value)?, source))
      }
    }
  }

  /// Coalesce concurrent calls for `key` onto one execution of `fetcher`
  /// without storing the result.
  pub async fn dedupe<T, F, Fut>(&self, key: &CacheKey, fetcher: F) -> Result<Arc<T>>
  where
    T: CacheValue,
    F: FnOnce() -> Fut,
    Fut: Future<Output = EyreResult<T>> + Send + 'static,
  {
    let joined = self.inner.state.lock().pending.get(key.as_str()).map(|p| p.future.clone());
    let shared = match joined {
      Some(shared) => shared,
      None => self.start_or_join(key, fetcher(), None, false).0,
    };
    downcast(key, shared.await?)
  }

  /// Fresh value for `key`, if any. Never fetches.
  pub fn get<T: CacheValue>(&self, key: &CacheKey) -> Option<Arc<T>> {
    let mut state = self.inner.state.lock();
    let value = state.entries.lookup(key.as_str(), Instant::now())?.value.clone();
    value.downcast::<T>().ok()
  }

  /// Store a value unconditionally, replacing any entry for `key`. A fetch
  /// already in flight for `key` is detached and will not overwrite it.
  pub fn set<T: CacheValue>(&self, key: &CacheKey, value: T, ttl: Option<Duration>) -> Arc<T> {
    let ttl = ttl.unwrap_or_else(|| self.inner.policy.ttl_for(key));
    let bytes = approx_size(&value);
    let value = Arc::new(value);
    let erased: ErasedValue = value.clone();
    let evicted = {
      let mut state = self.inner.state.lock();
      state.pending.detach(key.as_str());
      state.entries.insert(CacheEntry::new(key.clone(), erased, ttl, bytes))
    };
    if let Some(evicted) = evicted {
      debug!(key = %evicted, "evicted least recently used entry");
    }
    value
  }

  /// Remove one key. Returns whether an entry was stored.
  pub fn invalidate(&self, key: &CacheKey) -> bool {
    let mut state = self.inner.state.lock();
    let removed = state.entries.remove(key.as_str());
    state.pending.detach(key.as_str());
    debug!(key = %key, removed, "invalidated key");
    removed
  }

  /// Remove every key whose rendered form matches `pattern`.
  pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
    let mut state = self.inner.state.lock();
    let removed = state.entries.remove_where(|k| pattern.is_match(k.as_str()));
    state.pending.detach_where(|k| pattern.is_match(k.as_str()));
    debug!(pattern = %pattern, removed, "invalidated by pattern");
    removed
  }

  /// Remove every key scoped to `owner`.
  pub fn invalidate_owner(&self, owner: &OwnerScope) -> usize {
    let mut state = self.inner.state.lock();
    let removed = state.entries.remove_where(|k| k.belongs_to(owner));
    state.pending.detach_where(|k| k.belongs_to(owner));
    debug!(owner = %owner, removed, "invalidated owner");
    removed
  }

  /// Remove every key of one entity type for one owner: the collection,
  /// single records and cached pages.
  pub fn invalidate_entity(&self, owner: &OwnerScope, kind: EntityKind) -> usize {
    let matches = |k: &CacheKey| k.belongs_to(owner) && k.kind() == Some(kind);
    let mut state = self.inner.state.lock();
    let removed = state.entries.remove_where(matches);
    state.pending.detach_where(matches);
    debug!(owner = %owner, kind = %kind, removed, "invalidated entity");
    removed
  }

  /// Drop every entry and cancel every pending request. Waiters on a
  /// cancelled request receive [`CacheError::Cancelled`].
  pub fn clear(&self) -> usize {
    let mut state = self.inner.state.lock();
    let cancelled = state.pending.cancel_all();
    let removed = state.entries.clear();
    debug!(removed, cancelled, "cache cleared");
    removed
  }

  /// Delete expired entries. Returns how many were removed.
  pub fn cleanup(&self) -> usize {
    let removed = self.inner.state.lock().entries.purge_expired(Instant::now());
    if removed > 0 {
      debug!(removed, "swept expired entries");
    }
    removed
  }

  pub fn stats(&self) -> CacheStats {
    let state = self.inner.state.lock();
    let total = state.entries.len();
    let expired = state.entries.expired_count(Instant::now());
    CacheStats {
      total_entries: total,
      valid_entries: total - expired,
      expired_entries: expired,
      pending_requests: state.pending.len(),
      approx_memory_bytes: state.entries.approx_bytes(),
    }
  }

  /// Run `cleanup()` every `every` until `shutdown` fires or the cache is
  /// dropped. Periods below one millisecond are raised to one.
  pub fn spawn_cleanup(&self, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    let every = every.max(MIN_CLEANUP_INTERVAL);
    let weak = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut interval = tokio::time::interval_at(Instant::now() + every, every);
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = interval.tick() => {
            match weak.upgrade() {
              Some(inner) => {
                DataCache { inner }.cleanup();
              }
              None => break,
            }
          }
        }
      }
      trace!("cleanup task stopped");
    })
  }

  fn lookup(&self, key: &CacheKey) -> Lookup {
    let now = Instant::now();
    let mut state = self.inner.state.lock();

    let background_fetch = match state.pending.get(key.as_str()) {
      Some(pending) if pending.background => Some(pending.future.clone()),
      Some(pending) => return Lookup::Join(pending.future.clone()),
      None => None,
    };

    match state.entries.lookup(key.as_str(), now) {
      Some(entry) => {
        let age = entry.age(now);
        let value = entry.value.clone();
        // A refresh is already running for this key: serve what we have.
        if background_fetch.is_some() || age < entry.ttl.mul_f64(self.inner.stale_ratio) {
          Lookup::Hit(value, age)
        } else {
          Lookup::Stale(value, age)
        }
      }
      None => match background_fetch {
        Some(shared) => Lookup::Join(shared),
        None => Lookup::Miss,
      },
    }
  }

  /// Register `fut` as the pending fetch for `key`, or join the one another
  /// caller registered first. Returns the shared future and whether this call
  /// registered it. With `ttl` set, a success is written into the cache.
  ///
  /// The fetch runs on its own task, so it settles even when every waiter
  /// goes away before it completes.
  fn start_or_join<T, Fut>(
    &self,
    key: &CacheKey,
    fut: Fut,
    ttl: Option<Duration>,
    background: bool,
  ) -> (SharedFetch, bool)
  where
    T: CacheValue,
    Fut: Future<Output = EyreResult<T>> + Send + 'static,
  {
    let mut state = self.inner.state.lock();
    if let Some(pending) = state.pending.get(key.as_str()) {
      return (pending.future.clone(), false);
    }

    let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(settle_into_cache(
      Arc::downgrade(&self.inner),
      key.clone(),
      id,
      fut,
      ttl,
      background,
      cancel.clone(),
    ));
    let task_key = key.to_string();
    let shared = async move {
      match task.await {
        Ok(outcome) => outcome,
        Err(err) => {
          trace!(key = %task_key, error = %err, "fetch task did not finish");
          Err(CacheError::Cancelled(task_key))
        }
      }
    }
    .boxed()
    .shared();
    state.pending.register(PendingRequest {
      key: key.clone(),
      id,
      future: shared.clone(),
      cancel,
      background,
    });
    (shared, true)
  }

  fn spawn_refresh<T, Fut>(&self, key: &CacheKey, fut: Fut, ttl: Duration)
  where
    T: CacheValue,
    Fut: Future<Output = EyreResult<T>> + Send + 'static,
  {
    let (_, started) = self.start_or_join(key, fut, Some(ttl), true);
    if !started {
      trace!(key = %key, "refresh already running");
    }
  }
}

impl std::fmt::Debug for DataCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DataCache")
      .field("stats", &self.stats())
      .finish_non_exhaustive()
  }
}

/// Run a fetch to completion. When it settles the pending registration is
/// removed and (if it is still the registered fetch) a success is stored, all
/// before any waiter sees the result. A panicking fetch settles as a failure.
async fn settle_into_cache<T, Fut>(
  inner: Weak<Inner>,
  key: CacheKey,
  id: u64,
  fut: Fut,
  ttl: Option<Duration>,
  background: bool,
  cancel: CancellationToken,
) -> Result<ErasedValue>
where
  T: CacheValue,
  Fut: Future<Output = EyreResult<T>> + Send + 'static,
{
  let outcome = tokio::select! {
    biased;
    _ = cancel.cancelled() => Err(CacheError::Cancelled(key.to_string())),
    res = AssertUnwindSafe(fut).catch_unwind() => match res {
      Ok(Ok(value)) => Ok((approx_size(&value), Arc::new(value))),
      Ok(Err(report)) => Err(CacheError::fetch(key.as_str(), report)),
      Err(_) => Err(CacheError::fetch(key.as_str(), eyre!("fetch panicked"))),
    },
  };

  if let Some(inner) = inner.upgrade() {
    let mut state = inner.state.lock();
    let current = state.pending.settle(key.as_str(), id);
    match (&outcome, ttl) {
      (Ok((bytes, value)), Some(ttl)) if current => {
        let erased: ErasedValue = value.clone();
        if let Some(evicted) = state.entries.insert(CacheEntry::new(key.clone(), erased, ttl, *bytes)) {
          debug!(key = %evicted, "evicted least recently used entry");
        }
      }
      (Ok(_), Some(_)) => {
        debug!(key = %key, "discarding result of detached fetch");
      }
      _ => {}
    }
  }

  if background {
    if let Err(err) = &outcome {
      let err = CacheError::StaleRefresh {
        key: key.to_string(),
        reason: Box::new(err.clone()),
      };
      warn!(error = %err, "keeping stale entry");
    }
  }

  outcome.map(|(_, value)| value as ErasedValue)
}

fn downcast<T: CacheValue>(key: &CacheKey, value: ErasedValue) -> Result<Arc<T>> {
  value.downcast::<T>().map_err(|_| CacheError::TypeMismatch {
    key: key.to_string(),
    expected: std::any::type_name::<T>(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::key::{self, OwnerScope};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::AtomicUsize;

  fn cache() -> DataCache {
    DataCache::with_policy(TtlPolicy::uniform(Duration::from_millis(1000)), 100, 0.8)
  }

  fn counting_fetch(
    calls: &Arc<AtomicUsize>,
    value: &'static str,
    delay_ms: u64,
  ) -> impl FnOnce() -> futures::future::BoxFuture<'static, EyreResult<String>> {
    let calls = Arc::clone(calls);
    move || {
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok::<_, color_eyre::Report>(value.to_string())
      }
      .boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_callers_share_one_fetch() {
    let cache = cache();
    let key = key::applications(&OwnerScope::user("u1"));
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b, c) = tokio::join!(
      cache.fetch_with_source(&key, counting_fetch(&calls, "apps", 50), Some(Duration::from_secs(5))),
      cache.fetch_with_source(&key, counting_fetch(&calls, "other", 50), Some(Duration::from_secs(5))),
      cache.fetch_with_source(&key, counting_fetch(&calls, "other", 50), Some(Duration::from_secs(5))),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.source, CacheSource::Network);
    assert_eq!(b.source, CacheSource::Coalesced);
    assert!(Arc::ptr_eq(&a.data, &b.data));
    assert!(Arc::ptr_eq(&a.data, &c.data));
    assert_eq!(*a.data, "apps");
    assert_eq!(cache.stats().pending_requests, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_second_call_within_ttl_hits_cache_with_same_reference() {
    let cache = cache();
    let key = CacheKey::custom("user_u1_apps");
    let calls = Arc::new(AtomicUsize::new(0));

    let first: Arc<String> = cache
      .fetch_cached(&key, counting_fetch(&calls, "v", 0), Some(Duration::from_millis(5000)))
      .await
      .unwrap();
    tokio::time::advance(Duration::from_millis(100)).await;
    let second: Arc<String> = cache
      .fetch_cached(&key, counting_fetch(&calls, "v2", 0), Some(Duration::from_millis(5000)))
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first, &second));
  }

  #[tokio::test(start_paused = true)]
  async fn test_ttl_boundary() {
    let cache = DataCache::with_policy(TtlPolicy::uniform(Duration::from_secs(60)), 100, 1.0);
    let key = CacheKey::custom("boundary");
    cache.set(&key, 7u32, Some(Duration::from_millis(1000)));

    tokio::time::advance(Duration::from_millis(999)).await;
    assert_eq!(cache.get::<u32>(&key).as_deref(), Some(&7));

    tokio::time::advance(Duration::from_millis(2)).await;
    assert!(cache.get::<u32>(&key).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_forces_miss() {
    let cache = cache();
    let owner = OwnerScope::user("u1");
    let key = key::resumes(&owner);
    cache.set(&key, vec![1, 2, 3], None);

    assert!(cache.invalidate(&key));
    assert!(cache.get::<Vec<i32>>(&key).is_none());

    let calls = Arc::new(AtomicUsize::new(0));
    let value: Arc<String> = cache
      .fetch_cached(&key, counting_fetch(&calls, "fresh", 0), None)
      .await
      .unwrap();
    assert_eq!(*value, "fresh");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_is_shared_and_not_cached() {
    let cache = cache();
    let key = CacheKey::custom("flaky");
    let calls = Arc::new(AtomicUsize::new(0));

    let failing = |calls: &Arc<AtomicUsize>| {
      let calls = Arc::clone(calls);
      move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err::<String, _>(eyre!("store unavailable"))
      }
    };

    let (a, b) = tokio::join!(
      cache.fetch_cached(&key, failing(&calls), None),
      cache.fetch_cached(&key, failing(&calls), None),
    );
    assert!(matches!(a, Err(CacheError::Fetch { .. })));
    assert!(matches!(b, Err(CacheError::Fetch { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().total_entries, 0);

    // Immediately retryable
    let ok: Arc<String> = cache
      .fetch_cached(&key, counting_fetch(&calls, "recovered", 0), None)
      .await
      .unwrap();
    assert_eq!(*ok, "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cleanup_removes_expired_entries() {
    let cache = cache();
    cache.set(&CacheKey::custom("short"), 1u8, Some(Duration::from_millis(1000)));
    cache.set(&CacheKey::custom("long"), 2u8, Some(Duration::from_secs(60)));
    assert_eq!(cache.stats().total_entries, 2);

    tokio::time::advance(Duration::from_millis(1500)).await;
    let before = cache.stats();
    assert_eq!(before.expired_entries, 1);
    assert_eq!(before.valid_entries, 1);

    assert_eq!(cache.cleanup(), 1);
    assert_eq!(cache.stats().total_entries, before.total_entries - 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cleanup_task_sweeps_on_interval() {
    let cache = cache();
    cache.set(&CacheKey::custom("short"), 1u8, Some(Duration::from_millis(100)));
    let shutdown = CancellationToken::new();
    let handle = cache.spawn_cleanup(Duration::from_millis(500), shutdown.clone());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(cache.stats().total_entries, 0);

    shutdown.cancel();
    handle.await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_served_and_refreshed_in_background() {
    let cache = cache();
    let key = CacheKey::custom("swr");
    let calls = Arc::new(AtomicUsize::new(0));
    cache
      .fetch_cached(&key, counting_fetch(&calls, "v1", 0), None)
      .await
      .unwrap();

    tokio::time::advance(Duration::from_millis(850)).await;
    let stale = cache
      .fetch_with_source(&key, counting_fetch(&calls, "v2", 0), None)
      .await
      .unwrap();
    assert_eq!(stale.source, CacheSource::CacheStale);
    assert_eq!(*stale.data, "v1");

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(cache.get::<String>(&key).as_deref().map(String::as_str), Some("v2"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_background_refresh_keeps_stale_value() {
    let cache = cache();
    let key = CacheKey::custom("swr-fail");
    let calls = Arc::new(AtomicUsize::new(0));
    let original: Arc<String> = cache
      .fetch_cached(&key, counting_fetch(&calls, "v1", 0), None)
      .await
      .unwrap();

    tokio::time::advance(Duration::from_millis(850)).await;
    let served: Arc<String> = cache
      .fetch_cached(
        &key,
        || async { Err::<String, _>(eyre!("refresh exploded")) },
        None,
      )
      .await
      .unwrap();
    assert!(Arc::ptr_eq(&original, &served));

    tokio::time::sleep(Duration::from_millis(1)).await;
    let still: Arc<String> = cache.get(&key).unwrap();
    assert!(Arc::ptr_eq(&original, &still));
    assert_eq!(cache.stats().pending_requests, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_only_one_background_refresh_per_key() {
    let cache = cache();
    let key = CacheKey::custom("swr-once");
    let calls = Arc::new(AtomicUsize::new(0));
    cache
      .fetch_cached(&key, counting_fetch(&calls, "v1", 0), None)
      .await
      .unwrap();

    tokio::time::advance(Duration::from_millis(850)).await;
    for _ in 0..3 {
      let r = cache
        .fetch_with_source(&key, counting_fetch(&calls, "v2", 50), None)
        .await
        .unwrap();
      assert!(r.source.is_cached());
    }
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_entry_is_hard_miss() {
    let cache = cache();
    let key = CacheKey::custom("expired");
    let calls = Arc::new(AtomicUsize::new(0));
    cache
      .fetch_cached(&key, counting_fetch(&calls, "v1", 0), None)
      .await
      .unwrap();

    tokio::time::advance(Duration::from_millis(1001)).await;
    let r = cache
      .fetch_with_source(&key, counting_fetch(&calls, "v2", 0), None)
      .await
      .unwrap();
    assert_eq!(r.source, CacheSource::Network);
    assert_eq!(*r.data, "v2");
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_cancels_pending_waiters() {
    let cache = cache();
    let key = CacheKey::custom("slow");
    let calls = Arc::new(AtomicUsize::new(0));

    let task = {
      let cache = cache.clone();
      let key = key.clone();
      let fetch = counting_fetch(&calls, "never", 10_000);
      tokio::spawn(async move { cache.fetch_cached::<String, _, _>(&key, fetch, None).await })
    };
    tokio::task::yield_now().await;
    assert_eq!(cache.stats().pending_requests, 1);

    cache.clear();
    let result = task.await.unwrap();
    assert!(matches!(result, Err(CacheError::Cancelled(_))));
    assert_eq!(cache.stats().pending_requests, 0);
    assert_eq!(cache.stats().total_entries, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidated_in_flight_fetch_does_not_populate_cache() {
    let cache = cache();
    let owner = OwnerScope::user("u1");
    let key = key::applications(&owner);
    let calls = Arc::new(AtomicUsize::new(0));

    let task = {
      let cache = cache.clone();
      let key = key.clone();
      let fetch = counting_fetch(&calls, "before-write", 50);
      tokio::spawn(async move { cache.fetch_cached::<String, _, _>(&key, fetch, None).await })
    };
    tokio::task::yield_now().await;

    // A write lands while the read is in flight
    cache.invalidate_owner(&owner);
    assert_eq!(*task.await.unwrap().unwrap(), "before-write");
    assert!(cache.get::<String>(&key).is_none());

    let after: Arc<String> = cache
      .fetch_cached(&key, counting_fetch(&calls, "after-write", 0), None)
      .await
      .unwrap();
    assert_eq!(*after, "after-write");
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_settles_after_caller_times_out() {
    let cache = cache();
    let key = CacheKey::custom("abandoned");
    let calls = Arc::new(AtomicUsize::new(0));

    let timed_out = tokio::time::timeout(
      Duration::from_millis(10),
      cache.fetch_cached::<String, _, _>(&key, counting_fetch(&calls, "late", 100), None),
    )
    .await;
    assert!(timed_out.is_err());
    assert_eq!(cache.stats().pending_requests, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cache.stats().pending_requests, 0);
    assert_eq!(cache.get::<String>(&key).as_deref().map(String::as_str), Some("late"));

    let value: Arc<String> = cache
      .fetch_cached(&key, counting_fetch(&calls, "again", 0), None)
      .await
      .unwrap();
    assert_eq!(*value, "late");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_set_is_not_overwritten_by_older_fetch() {
    let cache = cache();
    let key = CacheKey::custom("written");
    let calls = Arc::new(AtomicUsize::new(0));

    let task = {
      let cache = cache.clone();
      let key = key.clone();
      let fetch = counting_fetch(&calls, "old-fetch", 50);
      tokio::spawn(async move { cache.fetch_cached::<String, _, _>(&key, fetch, None).await })
    };
    tokio::task::yield_now().await;
    assert_eq!(cache.stats().pending_requests, 1);

    cache.set(&key, "new-set".to_string(), None);
    assert_eq!(cache.stats().pending_requests, 0);
    assert_eq!(*task.await.unwrap().unwrap(), "old-fetch");
    assert_eq!(cache.get::<String>(&key).as_deref().map(String::as_str), Some("new-set"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_panicking_fetch_settles_as_failure() {
    let cache = cache();
    let key = CacheKey::custom("panics");
    let explode = true;

    let err = cache
      .fetch_cached(
        &key,
        move || async move {
          if explode {
            panic!("boom");
          }
          Ok::<_, color_eyre::Report>("unreachable".to_string())
        },
        None,
      )
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::Fetch { .. }));
    assert_eq!(cache.stats().pending_requests, 0);
    assert_eq!(cache.stats().total_entries, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_zero_cleanup_interval_is_raised() {
    let cache = cache();
    cache.set(&CacheKey::custom("short"), 1u8, Some(Duration::from_millis(5)));
    let shutdown = CancellationToken::new();
    let handle = cache.spawn_cleanup(Duration::ZERO, shutdown.clone());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.stats().total_entries, 0);

    shutdown.cancel();
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_invalidate_pattern_and_entity() {
    let cache = cache();
    let u1 = OwnerScope::user("u1");
    let u2 = OwnerScope::user("u2");
    cache.set(&key::applications(&u1), 1u8, None);
    cache.set(&CacheKey::record(&u1, EntityKind::Applications, "a1"), 1u8, None);
    cache.set(&key::resumes(&u1), 1u8, None);
    cache.set(&key::applications(&u2), 1u8, None);

    assert_eq!(cache.invalidate_entity(&u1, EntityKind::Applications), 2);
    assert!(cache.get::<u8>(&key::resumes(&u1)).is_some());

    let pattern = Regex::new(r"^user_u2_").unwrap();
    assert_eq!(cache.invalidate_pattern(&pattern), 1);
    assert_eq!(cache.stats().total_entries, 1);
  }

  #[tokio::test]
  async fn test_dedupe_does_not_store() {
    let cache = cache();
    let key = CacheKey::custom("dedupe");
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
      cache.dedupe::<String, _, _>(&key, counting_fetch(&calls, "x", 5)),
      cache.dedupe::<String, _, _>(&key, counting_fetch(&calls, "y", 5)),
    );
    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().total_entries, 0);
  }

  #[tokio::test]
  async fn test_type_mismatch_is_reported() {
    let cache = cache();
    let key = CacheKey::custom("typed");
    cache.set(&key, 5u64, None);

    let err = cache
      .fetch_cached::<String, _, _>(&key, || async { Ok::<_, color_eyre::Report>("x".to_string()) }, None)
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::TypeMismatch { .. }));
  }

  #[tokio::test]
  async fn test_max_entries_bounds_the_cache() {
    let cache = DataCache::with_policy(TtlPolicy::default(), 3, 0.8);
    for i in 0..10 {
      cache.set(&CacheKey::custom(&format!("k{}", i)), i, None);
    }
    assert_eq!(cache.stats().total_entries, 3);
    assert!(cache.stats().approx_memory_bytes > 0);
  }
}
