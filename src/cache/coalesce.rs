//! In-flight request registry.
//!
//! Each key has at most one pending fetch. The fetch runs on its own task and
//! callers await a [`Shared`] handle to its output, so every caller observes
//! the same outcome and the fetch settles even if all of them give up. Registration ids let a settling fetch tell whether it is still the
//! registered one: a fetch that was detached (by invalidation) or cancelled
//! (by `clear`) must not write into the cache.

use std::collections::HashMap;

use futures::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;

use super::key::CacheKey;
use super::traits::ErasedValue;
use crate::error::CacheError;

pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<ErasedValue, CacheError>>>;

pub(crate) struct PendingRequest {
  pub key: CacheKey,
  pub id: u64,
  pub future: SharedFetch,
  pub cancel: CancellationToken,
  /// Started by a stale-while-revalidate refresh rather than a caller miss.
  pub background: bool,
}

#[derive(Default)]
pub(crate) struct Coalescer {
  pending: HashMap<String, PendingRequest>,
}

impl Coalescer {
  pub fn get(&self, key: &str) -> Option<&PendingRequest> {
    self.pending.get(key)
  }

  pub fn register(&mut self, request: PendingRequest) {
    let key = request.key.as_str().to_string();
    self.pending.insert(key, request);
  }

  /// Remove the pending entry if `id` is still the one registered for `key`.
  /// Returns whether it was.
  pub fn settle(&mut self, key: &str, id: u64) -> bool {
    match self.pending.get(key) {
      Some(request) if request.id == id => {
        self.pending.remove(key);
        true
      }
      _ => false,
    }
  }

  /// Forget the pending request without cancelling it. Its current waiters
  /// still get the result; the next caller starts a fresh fetch.
  pub fn detach(&mut self, key: &str) -> bool {
    self.pending.remove(key).is_some()
  }

  pub fn detach_where(&mut self, mut matches: impl FnMut(&CacheKey) -> bool) -> usize {
    let before = self.pending.len();
    self.pending.retain(|_, request| !matches(&request.key));
    before - self.pending.len()
  }

  /// Cancel and drop every pending request.
  pub fn cancel_all(&mut self) -> usize {
    let n = self.pending.len();
    for (_, request) in self.pending.drain() {
      request.cancel.cancel();
    }
    n
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }
}
