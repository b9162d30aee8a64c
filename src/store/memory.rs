//! In-process document store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use parking_lot::{Mutex, RwLock};

use super::{eval, Document, DocumentStore, Query, QueryResult};

type Collections = BTreeMap<String, BTreeMap<String, Document>>;

/// Document store held in memory.
///
/// Counts queries and can be told to fail or slow down, which is what the
/// cache tests need to observe fetch behavior.
#[derive(Default)]
pub struct MemoryStore {
  collections: RwLock<Collections>,
  queries: AtomicUsize,
  fail_next: AtomicUsize,
  latency: Mutex<Duration>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert synchronously, for seeding.
  pub fn insert(&self, collection: &str, doc: Document) {
    self
      .collections
      .write()
      .entry(collection.to_string())
      .or_default()
      .insert(doc.id.clone(), doc);
  }

  /// Number of `query` calls so far, failed ones included.
  pub fn query_count(&self) -> usize {
    self.queries.load(Ordering::SeqCst)
  }

  /// Make the next `n` queries fail.
  pub fn fail_next(&self, n: usize) {
    self.fail_next.store(n, Ordering::SeqCst);
  }

  /// Delay every query by `latency`.
  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock() = latency;
  }

  fn take_failure(&self) -> bool {
    self
      .fail_next
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
  }
}

#[async_trait]
impl DocumentStore for MemoryStore {
  async fn query(&self, query: Query) -> Result<QueryResult> {
    self.queries.fetch_add(1, Ordering::SeqCst);

    let latency = *self.latency.lock();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
    if self.take_failure() {
      return Err(eyre!("Injected failure querying {}", query.collection));
    }

    let docs: Vec<Document> = self
      .collections
      .read()
      .get(&query.collection)
      .map(|c| c.values().cloned().collect())
      .unwrap_or_default();
    Ok(eval::run(docs, &query))
  }

  async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
    Ok(
      self
        .collections
        .read()
        .get(collection)
        .and_then(|c| c.get(id))
        .cloned(),
    )
  }

  async fn put(&self, collection: &str, doc: Document) -> Result<()> {
    self.insert(collection, doc);
    Ok(())
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
    Ok(
      self
        .collections
        .write()
        .get_mut(collection)
        .and_then(|c| c.remove(id))
        .is_some(),
    )
  }
}
