//! Cursor-paginated reads over the document store.
//!
//! Pages are fetched through the shared [`DataCache`], so a page is cached
//! under a key derived from its query shape and position, and concurrent
//! requests for the same page are coalesced. Writes that invalidate an
//! owner's entity type drop its pages too.

mod cursor;
mod stream;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use color_eyre::Result as EyreResult;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{DataCache, EntityKind, OwnerScope};
use crate::error::Result;
use crate::store::{DocCursor, Document, DocumentStore, Query};

pub use cursor::{PageQuery, StreamCursor};
pub use stream::{PageStream, StreamState};

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
  pub items: Vec<Document>,
  pub has_more: bool,
  /// Position of the last item; pass to `get_next_page` to continue
  pub cursor: Option<StreamCursor>,
}

/// Paginated, cached access to owner-scoped collections.
#[derive(Clone)]
pub struct Paginator {
  store: Arc<dyn DocumentStore>,
  cache: DataCache,
  owner_field: Arc<str>,
  cursors: Arc<Mutex<HashMap<PageQuery, StreamCursor>>>,
}

impl Paginator {
  /// `owner_field` names the document field holding the owner's uid.
  pub fn new(store: Arc<dyn DocumentStore>, cache: DataCache, owner_field: &str) -> Self {
    Self {
      store,
      cache,
      owner_field: Arc::from(owner_field),
      cursors: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub async fn get_initial_page(&self, query: &PageQuery) -> Result<Arc<Page>> {
    let key = query.page_key("initial");
    let page = self
      .cache
      .fetch_cached(&key, || self.load(query, None), None)
      .await?;
    self.remember(query, &page);
    Ok(page)
  }

  /// Continue `query` from `cursor`. Fails with `InvalidCursor` when the
  /// cursor was issued for a different query shape.
  pub async fn get_next_page(&self, query: &PageQuery, cursor: &StreamCursor) -> Result<Arc<Page>> {
    cursor.check(query)?;

    let key = query.page_key(&format!("after-{}", cursor.fingerprint()));
    let position = cursor.position().clone();
    let page = self
      .cache
      .fetch_cached(&key, || self.load(query, Some(position)), None)
      .await?;
    self.remember(query, &page);
    Ok(page)
  }

  /// Lazily pull every page of `query`, starting from the first one.
  pub fn stream(&self, query: PageQuery, cancel: CancellationToken) -> PageStream {
    PageStream::new(self.clone(), query, cancel)
  }

  /// Latest continuation cursor handed out for `query`, if the query has
  /// more pages.
  pub fn last_cursor(&self, query: &PageQuery) -> Option<StreamCursor> {
    self.cursors.lock().get(query).cloned()
  }

  pub fn release(&self, query: &PageQuery) {
    self.cursors.lock().remove(query);
  }

  pub fn release_owner(&self, owner: &OwnerScope) {
    self.cursors.lock().retain(|q, _| q.owner != *owner);
  }

  pub fn release_kind(&self, owner: &OwnerScope, kind: EntityKind) {
    self
      .cursors
      .lock()
      .retain(|q, _| !(q.owner == *owner && q.kind == kind));
  }

  fn remember(&self, query: &PageQuery, page: &Page) {
    let mut cursors = self.cursors.lock();
    match (&page.cursor, page.has_more) {
      (Some(cursor), true) => {
        cursors.insert(query.clone(), cursor.clone());
      }
      _ => {
        cursors.remove(query);
      }
    }
  }

  fn load(
    &self,
    query: &PageQuery,
    after: Option<DocCursor>,
  ) -> impl Future<Output = EyreResult<Page>> + Send + 'static {
    let store_query = query.store_query(&self.owner_field, after);
    load_page(Arc::clone(&self.store), store_query, query.clone())
  }
}

async fn load_page(
  store: Arc<dyn DocumentStore>,
  store_query: Query,
  query: PageQuery,
) -> EyreResult<Page> {
  let mut result = store.query(store_query).await?;
  let has_more = result.items.len() > query.page_size;
  result.items.truncate(query.page_size);
  debug!(
    owner = %query.owner,
    kind = %query.kind,
    items = result.items.len(),
    has_more,
    "loaded page"
  );

  let cursor = result
    .items
    .last()
    .map(|doc| StreamCursor::new(query.clone(), DocCursor::from_document(doc, Some(&query.order))));
  Ok(Page {
    items: result.items,
    has_more,
    cursor,
  })
}
