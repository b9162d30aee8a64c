//! Tracker data service that wraps the document store with transparent caching.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CREATED_FIELD, OWNER_FIELD, UPDATED_FIELD};
use crate::cache::{CacheKey, DataCache, EntityKind, OwnerScope};
use crate::error::CacheError;
use crate::paging::{Page, PageQuery, PageStream, Paginator, StreamCursor};
use crate::store::{Document, DocumentStore, Filter, OrderBy, Query};

/// Outcome of warming the cache for one owner.
#[derive(Debug, Default)]
pub struct PreloadReport {
  /// Number of documents loaded per entity type
  pub loaded: BTreeMap<EntityKind, usize>,
  pub failed: BTreeMap<EntityKind, CacheError>,
}

impl PreloadReport {
  pub fn is_complete(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Tracker documents with caching, request coalescing and invalidation on
/// write.
///
/// Reads go through the shared [`DataCache`]; writes hit the store and then
/// drop every cached key of the affected owner and entity type before
/// returning.
#[derive(Clone)]
pub struct TrackerData {
  store: Arc<dyn DocumentStore>,
  cache: DataCache,
  paginator: Paginator,
  page_size: usize,
}

impl TrackerData {
  pub fn new(store: Arc<dyn DocumentStore>, cache: DataCache, page_size: usize) -> Self {
    let paginator = Paginator::new(Arc::clone(&store), cache.clone(), OWNER_FIELD);
    Self {
      store,
      cache,
      paginator,
      page_size: page_size.max(1),
    }
  }

  pub fn cache(&self) -> &DataCache {
    &self.cache
  }

  pub fn paginator(&self) -> &Paginator {
    &self.paginator
  }

  /// All documents of `kind` owned by `owner`, newest first.
  pub async fn list(&self, owner: &OwnerScope, kind: EntityKind) -> Result<Arc<Vec<Document>>> {
    let key = CacheKey::collection(owner, kind);
    let docs = self
      .cache
      .fetch_cached(
        &key,
        || {
          let store = Arc::clone(&self.store);
          let query = owner_query(owner, kind);
          async move { store.query(query).await.map(|result| result.items) }
        },
        None,
      )
      .await?;

    Ok(docs)
  }

  pub async fn applications(&self, owner: &OwnerScope) -> Result<Arc<Vec<Document>>> {
    self.list(owner, EntityKind::Applications).await
  }

  pub async fn resumes(&self, owner: &OwnerScope) -> Result<Arc<Vec<Document>>> {
    self.list(owner, EntityKind::Resumes).await
  }

  pub async fn targets(&self, owner: &OwnerScope) -> Result<Arc<Vec<Document>>> {
    self.list(owner, EntityKind::Targets).await
  }

  pub async fn schedules(&self, owner: &OwnerScope) -> Result<Arc<Vec<Document>>> {
    self.list(owner, EntityKind::Schedules).await
  }

  /// The owner's settings document (the most recent, if several exist).
  pub async fn settings(&self, owner: &OwnerScope) -> Result<Option<Document>> {
    let all = self.list(owner, EntityKind::Settings).await?;
    Ok(all.first().cloned())
  }

  /// A single document, if it exists and belongs to `owner`.
  pub async fn get(
    &self,
    owner: &OwnerScope,
    kind: EntityKind,
    id: &str,
  ) -> Result<Arc<Option<Document>>> {
    let key = CacheKey::record(owner, kind, id);
    let doc = self
      .cache
      .fetch_cached(
        &key,
        || {
          let store = Arc::clone(&self.store);
          let owner = owner.clone();
          let id = id.to_string();
          async move {
            let doc = store.get(kind.collection(), &id).await;
            doc.map(|doc| doc.filter(|d| is_owned_by(d, &owner)))
          }
        },
        None,
      )
      .await?;

    Ok(doc)
  }

  /// Store a new document for `owner`. `fields` must be a JSON object.
  pub async fn create(&self, owner: &OwnerScope, kind: EntityKind, fields: Value) -> Result<Document> {
    let Value::Object(mut data) = fields else {
      return Err(eyre!("Document body for {} must be a JSON object", kind));
    };

    let now = timestamp();
    data.insert(OWNER_FIELD.to_string(), Value::from(owner.uid()));
    data.insert(CREATED_FIELD.to_string(), Value::from(now.clone()));
    data.insert(UPDATED_FIELD.to_string(), Value::from(now));

    let doc = Document::new(Uuid::new_v4().to_string(), data);
    self.store.put(kind.collection(), doc.clone()).await?;
    self.invalidate_entity(owner, kind);

    debug!(owner = %owner, kind = %kind, id = %doc.id, "created document");
    Ok(doc)
  }

  /// Merge `patch` into an existing document. The owner field cannot be
  /// changed.
  pub async fn update(
    &self,
    owner: &OwnerScope,
    kind: EntityKind,
    id: &str,
    patch: Value,
  ) -> Result<Document> {
    let Value::Object(patch) = patch else {
      return Err(eyre!("Patch for {} {} must be a JSON object", kind, id));
    };

    let mut doc = self.owned(owner, kind, id).await?;
    for (field, value) in patch {
      if field == OWNER_FIELD || field == CREATED_FIELD {
        continue;
      }
      doc.data.insert(field, value);
    }
    doc
      .data
      .insert(UPDATED_FIELD.to_string(), Value::from(timestamp()));

    self.store.put(kind.collection(), doc.clone()).await?;
    self.invalidate_entity(owner, kind);

    debug!(owner = %owner, kind = %kind, id, "updated document");
    Ok(doc)
  }

  /// Delete a document. Returns false when there was nothing to delete.
  pub async fn delete(&self, owner: &OwnerScope, kind: EntityKind, id: &str) -> Result<bool> {
    let existing = self.store.get(kind.collection(), id).await?;
    match existing {
      None => return Ok(false),
      Some(doc) if !is_owned_by(&doc, owner) => {
        return Err(eyre!("{} {} does not belong to {}", kind, id, owner));
      }
      Some(_) => {}
    }

    let removed = self.store.delete(kind.collection(), id).await?;
    self.invalidate_entity(owner, kind);

    debug!(owner = %owner, kind = %kind, id, removed, "deleted document");
    Ok(removed)
  }

  /// Drop every cached key and cursor of one entity type for one owner.
  pub fn invalidate_entity(&self, owner: &OwnerScope, kind: EntityKind) -> usize {
    self.paginator.release_kind(owner, kind);
    self.cache.invalidate_entity(owner, kind)
  }

  /// Drop everything cached for `owner`, e.g. on sign-out.
  pub fn forget_owner(&self, owner: &OwnerScope) -> usize {
    self.paginator.release_owner(owner);
    self.cache.invalidate_owner(owner)
  }

  /// Load every entity set for `owner` concurrently to warm the cache.
  ///
  /// A failing set is reported, not propagated; the others still load.
  pub async fn preload(&self, owner: &OwnerScope) -> PreloadReport {
    let results = futures::future::join_all(
      EntityKind::ALL
        .into_iter()
        .map(|kind| async move { (kind, self.list(owner, kind).await) }),
    )
    .await;

    let mut report = PreloadReport::default();
    for (kind, result) in results {
      match result {
        Ok(docs) => {
          report.loaded.insert(kind, docs.len());
        }
        Err(err) => {
          warn!(owner = %owner, kind = %kind, error = %err, "preload failed");
          let err = match err.downcast::<CacheError>() {
            Ok(cache_err) => cache_err,
            Err(report) => CacheError::fetch(kind.as_str(), report),
          };
          report.failed.insert(kind, err);
        }
      }
    }

    info!(
      owner = %owner,
      loaded = report.loaded.len(),
      failed = report.failed.len(),
      "preloaded tracker data"
    );
    report
  }

  /// The standard paginated query: newest first, `page_size` or the
  /// configured default.
  pub fn page_query(&self, owner: &OwnerScope, kind: EntityKind, page_size: Option<usize>) -> PageQuery {
    PageQuery::new(
      owner.clone(),
      kind,
      OrderBy::desc(CREATED_FIELD),
      page_size.unwrap_or(self.page_size),
    )
  }

  pub async fn first_page(&self, query: &PageQuery) -> Result<Arc<Page>> {
    Ok(self.paginator.get_initial_page(query).await?)
  }

  pub async fn next_page(&self, query: &PageQuery, cursor: &StreamCursor) -> Result<Arc<Page>> {
    Ok(self.paginator.get_next_page(query, cursor).await?)
  }

  pub fn stream(&self, query: PageQuery, cancel: CancellationToken) -> PageStream {
    self.paginator.stream(query, cancel)
  }

  async fn owned(&self, owner: &OwnerScope, kind: EntityKind, id: &str) -> Result<Document> {
    let doc = self
      .store
      .get(kind.collection(), id)
      .await?
      .ok_or_else(|| eyre!("{} {} not found", kind, id))?;

    if !is_owned_by(&doc, owner) {
      return Err(eyre!("{} {} does not belong to {}", kind, id, owner));
    }
    Ok(doc)
  }
}

fn owner_query(owner: &OwnerScope, kind: EntityKind) -> Query {
  Query::collection(kind.collection())
    .filter(Filter::eq(OWNER_FIELD, owner.uid()))
    .order_by(OrderBy::desc(CREATED_FIELD))
}

fn is_owned_by(doc: &Document, owner: &OwnerScope) -> bool {
  doc.str_field(OWNER_FIELD) == Some(owner.uid())
}

fn timestamp() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::TtlPolicy;
  use crate::store::MemoryStore;
  use serde_json::json;
  use std::time::Duration;

  fn setup() -> (TrackerData, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store.insert(
      "applications",
      Document::from_value(
        "a1",
        json!({"userId": "u1", "company": "Acme", "createdAt": "2020-01-01T00:00:00.000Z"}),
      ),
    );
    store.insert(
      "applications",
      Document::from_value(
        "a2",
        json!({"userId": "u1", "company": "Globex", "createdAt": "2020-02-01T00:00:00.000Z"}),
      ),
    );
    store.insert(
      "applications",
      Document::from_value(
        "b1",
        json!({"userId": "u2", "company": "Initech", "createdAt": "2020-03-01T00:00:00.000Z"}),
      ),
    );

    let cache = DataCache::with_policy(TtlPolicy::uniform(Duration::from_secs(60)), 100, 1.0);
    let dyn_store: Arc<dyn DocumentStore> = store.clone();
    (TrackerData::new(dyn_store, cache, 2), store)
  }

  fn ids(docs: &[Document]) -> Vec<&str> {
    docs.iter().map(|d| d.id.as_str()).collect()
  }

  #[tokio::test]
  async fn test_list_is_owner_scoped_newest_first_and_cached() {
    let (data, store) = setup();
    let u1 = OwnerScope::user("u1");

    let apps = data.applications(&u1).await.unwrap();
    assert_eq!(ids(&apps), vec!["a2", "a1"]);

    let again = data.applications(&u1).await.unwrap();
    assert!(Arc::ptr_eq(&apps, &again));
    assert_eq!(store.query_count(), 1);

    let other = data.applications(&OwnerScope::user("u2")).await.unwrap();
    assert_eq!(ids(&other), vec!["b1"]);
  }

  #[tokio::test]
  async fn test_create_invalidates_collection() {
    let (data, store) = setup();
    let u1 = OwnerScope::user("u1");
    assert_eq!(data.applications(&u1).await.unwrap().len(), 2);

    let created = data
      .create(&u1, EntityKind::Applications, json!({"company": "Hooli"}))
      .await
      .unwrap();
    assert_eq!(created.str_field("userId"), Some("u1"));
    assert!(created.field("createdAt").is_some());

    let apps = data.applications(&u1).await.unwrap();
    assert_eq!(apps.len(), 3);
    assert_eq!(apps[0].id, created.id);
    assert_eq!(store.query_count(), 2);
  }

  #[tokio::test]
  async fn test_create_leaves_other_owners_cached() {
    let (data, store) = setup();
    let u1 = OwnerScope::user("u1");
    let u2 = OwnerScope::user("u2");
    data.applications(&u2).await.unwrap();

    data
      .create(&u1, EntityKind::Applications, json!({"company": "Hooli"}))
      .await
      .unwrap();
    data.applications(&u2).await.unwrap();
    assert_eq!(store.query_count(), 1);
  }

  #[tokio::test]
  async fn test_create_rejects_non_object_body() {
    let (data, _) = setup();
    let err = data
      .create(&OwnerScope::user("u1"), EntityKind::Resumes, json!([1, 2]))
      .await
      .unwrap_err();
    assert!(err.to_string().contains("JSON object"));
  }

  #[tokio::test]
  async fn test_update_merges_and_protects_owner() {
    let (data, _) = setup();
    let u1 = OwnerScope::user("u1");
    data.applications(&u1).await.unwrap();

    let updated = data
      .update(
        &u1,
        EntityKind::Applications,
        "a1",
        json!({"status": "interview", "userId": "u2"}),
      )
      .await
      .unwrap();
    assert_eq!(updated.str_field("status"), Some("interview"));
    assert_eq!(updated.str_field("userId"), Some("u1"));
    assert_eq!(updated.str_field("company"), Some("Acme"));

    let apps = data.applications(&u1).await.unwrap();
    let a1 = apps.iter().find(|d| d.id == "a1").unwrap();
    assert_eq!(a1.str_field("status"), Some("interview"));
  }

  #[tokio::test]
  async fn test_writes_to_foreign_documents_fail() {
    let (data, _) = setup();
    let u1 = OwnerScope::user("u1");

    assert!(data
      .update(&u1, EntityKind::Applications, "b1", json!({"status": "x"}))
      .await
      .is_err());
    assert!(data.delete(&u1, EntityKind::Applications, "b1").await.is_err());
    assert!(data
      .update(&u1, EntityKind::Applications, "missing", json!({}))
      .await
      .is_err());
  }

  #[tokio::test]
  async fn test_delete_removes_and_invalidates() {
    let (data, _) = setup();
    let u1 = OwnerScope::user("u1");
    assert!(data.get(&u1, EntityKind::Applications, "a1").await.unwrap().is_some());

    assert!(data.delete(&u1, EntityKind::Applications, "a1").await.unwrap());
    assert!(!data.delete(&u1, EntityKind::Applications, "a1").await.unwrap());

    assert_eq!(ids(&data.applications(&u1).await.unwrap()), vec!["a2"]);
    assert!(data.get(&u1, EntityKind::Applications, "a1").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_get_hides_other_owners_documents() {
    let (data, _) = setup();
    let doc = data
      .get(&OwnerScope::user("u1"), EntityKind::Applications, "b1")
      .await
      .unwrap();
    assert!(doc.is_none());
  }

  #[tokio::test]
  async fn test_settings_returns_latest_or_none() {
    let (data, _) = setup();
    let u1 = OwnerScope::user("u1");
    assert!(data.settings(&u1).await.unwrap().is_none());

    data
      .create(&u1, EntityKind::Settings, json!({"theme": "dark"}))
      .await
      .unwrap();
    let settings = data.settings(&u1).await.unwrap().unwrap();
    assert_eq!(settings.str_field("theme"), Some("dark"));
  }

  #[tokio::test]
  async fn test_preload_reports_partial_failure() {
    let (data, store) = setup();
    let u1 = OwnerScope::user("u1");
    store.fail_next(1);

    let report = data.preload(&u1).await;
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.loaded.len(), 4);
    assert!(!report.is_complete());
    assert!(report
      .failed
      .values()
      .all(|e| matches!(e, CacheError::Fetch { .. })));

    // Loaded sets are now served from cache
    let queries = store.query_count();
    for kind in report.loaded.keys() {
      data.list(&u1, *kind).await.unwrap();
    }
    assert_eq!(store.query_count(), queries);
  }

  #[tokio::test]
  async fn test_write_releases_stream_cursor() {
    let (data, _) = setup();
    let u1 = OwnerScope::user("u1");
    let query = data.page_query(&u1, EntityKind::Applications, Some(1));

    let first = data.first_page(&query).await.unwrap();
    assert!(first.has_more);
    assert!(data.paginator().last_cursor(&query).is_some());

    data
      .create(&u1, EntityKind::Applications, json!({"company": "Hooli"}))
      .await
      .unwrap();
    assert!(data.paginator().last_cursor(&query).is_none());
    assert_eq!(data.cache().stats().total_entries, 0);
  }

  #[tokio::test]
  async fn test_next_page_with_foreign_cursor_is_invalid_cursor() {
    let (data, _) = setup();
    let u1 = OwnerScope::user("u1");
    let query = data.page_query(&u1, EntityKind::Applications, None);
    let first = data
      .first_page(&data.page_query(&u1, EntityKind::Applications, Some(1)))
      .await
      .unwrap();

    let err = data
      .next_page(&query, first.cursor.as_ref().unwrap())
      .await
      .unwrap_err();
    assert!(matches!(
      err.downcast_ref::<CacheError>(),
      Some(CacheError::InvalidCursor(_))
    ));
  }

  #[tokio::test]
  async fn test_forget_owner_drops_only_that_owner() {
    let (data, store) = setup();
    let u1 = OwnerScope::user("u1");
    let u2 = OwnerScope::user("u2");
    data.applications(&u1).await.unwrap();
    data.applications(&u2).await.unwrap();

    assert_eq!(data.forget_owner(&u1), 1);
    data.applications(&u2).await.unwrap();
    assert_eq!(store.query_count(), 2);
    data.applications(&u1).await.unwrap();
    assert_eq!(store.query_count(), 3);
  }
}
