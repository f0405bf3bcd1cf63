//! Lazy, dependency-tracked read handles.
//!
//! A handle does nothing until it is read. Every read resolves the (possibly
//! reactive) id or parameters, dispatches a fetch if the slot they map to is
//! absent or invalid, and returns whatever the cache holds right now. Values
//! are memoized per [`Computed`] and recomputed when a slot, entity or
//! parameter read last time changes.

use color_eyre::Result;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::StoreOptions;
use crate::cache::{entity_key, CacheLayer, EntityRef, Index, SlotStatus};
use crate::params::{Param, Params};
use crate::reactive::{Computed, Scope};

/// Cache key and API id a show read resolves to.
fn show_target(id: &Param, id_field: &str, requires_key: bool, scope: &mut Scope) -> Option<(String, Value)> {
  let id = match id.resolve(scope) {
    Value::Object(fields) => fields.get(id_field).cloned().unwrap_or(Value::Null),
    other => other,
  };
  match entity_key(&id) {
    Some(key) => Some((key, id)),
    None if !requires_key => Some((String::new(), id)),
    None => None,
  }
}

fn index_target(layer: &CacheLayer, params: &Params, scope: &mut Scope) -> (String, Map<String, Value>) {
  let params = params.resolve(scope);
  (layer.index_key(&params), params)
}

fn read_index(layer: &Arc<CacheLayer>, params: &Params, scope: &mut Scope) -> Option<Arc<Index>> {
  let (key, params) = index_target(layer, params, scope);
  layer.ensure_index(&key, params, scope)
}

/// Handle to one entity, as returned by [`ApiStore::show`](super::ApiStore::show).
///
/// The value is the canonical [`EntityRef`], so fields merged later by any
/// index response or mutation show up through a handle obtained earlier.
#[derive(Clone)]
pub struct ShowHandle {
  layer: Arc<CacheLayer>,
  id: Param,
  id_field: String,
  requires_key: bool,
  value: Computed<Option<EntityRef>>,
}

impl ShowHandle {
  pub(crate) fn new(layer: Arc<CacheLayer>, id: Param, options: &StoreOptions) -> Self {
    let id_field = options.id_field.clone();
    let requires_key = options.show_requires_key;

    let value = {
      let layer = Arc::clone(&layer);
      let id = id.clone();
      let id_field = id_field.clone();
      Computed::new(move |cx| {
        let (key, id) = show_target(&id, &id_field, requires_key, cx)?;
        layer.ensure_entity(&key, id, cx)
      })
    };

    Self {
      layer,
      id,
      id_field,
      requires_key,
      value,
    }
  }

  /// The cached entity, fetching it in the background if needed.
  pub fn get(&self) -> Option<EntityRef> {
    self.value.get()
  }

  /// Like [`get`](Self::get), recording the read in an enclosing `scope`.
  pub fn get_tracked(&self, scope: &mut Scope) -> Option<EntityRef> {
    self.value.get_tracked(scope)
  }

  /// Snapshot of the entity's fields.
  pub fn value(&self) -> Option<Value> {
    self.get().map(|entity| entity.to_value())
  }

  pub fn computed(&self) -> &Computed<Option<EntityRef>> {
    &self.value
  }

  /// Resolve once anything the last read depended on changes.
  pub async fn changed(&self) {
    self.value.changed().await;
  }

  /// Cache key the id currently resolves to.
  pub fn key(&self) -> Option<String> {
    self.target().map(|(key, _)| key)
  }

  pub fn status(&self) -> Option<SlotStatus> {
    let key = self.key()?;
    self.layer.with_state(|state| state.entities.status(&key))
  }

  /// Wait for the entity to be loaded. Joins a fetch already in flight.
  pub async fn load(&self) -> Result<Option<EntityRef>> {
    match self.target() {
      Some((key, id)) => self.layer.load_entity(&key, id, false).await,
      None => Ok(None),
    }
  }

  /// Fetch the entity again and wait for the result.
  pub async fn refresh(&self) -> Result<Option<EntityRef>> {
    match self.target() {
      Some((key, id)) => self.layer.load_entity(&key, id, true).await,
      None => Ok(None),
    }
  }

  fn target(&self) -> Option<(String, Value)> {
    show_target(&self.id, &self.id_field, self.requires_key, &mut Scope::new())
  }
}

impl std::fmt::Debug for ShowHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ShowHandle")
      .field("store", &self.layer.name())
      .field("id", &self.id)
      .finish_non_exhaustive()
  }
}

/// Handle to one result set, as returned by
/// [`ApiStore::index`](super::ApiStore::index).
///
/// `data` and `meta` are separate lazy accessors: each read runs the
/// fetch-if-needed check on its own, so a consumer can destructure the
/// handle and only pay for what it reads.
#[derive(Clone)]
pub struct IndexHandle {
  layer: Arc<CacheLayer>,
  params: Params,
  index: Computed<Option<Arc<Index>>>,
  /// Canonical entities of the result set, in response order
  pub data: Computed<Option<Vec<EntityRef>>>,
  /// The configured meta member of the response envelope
  pub meta: Computed<Option<Value>>,
}

impl IndexHandle {
  pub(crate) fn new(layer: Arc<CacheLayer>, params: Params, options: &StoreOptions) -> Self {
    let index = {
      let layer = Arc::clone(&layer);
      let params = params.clone();
      Computed::new(move |cx| read_index(&layer, &params, cx))
    };

    let data = {
      let layer = Arc::clone(&layer);
      let params = params.clone();
      Computed::new(move |cx| {
        let index = read_index(&layer, &params, cx)?;
        for entity in index.data() {
          cx.track(entity.signal());
        }
        Some(index.data().to_vec())
      })
    };

    let meta = field_accessor(&layer, &params, options.index_meta_field.clone());

    Self {
      layer,
      params,
      index,
      data,
      meta,
    }
  }

  /// The whole cached index, fetching it in the background if needed.
  pub fn get(&self) -> Option<Arc<Index>> {
    self.index.get()
  }

  pub fn get_tracked(&self, scope: &mut Scope) -> Option<Arc<Index>> {
    self.index.get_tracked(scope)
  }

  /// A lazy accessor for any other member of the response envelope, such
  /// as `links`.
  pub fn field(&self, name: &str) -> Computed<Option<Value>> {
    field_accessor(&self.layer, &self.params, name.to_string())
  }

  /// Split into the `data` and `meta` accessors.
  pub fn into_parts(self) -> (Computed<Option<Vec<EntityRef>>>, Computed<Option<Value>>) {
    (self.data, self.meta)
  }

  /// Cache key the parameters currently resolve to.
  pub fn key(&self) -> String {
    index_target(&self.layer, &self.params, &mut Scope::new()).0
  }

  pub fn status(&self) -> Option<SlotStatus> {
    let key = self.key();
    self.layer.with_state(|state| state.indexes.status(&key))
  }

  /// Wait for the index to be loaded. Joins a fetch already in flight.
  pub async fn load(&self) -> Result<Option<Arc<Index>>> {
    let (key, params) = index_target(&self.layer, &self.params, &mut Scope::new());
    self.layer.load_index(&key, params, false).await
  }

  /// Fetch the index again and wait for the result.
  pub async fn refresh(&self) -> Result<Option<Arc<Index>>> {
    let (key, params) = index_target(&self.layer, &self.params, &mut Scope::new());
    self.layer.load_index(&key, params, true).await
  }

  /// Resolve once anything the last [`get`](Self::get) depended on changes.
  pub async fn changed(&self) {
    self.index.changed().await;
  }
}

fn field_accessor(layer: &Arc<CacheLayer>, params: &Params, name: String) -> Computed<Option<Value>> {
  let layer = Arc::clone(layer);
  let params = params.clone();
  Computed::new(move |cx| read_index(&layer, &params, cx)?.field(&name).cloned())
}

impl std::fmt::Debug for IndexHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IndexHandle")
      .field("store", &self.layer.name())
      .field("params", &self.params)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use crate::api::{ApiAction, MemoryApi};
  use crate::cache::FetchState;
  use crate::params::Params;
  use crate::reactive::Source;
  use crate::store::{define_api_store, ApiStore, StoreOptions};
  use serde_json::{json, Value};
  use std::sync::Arc;
  use std::time::Duration;

  fn setup() -> (Arc<MemoryApi>, ApiStore) {
    let api = Arc::new(MemoryApi::seeded([
      json!({"id": 1, "name": "Kevin", "full_name": "Kevin Hamer"}),
      json!({"id": 2, "name": "Test", "full_name": "Test test"}),
    ]));
    let store = define_api_store("users", Arc::clone(&api), StoreOptions::default())
      .unwrap()
      .instance();
    (api, store)
  }

  #[tokio::test]
  async fn test_show_reads_then_resolves() {
    let (api, store) = setup();
    let kevin = store.show(1);

    assert!(kevin.get().is_none());
    store.settled().await;

    assert_eq!(
      kevin.value(),
      Some(json!({"id": 1, "name": "Kevin", "full_name": "Kevin Hamer"}))
    );
    assert_eq!(api.calls(ApiAction::Show), 1);
  }

  #[tokio::test]
  async fn test_show_dedups_concurrent_reads() {
    let (api, store) = setup();
    let handles: Vec<_> = (0..4).map(|_| store.show(2)).collect();
    for handle in &handles {
      handle.get();
      handle.get();
    }
    store.settled().await;

    assert_eq!(api.calls(ApiAction::Show), 1);
    for handle in &handles {
      assert_eq!(handle.get().and_then(|e| e.get("name")), Some(json!("Test")));
    }
  }

  #[tokio::test]
  async fn test_show_without_key_fetches_nothing() {
    let (api, store) = setup();
    let handle = store.show(Value::Null);

    assert!(handle.get().is_none());
    assert!(handle.key().is_none());
    assert!(handle.load().await.unwrap().is_none());
    assert_eq!(api.calls(ApiAction::Show), 0);
  }

  #[tokio::test]
  async fn test_show_follows_reactive_id() {
    let (api, store) = setup();
    let id = Source::new(json!(1));
    let handle = store.show(id.clone());

    handle.get();
    store.settled().await;
    assert_eq!(handle.get().and_then(|e| e.get("name")), Some(json!("Kevin")));

    id.set(json!(2));
    assert!(handle.computed().is_dirty());
    handle.get();
    store.settled().await;
    assert_eq!(handle.get().and_then(|e| e.get("name")), Some(json!("Test")));
    assert_eq!(api.calls(ApiAction::Show), 2);
  }

  #[tokio::test]
  async fn test_index_first_read_is_empty() {
    let (api, store) = setup();
    let users = store.index(Params::new());

    assert!(users.data.get().is_none());
    store.settled().await;

    assert_eq!(users.data.get().map(|data| data.len()), Some(2));
    assert_eq!(users.meta.get().map(|meta| meta["total"].clone()), Some(json!(2)));
    assert_eq!(api.calls(ApiAction::Index), 1);
  }

  #[tokio::test]
  async fn test_index_fields_share_one_fetch() {
    let (api, store) = setup();
    let users = store.index(Params::new().with("per_page", 1));
    let (data, meta) = users.clone().into_parts();
    let pages = users.field("meta");

    meta.get();
    data.get();
    pages.get();
    store.settled().await;

    assert_eq!(api.calls(ApiAction::Index), 1);
    assert_eq!(data.get().map(|d| d.len()), Some(1));
    assert_eq!(
      pages.get().map(|meta| meta["total_pages"].clone()),
      Some(json!(2))
    );
    assert!(users.field("links").get().is_none());
  }

  #[tokio::test]
  async fn test_index_recomputes_key_on_param_change() {
    let (api, store) = setup();
    let page = Source::new(json!(1));
    let users = store.index(
      Params::new()
        .with("per_page", 1)
        .with("page", page.clone()),
    );

    users.data.get();
    store.settled().await;
    let first = users.data.get().unwrap();
    assert_eq!(first[0].key(), "1");

    page.set(json!(2));
    assert!(users.data.get().is_none());
    store.settled().await;
    let second = users.data.get().unwrap();
    assert_eq!(second[0].key(), "2");
    assert_eq!(api.calls(ApiAction::Index), 2);
    assert_eq!(users.key(), "page=2&per_page=1");
  }

  #[tokio::test]
  async fn test_cache_coherence_between_show_and_index() {
    let (_, store) = setup();
    let kevin = store.show(1);
    kevin.get();
    store.settled().await;

    let users = store.index(Params::new());
    users.data.get();
    store.settled().await;

    let from_show = kevin.get().unwrap();
    let from_index = users
      .data
      .get()
      .and_then(|data| data.into_iter().find(|e| e.key() == "1"))
      .unwrap();
    assert!(Arc::ptr_eq(&from_show, &from_index));
  }

  #[tokio::test]
  async fn test_index_data_notifies_on_write() {
    let (_, store) = setup();
    let users = store.index(Params::new());
    users.data.get();
    store.settled().await;
    users.data.get();

    let waiter = {
      let data = users.data.clone();
      tokio::spawn(async move { data.changed().await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    store
      .update(json!({"id": 2, "name": "Renamed"}))
      .await
      .unwrap();

    tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .unwrap()
      .unwrap();
  }

  #[tokio::test]
  async fn test_invalidation_round_trip() {
    let (api, store) = setup();
    let kevin = store.show(1);
    kevin.get();
    store.settled().await;

    api.insert(json!({"id": 1, "name": "Kevin", "full_name": "K. Hamer"}));
    assert!(store.invalidate(1));
    assert_eq!(kevin.status().map(|s| s.state), Some(FetchState::Invalid));

    // Stale data stays visible while the refetch runs.
    assert_eq!(
      kevin.get().and_then(|e| e.get("full_name")),
      Some(json!("Kevin Hamer"))
    );
    kevin.get();
    store.settled().await;

    assert_eq!(api.calls(ApiAction::Show), 2);
    assert_eq!(
      kevin.get().and_then(|e| e.get("full_name")),
      Some(json!("K. Hamer"))
    );
  }

  #[tokio::test]
  async fn test_index_invalidation_round_trip() {
    let (api, store) = setup();
    let params = Params::new();
    let users = store.index(params.clone());
    users.get();
    store.settled().await;

    assert!(store.invalidate_index(&params));
    users.get();
    users.get();
    store.settled().await;
    assert_eq!(api.calls(ApiAction::Index), 2);
    assert_eq!(users.status().map(|s| s.state), Some(FetchState::Valid));
  }

  #[tokio::test]
  async fn test_load_and_refresh() {
    let (api, store) = setup();
    let users = store.index(Params::new());

    let index = users.load().await.unwrap().unwrap();
    assert_eq!(index.len(), 2);

    api.insert(json!({"id": 3, "name": "Chuck"}));
    let index = users.refresh().await.unwrap().unwrap();
    assert_eq!(index.len(), 3);
    assert_eq!(api.calls(ApiAction::Index), 2);

    let kevin = store.show(1).load().await.unwrap();
    assert_eq!(kevin.and_then(|e| e.get("name")), Some(json!("Kevin")));
  }

  #[derive(Debug, PartialEq, thiserror::Error)]
  #[error("upstream answered {0}")]
  struct Upstream(u16);

  #[tokio::test]
  async fn test_failed_load_surfaces_error_and_retries() {
    let (api, store) = setup();
    api.fail_next_with(ApiAction::Show, Upstream(502));
    let kevin = store.show(1);

    let err = kevin.load().await.unwrap_err();
    assert_eq!(err.downcast_ref::<Upstream>(), Some(&Upstream(502)));
    assert_eq!(kevin.status().map(|s| s.state), Some(FetchState::Invalid));
    assert_eq!(
      kevin.status().and_then(|s| s.error).as_deref(),
      Some("upstream answered 502")
    );

    assert!(kevin.load().await.unwrap().is_some());
    assert_eq!(api.calls(ApiAction::Show), 2);
  }

  #[tokio::test]
  async fn test_failed_index_load_keeps_error_type() {
    let (api, store) = setup();
    api.fail_next_with(ApiAction::Index, Upstream(503));
    let users = store.index(Params::new());

    let err = users.load().await.unwrap_err();
    assert_eq!(err.downcast_ref::<Upstream>(), Some(&Upstream(503)));
    assert_eq!(users.load().await.unwrap().map(|i| i.len()), Some(2));
  }
}
