//! Cache layer that ties the entity and index caches to a resource API.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::entities::{EntityCache, EntityRef};
use super::indexes::{Index, IndexCache};
use super::state::{FetchState, Slot};
use crate::api::ResourceApi;
use crate::error::StoreError;
use crate::reactive::Scope;

/// Both caches of one store instance, always locked together so an index
/// response and the entity merges it causes are applied atomically.
#[derive(Debug)]
pub struct CacheState {
  pub entities: EntityCache,
  pub indexes: IndexCache,
}

/// Which slot a fetch fills.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
  Entity(String),
  Index(String),
}

impl Target {
  fn key(&self) -> &str {
    match self {
      Target::Entity(key) | Target::Index(key) => key,
    }
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Target::Entity(key) => write!(f, "show:{}", key),
      Target::Index(key) => write!(f, "index:{}", key),
    }
  }
}

/// What an awaited load does next.
enum Step {
  Ready,
  Fetch(u64),
  Wait(watch::Receiver<u64>, u64),
  Failed(String),
}

fn next_step<T>(slot: &mut Slot<T>, force: bool, joined: Option<u64>) -> Step {
  if let Some(generation) = joined {
    if slot.generation == generation && slot.state == FetchState::Invalid {
      if let Some(error) = &slot.error {
        return Step::Failed(error.clone());
      }
    }
  }

  match slot.state {
    FetchState::Valid if !force => Step::Ready,
    FetchState::Loading => Step::Wait(slot.signal.subscribe(), slot.generation),
    _ => Step::Fetch(slot.begin_fetch()),
  }
}

type Request = BoxFuture<'static, Result<Value>>;

/// Fetch-if-needed orchestration for one store instance.
///
/// Reads never block: `ensure_*` returns whatever is cached and, if the slot
/// is `Invalid`, dispatches one background fetch on the current tokio
/// runtime. The slot stays `Loading` until that fetch settles, which
/// suppresses duplicate fetches for the same key.
pub struct CacheLayer {
  name: String,
  api: Arc<dyn ResourceApi>,
  state: Mutex<CacheState>,
  in_flight: watch::Sender<usize>,
}

impl CacheLayer {
  pub fn new(name: &str, api: Arc<dyn ResourceApi>, id_field: &str, index_data_field: &str) -> Self {
    let (in_flight, _) = watch::channel(0);
    Self {
      name: name.to_string(),
      api,
      state: Mutex::new(CacheState {
        entities: EntityCache::new(id_field),
        indexes: IndexCache::new(index_data_field),
      }),
      in_flight,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn api(&self) -> &Arc<dyn ResourceApi> {
    &self.api
  }

  /// Run `f` with both caches locked. `f` must not block or await.
  pub fn with_state<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
    f(&mut self.state.lock())
  }

  /// Cache key for an index parameter set.
  pub fn index_key(&self, params: &Map<String, Value>) -> String {
    self.api.key(params)
  }

  /// Current entity at `key`, dispatching a show fetch if the slot is
  /// absent or `Invalid`. Records the slot (and the entity, once present)
  /// as dependencies of `scope`.
  pub fn ensure_entity(self: &Arc<Self>, key: &str, id: Value, scope: &mut Scope) -> Option<EntityRef> {
    let (value, fetch) = self.with_state(|state| {
      let slot = state.entities.slot_mut(key);
      let fetch = slot.needs_fetch().then(|| slot.begin_fetch());
      scope.track(&slot.signal);
      if let Some(entity) = &slot.value {
        scope.track(entity.signal());
      }
      (slot.value.clone(), fetch)
    });

    if let Some(generation) = fetch {
      self.dispatch(Target::Entity(key.to_string()), generation, self.show_request(id));
    }
    value
  }

  /// Current index at `key`, dispatching an index fetch if needed.
  pub fn ensure_index(
    self: &Arc<Self>,
    key: &str,
    params: Map<String, Value>,
    scope: &mut Scope,
  ) -> Option<Arc<Index>> {
    let (value, fetch) = self.with_state(|state| {
      let slot = state.indexes.slot_mut(key);
      let fetch = slot.needs_fetch().then(|| slot.begin_fetch());
      scope.track(&slot.signal);
      (slot.value.clone(), fetch)
    });

    if let Some(generation) = fetch {
      self.dispatch(Target::Index(key.to_string()), generation, self.index_request(params));
    }
    value
  }

  /// Resolve once the entity at `key` is `Valid`, joining a fetch already in
  /// flight. With `force`, a fresh fetch is dispatched unless one is already
  /// running.
  pub async fn load_entity(self: &Arc<Self>, key: &str, id: Value, force: bool) -> Result<Option<EntityRef>> {
    let layer = Arc::clone(self);
    self
      .load(Target::Entity(key.to_string()), force, move || {
        layer.show_request(id.clone())
      })
      .await?;
    Ok(self.with_state(|state| state.entities.get(key)))
  }

  /// Index counterpart of [`load_entity`](Self::load_entity).
  pub async fn load_index(
    self: &Arc<Self>,
    key: &str,
    params: Map<String, Value>,
    force: bool,
  ) -> Result<Option<Arc<Index>>> {
    let layer = Arc::clone(self);
    self
      .load(Target::Index(key.to_string()), force, move || {
        layer.index_request(params.clone())
      })
      .await?;
    Ok(self.with_state(|state| state.indexes.get(key)))
  }

  /// Number of background fetches that haven't settled yet.
  pub fn in_flight(&self) -> usize {
    *self.in_flight.borrow()
  }

  /// Resolve once no background fetch is in flight.
  pub async fn settled(&self) {
    let mut rx = self.in_flight.subscribe();
    let _ = rx.wait_for(|count| *count == 0).await;
  }

  pub fn invalidate_entity(&self, key: &str) -> bool {
    self.with_state(|state| state.entities.invalidate(key))
  }

  pub fn invalidate_index(&self, key: &str) -> bool {
    self.with_state(|state| state.indexes.invalidate(key))
  }

  pub fn invalidate_all_indexes(&self) {
    self.with_state(|state| state.indexes.invalidate_all());
  }

  fn show_request(&self, id: Value) -> Request {
    let api = Arc::clone(&self.api);
    async move { api.show(id).await }.boxed()
  }

  fn index_request(&self, params: Map<String, Value>) -> Request {
    let api = Arc::clone(&self.api);
    async move { api.index(params).await }.boxed()
  }

  async fn load<F>(self: &Arc<Self>, target: Target, force: bool, request: F) -> Result<()>
  where
    F: Fn() -> Request,
  {
    let mut force = force;
    let mut joined = None;

    loop {
      let step = self.with_state(|state| match &target {
        Target::Entity(key) => next_step(state.entities.slot_mut(key), force, joined),
        Target::Index(key) => next_step(state.indexes.slot_mut(key), force, joined),
      });

      match step {
        Step::Ready => return Ok(()),
        Step::Failed(error) => return Err(StoreError::FetchFailed(error).into()),
        Step::Fetch(generation) => {
          force = false;
          joined = Some(generation);
          // Our own fetch hands back the adapter's error as is. Callers that
          // joined someone else's fetch only see its message.
          if let Some(task) = self.dispatch(target.clone(), generation, request()) {
            task
              .await
              .map_err(|e| eyre!("Fetch task for {} failed: {}", target, e))??;
          }
        }
        Step::Wait(mut rx, generation) => {
          force = false;
          joined = Some(generation);
          // A closed channel means the slot was removed; the next step recreates it.
          let _ = rx.changed().await;
        }
      }
    }
  }

  /// Spawn `request` and apply its result to `target` if `generation` is
  /// still current when it settles. The task yields the fetch error when it
  /// was recorded on the slot.
  fn dispatch<F>(self: &Arc<Self>, target: Target, generation: u64, request: F) -> Option<JoinHandle<Result<()>>>
  where
    F: Future<Output = Result<Value>> + Send + 'static,
  {
    let runtime = match Handle::try_current() {
      Ok(runtime) => runtime,
      Err(_) => {
        // Recorded on the slot; awaited loads pick it up from there.
        let _ = self.settle(&target, generation, Err(StoreError::NoRuntime.into()));
        return None;
      }
    };

    debug!(store = %self.name, key = %target, generation, "Dispatching fetch");
    self.in_flight.send_modify(|count| *count += 1);

    let layer = Arc::clone(self);
    Some(runtime.spawn(async move {
      let result = request.await;
      let settled = layer.settle(&target, generation, result);
      layer
        .in_flight
        .send_modify(|count| *count = count.saturating_sub(1));
      settled
    }))
  }

  /// Apply a fetch result. Returns the error if the fetch failed while it
  /// was still the slot's current one.
  fn settle(&self, target: &Target, generation: u64, result: Result<Value>) -> Result<()> {
    let mut state = self.state.lock();
    let CacheState { entities, indexes } = &mut *state;

    let applied = result.and_then(|response| match target {
      Target::Entity(key) => entities.apply_fetch(key, generation, response),
      Target::Index(key) => indexes.apply_fetch(key, generation, response, entities),
    });

    match applied {
      Ok(true) => {
        debug!(store = %self.name, key = %target, generation, "Fetch settled");
        Ok(())
      }
      Ok(false) => {
        debug!(store = %self.name, key = %target, generation, "Discarded superseded response");
        Ok(())
      }
      Err(error) => {
        warn!(store = %self.name, key = %target, generation, error = %error, "Fetch failed");
        let key = target.key();
        let message = error.to_string();
        let recorded = match target {
          Target::Entity(_) if entities.slot(key).is_some() => {
            entities.slot_mut(key).fail(generation, message)
          }
          Target::Index(_) if indexes.slot(key).is_some() => {
            indexes.slot_mut(key).fail(generation, message)
          }
          _ => false,
        };
        if recorded {
          Err(error)
        } else {
          Ok(())
        }
      }
    }
  }
}

impl fmt::Debug for CacheLayer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheLayer")
      .field("name", &self.name)
      .field("in_flight", &self.in_flight())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{ApiAction, MemoryApi};
  use serde_json::json;
  use std::time::Duration;

  fn layer_with(api: &Arc<MemoryApi>) -> Arc<CacheLayer> {
    let api: Arc<dyn ResourceApi> = Arc::clone(api) as Arc<dyn ResourceApi>;
    Arc::new(CacheLayer::new("users", api, "id", "data"))
  }

  fn users() -> Arc<MemoryApi> {
    Arc::new(MemoryApi::seeded([
      json!({"id": 1, "name": "Kevin"}),
      json!({"id": 2, "name": "Test"}),
    ]))
  }

  fn state_of(layer: &CacheLayer, key: &str) -> Option<FetchState> {
    layer.with_state(|state| state.entities.status(key).map(|s| s.state))
  }

  #[tokio::test]
  async fn test_ensure_entity_fetches_once() {
    let api = users();
    let layer = layer_with(&api);

    for _ in 0..5 {
      let value = layer.ensure_entity("1", json!(1), &mut Scope::new());
      assert!(value.is_none());
    }
    assert_eq!(state_of(&layer, "1"), Some(FetchState::Loading));

    layer.settled().await;
    assert_eq!(api.calls(ApiAction::Show), 1);
    assert_eq!(state_of(&layer, "1"), Some(FetchState::Valid));

    let entity = layer.ensure_entity("1", json!(1), &mut Scope::new());
    assert_eq!(entity.and_then(|e| e.get("name")), Some(json!("Kevin")));
    assert_eq!(api.calls(ApiAction::Show), 1);
  }

  #[tokio::test]
  async fn test_ensure_tracks_slot_signal() {
    let api = users();
    let layer = layer_with(&api);

    let mut scope = Scope::new();
    layer.ensure_index("", Map::new(), &mut scope);
    assert!(scope.is_current());

    layer.settled().await;
    assert!(!scope.is_current());
  }

  #[tokio::test]
  async fn test_failed_fetch_returns_to_invalid() {
    let api = users();
    api.fail_next(ApiAction::Show, "503 Service Unavailable");
    let layer = layer_with(&api);

    layer.ensure_entity("1", json!(1), &mut Scope::new());
    layer.settled().await;

    let status = layer
      .with_state(|state| state.entities.status("1"))
      .unwrap();
    assert_eq!(status.state, FetchState::Invalid);
    assert_eq!(status.error.as_deref(), Some("503 Service Unavailable"));

    // The next read retries.
    layer.ensure_entity("1", json!(1), &mut Scope::new());
    layer.settled().await;
    assert_eq!(api.calls(ApiAction::Show), 2);
    assert_eq!(state_of(&layer, "1"), Some(FetchState::Valid));
  }

  #[test]
  fn test_dispatch_without_runtime_fails_slot() {
    let api = users();
    let layer = layer_with(&api);

    layer.ensure_entity("1", json!(1), &mut Scope::new());

    let status = layer
      .with_state(|state| state.entities.status("1"))
      .unwrap();
    assert_eq!(status.state, FetchState::Invalid);
    assert_eq!(status.error, Some(StoreError::NoRuntime.to_string()));
    assert_eq!(layer.in_flight(), 0);
  }

  #[tokio::test]
  async fn test_load_joins_in_flight_fetch() {
    let api = users();
    api.delay_next(ApiAction::Show, Duration::from_millis(30));
    let layer = layer_with(&api);

    layer.ensure_entity("2", json!(2), &mut Scope::new());
    let entity = layer.load_entity("2", json!(2), false).await.unwrap();

    assert_eq!(entity.and_then(|e| e.get("name")), Some(json!("Test")));
    assert_eq!(api.calls(ApiAction::Show), 1);
  }

  #[tokio::test]
  async fn test_load_reports_failure() {
    let api = users();
    api.fail_next(ApiAction::Index, "500 Internal Server Error");
    let layer = layer_with(&api);

    let err = layer.load_index("", Map::new(), false).await.unwrap_err();
    assert_eq!(err.to_string(), "500 Internal Server Error");
    assert!(err.downcast_ref::<StoreError>().is_none());
  }

  #[tokio::test]
  async fn test_joined_load_reports_failure_message() {
    let api = users();
    api.fail_next(ApiAction::Show, "503 Service Unavailable");
    api.delay_next(ApiAction::Show, Duration::from_millis(20));
    let layer = layer_with(&api);

    layer.ensure_entity("1", json!(1), &mut Scope::new());
    let err = layer.load_entity("1", json!(1), false).await.unwrap_err();
    assert_eq!(
      err.downcast_ref::<StoreError>(),
      Some(&StoreError::FetchFailed("503 Service Unavailable".into()))
    );
    assert_eq!(api.calls(ApiAction::Show), 1);
  }

  #[tokio::test]
  async fn test_forced_load_refetches_valid_slot() {
    let api = users();
    let layer = layer_with(&api);

    layer.load_index("", Map::new(), false).await.unwrap();
    layer.load_index("", Map::new(), false).await.unwrap();
    assert_eq!(api.calls(ApiAction::Index), 1);

    let index = layer.load_index("", Map::new(), true).await.unwrap();
    assert_eq!(api.calls(ApiAction::Index), 2);
    assert_eq!(index.map(|i| i.len()), Some(2));
  }

  #[tokio::test]
  async fn test_superseded_show_is_discarded() {
    let api = users();
    api.delay_next(ApiAction::Show, Duration::from_millis(40));
    let layer = layer_with(&api);

    // Slow fetch of the seeded record.
    layer.ensure_entity("1", json!(1), &mut Scope::new());
    tokio::time::sleep(Duration::from_millis(5)).await;

    // A direct merge supersedes it.
    layer.with_state(|state| {
      state
        .entities
        .merge_element(&json!({"id": 1, "name": "Chuck"}))
        .map(|_| ())
    })
    .unwrap();

    layer.settled().await;
    let name = layer.with_state(|state| state.entities.get("1").and_then(|e| e.get("name")));
    assert_eq!(name, Some(json!("Chuck")));
  }

  #[tokio::test]
  async fn test_late_index_response_is_discarded() {
    let api = users();
    api.delay_next(ApiAction::Index, Duration::from_millis(50));
    let layer = layer_with(&api);

    // Fetch A reads the two seeded records, then stalls.
    layer.ensure_index("", Map::new(), &mut Scope::new());
    tokio::time::sleep(Duration::from_millis(5)).await;

    api.insert(json!({"id": 3, "name": "Chuck"}));
    assert!(layer.invalidate_index(""));

    // Fetch B sees the new record and settles first.
    let index = layer.load_index("", Map::new(), false).await.unwrap();
    assert_eq!(index.map(|i| i.keys()), Some(vec!["1".into(), "2".into(), "3".into()]));

    layer.settled().await;
    assert_eq!(api.calls(ApiAction::Index), 2);
    let keys = layer.with_state(|state| state.indexes.get("").map(|i| i.keys()));
    assert_eq!(keys, Some(vec!["1".to_string(), "2".to_string(), "3".to_string()]));
    let status = layer.with_state(|state| state.indexes.status("")).unwrap();
    assert_eq!(status.state, FetchState::Valid);
    assert_eq!(status.generation, 2);
  }
}
