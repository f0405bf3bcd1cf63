//! Store factory.
//!
//! [`define_api_store`] wires a [`ResourceApi`] to an entity cache and an
//! index cache and returns a [`StoreDefinition`]. Each
//! [`instance`](StoreDefinition::instance) of a definition has its own
//! caches; [`shared`](StoreDefinition::shared) hands out one lazily created
//! instance for code that wants a single named store.
//!
//! ```ignore
//! let users = define_api_store("users", "/api/users/:id?", StoreOptions::default())?
//!   .with_action("publish", CustomAction::new(ApiAction::Update).invalidating_indexes())?
//!   .shared();
//!
//! let kevin = users.show(1);
//! let page = users.index(Params::new().with("page", page_source.clone()));
//! ```

mod actions;
mod handles;

pub use actions::ActionOutcome;
pub use handles::{IndexHandle, ShowHandle};

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crate::api::{CustomAction, JsonApi, ResourceApi, UrlFormatter};
use crate::cache::{CacheLayer, EntityRef, Index, IntoKey, SlotStatus};
use crate::error::StoreError;
use crate::params::{Param, Params};

/// Operation names a custom action may not take.
const RESERVED_ACTIONS: &[&str] = &[
  "show",
  "index",
  "store",
  "update",
  "destroy",
  "invalidate",
  "invalidate_index",
  "invalidate_all_indexes",
];

/// Per-store options. Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
  /// Primary-key field of every entity
  pub id_field: String,
  /// Member of an index response holding the element array
  pub index_data_field: String,
  /// Member of an index response exposed as [`IndexHandle::meta`]
  pub index_meta_field: String,
  /// When set, `show` with no id yields nothing and fetches nothing
  pub show_requires_key: bool,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      id_field: "id".to_string(),
      index_data_field: "data".to_string(),
      index_meta_field: "meta".to_string(),
      show_requires_key: true,
    }
  }
}

/// Where a store gets its data: a ready adapter, or a URL (template) for
/// the default [`JsonApi`].
pub enum ApiSource {
  Api(Arc<dyn ResourceApi>),
  Url(String),
  Formatter(UrlFormatter),
}

impl From<&str> for ApiSource {
  fn from(url: &str) -> Self {
    ApiSource::Url(url.to_string())
  }
}

impl From<String> for ApiSource {
  fn from(url: String) -> Self {
    ApiSource::Url(url)
  }
}

impl From<UrlFormatter> for ApiSource {
  fn from(formatter: UrlFormatter) -> Self {
    ApiSource::Formatter(formatter)
  }
}

impl From<Arc<dyn ResourceApi>> for ApiSource {
  fn from(api: Arc<dyn ResourceApi>) -> Self {
    ApiSource::Api(api)
  }
}

impl<A: ResourceApi> From<Arc<A>> for ApiSource {
  fn from(api: Arc<A>) -> Self {
    ApiSource::Api(api)
  }
}

impl ApiSource {
  fn build(self, options: &StoreOptions, singleton: bool) -> Result<Arc<dyn ResourceApi>> {
    let api: Arc<dyn ResourceApi> = match self {
      ApiSource::Api(api) => return Ok(api),
      ApiSource::Url(url) if singleton => Arc::new(JsonApi::singleton(&url)?),
      ApiSource::Url(url) => Arc::new(JsonApi::new(&url)?.with_id_field(&options.id_field)),
      ApiSource::Formatter(formatter) => {
        Arc::new(JsonApi::from_formatter(formatter.with_id_field(&options.id_field))?)
      }
    };
    Ok(api)
  }
}

/// Define a store for a collection resource.
pub fn define_api_store(
  name: &str,
  api: impl Into<ApiSource>,
  options: StoreOptions,
) -> Result<StoreDefinition> {
  validate_name(name)?;
  let api = api.into().build(&options, false)?;
  Ok(StoreDefinition::new(name, api, options))
}

/// Define a store for a single resource such as `/api/me`.
///
/// URLs ignore ids and actions, `show` needs no id, and the entity is cached
/// under the empty key.
pub fn define_single_api_store(
  name: &str,
  api: impl Into<ApiSource>,
  options: StoreOptions,
) -> Result<StoreDefinition> {
  validate_name(name)?;
  let options = StoreOptions {
    show_requires_key: false,
    ..options
  };
  let api = api.into().build(&options, true)?;
  Ok(StoreDefinition::new(name, api, options))
}

fn validate_name(name: &str) -> Result<()> {
  let mut chars = name.chars();
  let valid = chars
    .next()
    .is_some_and(|first| first.is_alphabetic() || first == '_')
    && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-');

  if valid {
    Ok(())
  } else {
    Err(StoreError::InvalidName(name.to_string()).into())
  }
}

/// A named, reusable store definition.
pub struct StoreDefinition {
  name: String,
  api: Arc<dyn ResourceApi>,
  options: StoreOptions,
  actions: BTreeMap<String, CustomAction>,
  shared: OnceLock<ApiStore>,
}

impl StoreDefinition {
  fn new(name: &str, api: Arc<dyn ResourceApi>, options: StoreOptions) -> Self {
    Self {
      name: name.to_string(),
      api,
      options,
      actions: BTreeMap::new(),
      shared: OnceLock::new(),
    }
  }

  /// Add a named custom action, callable through [`ApiStore::action`].
  pub fn with_action(mut self, name: &str, action: CustomAction) -> Result<Self> {
    validate_name(name)?;
    if RESERVED_ACTIONS.contains(&name) {
      return Err(StoreError::ReservedAction(name.to_string()).into());
    }
    self.actions.insert(name.to_string(), action);
    Ok(self)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn options(&self) -> &StoreOptions {
    &self.options
  }

  /// A new store with empty caches.
  pub fn instance(&self) -> ApiStore {
    let layer = CacheLayer::new(
      &self.name,
      Arc::clone(&self.api),
      &self.options.id_field,
      &self.options.index_data_field,
    );
    ApiStore {
      layer: Arc::new(layer),
      options: Arc::new(self.options.clone()),
      actions: Arc::new(self.actions.clone()),
    }
  }

  /// The one shared instance, created on first use.
  pub fn shared(&self) -> ApiStore {
    self.shared.get_or_init(|| self.instance()).clone()
  }
}

impl std::fmt::Debug for StoreDefinition {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StoreDefinition")
      .field("name", &self.name)
      .field("options", &self.options)
      .field("actions", &self.actions)
      .finish_non_exhaustive()
  }
}

/// One store instance. Clones share the same caches.
#[derive(Debug, Clone)]
pub struct ApiStore {
  layer: Arc<CacheLayer>,
  options: Arc<StoreOptions>,
  actions: Arc<BTreeMap<String, CustomAction>>,
}

impl ApiStore {
  pub fn name(&self) -> &str {
    self.layer.name()
  }

  pub fn options(&self) -> &StoreOptions {
    &self.options
  }

  /// Names of the custom actions, sorted.
  pub fn action_names(&self) -> Vec<&str> {
    self.actions.keys().map(String::as_str).collect()
  }

  /// Lazy handle to one entity. `id` may be reactive; it is resolved on
  /// every read.
  pub fn show(&self, id: impl Into<Param>) -> ShowHandle {
    ShowHandle::new(Arc::clone(&self.layer), id.into(), &self.options)
  }

  /// Lazy handle to one result set. Parameters are resolved on every read.
  pub fn index(&self, params: impl Into<Params>) -> IndexHandle {
    IndexHandle::new(Arc::clone(&self.layer), params.into(), &self.options)
  }

  /// Mark an entity `Invalid`. Its data stays visible until the refetch
  /// lands. Returns whether the entity was known.
  pub fn invalidate(&self, target: impl IntoKey) -> bool {
    match target.into_key(&self.options.id_field) {
      Some(key) => self.layer.invalidate_entity(&key),
      None => false,
    }
  }

  /// Mark the index for `params` `Invalid`.
  pub fn invalidate_index(&self, params: &Params) -> bool {
    self.layer.invalidate_index(&self.index_key(params))
  }

  pub fn invalidate_all_indexes(&self) {
    self.layer.invalidate_all_indexes();
  }

  /// Cache key the current values of `params` map to.
  pub fn index_key(&self, params: &Params) -> String {
    self.layer.index_key(&params.resolve_untracked())
  }

  /// Cached entity, without fetching.
  pub fn cached(&self, target: impl IntoKey) -> Option<EntityRef> {
    let key = target.into_key(&self.options.id_field)?;
    self.layer.with_state(|state| state.entities.get(&key))
  }

  /// Cached index, without fetching.
  pub fn cached_index(&self, params: &Params) -> Option<Arc<Index>> {
    let key = self.index_key(params);
    self.layer.with_state(|state| state.indexes.get(&key))
  }

  pub fn entity_status(&self, target: impl IntoKey) -> Option<SlotStatus> {
    let key = target.into_key(&self.options.id_field)?;
    self.layer.with_state(|state| state.entities.status(&key))
  }

  pub fn index_status(&self, params: &Params) -> Option<SlotStatus> {
    let key = self.index_key(params);
    self.layer.with_state(|state| state.indexes.status(&key))
  }

  /// Background fetches not yet settled.
  pub fn in_flight(&self) -> usize {
    self.layer.in_flight()
  }

  /// Resolve once every background fetch has settled.
  pub async fn settled(&self) {
    self.layer.settled().await;
  }
}
