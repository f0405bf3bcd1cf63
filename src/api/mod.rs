//! Resource API adapters.
//!
//! The cache core only talks to a [`ResourceApi`]: a canonical `key` for a
//! parameter set plus the five REST operations. How URLs are built and how
//! requests travel is up to the adapter:
//!
//! - [`JsonApi`] talks to a JSON endpoint over HTTP through a bounded
//!   [`HttpQueue`], building URLs with a [`UrlFormatter`].
//! - [`MemoryApi`] keeps a collection in memory, which is useful for tests
//!   and demos.

mod formatter;
mod json;
mod memory;
mod queue;

pub use formatter::{UrlFormatter, UrlIntent, UrlTemplate};
pub use json::{JsonApi, XSRF_HEADER};
pub use memory::MemoryApi;
pub use queue::{HttpQueue, DEFAULT_CONCURRENCY};

use color_eyre::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::params::canonical_query;

/// The REST operations a resource supports. The HTTP verbs are accepted as
/// aliases when deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiAction {
  Index,
  #[serde(alias = "get")]
  Show,
  #[serde(alias = "post")]
  Store,
  #[serde(alias = "put")]
  Update,
  #[serde(alias = "delete")]
  Destroy,
}

impl ApiAction {
  pub fn as_str(&self) -> &'static str {
    match self {
      ApiAction::Index => "index",
      ApiAction::Show => "show",
      ApiAction::Store => "store",
      ApiAction::Update => "update",
      ApiAction::Destroy => "destroy",
    }
  }

  /// Whether the action addresses a single existing element by id.
  pub fn targets_element(&self) -> bool {
    matches!(self, ApiAction::Show | ApiAction::Update | ApiAction::Destroy)
  }
}

impl std::fmt::Display for ApiAction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An extra named store operation that wraps one API action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomAction {
  pub api_action: ApiAction,
  /// Mark every index invalid after the call succeeds
  #[serde(default)]
  pub invalidate_indexes: bool,
  /// Merge the returned element(s) into the entity cache
  #[serde(default)]
  pub merge_elements: bool,
  /// URL template overriding the adapter's default for this action
  #[serde(default)]
  pub url: Option<String>,
}

impl CustomAction {
  pub fn new(api_action: ApiAction) -> Self {
    Self {
      api_action,
      invalidate_indexes: false,
      merge_elements: false,
      url: None,
    }
  }

  pub fn invalidating_indexes(mut self) -> Self {
    self.invalidate_indexes = true;
    self
  }

  pub fn merging_elements(mut self) -> Self {
    self.merge_elements = true;
    self
  }

  pub fn with_url(mut self, url: impl Into<String>) -> Self {
    self.url = Some(url.into());
    self
  }
}

/// Contract between the cache core and a REST-style JSON resource.
///
/// Every method is a suspension point. Errors returned here (network
/// failures, non-2xx statuses, malformed JSON) reach the caller unchanged.
pub trait ResourceApi: Send + Sync + 'static {
  /// Canonical cache key for an index parameter set. Must be a pure function
  /// of the values, independent of insertion order.
  fn key(&self, params: &Map<String, Value>) -> String {
    canonical_query(params)
  }

  /// Fetch a result set. Returns the whole envelope, e.g. `{ data, meta }`.
  fn index(&self, params: Map<String, Value>) -> BoxFuture<'_, Result<Value>>;

  /// Fetch one element. `null` means it doesn't exist.
  fn show(&self, id: Value) -> BoxFuture<'_, Result<Value>>;

  fn store(&self, element: Value, params: Map<String, Value>) -> BoxFuture<'_, Result<Value>>;

  fn update(&self, element: Value, params: Map<String, Value>) -> BoxFuture<'_, Result<Value>>;

  /// Delete an element. Returns the deleted element, or `null` if the
  /// resource sends no body.
  fn destroy(&self, element: Value, params: Map<String, Value>) -> BoxFuture<'_, Result<Value>>;

  /// Run a custom action. The default routes to the matching operation and
  /// ignores any URL override.
  fn perform<'a>(
    &'a self,
    _name: &'a str,
    action: &'a CustomAction,
    element: Value,
    params: Map<String, Value>,
  ) -> BoxFuture<'a, Result<Value>> {
    match action.api_action {
      ApiAction::Index => self.index(params),
      ApiAction::Show => self.show(element),
      ApiAction::Store => self.store(element, params),
      ApiAction::Update => self.update(element, params),
      ApiAction::Destroy => self.destroy(element, params),
    }
  }
}
