//! Reactive parameter sets and their canonical encoding.
//!
//! A [`Params`] maps names to [`Param`]s, which may be plain JSON values or
//! reactive ones. Before a parameter set is used as a cache key or sent to a
//! [`ResourceApi`](crate::api::ResourceApi) it is flattened with
//! [`Params::resolve`], which must happen on every read because the reactive
//! values can change between reads.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::reactive::{Computed, Scope, Source};

/// One parameter value: concrete, or resolved from a reactive source.
#[derive(Clone, Debug)]
pub enum Param {
  Value(Value),
  Source(Source<Value>),
  Computed(Computed<Value>),
}

impl Param {
  /// Build a parameter whose value is derived from other reactive values.
  pub fn computed<F>(compute: F) -> Self
  where
    F: Fn(&mut Scope) -> Value + Send + Sync + 'static,
  {
    Param::Computed(Computed::new(compute))
  }

  /// Current value, tracking any reactive read in `scope`.
  pub fn resolve(&self, scope: &mut Scope) -> Value {
    match self {
      Param::Value(value) => value.clone(),
      Param::Source(source) => source.get(scope),
      Param::Computed(computed) => computed.get_tracked(scope),
    }
  }
}

impl From<Value> for Param {
  fn from(value: Value) -> Self {
    Param::Value(value)
  }
}

impl From<Source<Value>> for Param {
  fn from(source: Source<Value>) -> Self {
    Param::Source(source)
  }
}

impl From<Computed<Value>> for Param {
  fn from(computed: Computed<Value>) -> Self {
    Param::Computed(computed)
  }
}

impl From<&str> for Param {
  fn from(value: &str) -> Self {
    Param::Value(Value::from(value))
  }
}

impl From<String> for Param {
  fn from(value: String) -> Self {
    Param::Value(Value::from(value))
  }
}

impl From<i64> for Param {
  fn from(value: i64) -> Self {
    Param::Value(Value::from(value))
  }
}

impl From<u64> for Param {
  fn from(value: u64) -> Self {
    Param::Value(Value::from(value))
  }
}

impl From<i32> for Param {
  fn from(value: i32) -> Self {
    Param::Value(Value::from(value))
  }
}

impl From<bool> for Param {
  fn from(value: bool) -> Self {
    Param::Value(Value::from(value))
  }
}

type ObjectFn = Arc<dyn Fn(&mut Scope) -> Map<String, Value> + Send + Sync>;

#[derive(Clone)]
enum ParamsKind {
  Fields(BTreeMap<String, Param>),
  Object(Source<Map<String, Value>>),
  Computed(ObjectFn),
}

/// A named parameter set whose values may be reactive.
#[derive(Clone)]
pub struct Params {
  kind: ParamsKind,
}

impl Params {
  pub fn new() -> Self {
    Self {
      kind: ParamsKind::Fields(BTreeMap::new()),
    }
  }

  /// Add or replace one parameter. Has no effect on object-backed sets.
  pub fn with(mut self, name: impl Into<String>, param: impl Into<Param>) -> Self {
    if let ParamsKind::Fields(fields) = &mut self.kind {
      fields.insert(name.into(), param.into());
    }
    self
  }

  /// A parameter set backed by a whole reactive object.
  pub fn from_source(source: Source<Map<String, Value>>) -> Self {
    Self {
      kind: ParamsKind::Object(source),
    }
  }

  /// A parameter set computed as a whole from other reactive values.
  pub fn computed<F>(compute: F) -> Self
  where
    F: Fn(&mut Scope) -> Map<String, Value> + Send + Sync + 'static,
  {
    Self {
      kind: ParamsKind::Computed(Arc::new(compute)),
    }
  }

  /// Flatten every reactive value to its current concrete value.
  pub fn resolve(&self, scope: &mut Scope) -> Map<String, Value> {
    match &self.kind {
      ParamsKind::Fields(fields) => fields
        .iter()
        .map(|(name, param)| (name.clone(), param.resolve(scope)))
        .collect(),
      ParamsKind::Object(source) => source.get(scope),
      ParamsKind::Computed(compute) => compute(scope),
    }
  }

  /// Flatten without recording any dependency.
  pub fn resolve_untracked(&self) -> Map<String, Value> {
    self.resolve(&mut Scope::new())
  }
}

impl Default for Params {
  fn default() -> Self {
    Self::new()
  }
}

impl From<Map<String, Value>> for Params {
  fn from(map: Map<String, Value>) -> Self {
    Self {
      kind: ParamsKind::Fields(
        map
          .into_iter()
          .map(|(name, value)| (name, Param::Value(value)))
          .collect(),
      ),
    }
  }
}

impl std::fmt::Debug for Params {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.kind {
      ParamsKind::Fields(fields) => f.debug_map().entries(fields.iter()).finish(),
      ParamsKind::Object(source) => f.debug_tuple("Params").field(source).finish(),
      ParamsKind::Computed(_) => f.write_str("Params(<computed>)"),
    }
  }
}

/// Render a scalar parameter value for a URL or cache key.
///
/// `null` renders as nothing. Strings are used raw, and nested structures
/// are rendered as compact JSON.
pub fn scalar_string(value: &Value) -> Option<String> {
  match value {
    Value::Null => None,
    Value::String(s) => Some(s.clone()),
    Value::Bool(b) => Some(b.to_string()),
    Value::Number(n) => Some(n.to_string()),
    Value::Array(_) | Value::Object(_) => Some(value.to_string()),
  }
}

/// Sorted `(name, value)` pairs for a query string. Nulls are dropped, and
/// arrays expand to one pair per element.
pub fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
  let mut names: Vec<&String> = params.keys().collect();
  names.sort();

  let mut pairs = Vec::new();
  for name in names {
    match &params[name] {
      Value::Array(items) => {
        for item in items {
          if let Some(value) = scalar_string(item) {
            pairs.push((name.clone(), value));
          }
        }
      }
      other => {
        if let Some(value) = scalar_string(other) {
          pairs.push((name.clone(), value));
        }
      }
    }
  }
  pairs
}

/// Canonical, insertion-order-independent query string for `params`.
pub fn canonical_query(params: &Map<String, Value>) -> String {
  url::form_urlencoded::Serializer::new(String::new())
    .extend_pairs(query_pairs(params))
    .finish()
}
