//! Error taxonomy for store definitions and cache merges.
//!
//! Every fallible operation in the crate returns `color_eyre::Result`. The
//! variants here are the configuration and contract violations the crate
//! raises itself; transport errors from a [`ResourceApi`](crate::api::ResourceApi)
//! pass through untouched. Callers can tell them apart with
//! `report.downcast_ref::<StoreError>()`.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
  #[error("invalid store name {0:?}: expected a non-empty identifier")]
  InvalidName(String),

  #[error("custom action {0:?} collides with a built-in store operation")]
  ReservedAction(String),

  #[error("store has no custom action named {0:?}")]
  UnknownAction(String),

  #[error("element has no usable {field:?} field")]
  MissingId { field: String },

  #[error("expected a JSON object for {context}, got {found}")]
  NotAnObject {
    context: &'static str,
    found: &'static str,
  },

  #[error("index response has no {field:?} field")]
  MissingIndexData { field: String },

  #[error("index field {field:?} must be an array, got {found}")]
  IndexDataNotArray { field: String, found: &'static str },

  #[error("url template {template:?} requires parameter {param:?}")]
  MissingUrlParam { template: String, param: String },

  #[error("invalid url template {template:?}: {reason}")]
  InvalidTemplate { template: String, reason: String },

  #[error("no tokio runtime is available to dispatch a fetch")]
  NoRuntime,

  /// A fetch another reader started failed; its error was logged
  /// and is reported here by message.
  #[error("fetch failed: {0}")]
  FetchFailed(String),
}

/// Short JSON type name used in error messages.
pub fn value_kind(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}
