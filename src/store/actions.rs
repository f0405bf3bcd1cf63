//! Mutation pipeline: writes go to the API first, then into the caches.
//!
//! A successful write merges the returned element into the entity cache (or
//! removes it, for destroy) and marks every index `Invalid`, since which
//! result sets a write affects can't be known. A failed write leaves both
//! caches untouched and hands the API error back to the caller.

use color_eyre::Result;
use serde_json::{Map, Value};
use tracing::debug;

use super::ApiStore;
use crate::cache::{CacheState, EntityRef, IntoKey};
use crate::error::{value_kind, StoreError};

/// Result of a custom action.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
  /// The API response as returned
  pub response: Value,
  /// Entities merged from the response, if the action merges elements
  pub merged: Vec<EntityRef>,
}

impl ApiStore {
  /// Create an element. The response is merged under its own id, which may
  /// differ from any id the element was sent with.
  pub async fn store(&self, element: impl Into<Value>) -> Result<EntityRef> {
    self.store_with(element, Map::new()).await
  }

  pub async fn store_with(&self, element: impl Into<Value>, params: Map<String, Value>) -> Result<EntityRef> {
    let response = self.layer.api().store(element.into(), params).await?;

    let entity = self.layer.with_state(|state| -> Result<EntityRef> {
      let entity = state.entities.merge_element(&response)?;
      state.indexes.invalidate_all();
      Ok(entity)
    })?;

    debug!(store = %self.name(), key = %entity.key(), "Stored element");
    Ok(entity)
  }

  /// Update an element. The id comes from the response, or from `element`
  /// when the response omits it. An empty response merges `element` itself.
  pub async fn update(&self, element: impl Into<Value>) -> Result<EntityRef> {
    self.update_with(element, Map::new()).await
  }

  pub async fn update_with(&self, element: impl Into<Value>, params: Map<String, Value>) -> Result<EntityRef> {
    let element = element.into();
    let response = self.layer.api().update(element.clone(), params).await?;
    let id_field = &self.options.id_field;

    let entity = self.layer.with_state(|state| -> Result<EntityRef> {
      let key = (&response)
        .into_key(id_field)
        .or_else(|| (&element).into_key(id_field))
        .ok_or_else(|| StoreError::MissingId {
          field: id_field.clone(),
        })?;
      let source = if response.is_null() { &element } else { &response };
      let entity = state.entities.merge_object(&key, source)?;
      state.indexes.invalidate_all();
      Ok(entity)
    })?;

    debug!(store = %self.name(), key = %entity.key(), "Updated element");
    Ok(entity)
  }

  /// Delete an element, given as an id or as an object carrying one.
  ///
  /// Returns the last cached value of the element, or what the API returned
  /// if it wasn't cached. The entity is gone from the cache afterwards, so
  /// this is a snapshot, not a live reference.
  pub async fn destroy(&self, element: impl Into<Value>) -> Result<Value> {
    self.destroy_with(element, Map::new()).await
  }

  pub async fn destroy_with(&self, element: impl Into<Value>, params: Map<String, Value>) -> Result<Value> {
    let element = element.into();
    let response = self.layer.api().destroy(element.clone(), params).await?;
    let id_field = &self.options.id_field;
    let key = (&response)
      .into_key(id_field)
      .or_else(|| (&element).into_key(id_field));

    let removed = self.layer.with_state(|state| {
      state.indexes.invalidate_all();
      key.as_deref().and_then(|key| state.entities.delete(key))
    });

    debug!(store = %self.name(), key = ?key, "Destroyed element");
    Ok(match removed {
      Some(entity) => entity.to_value(),
      None if response.is_object() => response,
      None => element,
    })
  }

  /// Run a custom action defined with
  /// [`StoreDefinition::with_action`](super::StoreDefinition::with_action).
  pub async fn action(
    &self,
    name: &str,
    element: impl Into<Value>,
    params: Map<String, Value>,
  ) -> Result<ActionOutcome> {
    let action = self
      .actions
      .get(name)
      .ok_or_else(|| StoreError::UnknownAction(name.to_string()))?;

    let response = self
      .layer
      .api()
      .perform(name, action, element.into(), params)
      .await?;

    let merged = self.layer.with_state(|state| {
      let merged = if action.merge_elements {
        merge_response(state, &response, &self.options.index_data_field)?
      } else {
        Vec::new()
      };
      if action.invalidate_indexes {
        state.indexes.invalidate_all();
      }
      Ok::<_, color_eyre::Report>(merged)
    })?;

    debug!(store = %self.name(), action = name, merged = merged.len(), "Ran custom action");
    Ok(ActionOutcome { response, merged })
  }
}

/// Merge whatever elements a custom action returned: a list, an envelope
/// with a data list or element, or a single element.
fn merge_response(state: &mut CacheState, response: &Value, data_field: &str) -> Result<Vec<EntityRef>> {
  match response {
    Value::Null => Ok(Vec::new()),
    Value::Array(elements) => state.entities.merge_many(elements),
    Value::Object(envelope) => match envelope.get(data_field) {
      Some(Value::Array(elements)) => state.entities.merge_many(elements),
      Some(element @ Value::Object(_)) => Ok(vec![state.entities.merge_element(element)?]),
      _ => Ok(vec![state.entities.merge_element(response)?]),
    },
    other => Err(
      StoreError::NotAnObject {
        context: "action response",
        found: value_kind(other),
      }
      .into(),
    ),
  }
}
