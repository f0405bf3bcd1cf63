//! Index cache: keyed result sets that reference canonical entities.

use color_eyre::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::entities::{EntityCache, EntityRef};
use super::state::{Slot, SlotStatus};
use crate::error::{value_kind, StoreError};

/// One cached index response.
///
/// `data` holds the canonical entities in response order. Every other member
/// of the response envelope (pagination meta, links, ...) is kept as-is in
/// `fields`.
#[derive(Debug, Clone)]
pub struct Index {
  data: Vec<EntityRef>,
  fields: Map<String, Value>,
}

impl Index {
  pub fn data(&self) -> &[EntityRef] {
    &self.data
  }

  /// An envelope member other than the data array.
  pub fn field(&self, name: &str) -> Option<&Value> {
    self.fields.get(name)
  }

  pub fn fields(&self) -> &Map<String, Value> {
    &self.fields
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  /// Primary keys of the entities, in order.
  pub fn keys(&self) -> Vec<String> {
    self.data.iter().map(|e| e.key().to_string()).collect()
  }
}

/// Key → result-set mapping with per-index freshness.
#[derive(Debug)]
pub struct IndexCache {
  data_field: String,
  slots: HashMap<String, Slot<Arc<Index>>>,
  /// Last generation of each deleted slot.
  retired: HashMap<String, u64>,
}

impl IndexCache {
  pub fn new(data_field: impl Into<String>) -> Self {
    Self {
      data_field: data_field.into(),
      slots: HashMap::new(),
      retired: HashMap::new(),
    }
  }

  pub fn get(&self, key: &str) -> Option<Arc<Index>> {
    self.slots.get(key).and_then(|slot| slot.value.clone())
  }

  pub fn status(&self, key: &str) -> Option<SlotStatus> {
    self.slots.get(key).map(Slot::status)
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.slots.keys().cloned().collect();
    keys.sort();
    keys
  }

  /// Store an index response under `key`.
  ///
  /// The entities in the data array are merged into `entities` first, and the
  /// index keeps references to the merged canonical copies. A response
  /// without the data field, or with a non-array one, is rejected before
  /// anything is written.
  pub fn set_index(
    &mut self,
    key: &str,
    response: Value,
    entities: &mut EntityCache,
  ) -> Result<Arc<Index>> {
    let index = Arc::new(self.build(response, entities)?);
    let slot = self.slot_mut(key);
    slot.fill(Some(Arc::clone(&index)));
    Ok(index)
  }

  /// Remove an index and its freshness state.
  pub fn delete(&mut self, key: &str) -> Option<Arc<Index>> {
    let slot = self.slots.remove(key)?;
    self.retired.insert(key.to_string(), slot.generation);
    slot.signal.emit();
    slot.value
  }

  pub fn invalidate(&mut self, key: &str) -> bool {
    match self.slots.get_mut(key) {
      Some(slot) => {
        slot.invalidate();
        true
      }
      None => false,
    }
  }

  /// Mark every known index `Invalid`.
  ///
  /// Used after any write: which result sets a write affects can't be known
  /// without query semantics, so all of them refetch on their next read.
  pub fn invalidate_all(&mut self) {
    for slot in self.slots.values_mut() {
      slot.invalidate();
    }
  }

  pub(crate) fn slot(&self, key: &str) -> Option<&Slot<Arc<Index>>> {
    self.slots.get(key)
  }

  pub(crate) fn slot_mut(&mut self, key: &str) -> &mut Slot<Arc<Index>> {
    let retired = &mut self.retired;
    self
      .slots
      .entry(key.to_string())
      .or_insert_with(|| Slot::resumed(retired.remove(key).unwrap_or(0)))
  }

  /// Apply the result of an index fetch of `generation`. Returns
  /// `Ok(false)` when a newer fetch has superseded it.
  pub(crate) fn apply_fetch(
    &mut self,
    key: &str,
    generation: u64,
    response: Value,
    entities: &mut EntityCache,
  ) -> Result<bool> {
    let accepted = self
      .slots
      .get(key)
      .is_some_and(|slot| slot.accepts(generation));
    if !accepted {
      return Ok(false);
    }
    self.set_index(key, response, entities)?;
    Ok(true)
  }

  fn build(&self, response: Value, entities: &mut EntityCache) -> Result<Index> {
    let mut fields = match response {
      Value::Object(fields) => fields,
      other => {
        return Err(
          StoreError::NotAnObject {
            context: "index response",
            found: value_kind(&other),
          }
          .into(),
        )
      }
    };

    let elements = match fields.remove(&self.data_field) {
      Some(Value::Array(elements)) => elements,
      Some(other) => {
        return Err(
          StoreError::IndexDataNotArray {
            field: self.data_field.clone(),
            found: value_kind(&other),
          }
          .into(),
        )
      }
      None => {
        return Err(
          StoreError::MissingIndexData {
            field: self.data_field.clone(),
          }
          .into(),
        )
      }
    };

    let data = entities.merge_many(&elements)?;
    Ok(Index { data, fields })
  }
}
