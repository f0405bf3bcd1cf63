//! Normalized entity cache.
//!
//! The cache owns the one canonical [`Entity`] per primary key. Everything
//! else (show handles, index result sets, mutation results) holds an
//! [`EntityRef`] to that same allocation, and merges assign fields in place,
//! so every holder observes updates.

use color_eyre::Result;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::state::{Slot, SlotStatus};
use crate::error::{value_kind, StoreError};
use crate::reactive::{Scope, Signal};

/// A cached record. Fields are opaque JSON.
pub struct Entity {
  key: String,
  fields: RwLock<Map<String, Value>>,
  signal: Signal,
}

/// Shared handle to the canonical copy of an entity.
pub type EntityRef = Arc<Entity>;

impl Entity {
  fn new(key: &str) -> Self {
    Self {
      key: key.to_string(),
      fields: RwLock::new(Map::new()),
      signal: Signal::new(),
    }
  }

  /// The cache key this entity is stored under.
  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn get(&self, field: &str) -> Option<Value> {
    self.fields.read().get(field).cloned()
  }

  /// Read a field and record the entity as a dependency of `scope`.
  pub fn get_tracked(&self, field: &str, scope: &mut Scope) -> Option<Value> {
    scope.track(&self.signal);
    self.get(field)
  }

  /// Snapshot of all fields as a JSON object.
  pub fn to_value(&self) -> Value {
    Value::Object(self.fields.read().clone())
  }

  pub fn signal(&self) -> &Signal {
    &self.signal
  }

  /// Field-level assignment. Emits only if some field actually changed.
  fn assign(&self, partial: Map<String, Value>) -> bool {
    let mut fields = self.fields.write();
    let mut changed = false;
    for (name, value) in partial {
      if fields.get(&name) != Some(&value) {
        fields.insert(name, value);
        changed = true;
      }
    }
    drop(fields);

    if changed {
      self.signal.emit();
    }
    changed
  }
}

impl std::fmt::Debug for Entity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Entity")
      .field("key", &self.key)
      .field("fields", &*self.fields.read())
      .finish()
  }
}

/// Canonical cache key for a primary-key value. Only strings and numbers
/// can identify an entity, so `1` and `"1"` address the same slot.
pub fn entity_key(id: &Value) -> Option<String> {
  match id {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Anything that can name an entity: an id, an element carrying the id
/// field, or a cached entity.
pub trait IntoKey {
  fn into_key(self, id_field: &str) -> Option<String>;
}

impl IntoKey for &Value {
  fn into_key(self, id_field: &str) -> Option<String> {
    match self {
      Value::Object(fields) => fields.get(id_field).and_then(entity_key),
      other => entity_key(other),
    }
  }
}

impl IntoKey for Value {
  fn into_key(self, id_field: &str) -> Option<String> {
    (&self).into_key(id_field)
  }
}

impl IntoKey for &str {
  fn into_key(self, _id_field: &str) -> Option<String> {
    Some(self.to_string())
  }
}

impl IntoKey for String {
  fn into_key(self, _id_field: &str) -> Option<String> {
    Some(self)
  }
}

impl IntoKey for i64 {
  fn into_key(self, _id_field: &str) -> Option<String> {
    Some(self.to_string())
  }
}

impl IntoKey for u64 {
  fn into_key(self, _id_field: &str) -> Option<String> {
    Some(self.to_string())
  }
}

impl IntoKey for i32 {
  fn into_key(self, _id_field: &str) -> Option<String> {
    Some(self.to_string())
  }
}

impl IntoKey for &Entity {
  fn into_key(self, _id_field: &str) -> Option<String> {
    Some(self.key.clone())
  }
}

impl IntoKey for &EntityRef {
  fn into_key(self, _id_field: &str) -> Option<String> {
    Some(self.key.clone())
  }
}

/// Key → entity mapping with per-entity freshness.
#[derive(Debug)]
pub struct EntityCache {
  id_field: String,
  slots: HashMap<String, Slot<EntityRef>>,
  /// Last generation of each deleted slot, so a recreated slot never
  /// reuses a generation an older fetch still carries.
  retired: HashMap<String, u64>,
}

impl EntityCache {
  pub fn new(id_field: impl Into<String>) -> Self {
    Self {
      id_field: id_field.into(),
      slots: HashMap::new(),
      retired: HashMap::new(),
    }
  }

  pub fn id_field(&self) -> &str {
    &self.id_field
  }

  /// Current cached entity, if any. No side effects.
  pub fn get(&self, key: &str) -> Option<EntityRef> {
    self.slots.get(key).and_then(|slot| slot.value.clone())
  }

  pub fn status(&self, key: &str) -> Option<SlotStatus> {
    self.slots.get(key).map(Slot::status)
  }

  pub fn len(&self) -> usize {
    self.slots.values().filter(|slot| slot.value.is_some()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Shallow-merge `partial` into the entity at `key`, creating it if absent,
  /// and mark it `Valid`. Any fetch in flight for the key is superseded.
  pub fn merge(&mut self, key: &str, partial: Map<String, Value>) -> EntityRef {
    let entity = self.assign(key, partial);
    if let Some(slot) = self.slots.get_mut(key) {
      slot.supersede();
    }
    entity
  }

  /// Merge an element keyed by its own id field.
  pub fn merge_element(&mut self, element: &Value) -> Result<EntityRef> {
    let key = self.require_key(element)?;
    self.merge_object(&key, element)
  }

  /// Merge an object under an explicit key.
  pub fn merge_object(&mut self, key: &str, element: &Value) -> Result<EntityRef> {
    match element {
      Value::Object(fields) => Ok(self.merge(key, fields.clone())),
      other => Err(
        StoreError::NotAnObject {
          context: "entity",
          found: value_kind(other),
        }
        .into(),
      ),
    }
  }

  /// Merge each element by its id field.
  ///
  /// Either every element is merged or none is: all of them must be objects
  /// carrying an id before anything is written.
  pub fn merge_many(&mut self, elements: &[Value]) -> Result<Vec<EntityRef>> {
    let mut keyed = Vec::with_capacity(elements.len());
    for element in elements {
      let fields = match element {
        Value::Object(fields) => fields,
        other => {
          return Err(
            StoreError::NotAnObject {
              context: "index element",
              found: value_kind(other),
            }
            .into(),
          )
        }
      };
      keyed.push((self.require_key(element)?, fields));
    }

    Ok(
      keyed
        .into_iter()
        .map(|(key, fields)| self.merge(&key, fields.clone()))
        .collect(),
    )
  }

  /// Remove the entity and its freshness state. Fetches in flight for the
  /// key are discarded when they settle.
  pub fn delete(&mut self, key: &str) -> Option<EntityRef> {
    let slot = self.slots.remove(key)?;
    self.retired.insert(key.to_string(), slot.generation);
    slot.signal.emit();
    slot.value
  }

  /// Force a refetch on the next read while keeping the data visible.
  pub fn invalidate(&mut self, key: &str) -> bool {
    match self.slots.get_mut(key) {
      Some(slot) => {
        slot.invalidate();
        true
      }
      None => false,
    }
  }

  pub fn invalidate_all(&mut self) {
    for slot in self.slots.values_mut() {
      slot.invalidate();
    }
  }

  pub(crate) fn slot(&self, key: &str) -> Option<&Slot<EntityRef>> {
    self.slots.get(key)
  }

  /// The slot for `key`, created empty on first reference.
  pub(crate) fn slot_mut(&mut self, key: &str) -> &mut Slot<EntityRef> {
    let retired = &mut self.retired;
    self
      .slots
      .entry(key.to_string())
      .or_insert_with(|| Slot::resumed(retired.remove(key).unwrap_or(0)))
  }

  /// Apply the result of a show fetch of `generation`.
  ///
  /// Returns `Ok(false)` when a newer fetch or write has superseded it. A
  /// `null` response means the entity doesn't exist.
  pub(crate) fn apply_fetch(&mut self, key: &str, generation: u64, response: Value) -> Result<bool> {
    let accepted = self
      .slots
      .get(key)
      .is_some_and(|slot| slot.accepts(generation));
    if !accepted {
      return Ok(false);
    }

    match response {
      Value::Null => {
        self.slot_mut(key).fill(None);
      }
      Value::Object(fields) => {
        self.assign(key, fields);
        self.slot_mut(key).mark_valid();
      }
      other => {
        return Err(
          StoreError::NotAnObject {
            context: "show response",
            found: value_kind(&other),
          }
          .into(),
        )
      }
    }
    Ok(true)
  }

  fn require_key(&self, element: &Value) -> Result<String> {
    element.into_key(&self.id_field).ok_or_else(|| {
      StoreError::MissingId {
        field: self.id_field.clone(),
      }
      .into()
    })
  }

  /// Find or create the canonical entity and assign fields into it.
  fn assign(&mut self, key: &str, partial: Map<String, Value>) -> EntityRef {
    let slot = self.slot_mut(key);
    let entity = match &slot.value {
      Some(existing) => Arc::clone(existing),
      None => {
        let created = Arc::new(Entity::new(key));
        slot.value = Some(Arc::clone(&created));
        slot.signal.emit();
        created
      }
    };
    entity.assign(partial);
    entity
  }
}
