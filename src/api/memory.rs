use color_eyre::{eyre::eyre, Report, Result};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use super::{ApiAction, ResourceApi};
use crate::cache::{entity_key, IntoKey};
use crate::params::scalar_string;

/// Query parameters that page an index instead of filtering it.
const PAGE_PARAM: &str = "page";
const PER_PAGE_PARAM: &str = "per_page";

struct MemoryState {
  id_field: String,
  records: Vec<Map<String, Value>>,
  next_id: u64,
  calls: HashMap<ApiAction, usize>,
  delays: HashMap<ApiAction, VecDeque<Duration>>,
  failures: HashMap<ApiAction, VecDeque<Report>>,
}

impl MemoryState {
  fn position(&self, key: &str) -> Option<usize> {
    self.records.iter().position(|record| {
      record
        .get(&self.id_field)
        .and_then(entity_key)
        .is_some_and(|id| id == key)
    })
  }

  fn require(&self, element: &Value) -> Result<(String, usize)> {
    let key = element
      .into_key(&self.id_field)
      .ok_or_else(|| eyre!("400 Bad Request: missing {}", self.id_field))?;
    let position = self
      .position(&key)
      .ok_or_else(|| eyre!("404 Not Found: {}", key))?;
    Ok((key, position))
  }

  fn index(&self, params: &Map<String, Value>) -> Value {
    let filters: Vec<(&String, String)> = params
      .iter()
      .filter(|(name, _)| name.as_str() != PAGE_PARAM && name.as_str() != PER_PAGE_PARAM)
      .filter_map(|(name, value)| scalar_string(value).map(|value| (name, value)))
      .collect();

    let matching: Vec<&Map<String, Value>> = self
      .records
      .iter()
      .filter(|record| {
        filters.iter().all(|(name, expected)| {
          record
            .get(*name)
            .and_then(scalar_string)
            .is_some_and(|actual| actual == *expected)
        })
      })
      .collect();

    let total = matching.len();
    let per_page = params
      .get(PER_PAGE_PARAM)
      .and_then(number)
      .filter(|n| *n > 0)
      .unwrap_or(total.max(1));
    let current_page = params.get(PAGE_PARAM).and_then(number).unwrap_or(1).max(1);
    let total_pages = total.div_ceil(per_page).max(1);

    let data: Vec<Value> = matching
      .into_iter()
      .skip((current_page - 1).saturating_mul(per_page))
      .take(per_page)
      .map(|record| Value::Object(record.clone()))
      .collect();

    json!({
      "data": data,
      "meta": {
        "total": total,
        "current_page": current_page,
        "per_page": per_page,
        "total_pages": total_pages,
      }
    })
  }

  fn store(&mut self, element: Value) -> Result<Value> {
    let Value::Object(mut record) = element else {
      return Err(eyre!("422 Unprocessable Entity: element must be an object"));
    };
    match record.get(&self.id_field).and_then(entity_key) {
      Some(key) if self.position(&key).is_some() => {
        return Err(eyre!("409 Conflict: {} already exists", key));
      }
      Some(key) => {
        if let Ok(id) = key.parse::<u64>() {
          self.next_id = self.next_id.max(id + 1);
        }
      }
      None => {
        record.insert(self.id_field.clone(), json!(self.next_id));
        self.next_id += 1;
      }
    }
    self.records.push(record.clone());
    Ok(Value::Object(record))
  }

  fn update(&mut self, element: Value) -> Result<Value> {
    let (_, position) = self.require(&element)?;
    let Value::Object(fields) = element else {
      return Err(eyre!("422 Unprocessable Entity: element must be an object"));
    };
    let record = &mut self.records[position];
    record.extend(fields);
    Ok(Value::Object(record.clone()))
  }

  fn destroy(&mut self, element: &Value) -> Result<Value> {
    let (_, position) = self.require(element)?;
    Ok(Value::Object(self.records.remove(position)))
  }
}

fn number(value: &Value) -> Option<usize> {
  match value {
    Value::Number(n) => n.as_u64().map(|n| n as usize),
    Value::String(s) => s.parse().ok(),
    _ => None,
  }
}

/// In-memory [`ResourceApi`] for tests and demos.
///
/// Index supports equality filters on any field plus `page`/`per_page`
/// paging, and answers with a `{ data, meta }` envelope. Show answers `null`
/// for an unknown id and the first record for a `null` id, which is how a
/// singleton resource reads. Update and destroy fail with a 404 message.
///
/// Calls are counted per action, and individual calls can be delayed or made
/// to fail. A delayed read takes its snapshot before sleeping, so it can
/// deliver data older than a faster request issued after it.
pub struct MemoryApi {
  state: Mutex<MemoryState>,
  latency: Duration,
}

impl MemoryApi {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(MemoryState {
        id_field: "id".to_string(),
        records: Vec::new(),
        next_id: 1,
        calls: HashMap::new(),
        delays: HashMap::new(),
        failures: HashMap::new(),
      }),
      latency: Duration::ZERO,
    }
  }

  /// A collection holding `records`. Non-object values are skipped.
  pub fn seeded(records: impl IntoIterator<Item = Value>) -> Self {
    let api = Self::new();
    for record in records {
      api.insert(record);
    }
    api
  }

  pub fn with_id_field(self, id_field: impl Into<String>) -> Self {
    self.state.lock().id_field = id_field.into();
    self
  }

  /// Delay every call by `latency`.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  /// Add or replace a record directly, bypassing call accounting.
  pub fn insert(&self, record: Value) {
    let Value::Object(record) = record else {
      return;
    };
    let mut state = self.state.lock();
    let key = record.get(&state.id_field).and_then(entity_key);
    let existing = key.as_deref().and_then(|key| state.position(key));
    match existing {
      Some(position) => state.records[position] = record,
      None => {
        if let Some(id) = key.and_then(|key| key.parse::<u64>().ok()) {
          state.next_id = state.next_id.max(id + 1);
        }
        state.records.push(record);
      }
    }
  }

  pub fn records(&self) -> Vec<Value> {
    self
      .state
      .lock()
      .records
      .iter()
      .cloned()
      .map(Value::Object)
      .collect()
  }

  /// How many times `action` has been called.
  pub fn calls(&self, action: ApiAction) -> usize {
    self.state.lock().calls.get(&action).copied().unwrap_or(0)
  }

  /// Delay the next call of `action` by an extra `delay`.
  pub fn delay_next(&self, action: ApiAction, delay: Duration) {
    self
      .state
      .lock()
      .delays
      .entry(action)
      .or_default()
      .push_back(delay);
  }

  /// Make the next call of `action` fail with `message`.
  pub fn fail_next(&self, action: ApiAction, message: impl Into<String>) {
    self.fail_next_with(action, eyre!("{}", message.into()));
  }

  /// Make the next call of `action` fail with `error`, which callers can
  /// downcast back to its own type.
  pub fn fail_next_with(&self, action: ApiAction, error: impl Into<Report>) {
    self
      .state
      .lock()
      .failures
      .entry(action)
      .or_default()
      .push_back(error.into());
  }

  fn respond<'a, F>(&'a self, action: ApiAction, handle: F) -> BoxFuture<'a, Result<Value>>
  where
    F: FnOnce(&mut MemoryState) -> Result<Value> + Send + 'a,
  {
    async move {
      let (result, delay) = self.run(action, handle);
      if !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }
      result
    }
    .boxed()
  }

  fn run<F>(&self, action: ApiAction, handle: F) -> (Result<Value>, Duration)
  where
    F: FnOnce(&mut MemoryState) -> Result<Value>,
  {
    let mut state = self.state.lock();
    *state.calls.entry(action).or_default() += 1;

    let delay = self.latency
      + state
        .delays
        .get_mut(&action)
        .and_then(VecDeque::pop_front)
        .unwrap_or_default();
    let result = match state.failures.get_mut(&action).and_then(VecDeque::pop_front) {
      Some(error) => Err(error),
      None => handle(&mut state),
    };
    (result, delay)
  }
}

impl Default for MemoryApi {
  fn default() -> Self {
    Self::new()
  }
}

impl ResourceApi for MemoryApi {
  fn index(&self, params: Map<String, Value>) -> BoxFuture<'_, Result<Value>> {
    self.respond(ApiAction::Index, move |state| Ok(state.index(&params)))
  }

  fn show(&self, id: Value) -> BoxFuture<'_, Result<Value>> {
    self.respond(ApiAction::Show, move |state| {
      let found = match id {
        Value::Null => state.records.first().cloned(),
        id => id
          .into_key(&state.id_field)
          .and_then(|key| state.position(&key))
          .map(|position| state.records[position].clone()),
      };
      Ok(found.map(Value::Object).unwrap_or(Value::Null))
    })
  }

  fn store(&self, element: Value, _params: Map<String, Value>) -> BoxFuture<'_, Result<Value>> {
    self.respond(ApiAction::Store, move |state| state.store(element))
  }

  fn update(&self, element: Value, _params: Map<String, Value>) -> BoxFuture<'_, Result<Value>> {
    self.respond(ApiAction::Update, move |state| state.update(element))
  }

  fn destroy(&self, element: Value, _params: Map<String, Value>) -> BoxFuture<'_, Result<Value>> {
    self.respond(ApiAction::Destroy, move |state| state.destroy(&element))
  }
}
