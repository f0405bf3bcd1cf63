//! Freshness state shared by entity and index slots.

use chrono::{DateTime, Utc};

use crate::reactive::Signal;

/// Freshness of one cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
  /// A fetch is in flight; no result has been written for it yet
  Loading,
  /// The cached value is usable and needs no refetch
  Valid,
  /// Explicitly invalidated, or the last fetch failed; the next read refetches
  Invalid,
}

/// Snapshot of a slot's bookkeeping, for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
  pub state: FetchState,
  /// When a value was last written to the slot
  pub loaded_at: Option<DateTime<Utc>>,
  /// Message of the most recent failed fetch, cleared when a new one starts
  pub error: Option<String>,
  /// Latest generation dispatched for the slot
  pub generation: u64,
}

/// One keyed cache slot.
///
/// Every fetch dispatched for the slot takes the next generation number. A
/// result is only applied while its generation is still the latest, so a slow
/// response can't overwrite one from a newer fetch or a direct write.
#[derive(Debug)]
pub(crate) struct Slot<T> {
  pub value: Option<T>,
  pub state: FetchState,
  pub generation: u64,
  pub loaded_at: Option<DateTime<Utc>>,
  pub error: Option<String>,
  pub signal: Signal,
}

impl<T> Slot<T> {
  /// A slot that has never been fetched.
  pub fn new() -> Self {
    Self {
      value: None,
      state: FetchState::Invalid,
      generation: 0,
      loaded_at: None,
      error: None,
      signal: Signal::new(),
    }
  }

  /// A fresh slot for a key that was deleted at `generation`. Fetches
  /// dispatched before the delete stay rejected.
  pub fn resumed(generation: u64) -> Self {
    Self {
      generation,
      ..Self::new()
    }
  }

  /// Whether a read should dispatch a fetch.
  pub fn needs_fetch(&self) -> bool {
    self.state == FetchState::Invalid
  }

  /// Enter `Loading` and return the generation of the new fetch.
  pub fn begin_fetch(&mut self) -> u64 {
    self.generation += 1;
    self.state = FetchState::Loading;
    self.error = None;
    self.signal.emit();
    self.generation
  }

  /// Whether a fetch of `generation` may still write its result.
  pub fn accepts(&self, generation: u64) -> bool {
    generation == self.generation
  }

  /// Store a value and mark the slot `Valid`.
  pub fn fill(&mut self, value: Option<T>) {
    self.value = value;
    self.mark_valid();
  }

  pub fn mark_valid(&mut self) {
    self.state = FetchState::Valid;
    self.loaded_at = Some(Utc::now());
    self.error = None;
    self.signal.emit();
  }

  /// Mark `Valid` from a write that didn't come from this slot's own fetch.
  /// Any fetch still in flight is superseded.
  pub fn supersede(&mut self) {
    self.generation += 1;
    self.mark_valid();
  }

  /// Record a failed fetch. Ignored if a newer fetch or write took over.
  pub fn fail(&mut self, generation: u64, error: String) -> bool {
    if !self.accepts(generation) {
      return false;
    }
    self.state = FetchState::Invalid;
    self.error = Some(error);
    self.signal.emit();
    true
  }

  /// Keep the value visible but force a refetch on the next read.
  pub fn invalidate(&mut self) {
    if self.state != FetchState::Invalid {
      self.state = FetchState::Invalid;
      self.signal.emit();
    }
  }

  pub fn status(&self) -> SlotStatus {
    SlotStatus {
      state: self.state,
      loaded_at: self.loaded_at,
      error: self.error.clone(),
      generation: self.generation,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_new_slot_needs_fetch() {
    let slot: Slot<u32> = Slot::new();
    assert!(slot.needs_fetch());
    assert_eq!(slot.status().state, FetchState::Invalid);
    assert_eq!(slot.status().generation, 0);
  }

  #[test]
  fn test_begin_fetch_suppresses_duplicates() {
    let mut slot: Slot<u32> = Slot::new();
    let generation = slot.begin_fetch();
    assert_eq!(generation, 1);
    assert!(!slot.needs_fetch());
    assert!(slot.accepts(generation));
  }

  #[test]
  fn test_superseded_generation_is_rejected() {
    let mut slot: Slot<u32> = Slot::new();
    let first = slot.begin_fetch();
    slot.invalidate();
    let second = slot.begin_fetch();

    assert!(!slot.accepts(first));
    assert!(slot.accepts(second));
    assert!(!slot.fail(first, "late".into()));
    assert_eq!(slot.state, FetchState::Loading);
  }

  #[test]
  fn test_invalidate_while_loading_keeps_generation() {
    let mut slot: Slot<u32> = Slot::new();
    let generation = slot.begin_fetch();
    slot.invalidate();
    assert!(slot.accepts(generation));

    slot.fill(Some(7));
    assert_eq!(slot.state, FetchState::Valid);
    assert_eq!(slot.value, Some(7));
  }

  #[test]
  fn test_supersede_rejects_in_flight_fetch() {
    let mut slot: Slot<u32> = Slot::new();
    let generation = slot.begin_fetch();
    slot.value = Some(1);
    slot.supersede();

    assert_eq!(slot.state, FetchState::Valid);
    assert!(!slot.accepts(generation));
  }

  #[test]
  fn test_resumed_slot_rejects_earlier_generations() {
    let mut slot: Slot<u32> = Slot::resumed(3);
    assert!(slot.needs_fetch());
    assert!(!slot.accepts(3));

    let generation = slot.begin_fetch();
    assert_eq!(generation, 4);
    assert!(!slot.accepts(1));
  }

  #[test]
  fn test_fail_records_error_and_allows_retry() {
    let mut slot: Slot<u32> = Slot::new();
    let generation = slot.begin_fetch();
    let before = slot.signal.version();

    assert!(slot.fail(generation, "boom".into()));
    assert!(slot.needs_fetch());
    assert_eq!(slot.status().error.as_deref(), Some("boom"));
    assert!(slot.signal.version() > before);

    slot.begin_fetch();
    assert_eq!(slot.status().error, None);
  }
}
