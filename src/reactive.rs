//! Explicit dependency-tracked reactivity.
//!
//! This is the small signal/computed core the store handles are built on.
//! It does not depend on any UI framework:
//!
//! - [`Signal`] is a versioned change marker. Cache slots and entities own one
//!   and emit it whenever they change.
//! - [`Scope`] records which signals (and at which version) a computation read.
//! - [`Source<T>`] is a settable reactive value, typically used for parameters.
//! - [`Computed<T>`] is a lazily evaluated, memoized derivation. It recomputes
//!   on the next `get()` after any signal it read during its last computation
//!   has changed.
//!
//! Reads are pull-based: nothing recomputes in the background. Consumers that
//! want push notification await [`Computed::changed`] and read again.
//!
//! # Example
//!
//! ```ignore
//! let page = Source::new(1);
//! let label = Computed::new({
//!     let page = page.clone();
//!     move |cx| format!("page {}", page.get(cx))
//! });
//!
//! assert_eq!(label.get(), "page 1");
//! page.set(2);
//! assert_eq!(label.get(), "page 2");
//! ```

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;

/// A versioned change marker.
///
/// Cloning a signal yields another handle to the same marker.
#[derive(Clone)]
pub struct Signal {
  tx: Arc<watch::Sender<u64>>,
}

impl Signal {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(0);
    Self { tx: Arc::new(tx) }
  }

  /// Current version. Increases by one on every [`emit`](Self::emit).
  pub fn version(&self) -> u64 {
    *self.tx.borrow()
  }

  /// Mark the owner as changed and wake anyone waiting on it.
  pub fn emit(&self) {
    self.tx.send_modify(|version| *version = version.wrapping_add(1));
  }

  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.tx.subscribe()
  }

  /// Whether both handles point at the same marker.
  pub fn same(&self, other: &Signal) -> bool {
    Arc::ptr_eq(&self.tx, &other.tx)
  }
}

impl Default for Signal {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for Signal {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Signal")
      .field("version", &self.version())
      .finish()
  }
}

/// The set of signals a computation read, with the version seen for each.
#[derive(Debug, Clone, Default)]
pub struct Scope {
  deps: Vec<(Signal, u64)>,
}

impl Scope {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a read of `signal` at its current version.
  pub fn track(&mut self, signal: &Signal) {
    if self.deps.iter().any(|(seen, _)| seen.same(signal)) {
      return;
    }
    self.deps.push((signal.clone(), signal.version()));
  }

  /// Merge the dependencies of a nested computation into this one.
  pub fn extend(&mut self, other: &Scope) {
    for (signal, version) in &other.deps {
      if !self.deps.iter().any(|(seen, _)| seen.same(signal)) {
        self.deps.push((signal.clone(), *version));
      }
    }
  }

  /// True while no tracked signal has been emitted since it was read.
  pub fn is_current(&self) -> bool {
    self
      .deps
      .iter()
      .all(|(signal, version)| signal.version() == *version)
  }

  pub fn len(&self) -> usize {
    self.deps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.deps.is_empty()
  }

  /// Resolve once any tracked signal moves past the version that was read.
  ///
  /// A scope with no dependencies never changes, so this never resolves.
  pub async fn changed(&self) {
    if self.deps.is_empty() {
      futures::future::pending::<()>().await;
    }

    let waits = self.deps.iter().map(|(signal, seen)| {
      let rx = signal.subscribe();
      let seen = *seen;
      Box::pin(async move {
        let mut rx = rx;
        // A closed channel means the slot was dropped, which is a change too.
        let _ = rx.wait_for(|version| *version != seen).await;
      })
    });

    futures::future::select_all(waits).await;
  }
}

/// A settable reactive value.
pub struct Source<T> {
  value: Arc<RwLock<T>>,
  signal: Signal,
}

impl<T> Clone for Source<T> {
  fn clone(&self) -> Self {
    Self {
      value: Arc::clone(&self.value),
      signal: self.signal.clone(),
    }
  }
}

impl<T: Clone> Source<T> {
  pub fn new(value: T) -> Self {
    Self {
      value: Arc::new(RwLock::new(value)),
      signal: Signal::new(),
    }
  }

  /// Read the value and record the read in `scope`.
  pub fn get(&self, scope: &mut Scope) -> T {
    scope.track(&self.signal);
    self.value.read().clone()
  }

  pub fn get_untracked(&self) -> T {
    self.value.read().clone()
  }

  pub fn set(&self, value: T) {
    *self.value.write() = value;
    self.signal.emit();
  }

  /// Modify the value in place, then notify.
  pub fn update(&self, f: impl FnOnce(&mut T)) {
    f(&mut self.value.write());
    self.signal.emit();
  }

  pub fn signal(&self) -> &Signal {
    &self.signal
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Source<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Source")
      .field("value", &*self.value.read())
      .field("version", &self.signal.version())
      .finish()
  }
}

type ComputeFn<T> = Box<dyn Fn(&mut Scope) -> T + Send + Sync>;

struct Memo<T> {
  value: T,
  deps: Scope,
}

struct ComputedInner<T> {
  compute: ComputeFn<T>,
  memo: Mutex<Option<Memo<T>>>,
}

/// A lazily evaluated, memoized derivation.
///
/// Nothing runs until the first [`get`](Self::get). Each later `get` returns
/// the memoized value unless a signal read during the last computation has
/// changed, in which case the closure runs again and tracks a fresh scope.
///
/// The closure may have side effects (the store handles dispatch fetches from
/// it); they run at most once per recomputation.
pub struct Computed<T> {
  inner: Arc<ComputedInner<T>>,
}

impl<T> Clone for Computed<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Clone + Send + 'static> Computed<T> {
  pub fn new<F>(compute: F) -> Self
  where
    F: Fn(&mut Scope) -> T + Send + Sync + 'static,
  {
    Self {
      inner: Arc::new(ComputedInner {
        compute: Box::new(compute),
        memo: Mutex::new(None),
      }),
    }
  }

  /// Current value, recomputing first if any dependency changed.
  pub fn get(&self) -> T {
    let mut memo = self.inner.memo.lock();
    self.refresh(&mut memo).value.clone()
  }

  /// Like [`get`](Self::get), but also records this computation's
  /// dependencies in an enclosing `scope`.
  pub fn get_tracked(&self, scope: &mut Scope) -> T {
    let mut memo = self.inner.memo.lock();
    let memo = self.refresh(&mut memo);
    scope.extend(&memo.deps);
    memo.value.clone()
  }

  /// True if the next `get` will run the closure.
  pub fn is_dirty(&self) -> bool {
    match &*self.inner.memo.lock() {
      Some(memo) => !memo.deps.is_current(),
      None => true,
    }
  }

  /// Resolve once a dependency of the last computation changes.
  ///
  /// Resolves immediately if the value has never been computed or is already
  /// dirty.
  pub async fn changed(&self) {
    let deps = match &*self.inner.memo.lock() {
      Some(memo) => memo.deps.clone(),
      None => return,
    };
    deps.changed().await;
  }

  fn refresh<'a>(&self, memo: &'a mut Option<Memo<T>>) -> &'a Memo<T> {
    if memo
      .as_ref()
      .is_some_and(|existing| !existing.deps.is_current())
    {
      *memo = None;
    }

    memo.get_or_insert_with(|| {
      let mut deps = Scope::new();
      let value = (self.inner.compute)(&mut deps);
      Memo { value, deps }
    })
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Computed<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let memo = self.inner.memo.lock();
    f.debug_struct("Computed")
      .field("value", &memo.as_ref().map(|m| &m.value))
      .field("deps", &memo.as_ref().map(|m| m.deps.len()))
      .finish_non_exhaustive()
  }
}
