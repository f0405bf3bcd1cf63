use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Requests allowed in flight at once unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Bounds how many HTTP requests run concurrently. Requests over the limit
/// wait in FIFO order for a free slot.
///
/// Clones share the same limit, so one queue can be handed to several
/// [`JsonApi`](super::JsonApi)s talking to the same host.
#[derive(Debug, Clone)]
pub struct HttpQueue {
  permits: Arc<Semaphore>,
  concurrency: usize,
}

impl HttpQueue {
  pub fn new(concurrency: usize) -> Self {
    let concurrency = concurrency.max(1);
    Self {
      permits: Arc::new(Semaphore::new(concurrency)),
      concurrency,
    }
  }

  pub fn concurrency(&self) -> usize {
    self.concurrency
  }

  /// Requests currently holding a slot.
  pub fn active(&self) -> usize {
    self.concurrency - self.permits.available_permits()
  }

  /// Run `request` once a slot is free.
  pub async fn enqueue<F, T>(&self, request: F) -> Result<T>
  where
    F: Future<Output = Result<T>>,
  {
    let _permit = self
      .permits
      .acquire()
      .await
      .map_err(|e| eyre!("Request queue closed: {}", e))?;
    request.await
  }
}

impl Default for HttpQueue {
  fn default() -> Self {
    Self::new(DEFAULT_CONCURRENCY)
  }
}
