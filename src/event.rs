use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Events driving the `watch` loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Periodic tick: time to revalidate what is on screen
  Tick,
  /// Ctrl-C was pressed
  Quit,
}

/// Event handler that produces events from a tick timer and Ctrl-C
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn tick timer
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      // The first tick completes immediately; the initial read already fetched.
      interval.tick().await;
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    // Spawn Ctrl-C listener
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        debug!("Received Ctrl-C");
        let _ = tx.send(Event::Quit);
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
