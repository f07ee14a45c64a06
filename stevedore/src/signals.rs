//! Lifecycle signalling.
//!
//! Two small primitives are used throughout the crate: [`Event`], a sticky
//! one-shot flag that any number of tasks can wait on, and the
//! [`Broadcaster`]/[`Watcher`] pair built on top of it for shutdown
//! propagation. A watcher can be cloned freely and handed to every task that
//! must observe the signal.

use std::sync::Arc;

use tokio::sync::watch;

/// A sticky one-shot event.
///
/// Starts unset; [`Event::set`] flips it exactly once and releases every
/// current and future waiter. Cloning shares the underlying flag.
#[derive(Debug, Clone)]
pub struct Event {
    tx: Arc<watch::Sender<bool>>,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.tx.subscribe().borrow()
    }

    /// Suspend until the event is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for cannot fail.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a linked shutdown pair.
#[must_use]
pub fn signal() -> (Broadcaster, Watcher) {
    let event = Event::new();
    (
        Broadcaster {
            event: event.clone(),
        },
        Watcher { event },
    )
}

/// The signalling half of a shutdown pair.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    event: Event,
}

impl Broadcaster {
    pub fn signal(&self) {
        self.event.set();
    }
}

/// The observing half of a shutdown pair.
#[derive(Debug, Clone)]
pub struct Watcher {
    event: Event,
}

impl Watcher {
    /// Suspend until the broadcaster signals.
    pub async fn recv(&self) {
        self.event.wait().await;
    }

    #[must_use]
    pub fn try_recv(&self) -> bool {
        self.event.is_set()
    }
}
