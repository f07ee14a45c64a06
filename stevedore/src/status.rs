//! Four-state lifecycle gate shared by endpoints and connections.

use std::sync::Arc;

use tokio::sync::watch;

/// Lifecycle states, in the only order they may advance. A stopped waiter
/// may be restarted by calling [`StatusWaiter::set_starting`] again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Starting,
    Started,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
struct State {
    status: Status,
    ever_started: bool,
}

/// An observable lifecycle: `starting -> started -> stopping -> stopped`,
/// with a sticky `ever_started` flag and any number of concurrent waiters.
#[derive(Debug, Clone)]
pub struct StatusWaiter {
    tx: Arc<watch::Sender<State>>,
}

impl StatusWaiter {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(State {
            status: Status::Idle,
            ever_started: false,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn set_starting(&self) {
        self.tx.send_modify(|s| s.status = Status::Starting);
    }

    pub fn set_started(&self) {
        self.tx.send_modify(|s| {
            s.status = Status::Started;
            s.ever_started = true;
        });
    }

    pub fn set_stopping(&self) {
        self.tx.send_modify(|s| s.status = Status::Stopping);
    }

    pub fn set_stopped(&self) {
        self.tx.send_modify(|s| s.status = Status::Stopped);
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.tx.subscribe().borrow().status
    }

    #[must_use]
    pub fn is_starting(&self) -> bool {
        self.status() == Status::Starting
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.status() == Status::Started
    }

    #[must_use]
    pub fn is_starting_or_started(&self) -> bool {
        matches!(self.status(), Status::Starting | Status::Started)
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.status() == Status::Stopping
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.status() == Status::Stopped
    }

    #[must_use]
    pub fn is_stopping_or_stopped(&self) -> bool {
        matches!(self.status(), Status::Stopping | Status::Stopped)
    }

    /// Whether `set_started` has ever been called, across restarts.
    #[must_use]
    pub fn has_started(&self) -> bool {
        self.tx.subscribe().borrow().ever_started
    }

    pub async fn wait_started(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| s.status == Status::Started).await;
    }

    /// Wait until the endpoint has been started at least once, even if it has
    /// since stopped.
    pub async fn wait_has_started(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| s.ever_started).await;
    }

    pub async fn wait_stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| s.status == Status::Stopped).await;
    }
}

impl Default for StatusWaiter {
    fn default() -> Self {
        Self::new()
    }
}
