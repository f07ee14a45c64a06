//! The source side of a two-way client.
//!
//! A [`Requester`] lives for the whole endpoint, is started and closed
//! alongside the factory, and sees every inbound object that matched no
//! pending request.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::action::ActionError;

#[async_trait]
pub trait Requester: Send + Sync + std::fmt::Debug {
    async fn start(&self) -> Result<(), ActionError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ActionError> {
        Ok(())
    }

    /// Called with each inbound object that matched no pending request.
    fn on_notification(&self, _payload: serde_json::Value) {}
}

/// Stamps outgoing requests with incrementing correlation ids.
#[derive(Debug, Default)]
pub struct JsonRequester {
    next_id: AtomicU64,
}

impl JsonRequester {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a request object carrying a fresh correlation id.
    #[must_use]
    pub fn make_request(&self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        serde_json::json!({
            "id": id,
            "method": method,
            "params": params,
        })
    }
}

#[async_trait]
impl Requester for JsonRequester {}
