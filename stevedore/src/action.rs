//! The sink side of a receiver: decoded messages are handed to an
//! [`Action`], one per endpoint, shared by every connection the endpoint
//! accepts.

pub mod file_storage;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::codec::DecodeError;
use crate::message::MessageObject;

/// Errors produced by actions.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// A bounded write queue is full. Receivers propagate this back to the
    /// connection so the sender observes flow control.
    #[error("write queue for {path} is full")]
    Backpressure { path: PathBuf },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A handler rejected one message. The connection stays up.
    #[error("{0}")]
    Handler(String),
}

/// Per-message sink. `do_one` failures are per-message: they are reported
/// through [`Action::response_on_exception`] and never terminate the
/// connection.
#[async_trait]
pub trait Action: Send + Sync + std::fmt::Debug {
    async fn start(&self) -> Result<(), ActionError> {
        Ok(())
    }

    /// Handle one message. A `Some` return value is encoded and written
    /// back to the peer.
    async fn do_one(
        &self,
        msg: Arc<MessageObject>,
    ) -> Result<Option<serde_json::Value>, ActionError>;

    /// Handle a batch sequentially, preserving arrival order.
    async fn do_many(
        &self,
        msgs: Vec<Arc<MessageObject>>,
    ) -> Vec<(Arc<MessageObject>, Result<Option<serde_json::Value>, ActionError>)> {
        let mut results = Vec::with_capacity(msgs.len());
        for msg in msgs {
            let result = self.do_one(Arc::clone(&msg)).await;
            results.push((msg, result));
        }
        results
    }

    /// Resolve once all work enqueued so far has completed.
    async fn wait_complete(&self) -> Result<(), ActionError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ActionError> {
        Ok(())
    }

    /// Optionally synthesize a response for bytes that failed to decode.
    fn response_on_decode_error(
        &self,
        _data: &Bytes,
        _error: &DecodeError,
    ) -> Option<serde_json::Value> {
        None
    }

    /// Optionally synthesize a response for a message whose handler failed.
    fn response_on_exception(
        &self,
        _msg: &Arc<MessageObject>,
        _error: &ActionError,
    ) -> Option<serde_json::Value> {
        None
    }
}

/// Decoded action configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Config {
    /// Batch-append encoded messages through managed files.
    BufferedFileStorage(file_storage::Config),
    /// Open-write-close one file per message.
    FileStorage(file_storage::Config),
}

impl Config {
    #[must_use]
    pub fn build(&self) -> Arc<dyn Action> {
        match self {
            Self::BufferedFileStorage(config) => {
                Arc::new(file_storage::BufferedFileStorage::new(config.clone()))
            }
            Self::FileStorage(config) => Arc::new(file_storage::FileStorage::new(config.clone())),
        }
    }
}
