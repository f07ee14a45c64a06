//! Decoded messages and the per-connection context they carry.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::watch;
use uuid::Uuid;

/// Per-connection context, built once in `connection_made` and read-mostly
/// afterwards. The alias may be rewritten after authorization.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Connection flavour, e.g. `"TCP Server"`.
    pub protocol_name: String,
    /// Full name of the owning endpoint.
    pub endpoint: String,
    /// Remote endpoint string.
    pub peer: String,
    /// Local endpoint string.
    pub own: String,
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub addr: Option<String>,
    /// Display name for the remote side, `"alias(peer)"` when aliased.
    pub alias: String,
    pub server: String,
    pub client: String,
    pub fd: Option<i32>,
    pub handle: Option<u64>,
    pub cipher: Option<String>,
    pub compression: Option<String>,
    pub peercert: Option<Vec<u8>>,
}

/// Tracks how many messages a connection has decoded but not yet processed.
/// Shared between the adaptor (which opens slots) and the message objects
/// (which close them).
#[derive(Debug, Clone)]
pub struct Inflight {
    tx: Arc<watch::Sender<usize>>,
}

impl Inflight {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn start(&self) {
        self.tx.send_modify(|n| *n += 1);
    }

    pub fn done(&self) {
        self.tx.send_modify(|n| *n = n.saturating_sub(1));
    }

    #[must_use]
    pub fn count(&self) -> usize {
        *self.tx.subscribe().borrow()
    }

    /// Suspend until every started message has been processed.
    pub async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for Inflight {
    fn default() -> Self {
        Self::new()
    }
}

/// One decoded message plus its metadata. Immutable after construction;
/// [`MessageObject::processed`] is idempotent and is guaranteed to run at
/// most once even when called from multiple owners, with a drop-time
/// backstop so an abandoned message can never wedge accounting.
#[derive(Debug)]
pub struct MessageObject {
    encoded: Bytes,
    decoded: serde_json::Value,
    context: Arc<Context>,
    received: SystemTime,
    uid: Uuid,
    processed: AtomicBool,
    inflight: Option<Inflight>,
}

impl MessageObject {
    #[must_use]
    pub fn new(
        encoded: Bytes,
        decoded: serde_json::Value,
        context: Arc<Context>,
        received: SystemTime,
    ) -> Self {
        Self {
            encoded,
            decoded,
            context,
            received,
            uid: Uuid::new_v4(),
            processed: AtomicBool::new(false),
            inflight: None,
        }
    }

    /// A message wrapping an undecoded buffer, as handed to preactions.
    #[must_use]
    pub fn buffer(encoded: Bytes, context: Arc<Context>, received: SystemTime) -> Self {
        Self::new(encoded, serde_json::Value::Null, context, received)
    }

    /// Open an in-flight slot that `processed` will close.
    pub(crate) fn track(&mut self, inflight: Inflight) {
        inflight.start();
        self.inflight = Some(inflight);
    }

    #[must_use]
    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    #[must_use]
    pub fn decoded(&self) -> &serde_json::Value {
        &self.decoded
    }

    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    #[must_use]
    pub fn received_timestamp(&self) -> SystemTime {
        self.received
    }

    #[must_use]
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    /// The sender's display name, taken from the connection context.
    #[must_use]
    pub fn sender(&self) -> &str {
        if self.context.alias.is_empty() {
            &self.context.peer
        } else {
            &self.context.alias
        }
    }

    /// Correlation id, when the decoded form carries an `"id"` field.
    #[must_use]
    pub fn request_id(&self) -> Option<String> {
        match self.decoded.get("id") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Whether this message should be dropped before reaching the action.
    #[must_use]
    pub fn filter(&self) -> bool {
        false
    }

    /// Mark the message fully handled. Idempotent.
    pub fn processed(&self) {
        if !self.processed.swap(true, Ordering::AcqRel) {
            metrics::counter!("messages_processed").increment(1);
            if let Some(inflight) = &self.inflight {
                inflight.done();
            }
        }
    }

    #[must_use]
    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }

    /// Short human-readable rendering for logs.
    #[must_use]
    pub fn pformat(&self) -> String {
        format!(
            "{} byte message from {} ({})",
            self.encoded.len(),
            self.sender(),
            self.uid
        )
    }
}

impl Drop for MessageObject {
    fn drop(&mut self) {
        // Accounting backstop: a message abandoned on an error path still
        // closes its in-flight slot.
        self.processed();
    }
}

impl fmt::Display for MessageObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pformat())
    }
}
