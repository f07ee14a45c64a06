//! Adaptors bind a connection to its codec and to an action (receivers) or
//! a correlation table (senders).
//!
//! Bytes are queued to a per-connection worker task so they enter the codec
//! in arrival order and message objects reach the action in decode order.
//! `on_bytes` hands back an acknowledgement that resolves with the chunk's
//! byte count once the action has accepted the chunk's messages, meaning
//! enqueued on its sink, not necessarily written. The connection's
//! pause/resume accounting hangs off that ack, and a `Backpressure` result
//! pauses reading outright until the sink drains, so a full or slow sink
//! reaches the peer as flow control.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::action::{Action, ActionError};
use crate::codec::Codec;
use crate::message::{Context, Inflight, MessageObject};
use crate::requester::Requester;
use crate::transport::{CloseReason, Transport, TransportError};

/// A response waiter resolves with the matched message, or the reason the
/// connection went away.
pub type ResponseWaiter = oneshot::Receiver<Result<Arc<MessageObject>, CloseReason>>;

#[derive(Debug, thiserror::Error)]
pub enum AdaptorError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connection is closed")]
    Closed,
}

struct Job {
    data: Bytes,
    received: SystemTime,
    /// Resolved by the worker once the chunk's messages have been accepted
    /// by their destination.
    ack: oneshot::Sender<usize>,
}

/// Hand a chunk to the worker. The ack resolves when the worker has
/// dispatched it; if the worker is gone the ack resolves immediately so the
/// connection's accounting cannot wedge.
fn enqueue(
    slot: &Mutex<Option<mpsc::UnboundedSender<Job>>>,
    data: Bytes,
    received: SystemTime,
) -> oneshot::Receiver<usize> {
    let len = data.len();
    let (ack, rx) = oneshot::channel();
    let tx = slot.lock().expect("adaptor lock poisoned");
    if let Some(tx) = tx.as_ref() {
        if let Err(mpsc::error::SendError(job)) = tx.send(Job {
            data,
            received,
            ack,
        }) {
            let _ = job.ack.send(len);
        }
    } else {
        let _ = ack.send(len);
    }
    rx
}

fn send_response(
    codec: &Arc<dyn Codec>,
    transport: &Arc<dyn Transport>,
    response: &serde_json::Value,
) {
    let encoded = codec.encode(response);
    if let Err(error) = transport.write(encoded) {
        warn!(%error, "failed to write response");
    }
}

/// One side of the adaptor pair. Connections hold this and forward to the
/// active variant.
#[derive(Debug)]
pub enum Adaptor {
    Receiver(ReceiverAdaptor),
    Sender(SenderAdaptor),
}

impl Adaptor {
    /// Queue one inbound chunk. The returned acknowledgement resolves with
    /// the chunk length once the action has accepted its messages.
    pub fn on_bytes(&self, data: Bytes, received: SystemTime) -> oneshot::Receiver<usize> {
        match self {
            Self::Receiver(adaptor) => adaptor.on_bytes(data, received),
            Self::Sender(adaptor) => adaptor.on_bytes(data, received),
        }
    }

    /// Drain in-flight work, bounded by the adaptor timeout, then release
    /// whatever the variant holds.
    pub async fn close(&self, reason: Option<&CloseReason>) {
        match self {
            Self::Receiver(adaptor) => adaptor.close(reason).await,
            Self::Sender(adaptor) => adaptor.close(reason).await,
        }
    }

    #[must_use]
    pub fn sender(&self) -> Option<&SenderAdaptor> {
        match self {
            Self::Sender(adaptor) => Some(adaptor),
            Self::Receiver(_) => None,
        }
    }
}

/// Receiver side: preaction, decode, dispatch to the action, write back any
/// responses the action produces.
#[derive(Debug)]
pub struct ReceiverAdaptor {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    action: Arc<dyn Action>,
    preaction: Option<Arc<dyn Action>>,
    timeout: Duration,
}

impl ReceiverAdaptor {
    #[must_use]
    pub fn new(
        codec: Arc<dyn Codec>,
        action: Arc<dyn Action>,
        preaction: Option<Arc<dyn Action>>,
        context: Arc<Context>,
        transport: Arc<dyn Transport>,
        inflight: Inflight,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::worker(
            rx,
            codec,
            Arc::clone(&action),
            preaction.clone(),
            context,
            transport,
            inflight,
        ));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            action,
            preaction,
            timeout,
        }
    }

    fn on_bytes(&self, data: Bytes, received: SystemTime) -> oneshot::Receiver<usize> {
        enqueue(&self.tx, data, received)
    }

    async fn worker(
        mut rx: mpsc::UnboundedReceiver<Job>,
        codec: Arc<dyn Codec>,
        action: Arc<dyn Action>,
        preaction: Option<Arc<dyn Action>>,
        context: Arc<Context>,
        transport: Arc<dyn Transport>,
        inflight: Inflight,
    ) {
        let mut pending = BytesMut::new();
        while let Some(job) = rx.recv().await {
            let len = job.data.len();
            if let Some(preaction) = &preaction {
                let buffer_msg = Arc::new(MessageObject::buffer(
                    job.data.clone(),
                    Arc::clone(&context),
                    job.received,
                ));
                let preaction = Arc::clone(preaction);
                tokio::spawn(async move {
                    if let Err(error) = preaction.do_one(buffer_msg).await {
                        warn!(%error, "preaction failed");
                    }
                });
            }
            let buffer: Bytes = if pending.is_empty() {
                job.data.clone()
            } else {
                pending.extend_from_slice(&job.data);
                pending.split().freeze()
            };
            match codec.decode_buffer(&buffer, &context, job.received) {
                Ok(decoded) => {
                    if decoded.consumed < buffer.len() {
                        pending.extend_from_slice(&buffer[decoded.consumed..]);
                    }
                    let mut msgs = Vec::with_capacity(decoded.objects.len());
                    for mut object in decoded.objects {
                        if object.filter() {
                            object.processed();
                            continue;
                        }
                        object.track(inflight.clone());
                        msgs.push(Arc::new(object));
                    }
                    metrics::counter!("messages_received").increment(msgs.len() as u64);
                    let mut backpressured = false;
                    for (msg, result) in action.do_many(msgs).await {
                        match result {
                            Ok(Some(response)) => {
                                send_response(&codec, &transport, &response);
                            }
                            Ok(None) => {}
                            Err(error) => {
                                if matches!(error, ActionError::Backpressure { .. }) {
                                    backpressured = true;
                                    if transport.can_pause() && transport.is_reading() {
                                        transport.pause_reading();
                                        info!("Reading paused");
                                    }
                                }
                                warn!(msg = %msg, %error, "handler failed");
                                if let Some(response) =
                                    action.response_on_exception(&msg, &error)
                                {
                                    send_response(&codec, &transport, &response);
                                }
                            }
                        }
                    }
                    if backpressured {
                        // Hold the read side closed until the sink can
                        // accept writes again; the ack below stays pending
                        // for the same stretch.
                        if let Err(error) = action.wait_complete().await {
                            warn!(%error, "sink did not drain cleanly");
                        }
                        if !transport.is_closing() && !transport.is_reading() {
                            transport.resume_reading();
                            info!("Reading resumed");
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, "decode failed");
                    if let Some(response) = action.response_on_decode_error(&buffer, &error) {
                        send_response(&codec, &transport, &response);
                    }
                    // Drop the poisoned bytes so the stream can resync.
                    pending.clear();
                }
            }
            let _ = job.ack.send(len);
        }
    }

    async fn close(&self, reason: Option<&CloseReason>) {
        debug!(?reason, "closing receiver adaptor");
        drop(self.tx.lock().expect("adaptor lock poisoned").take());
        let mut worker = self.worker.lock().expect("adaptor lock poisoned").take();
        let graceful = async {
            if let Some(handle) = worker.as_mut() {
                let _ = handle.await;
            }
            if let Err(error) = self.action.wait_complete().await {
                warn!(%error, "action did not finish cleanly");
            }
            if let Some(preaction) = &self.preaction {
                if let Err(error) = preaction.wait_complete().await {
                    warn!(%error, "preaction did not finish cleanly");
                }
            }
        };
        if tokio::time::timeout(self.timeout, graceful).await.is_err() {
            warn!("graceful close timed out; cancelling in-flight work");
            if let Some(handle) = &worker {
                handle.abort();
            }
        }
        if let Err(error) = self.action.close().await {
            warn!(%error, "action close failed");
        }
        if let Some(preaction) = &self.preaction {
            if let Err(error) = preaction.close().await {
                warn!(%error, "preaction close failed");
            }
        }
    }
}

/// Sender side: encode outgoing requests, match inbound objects against the
/// pending table by correlation id, queue the rest as notifications.
#[derive(Debug)]
pub struct SenderAdaptor {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    codec: Arc<dyn Codec>,
    context: Arc<Context>,
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<FxHashMap<String, oneshot::Sender<Result<Arc<MessageObject>, CloseReason>>>>>,
    requester: Option<Arc<dyn Requester>>,
    timeout: Duration,
}

impl SenderAdaptor {
    #[must_use]
    pub fn new(
        codec: Arc<dyn Codec>,
        requester: Option<Arc<dyn Requester>>,
        context: Arc<Context>,
        transport: Arc<dyn Transport>,
        notifications: mpsc::UnboundedSender<serde_json::Value>,
        inflight: Inflight,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(FxHashMap::default()));
        let worker = tokio::spawn(Self::worker(
            rx,
            Arc::clone(&codec),
            Arc::clone(&context),
            Arc::clone(&pending),
            requester.clone(),
            notifications,
            inflight,
        ));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            codec,
            context,
            transport,
            pending,
            requester,
            timeout,
        }
    }

    /// Encode and send one decoded value; the returned waiter resolves when
    /// a response with the same correlation id arrives. Values without an
    /// id are one-way; their waiter never resolves.
    pub fn encode_send(&self, decoded: serde_json::Value) -> Result<ResponseWaiter, AdaptorError> {
        let msg = self.codec.from_decoded(decoded, &self.context);
        let (tx, rx) = oneshot::channel();
        if let Some(request_id) = msg.request_id() {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .insert(request_id, tx);
        }
        self.transport.write(msg.encoded().clone())?;
        Ok(rx)
    }

    fn on_bytes(&self, data: Bytes, received: SystemTime) -> oneshot::Receiver<usize> {
        enqueue(&self.tx, data, received)
    }

    async fn worker(
        mut rx: mpsc::UnboundedReceiver<Job>,
        codec: Arc<dyn Codec>,
        context: Arc<Context>,
        pending: Arc<
            Mutex<FxHashMap<String, oneshot::Sender<Result<Arc<MessageObject>, CloseReason>>>>,
        >,
        requester: Option<Arc<dyn Requester>>,
        notifications: mpsc::UnboundedSender<serde_json::Value>,
        inflight: Inflight,
    ) {
        let mut leftover = BytesMut::new();
        while let Some(job) = rx.recv().await {
            let len = job.data.len();
            let buffer: Bytes = if leftover.is_empty() {
                job.data.clone()
            } else {
                leftover.extend_from_slice(&job.data);
                leftover.split().freeze()
            };
            match codec.decode_buffer(&buffer, &context, job.received) {
                Ok(decoded) => {
                    if decoded.consumed < buffer.len() {
                        leftover.extend_from_slice(&buffer[decoded.consumed..]);
                    }
                    for mut object in decoded.objects {
                        object.track(inflight.clone());
                        let object = Arc::new(object);
                        let waiter = object.request_id().and_then(|id| {
                            pending.lock().expect("pending lock poisoned").remove(&id)
                        });
                        match waiter {
                            Some(waiter) => {
                                object.processed();
                                let _ = waiter.send(Ok(object));
                            }
                            None => {
                                object.processed();
                                let payload = object.decoded().clone();
                                if let Some(requester) = &requester {
                                    requester.on_notification(payload.clone());
                                }
                                let _ = notifications.send(payload);
                            }
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, "decode failed");
                    leftover.clear();
                }
            }
            let _ = job.ack.send(len);
        }
    }

    async fn close(&self, reason: Option<&CloseReason>) {
        debug!(?reason, "closing sender adaptor");
        drop(self.tx.lock().expect("adaptor lock poisoned").take());
        let mut worker = self.worker.lock().expect("adaptor lock poisoned").take();
        let graceful = async {
            if let Some(handle) = worker.as_mut() {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.timeout, graceful).await.is_err() {
            warn!("graceful close timed out; cancelling in-flight work");
            if let Some(handle) = &worker {
                handle.abort();
            }
        }
        let cause = reason.cloned().unwrap_or(CloseReason::UserRequested);
        let waiters: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.drain().collect()
        };
        for (request_id, waiter) in waiters {
            debug!(%request_id, "resolving pending request with close");
            let _ = waiter.send(Err(cause.clone()));
        }
        if let Some(requester) = &self.requester {
            if let Err(error) = requester.close().await {
                warn!(%error, "requester close failed");
            }
        }
    }
}
