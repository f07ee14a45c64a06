//! Per-peer protocol state machine.
//!
//! A [`Connection`] owns one peer session: it builds the session context
//! from the transport, enforces the allowed-senders policy, constructs the
//! adaptor, registers itself with the connections manager and tracks
//! backpressure accounting. `connection_made`, `data_received` and
//! `connection_lost` never suspend; slow work runs in spawned tasks.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use ipnet::IpNet;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::adaptor::{Adaptor, ReceiverAdaptor, ResponseWaiter, SenderAdaptor};
use crate::codec::Codec;
use crate::manager::{connections, ManagedConnection, ManagerError};
use crate::message::{Context, Inflight};
use crate::requester::Requester;
use crate::signals::Event;
use crate::status::StatusWaiter;
use crate::transport::{CloseReason, StreamTransport, Transport, TransportError};

/// Which side of the conversation this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// What the connection feeds decoded messages into.
#[derive(Debug, Clone)]
pub enum Pipeline {
    /// One-way (or request/response) server side.
    Receiver {
        action: Arc<dyn Action>,
        preaction: Option<Arc<dyn Action>>,
    },
    /// Two-way client side.
    Sender {
        requester: Option<Arc<dyn Requester>>,
    },
}

fn default_timeout_secs() -> u64 {
    5
}

/// Decoded per-connection settings, shared by every connection an endpoint
/// creates.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Pause reading once a single chunk reaches this size, until the
    /// adaptor catches up.
    #[serde(default)]
    pub pause_threshold: Option<byte_unit::Byte>,
    /// Networks peers may connect from; empty means everyone.
    #[serde(default)]
    pub allowed_senders: Vec<IpNet>,
    /// Host-to-alias rewrites applied after authorization.
    #[serde(default)]
    pub aliases: FxHashMap<String, String>,
    /// Bound on graceful-close waits.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pause_threshold: None,
            allowed_senders: Vec::new(),
            aliases: FxHashMap::default(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Settings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn pause_bytes(&self) -> Option<u64> {
        self.pause_threshold
            .map(|b| u64::try_from(b.get_bytes()).unwrap_or(u64::MAX))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The peer's address is outside every allowed network.
    #[error("received message from unauthorized host {host}")]
    UnauthorizedPeer { host: IpAddr },
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connection is not open")]
    NotConnected,
}

/// Hook run when the connection is lost, before the adaptor drains.
pub type LostHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Compute the registry key for a peer.
#[must_use]
pub fn peername(peer_prefix: &str, own: &str, peer: &str) -> String {
    format!("{peer_prefix}_{own}_{peer}")
}

pub struct Connection {
    me: Weak<Connection>,
    parent_name: String,
    peer_prefix: String,
    protocol_name: String,
    role: Role,
    settings: Settings,
    codec: Arc<dyn Codec>,
    pipeline: Pipeline,
    base_context: Context,
    status: StatusWaiter,
    context: Mutex<Option<Arc<Context>>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    adaptor: Mutex<Option<Arc<Adaptor>>>,
    unprocessed: AtomicU64,
    inflight: Inflight,
    notifications_tx: mpsc::UnboundedSender<serde_json::Value>,
    notifications_rx: Mutex<Option<mpsc::UnboundedReceiver<serde_json::Value>>>,
    on_lost: Mutex<Vec<LostHook>>,
    lost: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("parent_name", &self.parent_name)
            .field("protocol_name", &self.protocol_name)
            .field("role", &self.role)
            .field("status", &self.status.status())
            .finish_non_exhaustive()
    }
}

impl Connection {
    #[must_use]
    pub fn new(
        parent_name: String,
        peer_prefix: String,
        protocol_name: String,
        role: Role,
        settings: Settings,
        codec: Arc<dyn Codec>,
        pipeline: Pipeline,
        base_context: Context,
    ) -> Arc<Self> {
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            parent_name,
            peer_prefix,
            protocol_name,
            role,
            settings,
            codec,
            pipeline,
            base_context,
            status: StatusWaiter::new(),
            context: Mutex::new(None),
            transport: Mutex::new(None),
            adaptor: Mutex::new(None),
            unprocessed: AtomicU64::new(0),
            inflight: Inflight::new(),
            notifications_tx,
            notifications_rx: Mutex::new(Some(notifications_rx)),
            on_lost: Mutex::new(Vec::new()),
            lost: AtomicBool::new(false),
        })
    }

    /// The connection's context, once `connection_made` has built it.
    #[must_use]
    pub fn context(&self) -> Option<Arc<Context>> {
        self.context.lock().expect("context lock poisoned").clone()
    }

    fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    fn build_context(&self, transport: &Arc<dyn Transport>) -> Context {
        let info = transport.info();
        let mut context = self.base_context.clone();
        context.protocol_name.clone_from(&self.protocol_name);
        if let Some(fd) = info.fd {
            // UNIX stream socket.
            context.fd = Some(fd);
            if self.is_server() {
                let sockname = info.unix_sock.clone().unwrap_or_default();
                context.peer = fd.to_string();
                context.addr = Some(sockname.clone());
                context.own.clone_from(&sockname);
                context.alias.clone_from(&context.peer);
                context.server = sockname;
                context.client = fd.to_string();
            } else {
                let peername = info.unix_peer.clone().unwrap_or_default();
                context.addr = Some(peername.clone());
                context.peer.clone_from(&peername);
                context.alias.clone_from(&peername);
                context.own = fd.to_string();
                context.server = peername;
                context.client = fd.to_string();
            }
        } else if let Some(handle) = info.pipe_handle {
            // Platform named pipe.
            let addr = info.pipe_addr.clone().unwrap_or_default();
            context.addr = Some(addr.clone());
            context.handle = Some(handle);
            context.server.clone_from(&addr);
            context.client = handle.to_string();
            if self.is_server() {
                context.alias = handle.to_string();
                context.own = addr;
                context.peer.clone_from(&context.client);
            } else {
                context.alias.clone_from(&addr);
                context.own = handle.to_string();
                context.peer.clone_from(&context.server);
            }
        } else {
            // INET/INET6.
            let peer = info.peer.map(|a| a.to_string()).unwrap_or_default();
            let own = info.sock.map(|a| a.to_string()).unwrap_or_default();
            context.peer.clone_from(&peer);
            context.own.clone_from(&own);
            context.host = info.peer.map(|a| a.ip());
            context.port = info.peer.map(|a| a.port());
            if self.is_server() {
                context.server = own;
                context.client = peer;
            } else {
                context.server = peer;
                context.client = own;
            }
        }
        if let Some(tls) = &info.tls {
            context.cipher = Some(tls.cipher.clone());
            context.compression.clone_from(&tls.compression);
            context.peercert.clone_from(&tls.peercert);
        }
        context
    }

    fn check_peer(&self, context: &mut Context) -> Result<(), ConnectionError> {
        let Some(host) = context.host else {
            return Ok(());
        };
        if !self.settings.allowed_senders.is_empty()
            && !self
                .settings
                .allowed_senders
                .iter()
                .any(|net| net.contains(&host))
        {
            warn!("Received message from unauthorized host {host}");
            return Err(ConnectionError::UnauthorizedPeer { host });
        }
        let host_str = host.to_string();
        let alias = self
            .settings
            .aliases
            .get(&host_str)
            .cloned()
            .unwrap_or(host_str);
        if !alias.is_empty() && !context.peer.contains(&alias) {
            debug!(%host, %alias, "alias found");
            context.alias = format!("{alias}({})", context.peer);
        } else {
            context.alias = alias;
        }
        Ok(())
    }

    /// Take ownership of a transport and bring the session up. On an
    /// authorization failure the transport is aborted and the connection is
    /// never registered.
    pub fn connection_made(&self, transport: Arc<dyn Transport>) -> Result<(), ConnectionError> {
        self.status.set_starting();
        let mut context = self.build_context(&transport);
        if let Err(error) = self.check_peer(&mut context) {
            transport.abort();
            self.status.set_stopped();
            return Err(error);
        }
        let context = Arc::new(context);
        *self.context.lock().expect("context lock poisoned") = Some(Arc::clone(&context));

        let adaptor = match &self.pipeline {
            Pipeline::Receiver { action, preaction } => Adaptor::Receiver(ReceiverAdaptor::new(
                Arc::clone(&self.codec),
                Arc::clone(action),
                preaction.clone(),
                Arc::clone(&context),
                Arc::clone(&transport),
                self.inflight.clone(),
                self.settings.timeout(),
            )),
            Pipeline::Sender { requester } => Adaptor::Sender(SenderAdaptor::new(
                Arc::clone(&self.codec),
                requester.clone(),
                Arc::clone(&context),
                Arc::clone(&transport),
                self.notifications_tx.clone(),
                self.inflight.clone(),
                self.settings.timeout(),
            )),
        };
        *self.adaptor.lock().expect("adaptor lock poisoned") = Some(Arc::new(adaptor));
        *self.transport.lock().expect("transport lock poisoned") = Some(transport);

        let me = self.me.upgrade().expect("connection alive during setup");
        match connections().add(me) {
            Ok(num) => {
                debug!(num, "connection opened");
                metrics::gauge!("connections_open").increment(1.0);
            }
            Err(error) => {
                self.abort_setup();
                return Err(error.into());
            }
        }
        self.status.set_started();
        info!(
            "New {} connection from {} to {}",
            self.protocol_name, context.client, context.server
        );
        debug!(?context, "connection context");
        Ok(())
    }

    fn abort_setup(&self) {
        if let Some(transport) = self
            .transport
            .lock()
            .expect("transport lock poisoned")
            .take()
        {
            transport.abort();
        }
        self.adaptor.lock().expect("adaptor lock poisoned").take();
        self.status.set_stopped();
    }

    fn transport_handle(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .lock()
            .expect("transport lock poisoned")
            .clone()
    }

    fn adaptor_handle(&self) -> Option<Arc<Adaptor>> {
        self.adaptor.lock().expect("adaptor lock poisoned").clone()
    }

    /// Feed one inbound chunk through the adaptor, maintaining the
    /// pause/resume accounting.
    pub fn data_received(&self, data: Bytes) {
        self.data_received_at(data, SystemTime::now());
    }

    pub fn data_received_at(&self, data: Bytes, received: SystemTime) {
        let len = data.len() as u64;
        self.unprocessed.fetch_add(len, Ordering::AcqRel);
        metrics::counter!("bytes_received").increment(len);
        let transport = self.transport_handle();
        if let (Some(threshold), Some(transport)) = (self.settings.pause_bytes(), &transport) {
            if len >= threshold && transport.can_pause() && transport.is_reading() {
                transport.pause_reading();
                info!("Reading paused");
            }
        }
        let Some(adaptor) = self.adaptor_handle() else {
            warn!("data received before the adaptor was configured");
            return;
        };
        let ack = adaptor.on_bytes(data, received);
        if let Some(conn) = self.me.upgrade() {
            tokio::spawn(async move {
                if let Ok(n) = ack.await {
                    conn.bytes_processed(n as u64);
                }
            });
        }
    }

    fn bytes_processed(&self, n: u64) {
        let before = self.unprocessed.fetch_sub(n, Ordering::AcqRel);
        let unprocessed = before.saturating_sub(n);
        if let (Some(threshold), Some(transport)) = (self.settings.pause_bytes(), self.transport_handle())
        {
            if !transport.is_reading() && !transport.is_closing() && unprocessed <= threshold {
                transport.resume_reading();
                info!("Reading resumed");
            }
        }
    }

    /// Queue bytes to the peer.
    pub fn send(&self, data: Bytes) -> Result<(), ConnectionError> {
        let transport = self.transport_handle().ok_or(ConnectionError::NotConnected)?;
        transport.write(data)?;
        Ok(())
    }

    /// Encode and send a request; two-way clients only.
    pub fn encode_send(
        &self,
        decoded: serde_json::Value,
    ) -> Result<ResponseWaiter, ConnectionError> {
        let adaptor = self.adaptor_handle().ok_or(ConnectionError::NotConnected)?;
        let sender = adaptor.sender().ok_or(ConnectionError::NotConnected)?;
        sender
            .encode_send(decoded)
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Stream of inbound objects that matched no pending request, plus
    /// payloads fanned out via the manager's notify. Takable once.
    #[must_use]
    pub fn notifications(&self) -> Option<mpsc::UnboundedReceiver<serde_json::Value>> {
        self.notifications_rx
            .lock()
            .expect("notifications lock poisoned")
            .take()
    }

    /// Register a hook to run when the connection is lost.
    pub fn add_on_lost_hook(&self, hook: LostHook) {
        self.on_lost.lock().expect("hooks lock poisoned").push(hook);
    }

    /// Close the session. Idempotent. With `immediate`, queued writes are
    /// dropped instead of drained.
    pub fn close(&self, immediate: bool) {
        let Some(transport) = self.transport_handle() else {
            return;
        };
        if !transport.is_closing() {
            if immediate {
                transport.abort();
            } else {
                transport.close();
            }
        }
        if !transport.is_stream() {
            // No read loop will observe the close for a datagram peer.
            self.connection_lost(None);
        }
    }

    /// Tear the session down. Runs lost-hooks, deregisters, then drains the
    /// adaptor in a spawned task. Safe to call more than once; only the
    /// first call acts.
    pub fn connection_lost(&self, reason: Option<CloseReason>) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks: Vec<LostHook> = {
            let mut on_lost = self.on_lost.lock().expect("hooks lock poisoned");
            on_lost.drain(..).collect()
        };
        if !hooks.is_empty() {
            tokio::spawn(async move {
                futures::future::join_all(hooks.into_iter().map(|hook| hook())).await;
            });
        }
        let registered = self.adaptor_handle().is_some();
        if registered {
            debug!("Finishing connection");
            connections().remove(self);
            metrics::gauge!("connections_open").decrement(1.0);
        }
        self.status.set_stopping();
        if let Some(conn) = self.me.upgrade() {
            tokio::spawn(async move { conn.drain_and_stop(reason, registered).await });
        }
    }

    async fn drain_and_stop(&self, reason: Option<CloseReason>, registered: bool) {
        if let Some(adaptor) = self.adaptor_handle() {
            let drained = tokio::time::timeout(
                self.settings.timeout(),
                adaptor.close(reason.as_ref()),
            )
            .await;
            if drained.is_err() {
                warn!("adaptor close timed out");
            }
        }
        if registered {
            match connections().decrement(self) {
                Ok(num) => debug!(num, "connection closed"),
                Err(error) => error!(%error, "connection counter underflow"),
            }
        }
        self.status.set_stopped();
        let (client, server) = self
            .context()
            .map(|c| (c.client.clone(), c.server.clone()))
            .unwrap_or_default();
        match reason {
            Some(reason) => info!(
                ?reason,
                "{} connection from {client} to {server} has been closed", self.protocol_name
            ),
            None => info!(
                "{} connection from {client} to {server} has been closed",
                self.protocol_name
            ),
        }
    }

    /// Stream EOF: the framework always closes explicitly.
    #[must_use]
    pub fn eof_received(&self) -> bool {
        false
    }

    pub async fn wait_connected(&self) {
        self.status.wait_started().await;
    }

    pub async fn wait_closed(&self) {
        self.status.wait_stopped().await;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status.is_started()
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.status.is_stopping_or_stopped()
    }
}

#[async_trait]
impl ManagedConnection for Connection {
    fn parent_name(&self) -> String {
        self.parent_name.clone()
    }

    fn peer_name(&self) -> String {
        let context = self.context();
        let (own, peer) = context
            .map(|c| (c.own.clone(), c.peer.clone()))
            .unwrap_or_default();
        peername(&self.peer_prefix, &own, &peer)
    }

    fn data_received(&self, data: Bytes) {
        Connection::data_received(self, data);
    }

    fn transport_lost(&self, error: Option<String>) {
        self.connection_lost(error.map(CloseReason::TransportError));
    }

    fn deliver_notification(&self, payload: serde_json::Value) {
        let _ = self.notifications_tx.send(payload);
    }

    async fn wait_messages_processed(&self) {
        self.inflight.wait_idle().await;
    }
}

/// Drive a stream transport's read side: feed chunks to the connection,
/// honour the pause flag, and report the final `connection_lost`.
pub(crate) async fn drive_stream<R>(
    conn: Arc<Connection>,
    mut reader: R,
    transport: Arc<StreamTransport>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let closed: Event = transport.closed_event();
    let mut paused = transport.pause_flag();
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let reason = loop {
        if *paused.borrow() {
            tokio::select! {
                () = closed.wait() => break None,
                changed = paused.wait_for(|p| !*p) => {
                    if changed.is_err() {
                        break None;
                    }
                    continue;
                }
            }
        }
        tokio::select! {
            () = closed.wait() => break None,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    let _ = conn.eof_received();
                    break None;
                }
                Ok(_) => {
                    let data = buf.split().freeze();
                    conn.data_received(data);
                }
                Err(error) => break Some(CloseReason::TransportError(error.to_string())),
            }
        }
    };
    transport.close();
    conn.connection_lost(reason);
}
