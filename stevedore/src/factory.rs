//! Per-endpoint builder of connections.
//!
//! One factory lives for the endpoint's whole lifetime. It owns the action,
//! preaction and requester, snapshots the base context every connection
//! inherits (each connection gets its own copy), and answers count-waiting
//! queries for the endpoint. For datagram endpoints the factory is also the
//! demultiplexer: one shared socket, one synthesized connection per remote
//! address.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::action::ActionError;
use crate::codec::Codec;
use crate::connection::{peername, Connection, Pipeline, Role, Settings};
use crate::manager::{connections, ManagedConnection};
use crate::message::Context;
use crate::signals::Watcher;
use crate::transport::{DatagramTransport, TransportInfo};

#[derive(Debug)]
pub struct ProtocolFactory {
    full_name: Mutex<String>,
    peer_prefix: Mutex<String>,
    protocol_name: String,
    role: Role,
    codec: Arc<dyn Codec>,
    pipeline: Pipeline,
    settings: Settings,
}

impl ProtocolFactory {
    #[must_use]
    pub fn new(
        role: Role,
        protocol_name: impl Into<String>,
        codec: Arc<dyn Codec>,
        pipeline: Pipeline,
        settings: Settings,
    ) -> Self {
        Self {
            full_name: Mutex::new(String::new()),
            peer_prefix: Mutex::new(String::new()),
            protocol_name: protocol_name.into(),
            role,
            codec,
            pipeline,
            settings,
        }
    }

    /// Name the endpoint. Called by the shell once the listening address is
    /// known, before any connection is built.
    pub fn set_name(&self, full_name: &str, peer_prefix: &str) {
        *self.full_name.lock().expect("name lock poisoned") = full_name.to_owned();
        *self.peer_prefix.lock().expect("name lock poisoned") = peer_prefix.to_owned();
    }

    #[must_use]
    pub fn full_name(&self) -> String {
        self.full_name.lock().expect("name lock poisoned").clone()
    }

    #[must_use]
    pub fn peer_prefix(&self) -> String {
        self.peer_prefix.lock().expect("name lock poisoned").clone()
    }

    /// Start the owned action, preaction and requester together.
    pub async fn start(&self) -> Result<(), ActionError> {
        match &self.pipeline {
            Pipeline::Receiver { action, preaction } => {
                let preaction_start = async {
                    match preaction {
                        Some(preaction) => preaction.start().await,
                        None => Ok(()),
                    }
                };
                let (a, p) = futures::join!(action.start(), preaction_start);
                a?;
                p?;
            }
            Pipeline::Sender { requester } => {
                if let Some(requester) = requester {
                    requester.start().await?;
                }
            }
        }
        Ok(())
    }

    /// Build a fresh connection inheriting the endpoint context. Each
    /// connection gets its own copy, so per-connection mutations never
    /// leak.
    #[must_use]
    pub fn new_connection(&self) -> Arc<Connection> {
        debug!("creating new connection");
        let full_name = self.full_name();
        let base_context = Context {
            endpoint: full_name.clone(),
            ..Context::default()
        };
        Connection::new(
            full_name,
            self.peer_prefix(),
            self.protocol_name.clone(),
            self.role,
            self.settings.clone(),
            Arc::clone(&self.codec),
            self.pipeline.clone(),
            base_context,
        )
    }

    #[must_use]
    pub fn is_owner(&self, connection: &dyn ManagedConnection) -> bool {
        connection.parent_name() == self.full_name()
    }

    pub async fn wait_num_connected(&self, num: u64) {
        connections()
            .wait_num_connections(&self.full_name(), num)
            .await;
    }

    pub async fn wait_num_has_connected(&self, num: u64) {
        connections()
            .wait_num_has_connected(&self.full_name(), num)
            .await;
    }

    pub async fn wait_all_closed(&self) {
        self.wait_num_connected(0).await;
    }

    pub async fn wait_all_messages_processed(&self) {
        connections()
            .wait_all_messages_processed(&self.full_name())
            .await;
    }

    /// Close the owned action, preaction and requester together.
    pub async fn close_actions(&self) {
        match &self.pipeline {
            Pipeline::Receiver { action, preaction } => {
                let preaction_close = async {
                    match preaction {
                        Some(preaction) => preaction.close().await,
                        None => Ok(()),
                    }
                };
                let (a, p) = futures::join!(action.close(), preaction_close);
                if let Err(error) = a {
                    warn!(%error, "action close failed");
                }
                if let Err(error) = p {
                    warn!(%error, "preaction close failed");
                }
            }
            Pipeline::Sender { requester } => {
                if let Some(requester) = requester {
                    if let Err(error) = requester.close().await {
                        warn!(%error, "requester close failed");
                    }
                }
            }
        }
    }

    /// Wait for every owned connection to close, then shut the pipeline
    /// down and forget the endpoint counter.
    pub async fn close(&self) {
        self.wait_all_closed().await;
        self.close_actions().await;
        connections().clear_server(&self.full_name());
    }

    /// Demultiplex one inbound datagram: hand it to the peer's live
    /// connection, or synthesize a new one pinned to the source address.
    pub(crate) fn datagram_received(
        &self,
        socket: &Arc<UdpSocket>,
        own: SocketAddr,
        data: Bytes,
        addr: SocketAddr,
    ) {
        let peer = peername(&self.peer_prefix(), &own.to_string(), &addr.to_string());
        if let Some(connection) = connections().get(&peer) {
            connection.data_received(data);
            return;
        }
        let connection = self.new_connection();
        let info = TransportInfo {
            peer: Some(addr),
            sock: Some(own),
            ..TransportInfo::default()
        };
        let transport = DatagramTransport::new(Arc::clone(socket), Some(addr), info);
        match connection.connection_made(transport) {
            Ok(()) => connection.data_received(data),
            Err(error) => warn!(%error, %addr, "rejected datagram peer"),
        }
    }
}

/// Receive loop for a shared datagram socket. Runs until shutdown or a
/// socket error, then fans `connection_lost` out to every peer connection
/// this factory owns.
pub(crate) async fn run_datagram_listener(
    factory: Arc<ProtocolFactory>,
    socket: Arc<UdpSocket>,
    shutdown: Watcher,
) -> std::io::Result<()> {
    let own = socket.local_addr()?;
    let mut buf = vec![0u8; 64 * 1024];
    let error = loop {
        tokio::select! {
            () = shutdown.recv() => break None,
            result = socket.recv_from(&mut buf) => match result {
                Ok((n, addr)) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    factory.datagram_received(&socket, own, data, addr);
                }
                Err(io_error) => break Some(io_error),
            }
        }
    };
    let reason = error.as_ref().map(std::string::ToString::to_string);
    for connection in connections().children(&factory.full_name()) {
        connection.transport_lost(reason.clone());
    }
    match error {
        Some(io_error) => Err(io_error),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::action::Action;
    use crate::codec::JsonCodec;
    use crate::message::MessageObject;
    use crate::signals;

    #[derive(Debug, Default)]
    struct BySender {
        seen: StdMutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl Action for BySender {
        async fn do_one(
            &self,
            msg: Arc<MessageObject>,
        ) -> Result<Option<serde_json::Value>, ActionError> {
            self.seen
                .lock()
                .unwrap()
                .push((msg.context().peer.clone(), msg.decoded().clone()));
            msg.processed();
            Ok(None)
        }
    }

    fn udp_factory(action: Arc<dyn Action>) -> Arc<ProtocolFactory> {
        Arc::new(ProtocolFactory::new(
            Role::Server,
            "UDP Server",
            Arc::new(JsonCodec),
            Pipeline::Receiver {
                action,
                preaction: None,
            },
            Settings::default(),
        ))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn demultiplexes_datagrams_per_peer() {
        let action = Arc::new(BySender::default());
        let factory = udp_factory(action.clone());
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let own = socket.local_addr().unwrap();
        let full_name = format!("UDP Server {own}");
        factory.set_name(&full_name, "udp");
        factory.start().await.unwrap();

        let (broadcaster, watcher) = signals::signal();
        let listener = tokio::spawn(run_datagram_listener(
            Arc::clone(&factory),
            Arc::clone(&socket),
            watcher,
        ));

        let peer_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer_a.send_to(b"{\"seq\":1}", own).await.unwrap();
        peer_a.send_to(b"{\"seq\":2}", own).await.unwrap();
        peer_b.send_to(b"{\"seq\":10}", own).await.unwrap();

        wait_until(|| action.seen.lock().unwrap().len() == 3).await;
        assert_eq!(connections().num_connections(&full_name), 2);

        let addr_a = peer_a.local_addr().unwrap().to_string();
        let seen = action.seen.lock().unwrap().clone();
        let from_a: Vec<_> = seen
            .iter()
            .filter(|(peer, _)| *peer == addr_a)
            .map(|(_, v)| v["seq"].clone())
            .collect();
        assert_eq!(from_a, vec![serde_json::json!(1), serde_json::json!(2)]);

        broadcaster.signal();
        listener.await.unwrap().unwrap();
        factory.close().await;
        assert_eq!(connections().num_connections(&full_name), 0);
    }

    #[tokio::test]
    async fn close_waits_for_connections_then_clears() {
        let factory = udp_factory(Arc::new(BySender::default()));
        factory.set_name("UDP Server test-close", "udp");
        // No connections: close resolves immediately.
        tokio::time::timeout(Duration::from_secs(1), factory.close())
            .await
            .expect("close should not block with no connections");
    }
}
