//! The UDP client endpoint.

use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tracing::warn;

use super::{Client, General};
use crate::action::ActionError;
use crate::codec;
use crate::connection::{ConnectionError, Pipeline, Role, Settings};
use crate::factory::ProtocolFactory;
use crate::requester::Requester;
use crate::transport::{CloseReason, DatagramTransport, Transport, TransportInfo};

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    4000
}

/// Errors produced by [`Udp`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Action(#[from] ActionError),
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
/// Configuration of this sender.
pub struct Config {
    /// Host to send to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to send to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Wire codec for the connection.
    #[serde(default)]
    pub codec: codec::Config,
    /// Per-connection settings.
    #[serde(default)]
    pub connection: Settings,
}

/// The UDP client sender.
#[derive(Debug)]
pub struct Udp {
    host: String,
    port: u16,
    factory: Arc<ProtocolFactory>,
}

impl Udp {
    /// Create a new [`Udp`] client instance.
    #[must_use]
    pub fn new(general: General, config: &Config) -> Self {
        Self::with_requester(general, config, None)
    }

    /// Create a client whose unmatched responses are handed to `requester`.
    #[must_use]
    pub fn with_requester(
        _general: General,
        config: &Config,
        requester: Option<Arc<dyn Requester>>,
    ) -> Self {
        let factory = Arc::new(ProtocolFactory::new(
            Role::Client,
            "UDP Client",
            config.codec.build(),
            Pipeline::Sender { requester },
            config.connection.clone(),
        ));
        Self {
            host: config.host.clone(),
            port: config.port,
            factory,
        }
    }

    /// Bind an ephemeral socket, connect it to the remote, and bring the
    /// connection up.
    pub async fn connect(&self) -> Result<Client, Error> {
        let remote = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| Error::Resolve {
                host: self.host.clone(),
                port: self.port,
            })?;
        let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await?;
        let local = socket.local_addr()?;
        self.factory.set_name(&format!("UDP Client {local}"), "udp");
        self.factory.start().await?;

        let socket = Arc::new(socket);
        let info = TransportInfo {
            peer: Some(remote),
            sock: Some(local),
            ..TransportInfo::default()
        };
        let transport = DatagramTransport::new(Arc::clone(&socket), None, info);
        let connection = self.factory.new_connection();
        connection.connection_made(Arc::clone(&transport) as Arc<dyn Transport>)?;

        // Pump responses back into the connection until it closes.
        let driver = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                let closed = connection.wait_closed();
                tokio::pin!(closed);
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    tokio::select! {
                        () = &mut closed => break,
                        result = socket.recv(&mut buf) => match result {
                            Ok(n) => connection.data_received(Bytes::copy_from_slice(&buf[..n])),
                            Err(error) => {
                                warn!(%error, "UDP receive failed");
                                connection.connection_lost(Some(
                                    CloseReason::TransportError(error.to_string()),
                                ));
                                break;
                            }
                        }
                    }
                }
            })
        };
        connection.wait_connected().await;
        Ok(Client::new(connection, Arc::clone(&self.factory), Some(driver)))
    }
}
