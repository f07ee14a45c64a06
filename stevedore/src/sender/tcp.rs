//! The TCP client endpoint.

use std::sync::Arc;

use serde::Deserialize;
use tokio::net::TcpStream;

use super::{Client, General};
use crate::action::ActionError;
use crate::codec;
use crate::connection::{drive_stream, ConnectionError, Pipeline, Role, Settings};
use crate::factory::ProtocolFactory;
use crate::requester::Requester;
use crate::transport::{StreamTransport, Transport, TransportInfo};

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    4000
}

/// Errors produced by [`Tcp`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
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
    /// Host to connect to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to connect to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Wire codec for the connection.
    #[serde(default)]
    pub codec: codec::Config,
    /// Per-connection settings.
    #[serde(default)]
    pub connection: Settings,
}

/// The TCP client sender.
#[derive(Debug)]
pub struct Tcp {
    host: String,
    port: u16,
    factory: Arc<ProtocolFactory>,
}

impl Tcp {
    /// Create a new [`Tcp`] client instance.
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
            "TCP Client",
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

    /// Open the connection and wait for it to come up.
    pub async fn connect(&self) -> Result<Client, Error> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let _ = stream.set_nodelay(true);
        self.factory.set_name(&format!("TCP Client {local}"), "tcp");
        self.factory.start().await?;
        let (read, write) = stream.into_split();
        let info = TransportInfo {
            peer: Some(peer),
            sock: Some(local),
            ..TransportInfo::default()
        };
        let transport = StreamTransport::start(write, info);
        let connection = self.factory.new_connection();
        connection.connection_made(Arc::clone(&transport) as Arc<dyn Transport>)?;
        let driver = tokio::spawn(drive_stream(
            Arc::clone(&connection),
            read,
            transport,
        ));
        connection.wait_connected().await;
        Ok(Client::new(connection, Arc::clone(&self.factory), Some(driver)))
    }
}
