//! The UNIX stream socket client endpoint.

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tokio::net::UnixStream;

use super::{Client, General};
use crate::action::ActionError;
use crate::codec;
use crate::connection::{drive_stream, ConnectionError, Pipeline, Role, Settings};
use crate::factory::ProtocolFactory;
use crate::requester::Requester;
use crate::transport::{StreamTransport, Transport, TransportInfo};

/// Errors produced by [`Unix`].
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
    /// Filesystem path of the server socket.
    pub path: PathBuf,
    /// Wire codec for the connection.
    #[serde(default)]
    pub codec: codec::Config,
    /// Per-connection settings.
    #[serde(default)]
    pub connection: Settings,
}

/// The UNIX stream socket client sender.
#[derive(Debug)]
pub struct Unix {
    path: PathBuf,
    factory: Arc<ProtocolFactory>,
}

impl Unix {
    /// Create a new [`Unix`] client instance.
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
            "UNIX Client",
            config.codec.build(),
            Pipeline::Sender { requester },
            config.connection.clone(),
        ));
        Self {
            path: config.path.clone(),
            factory,
        }
    }

    /// Open the connection and wait for it to come up.
    pub async fn connect(&self) -> Result<Client, Error> {
        let stream = UnixStream::connect(&self.path).await?;
        let fd = stream.as_raw_fd();
        let peername = self.path.display().to_string();
        self.factory
            .set_name(&format!("UNIX Client {fd}"), "unix");
        self.factory.start().await?;
        let (read, write) = stream.into_split();
        let info = TransportInfo {
            fd: Some(fd),
            unix_peer: Some(peername),
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
