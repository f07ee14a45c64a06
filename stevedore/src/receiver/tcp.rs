//! The TCP server endpoint.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use super::General;
use crate::action::{self, ActionError};
use crate::codec;
use crate::connection::{drive_stream, Pipeline, Role, Settings};
use crate::factory::ProtocolFactory;
use crate::recording::Recorder;
use crate::signals::{self, Broadcaster, Watcher};
use crate::status::StatusWaiter;
use crate::transport::{StreamTransport, Transport, TransportInfo};

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    4000
}

/// Errors produced by [`Tcp`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Double start or double close.
    #[error("{endpoint} is already {state}")]
    AlreadyInState {
        endpoint: String,
        state: &'static str,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Action(#[from] ActionError),
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
/// Configuration of this receiver.
pub struct Config {
    /// Address to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to; 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Wire codec for every connection.
    #[serde(default)]
    pub codec: codec::Config,
    /// Sink for decoded messages.
    pub action: action::Config,
    /// Optional pre-decode traffic recording.
    #[serde(default)]
    pub recording: Option<crate::action::file_storage::Config>,
    /// Per-connection settings.
    #[serde(default)]
    pub connection: Settings,
}

/// The TCP server receiver.
#[derive(Debug)]
pub struct Tcp {
    quiet: bool,
    host: String,
    port: u16,
    factory: Arc<ProtocolFactory>,
    status: StatusWaiter,
    stop: Mutex<Option<Broadcaster>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Tcp {
    /// Create a new [`Tcp`] server instance.
    #[must_use]
    pub fn new(general: General, config: &Config) -> Self {
        let action = config.action.build();
        let preaction = config
            .recording
            .as_ref()
            .map(|c| Arc::new(Recorder::new(c.clone())) as Arc<dyn crate::action::Action>);
        let factory = Arc::new(ProtocolFactory::new(
            Role::Server,
            "TCP Server",
            config.codec.build(),
            Pipeline::Receiver { action, preaction },
            config.connection.clone(),
        ));
        Self {
            quiet: general.quiet,
            host: config.host.clone(),
            port: config.port,
            factory,
            status: StatusWaiter::new(),
            stop: Mutex::new(None),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The bound address once started, the configured one before.
    #[must_use]
    pub fn listening_on(&self) -> String {
        match *self.local_addr.lock().expect("addr lock poisoned") {
            Some(addr) => addr.to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    #[must_use]
    pub fn full_name(&self) -> String {
        format!("TCP Server {}", self.listening_on())
    }

    #[must_use]
    pub fn factory(&self) -> &Arc<ProtocolFactory> {
        &self.factory
    }

    #[must_use]
    pub fn status(&self) -> &StatusWaiter {
        &self.status
    }

    /// Bind and begin accepting connections.
    pub async fn start(&self) -> Result<(), Error> {
        if self.status.is_starting_or_started() {
            return Err(Error::AlreadyInState {
                endpoint: self.full_name(),
                state: "started",
            });
        }
        self.status.set_starting();
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().expect("addr lock poisoned") = Some(local);
        let full_name = format!("TCP Server {local}");
        self.factory.set_name(&full_name, "tcp");
        self.factory.start().await?;
        info!("Starting TCP Server on {local}");

        let (stop, watcher) = signals::signal();
        *self.stop.lock().expect("stop lock poisoned") = Some(stop);
        let factory = Arc::clone(&self.factory);
        let task = tokio::spawn(Self::accept_loop(listener, factory, watcher));
        *self.accept_task.lock().expect("task lock poisoned") = Some(task);

        if !self.quiet {
            println!("Serving TCP Server on {local}");
        }
        self.status.set_started();
        Ok(())
    }

    async fn accept_loop(listener: TcpListener, factory: Arc<ProtocolFactory>, shutdown: Watcher) {
        let mut drivers = JoinSet::new();
        loop {
            tokio::select! {
                () = shutdown.recv() => break,
                incoming = listener.accept() => {
                    let (stream, peer_addr) = match incoming {
                        Ok(accepted) => accepted,
                        Err(accept_error) => {
                            error!("accept error: {accept_error}");
                            continue;
                        }
                    };
                    let local = stream.local_addr().ok();
                    let _ = stream.set_nodelay(true);
                    let (read, write) = stream.into_split();
                    let info = TransportInfo {
                        peer: Some(peer_addr),
                        sock: local,
                        ..TransportInfo::default()
                    };
                    let transport = StreamTransport::start(write, info);
                    let connection = factory.new_connection();
                    match connection.connection_made(
                        Arc::clone(&transport) as Arc<dyn Transport>
                    ) {
                        Ok(()) => {
                            drivers.spawn(drive_stream(connection, read, transport));
                        }
                        Err(error) => warn!(%error, %peer_addr, "connection rejected"),
                    }
                }
            }
        }
        drop(listener);
        // Existing sessions run to their natural end.
        while drivers.join_next().await.is_some() {}
    }

    /// Stop accepting, wait for live connections to drain, close the
    /// pipeline.
    pub async fn close(&self) -> Result<(), Error> {
        if self.status.is_stopping_or_stopped() {
            return Err(Error::AlreadyInState {
                endpoint: self.full_name(),
                state: "stopping or stopped",
            });
        }
        self.status.set_stopping();
        info!("Stopping TCP Server running at {}", self.listening_on());
        if let Some(stop) = self.stop.lock().expect("stop lock poisoned").take() {
            stop.signal();
        }
        let task = self.accept_task.lock().expect("task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.factory.close().await;
        self.status.set_stopped();
        info!("TCP Server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    use super::*;
    use crate::action::file_storage::{self, ManagedFile};
    use crate::manager::connections;

    fn storage_receiver(dir: &std::path::Path) -> Tcp {
        let config = Config {
            host: "127.0.0.1".to_owned(),
            port: 0,
            codec: codec::Config::Json,
            action: action::Config::BufferedFileStorage(file_storage::Config {
                base_path: dir.to_owned(),
                path: "{msg.host}.JSON".to_owned(),
                separator: String::new(),
                mode: file_storage::Mode::Append,
                buffering: 8192,
                timeout_secs: 5,
                queue_size: 1024,
            }),
            recording: None,
            connection: Settings::default(),
        };
        Tcp::new(
            General {
                id: None,
                quiet: true,
            },
            &config,
        )
    }

    #[tokio::test]
    async fn one_way_server_stores_messages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let server = storage_receiver(dir.path());
        server.start().await.unwrap();
        let full_name = server.full_name();
        let addr = server.listening_on();

        let mut client = TcpStream::connect(&addr).await.unwrap();
        client
            .write_all(b"{\"id\":1,\"method\":\"login\",\"params\":[\"user1\",\"password\"]}")
            .await
            .unwrap();
        client
            .write_all(b"{\"id\":2,\"method\":\"logout\"}")
            .await
            .unwrap();
        server.factory().wait_num_has_connected(1).await;
        client.shutdown().await.unwrap();
        drop(client);

        server.factory().wait_num_connected(0).await;
        assert_eq!(connections().num_connections(&full_name), 0);
        assert_eq!(connections().num_has_connected(&full_name), 1);
        server.close().await.unwrap();

        let written = tokio::fs::read_to_string(dir.path().join("127.0.0.1.JSON"))
            .await
            .unwrap();
        assert_eq!(
            written,
            "{\"id\":1,\"method\":\"login\",\"params\":[\"user1\",\"password\"]}{\"id\":2,\"method\":\"logout\"}"
        );
    }

    #[tokio::test]
    async fn graceful_shutdown_flushes_inflight_writes() {
        let dir = tempfile::tempdir().unwrap();
        let server = storage_receiver(dir.path());
        server.start().await.unwrap();
        let addr = server.listening_on();

        let mut client = TcpStream::connect(&addr).await.unwrap();
        for i in 0..10 {
            client
                .write_all(format!("{{\"id\":{i}}}").as_bytes())
                .await
                .unwrap();
        }
        server.factory().wait_num_has_connected(1).await;
        client.shutdown().await.unwrap();
        drop(client);
        server.factory().wait_num_connected(0).await;
        server.close().await.unwrap();
        server.status().wait_stopped().await;

        let path = dir.path().join("127.0.0.1.JSON");
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        let count = written.matches("{\"id\":").count();
        assert_eq!(count, 10);
        assert!(ManagedFile::lookup(&path).is_none());
    }

    #[tokio::test]
    async fn double_start_and_double_close_raise() {
        let dir = tempfile::tempdir().unwrap();
        let server = storage_receiver(dir.path());
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(Error::AlreadyInState { .. })
        ));
        server.close().await.unwrap();
        assert!(matches!(
            server.close().await,
            Err(Error::AlreadyInState { .. })
        ));
    }

    #[tokio::test]
    async fn unauthorized_peer_is_dropped_without_registering() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            host: "127.0.0.1".to_owned(),
            port: 0,
            codec: codec::Config::Json,
            action: action::Config::BufferedFileStorage(file_storage::Config {
                base_path: dir.path().to_owned(),
                path: "{msg.host}.JSON".to_owned(),
                separator: String::new(),
                mode: file_storage::Mode::Append,
                buffering: 8192,
                timeout_secs: 5,
                queue_size: 1024,
            }),
            recording: None,
            connection: Settings {
                allowed_senders: vec!["10.0.0.0/8".parse().unwrap()],
                ..Settings::default()
            },
        };
        let server = Tcp::new(
            General {
                id: None,
                quiet: true,
            },
            &config,
        );
        server.start().await.unwrap();
        let full_name = server.full_name();
        let addr = server.listening_on();

        let client = TcpStream::connect(&addr).await.unwrap();
        // The server closes the stream without ever registering the peer.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connections().num_connections(&full_name), 0);
        assert_eq!(connections().num_has_connected(&full_name), 0);
        drop(client);
        server.close().await.unwrap();
    }
}
