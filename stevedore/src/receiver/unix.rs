//! The UNIX stream socket server endpoint.

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::net::UnixListener;
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

/// Errors produced by [`Unix`].
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
    /// Filesystem path of the listening socket.
    pub path: PathBuf,
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

/// The UNIX stream socket server receiver.
#[derive(Debug)]
pub struct Unix {
    quiet: bool,
    path: PathBuf,
    factory: Arc<ProtocolFactory>,
    status: StatusWaiter,
    stop: Mutex<Option<Broadcaster>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Unix {
    /// Create a new [`Unix`] server instance.
    #[must_use]
    pub fn new(general: General, config: &Config) -> Self {
        let action = config.action.build();
        let preaction = config
            .recording
            .as_ref()
            .map(|c| Arc::new(Recorder::new(c.clone())) as Arc<dyn crate::action::Action>);
        let factory = Arc::new(ProtocolFactory::new(
            Role::Server,
            "UNIX Server",
            config.codec.build(),
            Pipeline::Receiver { action, preaction },
            config.connection.clone(),
        ));
        Self {
            quiet: general.quiet,
            path: config.path.clone(),
            factory,
            status: StatusWaiter::new(),
            stop: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn listening_on(&self) -> String {
        self.path.display().to_string()
    }

    #[must_use]
    pub fn full_name(&self) -> String {
        format!("UNIX Server {}", self.listening_on())
    }

    #[must_use]
    pub fn factory(&self) -> &Arc<ProtocolFactory> {
        &self.factory
    }

    #[must_use]
    pub fn status(&self) -> &StatusWaiter {
        &self.status
    }

    /// Bind the socket path and begin accepting connections.
    pub async fn start(&self) -> Result<(), Error> {
        if self.status.is_starting_or_started() {
            return Err(Error::AlreadyInState {
                endpoint: self.full_name(),
                state: "started",
            });
        }
        self.status.set_starting();
        let listener = UnixListener::bind(&self.path)?;
        let full_name = self.full_name();
        self.factory.set_name(&full_name, "unix");
        self.factory.start().await?;
        info!("Starting UNIX Server on {}", self.listening_on());

        let (stop, watcher) = signals::signal();
        *self.stop.lock().expect("stop lock poisoned") = Some(stop);
        let sockname = self.listening_on();
        let task = tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&self.factory),
            sockname,
            watcher,
        ));
        *self.accept_task.lock().expect("task lock poisoned") = Some(task);

        if !self.quiet {
            println!("Serving UNIX Server on {}", self.listening_on());
        }
        self.status.set_started();
        Ok(())
    }

    async fn accept_loop(
        listener: UnixListener,
        factory: Arc<ProtocolFactory>,
        sockname: String,
        shutdown: Watcher,
    ) {
        let mut drivers = JoinSet::new();
        loop {
            tokio::select! {
                () = shutdown.recv() => break,
                incoming = listener.accept() => {
                    let (stream, _addr) = match incoming {
                        Ok(accepted) => accepted,
                        Err(accept_error) => {
                            error!("accept error: {accept_error}");
                            continue;
                        }
                    };
                    let fd = stream.as_raw_fd();
                    let (read, write) = stream.into_split();
                    let info = TransportInfo {
                        fd: Some(fd),
                        unix_sock: Some(sockname.clone()),
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
                        Err(error) => warn!(%error, "connection rejected"),
                    }
                }
            }
        }
        drop(listener);
        while drivers.join_next().await.is_some() {}
    }

    /// Stop accepting, drain live connections, close the pipeline and
    /// remove the socket file.
    pub async fn close(&self) -> Result<(), Error> {
        if self.status.is_stopping_or_stopped() {
            return Err(Error::AlreadyInState {
                endpoint: self.full_name(),
                state: "stopping or stopped",
            });
        }
        self.status.set_stopping();
        info!("Stopping UNIX Server running at {}", self.listening_on());
        if let Some(stop) = self.stop.lock().expect("stop lock poisoned").take() {
            stop.signal();
        }
        let task = self.accept_task.lock().expect("task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.factory.close().await;
        if let Err(io_error) = tokio::fs::remove_file(&self.path).await {
            if io_error.kind() != std::io::ErrorKind::NotFound {
                warn!(%io_error, "failed to remove socket path");
            }
        }
        self.status.set_stopped();
        info!("UNIX Server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    use super::*;
    use crate::action::file_storage;
    use crate::manager::connections;

    #[tokio::test]
    async fn accepts_and_stores_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("endpoint.sock");
        let config = Config {
            path: socket_path.clone(),
            codec: codec::Config::Json,
            action: action::Config::BufferedFileStorage(file_storage::Config {
                base_path: dir.path().to_owned(),
                path: "unix-in.JSON".to_owned(),
                separator: "\n".to_owned(),
                mode: file_storage::Mode::Append,
                buffering: 8192,
                timeout_secs: 5,
                queue_size: 1024,
            }),
            recording: None,
            connection: Settings::default(),
        };
        let server = Unix::new(
            General {
                id: None,
                quiet: true,
            },
            &config,
        );
        server.start().await.unwrap();
        let full_name = server.full_name();

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        client.write_all(b"{\"id\":1}").await.unwrap();
        server.factory().wait_num_has_connected(1).await;
        client.shutdown().await.unwrap();
        drop(client);
        server.factory().wait_num_connected(0).await;
        server.close().await.unwrap();

        assert_eq!(connections().num_connections(&full_name), 0);
        let written = tokio::fs::read_to_string(dir.path().join("unix-in.JSON"))
            .await
            .unwrap();
        assert_eq!(written, "{\"id\":1}\n");
        assert!(!socket_path.exists());
    }
}
