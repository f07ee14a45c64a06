//! The UDP server endpoint.
//!
//! One socket, many peers: the factory demultiplexes datagrams into
//! per-peer connections keyed by source address. Peer connections end when
//! the listener closes.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::General;
use crate::action::{self, ActionError};
use crate::codec;
use crate::connection::{Pipeline, Role, Settings};
use crate::factory::{run_datagram_listener, ProtocolFactory};
use crate::recording::Recorder;
use crate::signals::{self, Broadcaster};
use crate::status::StatusWaiter;

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    4000
}

/// Errors produced by [`Udp`].
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

/// The UDP server receiver.
#[derive(Debug)]
pub struct Udp {
    quiet: bool,
    host: String,
    port: u16,
    factory: Arc<ProtocolFactory>,
    status: StatusWaiter,
    stop: Mutex<Option<Broadcaster>>,
    listener_task: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Udp {
    /// Create a new [`Udp`] server instance.
    #[must_use]
    pub fn new(general: General, config: &Config) -> Self {
        let action = config.action.build();
        let preaction = config
            .recording
            .as_ref()
            .map(|c| Arc::new(Recorder::new(c.clone())) as Arc<dyn crate::action::Action>);
        let factory = Arc::new(ProtocolFactory::new(
            Role::Server,
            "UDP Server",
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
            listener_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn listening_on(&self) -> String {
        match *self.local_addr.lock().expect("addr lock poisoned") {
            Some(addr) => addr.to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    #[must_use]
    pub fn full_name(&self) -> String {
        format!("UDP Server {}", self.listening_on())
    }

    #[must_use]
    pub fn factory(&self) -> &Arc<ProtocolFactory> {
        &self.factory
    }

    #[must_use]
    pub fn status(&self) -> &StatusWaiter {
        &self.status
    }

    /// Bind and begin receiving datagrams.
    pub async fn start(&self) -> Result<(), Error> {
        if self.status.is_starting_or_started() {
            return Err(Error::AlreadyInState {
                endpoint: self.full_name(),
                state: "started",
            });
        }
        self.status.set_starting();
        let socket = Arc::new(UdpSocket::bind((self.host.as_str(), self.port)).await?);
        let local = socket.local_addr()?;
        *self.local_addr.lock().expect("addr lock poisoned") = Some(local);
        let full_name = format!("UDP Server {local}");
        self.factory.set_name(&full_name, "udp");
        self.factory.start().await?;
        info!("Starting UDP Server on {local}");

        let (stop, watcher) = signals::signal();
        *self.stop.lock().expect("stop lock poisoned") = Some(stop);
        let task = tokio::spawn(run_datagram_listener(
            Arc::clone(&self.factory),
            socket,
            watcher,
        ));
        *self.listener_task.lock().expect("task lock poisoned") = Some(task);

        if !self.quiet {
            println!("Serving UDP Server on {local}");
        }
        self.status.set_started();
        Ok(())
    }

    /// Stop the listener, end every synthesized peer connection, close the
    /// pipeline.
    pub async fn close(&self) -> Result<(), Error> {
        if self.status.is_stopping_or_stopped() {
            return Err(Error::AlreadyInState {
                endpoint: self.full_name(),
                state: "stopping or stopped",
            });
        }
        self.status.set_stopping();
        info!("Stopping UDP Server running at {}", self.listening_on());
        if let Some(stop) = self.stop.lock().expect("stop lock poisoned").take() {
            stop.signal();
        }
        let task = self.listener_task.lock().expect("task lock poisoned").take();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(io_error)) => error!(%io_error, "UDP listener failed"),
                Err(join_error) => error!(%join_error, "UDP listener panicked"),
            }
        }
        self.factory.close().await;
        self.status.set_stopped();
        info!("UDP Server stopped");
        Ok(())
    }
}
