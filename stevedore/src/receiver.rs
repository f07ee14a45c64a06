//! stevedore receivers
//!
//! A receiver hosts one server endpoint over a single transport, the
//! variants of [`Server`]. Each variant works the same way: bind, hand
//! every peer to the endpoint's protocol factory, and on shutdown stop
//! accepting, wait for live sessions to drain, then close the pipeline.

use serde::Deserialize;

use crate::notify;
use crate::signals::Event;

pub mod tcp;
pub mod udp;
#[cfg(unix)]
pub mod unix;

/// Errors produced by [`Server`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// See [`crate::receiver::tcp::Error`] for details.
    #[error(transparent)]
    Tcp(#[from] tcp::Error),
    /// See [`crate::receiver::udp::Error`] for details.
    #[error(transparent)]
    Udp(#[from] udp::Error),
    /// See [`crate::receiver::unix::Error`] for details.
    #[cfg(unix)]
    #[error(transparent)]
    Unix(#[from] unix::Error),
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
/// Configurations common to all [`Server`] variants.
pub struct General {
    /// The ID assigned to this receiver.
    pub id: Option<String>,
    /// Suppress the human-readable listening lines.
    #[serde(default)]
    pub quiet: bool,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
/// Configuration for [`Server`].
pub struct Config {
    /// Common receiver configs.
    #[serde(flatten)]
    pub general: General,
    /// The receiver config.
    #[serde(flatten)]
    pub inner: Inner,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
/// Configuration for [`Server`].
pub enum Inner {
    /// See [`crate::receiver::tcp::Config`] for details.
    Tcp(tcp::Config),
    /// See [`crate::receiver::udp::Config`] for details.
    Udp(udp::Config),
    /// See [`crate::receiver::unix::Config`] for details.
    #[cfg(unix)]
    Unix(unix::Config),
}

/// What ended a [`Server::serve_until_signal`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The stop event fired; the endpoint is closed.
    Stopped,
    /// The restart event fired; the caller should rebuild from config.
    Restart,
}

#[derive(Debug)]
/// The receiver server.
///
/// All receivers supported by stevedore are a variant of this enum.
pub enum Server {
    /// See [`crate::receiver::tcp::Tcp`] for details.
    Tcp(tcp::Tcp),
    /// See [`crate::receiver::udp::Udp`] for details.
    Udp(udp::Udp),
    /// See [`crate::receiver::unix::Unix`] for details.
    #[cfg(unix)]
    Unix(unix::Unix),
}

impl Server {
    /// Create a new [`Server`], deferring to the underlying sub-server.
    #[must_use]
    pub fn new(config: Config) -> Self {
        match config.inner {
            Inner::Tcp(conf) => Self::Tcp(tcp::Tcp::new(config.general, &conf)),
            Inner::Udp(conf) => Self::Udp(udp::Udp::new(config.general, &conf)),
            #[cfg(unix)]
            Inner::Unix(conf) => Self::Unix(unix::Unix::new(config.general, &conf)),
        }
    }

    /// Bind the endpoint and begin serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint was already started, the bind
    /// fails, or the pipeline fails to start.
    pub async fn start(&self) -> Result<(), Error> {
        match self {
            Self::Tcp(inner) => inner.start().await.map_err(Error::Tcp),
            Self::Udp(inner) => inner.start().await.map_err(Error::Udp),
            #[cfg(unix)]
            Self::Unix(inner) => inner.start().await.map_err(Error::Unix),
        }
    }

    /// Shut the endpoint down: stop accepting, drain, close the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint was already stopping or stopped.
    pub async fn close(&self) -> Result<(), Error> {
        match self {
            Self::Tcp(inner) => inner.close().await.map_err(Error::Tcp),
            Self::Udp(inner) => inner.close().await.map_err(Error::Udp),
            #[cfg(unix)]
            Self::Unix(inner) => inner.close().await.map_err(Error::Unix),
        }
    }

    /// Full endpoint name, e.g. `"TCP Server 127.0.0.1:4000"`.
    #[must_use]
    pub fn full_name(&self) -> String {
        match self {
            Self::Tcp(inner) => inner.full_name(),
            Self::Udp(inner) => inner.full_name(),
            #[cfg(unix)]
            Self::Unix(inner) => inner.full_name(),
        }
    }

    #[must_use]
    pub fn listening_on(&self) -> String {
        match self {
            Self::Tcp(inner) => inner.listening_on(),
            Self::Udp(inner) => inner.listening_on(),
            #[cfg(unix)]
            Self::Unix(inner) => inner.listening_on(),
        }
    }

    #[must_use]
    pub fn factory(&self) -> &std::sync::Arc<crate::factory::ProtocolFactory> {
        match self {
            Self::Tcp(inner) => inner.factory(),
            Self::Udp(inner) => inner.factory(),
            #[cfg(unix)]
            Self::Unix(inner) => inner.factory(),
        }
    }

    #[must_use]
    pub fn status(&self) -> &crate::status::StatusWaiter {
        match self {
            Self::Tcp(inner) => inner.status(),
            Self::Udp(inner) => inner.status(),
            #[cfg(unix)]
            Self::Unix(inner) => inner.status(),
        }
    }

    pub async fn wait_started(&self) {
        self.status().wait_started().await;
    }

    pub async fn wait_stopped(&self) {
        self.status().wait_stopped().await;
    }

    pub async fn wait_num_connections(&self, num: u64) {
        self.factory().wait_num_connected(num).await;
    }

    pub async fn wait_num_has_connected(&self, num: u64) {
        self.factory().wait_num_has_connected(num).await;
    }

    pub async fn wait_all_connections_closed(&self) {
        self.factory().wait_all_closed().await;
    }

    /// Serve until the stop or restart event fires, then shut down.
    ///
    /// Emits the supervisor readiness notifications around the run:
    /// `STATUS=` with the listening line, `READY=1` once serving,
    /// `STOPPING=1` when the stop event fires, and an optional start signal
    /// to a parent process.
    ///
    /// # Errors
    ///
    /// Returns an error if starting or closing the endpoint fails.
    pub async fn serve_until_signal(
        &self,
        stop: &Event,
        restart: &Event,
        notify_pid: Option<i32>,
    ) -> Result<ServeOutcome, Error> {
        self.start().await?;
        use std::io::Write;
        let _ = std::io::stdout().flush();
        notify::send_status(&format!("Serving {}", self.full_name()));
        notify::send_ready();
        if let Some(pid) = notify_pid {
            notify::send_start_signal(pid);
        }
        let outcome = tokio::select! {
            () = stop.wait() => ServeOutcome::Stopped,
            () = restart.wait() => ServeOutcome::Restart,
        };
        if outcome == ServeOutcome::Stopped {
            notify::send_stopping();
        }
        self.close().await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action;
    use crate::action::file_storage;

    #[tokio::test]
    async fn serve_until_signal_stops_on_stop_event() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            general: General {
                id: Some("test".to_owned()),
                quiet: true,
            },
            inner: Inner::Tcp(tcp::Config {
                host: "127.0.0.1".to_owned(),
                port: 0,
                codec: crate::codec::Config::Json,
                action: action::Config::BufferedFileStorage(file_storage::Config {
                    base_path: dir.path().to_owned(),
                    path: "in.JSON".to_owned(),
                    separator: "\n".to_owned(),
                    mode: file_storage::Mode::Append,
                    buffering: 8192,
                    timeout_secs: 5,
                    queue_size: 1024,
                }),
                recording: None,
                connection: crate::connection::Settings::default(),
            }),
        };
        let server = Server::new(config);
        let stop = Event::new();
        let restart = Event::new();
        let serve = {
            let stop = stop.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                stop.set();
            }
        };
        let (outcome, ()) = tokio::join!(
            server.serve_until_signal(&stop, &restart, None),
            serve
        );
        assert_eq!(outcome.unwrap(), ServeOutcome::Stopped);
        assert!(server.status().is_stopped());
    }
}
