//! stevedore senders
//!
//! A sender opens one client connection to a remote endpoint, the variants
//! of [`Sender`]. Connecting yields a [`Client`] handle: raw sends,
//! correlated requests, notification consumption and recording playback all
//! go through it, and it guarantees the connection is torn down on every
//! exit path.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionError};
use crate::factory::ProtocolFactory;
use crate::message::MessageObject;
use crate::recording::{self, RecordingError};
use crate::transport::CloseReason;

pub mod tcp;
pub mod udp;
#[cfg(unix)]
pub mod unix;

/// Errors produced by [`Sender`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// See [`crate::sender::tcp::Error`] for details.
    #[error(transparent)]
    Tcp(#[from] tcp::Error),
    /// See [`crate::sender::udp::Error`] for details.
    #[error(transparent)]
    Udp(#[from] udp::Error),
    /// See [`crate::sender::unix::Error`] for details.
    #[cfg(unix)]
    #[error(transparent)]
    Unix(#[from] unix::Error),
}

/// A request failed to produce a response.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("connection closed: {0:?}")]
    Closed(CloseReason),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Replaying a recording failed.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Recording(#[from] RecordingError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
/// Configurations common to all [`Sender`] variants.
pub struct General {
    /// The ID assigned to this sender.
    pub id: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
/// Configuration for [`Sender`].
pub struct Config {
    /// Common sender configs.
    #[serde(flatten)]
    pub general: General,
    /// The sender config.
    #[serde(flatten)]
    pub inner: Inner,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
/// Configuration for [`Sender`].
pub enum Inner {
    /// See [`crate::sender::tcp::Config`] for details.
    Tcp(tcp::Config),
    /// See [`crate::sender::udp::Config`] for details.
    Udp(udp::Config),
    /// See [`crate::sender::unix::Config`] for details.
    #[cfg(unix)]
    Unix(unix::Config),
}

#[derive(Debug)]
/// The sender client.
///
/// All senders supported by stevedore are a variant of this enum.
pub enum Sender {
    /// See [`crate::sender::tcp::Tcp`] for details.
    Tcp(tcp::Tcp),
    /// See [`crate::sender::udp::Udp`] for details.
    Udp(udp::Udp),
    /// See [`crate::sender::unix::Unix`] for details.
    #[cfg(unix)]
    Unix(unix::Unix),
}

impl Sender {
    /// Create a new [`Sender`], deferring to the underlying sub-sender.
    #[must_use]
    pub fn new(config: Config) -> Self {
        match config.inner {
            Inner::Tcp(conf) => Self::Tcp(tcp::Tcp::new(config.general, &conf)),
            Inner::Udp(conf) => Self::Udp(udp::Udp::new(config.general, &conf)),
            #[cfg(unix)]
            Inner::Unix(conf) => Self::Unix(unix::Unix::new(config.general, &conf)),
        }
    }

    /// Open the connection and wait for it to come up.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be opened or the connection
    /// fails to initialize.
    pub async fn connect(&self) -> Result<Client, Error> {
        match self {
            Self::Tcp(inner) => inner.connect().await.map_err(Error::Tcp),
            Self::Udp(inner) => inner.connect().await.map_err(Error::Udp),
            #[cfg(unix)]
            Self::Unix(inner) => inner.connect().await.map_err(Error::Unix),
        }
    }
}

/// A live client connection. Closing is graceful; dropping an unclosed
/// client aborts the connection so cancelled callers cannot leak it.
#[derive(Debug)]
pub struct Client {
    connection: Arc<Connection>,
    factory: Arc<ProtocolFactory>,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Client {
    #[must_use]
    pub fn new(
        connection: Arc<Connection>,
        factory: Arc<ProtocolFactory>,
        driver: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            connection,
            factory,
            driver: Mutex::new(driver),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Send raw wire bytes.
    pub fn send(&self, data: Bytes) -> Result<(), ConnectionError> {
        self.connection.send(data)
    }

    /// Encode and send one decoded value without waiting for a response.
    pub fn send_decoded(&self, decoded: serde_json::Value) -> Result<(), ConnectionError> {
        self.connection.encode_send(decoded).map(|_waiter| ())
    }

    /// Encode and send a request, then wait for the correlated response.
    pub async fn request(
        &self,
        decoded: serde_json::Value,
    ) -> Result<Arc<MessageObject>, RequestError> {
        let waiter = self.connection.encode_send(decoded)?;
        match waiter.await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(reason)) => Err(RequestError::Closed(reason)),
            Err(_) => Err(RequestError::Closed(CloseReason::UserRequested)),
        }
    }

    /// Inbound objects that matched no pending request, plus payloads
    /// fanned out via the manager. Takable once.
    #[must_use]
    pub fn notifications(&self) -> Option<mpsc::UnboundedReceiver<serde_json::Value>> {
        self.connection.notifications()
    }

    /// Replay a recorded session. Paced playback honours recorded gaps of a
    /// second or more; `immediate` sends everything back to back. Returns
    /// the number of records sent.
    pub async fn play_recording(
        &self,
        path: &Path,
        immediate: bool,
    ) -> Result<usize, PlaybackError> {
        let records = recording::read_recording(path).await?;
        let count = records.len();
        for record in records {
            if !immediate && record.elapsed >= Duration::from_secs(1) {
                tokio::time::sleep(record.elapsed).await;
            }
            self.send(record.data)?;
        }
        Ok(count)
    }

    /// Close the connection and wait for it to drain.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connection.close(false);
        self.connection.wait_closed().await;
        let driver = self.driver.lock().expect("driver lock poisoned").take();
        if let Some(driver) = driver {
            // A pump that never observes the close is abandoned.
            let _ = tokio::time::timeout(Duration::from_secs(1), driver).await;
        }
        self.factory.close().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.connection.close(true);
            self.connection.connection_lost(Some(CloseReason::UserRequested));
            if let Some(driver) = self.driver.lock().expect("driver lock poisoned").take() {
                driver.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::connection::Settings;
    use crate::manager::{connections, ManagedConnection};

    fn tcp_client(port: u16) -> tcp::Tcp {
        tcp::Tcp::new(
            General { id: None },
            &tcp::Config {
                host: "127.0.0.1".to_owned(),
                port,
                codec: codec::Config::Json,
                connection: Settings::default(),
            },
        )
    }

    /// Minimal in-test echo server: accept one TCP stream, respond to each
    /// decoded request with `{"id": .., "result": method}`.
    async fn spawn_raw_echo_server() -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    let mut held = Vec::new();
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        held.extend_from_slice(&buf[..n]);
                        let mut consumed = 0;
                        let mut iter = serde_json::Deserializer::from_slice(&held)
                            .into_iter::<serde_json::Value>();
                        let mut responses = Vec::new();
                        loop {
                            match iter.next() {
                                Some(Ok(value)) => {
                                    consumed = iter.byte_offset();
                                    responses.push(serde_json::json!({
                                        "id": value["id"].clone(),
                                        "result": value["method"].clone(),
                                    }));
                                }
                                _ => break,
                            }
                        }
                        held.drain(..consumed);
                        for response in responses {
                            let bytes = serde_json::to_vec(&response).unwrap();
                            if stream.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn two_way_request_correlation_over_tcp() {
        let addr = spawn_raw_echo_server().await;
        let sender = tcp_client(addr.port());
        let client = sender.connect().await.unwrap();

        let response = client
            .request(serde_json::json!({
                "id": 1,
                "method": "login",
                "params": ["user1", "password"],
            }))
            .await
            .unwrap();
        assert_eq!(response.decoded()["result"], serde_json::json!("login"));

        let response = client
            .request(serde_json::json!({"id": 2, "method": "logout"}))
            .await
            .unwrap();
        assert_eq!(response.decoded()["result"], serde_json::json!("logout"));

        let full_name = client.connection().parent_name();
        client.close().await;
        assert_eq!(connections().num_connections(&full_name), 0);
    }

    #[tokio::test]
    async fn replays_a_recording_over_tcp() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.record");
        let mut framed = Vec::new();
        for (body, elapsed_ms) in [(&b"{\"id\":1}"[..], 0u64), (&b"{\"id\":2}"[..], 20)] {
            framed.extend_from_slice(&recording::encode_record(&recording::Record {
                sent_by_server: false,
                elapsed: Duration::from_millis(elapsed_ms),
                sender: "127.0.0.1".to_owned(),
                data: Bytes::copy_from_slice(body),
            }));
        }
        tokio::fs::write(&path, &framed).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let sender = tcp_client(addr.port());
        let client = sender.connect().await.unwrap();
        // Sub-second recorded gaps replay back to back even when not
        // immediate; `true` skips pacing entirely.
        let sent = client.play_recording(&path, true).await.unwrap();
        assert_eq!(sent, 2);
        client.close().await;

        let buf = received.await.unwrap();
        assert_eq!(buf, b"{\"id\":1}{\"id\":2}");
    }

    #[tokio::test]
    async fn pending_request_resolves_with_close_reason() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept but never respond.
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let sender = tcp_client(addr.port());
        let client = sender.connect().await.unwrap();
        let pending = client.connection().encode_send(serde_json::json!({
            "id": 7,
            "method": "never-answered",
        }));
        let waiter = pending.unwrap();
        client.close().await;
        let outcome = waiter.await.unwrap();
        assert!(outcome.is_err());
    }
}
