//! Transport seam between connections and sockets.
//!
//! A [`Transport`] gives a connection a non-suspending `write`, cooperative
//! pause/resume for stream reads, and close/abort. Stream sockets get a
//! write-pump task fed from an unbounded channel; the shared datagram socket
//! is wrapped per peer so each connection writes to a pinned remote address.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::signals::Event;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Local close, or the peer hung up cleanly.
    UserRequested,
    /// The transport failed underneath the connection.
    TransportError(String),
    /// A graceful-close wait ran out of time.
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// TLS session details carried through to the connection context.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub cipher: String,
    pub compression: Option<String>,
    pub peercert: Option<Vec<u8>>,
}

/// Everything a connection needs to know about the socket underneath it.
#[derive(Debug, Clone, Default)]
pub struct TransportInfo {
    pub peer: Option<SocketAddr>,
    pub sock: Option<SocketAddr>,
    /// Peer path of a UNIX stream socket, when bound.
    pub unix_peer: Option<String>,
    /// Local path of a UNIX stream socket.
    pub unix_sock: Option<String>,
    pub fd: Option<i32>,
    pub pipe_addr: Option<String>,
    pub pipe_handle: Option<u64>,
    pub tls: Option<TlsInfo>,
}

pub trait Transport: Send + Sync + std::fmt::Debug {
    fn info(&self) -> &TransportInfo;

    /// Queue bytes for the peer. Never suspends.
    fn write(&self, data: Bytes) -> Result<(), TransportError>;

    fn pause_reading(&self) {}

    fn resume_reading(&self) {}

    fn is_reading(&self) -> bool {
        true
    }

    /// Whether this transport supports pausing reads.
    fn can_pause(&self) -> bool {
        false
    }

    /// Whether closing this transport ends a read loop that will report
    /// `connection_lost` on the connection's behalf.
    fn is_stream(&self) -> bool;

    /// Begin a graceful close: queued writes drain first.
    fn close(&self);

    /// Close immediately, dropping queued writes.
    fn abort(&self) {
        self.close();
    }

    fn is_closing(&self) -> bool;
}

/// Write side of a stream socket. Reads are driven externally (see
/// `connection::drive_stream`), which honours the pause flag here.
#[derive(Debug)]
pub struct StreamTransport {
    info: TransportInfo,
    out: mpsc::UnboundedSender<Bytes>,
    paused: Arc<watch::Sender<bool>>,
    closing: Event,
    aborted: Event,
}

impl StreamTransport {
    /// Wrap a write half, spawning its pump task.
    pub fn start<W>(writer: W, info: TransportInfo) -> Arc<Self>
    where
        W: tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let (out, rx) = mpsc::unbounded_channel();
        let (paused, _) = watch::channel(false);
        let transport = Arc::new(Self {
            info,
            out,
            paused: Arc::new(paused),
            closing: Event::new(),
            aborted: Event::new(),
        });
        tokio::spawn(Self::write_pump(
            writer,
            rx,
            transport.closing.clone(),
            transport.aborted.clone(),
        ));
        transport
    }

    async fn write_pump<W>(
        mut writer: W,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        closing: Event,
        aborted: Event,
    ) where
        W: tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        loop {
            tokio::select! {
                () = aborted.wait() => break,
                () = closing.wait() => {
                    // Drain what was queued before the close, then stop.
                    while let Ok(buf) = rx.try_recv() {
                        if writer.write_all(&buf).await.is_err() {
                            break;
                        }
                    }
                    let _ = writer.flush().await;
                    break;
                }
                maybe = rx.recv() => match maybe {
                    Some(buf) => {
                        let result = async {
                            writer.write_all(&buf).await?;
                            writer.flush().await
                        }
                        .await;
                        if let Err(error) = result {
                            warn!(%error, "stream write failed");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Observe the pause flag; used by the read loop.
    pub(crate) fn pause_flag(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    /// Observe the closing state; used by the read loop.
    pub(crate) fn closed_event(&self) -> Event {
        self.closing.clone()
    }
}

impl Transport for StreamTransport {
    fn info(&self) -> &TransportInfo {
        &self.info
    }

    fn write(&self, data: Bytes) -> Result<(), TransportError> {
        if self.is_closing() {
            return Err(TransportError::Closed);
        }
        self.out.send(data).map_err(|_| TransportError::Closed)
    }

    fn pause_reading(&self) {
        self.paused.send_replace(true);
    }

    fn resume_reading(&self) {
        self.paused.send_replace(false);
    }

    fn is_reading(&self) -> bool {
        !*self.paused.subscribe().borrow()
    }

    fn can_pause(&self) -> bool {
        true
    }

    fn is_stream(&self) -> bool {
        true
    }

    fn close(&self) {
        self.closing.set();
    }

    fn abort(&self) {
        self.aborted.set();
        self.closing.set();
    }

    fn is_closing(&self) -> bool {
        self.closing.is_set() || self.aborted.is_set()
    }
}

/// Per-peer writer over a shared datagram socket. Each wrapper pins one
/// remote address; a `None` peer means the socket is connected and plain
/// `send` is used.
#[derive(Debug)]
pub struct DatagramTransport {
    info: TransportInfo,
    socket: Arc<tokio::net::UdpSocket>,
    peer: Option<SocketAddr>,
    closing: Event,
}

impl DatagramTransport {
    #[must_use]
    pub fn new(
        socket: Arc<tokio::net::UdpSocket>,
        peer: Option<SocketAddr>,
        info: TransportInfo,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            socket,
            peer,
            closing: Event::new(),
        })
    }
}

impl Transport for DatagramTransport {
    fn info(&self) -> &TransportInfo {
        &self.info
    }

    fn write(&self, data: Bytes) -> Result<(), TransportError> {
        if self.is_closing() {
            return Err(TransportError::Closed);
        }
        let socket = Arc::clone(&self.socket);
        let peer = self.peer;
        tokio::spawn(async move {
            let result = match peer {
                Some(addr) => socket.send_to(&data, addr).await,
                None => socket.send(&data).await,
            };
            if let Err(error) = result {
                warn!(?peer, %error, "datagram send failed");
            }
        });
        Ok(())
    }

    fn is_stream(&self) -> bool {
        false
    }

    fn close(&self) {
        self.closing.set();
    }

    fn is_closing(&self) -> bool {
        self.closing.is_set()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Records writes and pause/resume calls; for driving connections
    /// without sockets.
    #[derive(Debug)]
    pub(crate) struct MockTransport {
        info: TransportInfo,
        pub(crate) writes: Mutex<Vec<Bytes>>,
        pub(crate) pause_calls: AtomicUsize,
        pub(crate) resume_calls: AtomicUsize,
        reading: AtomicBool,
        closing: Event,
        stream: bool,
    }

    impl MockTransport {
        pub(crate) fn new(info: TransportInfo, stream: bool) -> Arc<Self> {
            Arc::new(Self {
                info,
                writes: Mutex::new(Vec::new()),
                pause_calls: AtomicUsize::new(0),
                resume_calls: AtomicUsize::new(0),
                reading: AtomicBool::new(true),
                closing: Event::new(),
                stream,
            })
        }

        pub(crate) fn written(&self) -> Vec<Bytes> {
            self.writes.lock().expect("mock lock poisoned").clone()
        }
    }

    impl Transport for MockTransport {
        fn info(&self) -> &TransportInfo {
            &self.info
        }

        fn write(&self, data: Bytes) -> Result<(), TransportError> {
            if self.is_closing() {
                return Err(TransportError::Closed);
            }
            self.writes.lock().expect("mock lock poisoned").push(data);
            Ok(())
        }

        fn pause_reading(&self) {
            self.pause_calls.fetch_add(1, Ordering::SeqCst);
            self.reading.store(false, Ordering::SeqCst);
        }

        fn resume_reading(&self) {
            self.resume_calls.fetch_add(1, Ordering::SeqCst);
            self.reading.store(true, Ordering::SeqCst);
        }

        fn is_reading(&self) -> bool {
            self.reading.load(Ordering::SeqCst)
        }

        fn can_pause(&self) -> bool {
            true
        }

        fn is_stream(&self) -> bool {
            self.stream
        }

        fn close(&self) {
            self.closing.set();
        }

        fn is_closing(&self) -> bool {
            self.closing.is_set()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn stream_transport_pumps_writes_in_order() {
        let (client, mut server) = tokio::io::duplex(1024);
        let transport = StreamTransport::start(client, TransportInfo::default());
        transport.write(Bytes::from_static(b"first ")).unwrap();
        transport.write(Bytes::from_static(b"second")).unwrap();
        let mut buf = vec![0u8; 12];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first second");
    }

    #[tokio::test]
    async fn close_drains_queued_writes_then_rejects() {
        let (client, mut server) = tokio::io::duplex(1024);
        let transport = StreamTransport::start(client, TransportInfo::default());
        transport.write(Bytes::from_static(b"tail")).unwrap();
        transport.close();
        assert!(transport.is_closing());
        assert!(matches!(
            transport.write(Bytes::from_static(b"late")),
            Err(TransportError::Closed)
        ));
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tail");
    }

    #[tokio::test]
    async fn pause_flag_toggles() {
        let (client, _server) = tokio::io::duplex(64);
        let transport = StreamTransport::start(client, TransportInfo::default());
        assert!(transport.is_reading());
        transport.pause_reading();
        assert!(!transport.is_reading());
        transport.resume_reading();
        assert!(transport.is_reading());
    }
}
