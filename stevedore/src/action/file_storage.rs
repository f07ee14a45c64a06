//! File-sink actions.
//!
//! [`BufferedFileStorage`] appends batches of encoded message bytes into
//! files keyed by a path template. Each path has at most one live
//! [`ManagedFile`] writer; writes are enqueued without blocking and the
//! writer coalesces whatever is queued into a single write-and-flush. A
//! writer that sees no traffic for its timeout closes the file and
//! deregisters itself; the next write reopens it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use super::{Action, ActionError};
use crate::message::MessageObject;
use crate::signals::Event;

fn default_buffering() -> usize {
    8 * 1024
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_queue_size() -> usize {
    1024
}

/// How files are opened.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Append,
    Truncate,
}

/// Configuration shared by both file-storage actions.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory every rendered path is joined under.
    pub base_path: PathBuf,
    /// Path template resolved against each message, e.g.
    /// `"{msg.host}.JSON"`.
    pub path: String,
    /// Appended after every message written.
    #[serde(default)]
    pub separator: String,
    #[serde(default)]
    pub mode: Mode,
    /// Writer buffer capacity in bytes.
    #[serde(default = "default_buffering")]
    pub buffering: usize,
    /// Seconds an idle managed file stays open.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Bound of the per-file write queue; a full queue surfaces
    /// backpressure.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct FileParams {
    pub(crate) mode: Mode,
    pub(crate) buffering: usize,
    pub(crate) timeout: Duration,
    pub(crate) separator: Bytes,
    pub(crate) queue_size: usize,
}

impl Config {
    pub(crate) fn params(&self) -> FileParams {
        FileParams {
            mode: self.mode,
            buffering: self.buffering,
            timeout: Duration::from_secs(self.timeout_secs),
            separator: Bytes::from(self.separator.clone().into_bytes()),
            queue_size: self.queue_size,
        }
    }
}

/// Resolve a `{msg.field}` template against one message.
fn render_path(template: &str, msg: &MessageObject) -> Result<PathBuf, ActionError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let Some(close) = rest[open..].find('}') else {
            return Err(ActionError::Handler(format!(
                "unterminated placeholder in path template {template:?}"
            )));
        };
        let key = &rest[open + 1..open + close];
        let context = msg.context();
        match key {
            "msg.sender" => out.push_str(msg.sender()),
            "msg.alias" => out.push_str(&context.alias),
            "msg.peer" => out.push_str(&context.peer),
            "msg.own" => out.push_str(&context.own),
            "msg.host" => match context.host {
                Some(host) => out.push_str(&host.to_string()),
                None => out.push_str(&context.peer),
            },
            "msg.port" => {
                if let Some(port) = context.port {
                    out.push_str(&port.to_string());
                }
            }
            "msg.uid" => out.push_str(&msg.uid().to_string()),
            "msg.request_id" => out.push_str(&msg.request_id().unwrap_or_default()),
            other => {
                return Err(ActionError::Handler(format!(
                    "unknown placeholder {other:?} in path template"
                )));
            }
        }
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    Ok(PathBuf::from(out))
}

static OPEN_FILES: Lazy<Mutex<FxHashMap<PathBuf, Arc<ManagedFile>>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

#[derive(Debug)]
enum WriteError {
    Full,
    Stopped,
}

#[derive(Debug)]
enum CloseCause {
    Timeout,
    Shutdown,
    Disconnected,
    Io(std::io::Error),
}

/// The single live writer for one path.
#[derive(Debug)]
pub struct ManagedFile {
    path: PathBuf,
    tx: mpsc::Sender<Arc<MessageObject>>,
    outstanding: Arc<watch::Sender<usize>>,
    task_started: Event,
    finished: Event,
    shutdown: Event,
}

impl ManagedFile {
    /// Fetch the live writer for `path`, spawning one if needed.
    fn get_or_open(path: PathBuf, params: &FileParams) -> Arc<Self> {
        let mut open = OPEN_FILES.lock().expect("open-files lock poisoned");
        if let Some(existing) = open.get(&path) {
            if !existing.finished.is_set() {
                return Arc::clone(existing);
            }
        }
        let (tx, rx) = mpsc::channel(params.queue_size);
        let (outstanding, _) = watch::channel(0usize);
        let file = Arc::new(Self {
            path: path.clone(),
            tx,
            outstanding: Arc::new(outstanding),
            task_started: Event::new(),
            finished: Event::new(),
            shutdown: Event::new(),
        });
        open.insert(path, Arc::clone(&file));
        tokio::spawn(Self::manage(Arc::clone(&file), rx, params.clone()));
        file
    }

    pub(crate) fn lookup(path: &Path) -> Option<Arc<Self>> {
        OPEN_FILES
            .lock()
            .expect("open-files lock poisoned")
            .get(path)
            .cloned()
    }

    #[must_use]
    pub fn num_files() -> usize {
        OPEN_FILES.lock().expect("open-files lock poisoned").len()
    }

    /// Enqueue one message without blocking.
    fn write(&self, msg: Arc<MessageObject>) -> Result<(), WriteError> {
        self.outstanding.send_modify(|n| *n += 1);
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
                Err(WriteError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
                Err(WriteError::Stopped)
            }
        }
    }

    /// Resolve once every queued message has been written, or the writer
    /// task has died, whichever comes first; a dying task never leaves
    /// callers blocked here.
    pub async fn wait_writes_done(&self) {
        debug!(path = %self.path.display(), "waiting for writes to complete");
        let mut outstanding = self.outstanding.subscribe();
        tokio::select! {
            _ = outstanding.wait_for(|n| *n == 0) => {}
            () = self.finished.wait() => {}
        }
        debug!(path = %self.path.display(), "writes completed");
    }

    /// Cooperative close: wait for the writer to start, drain its queue,
    /// then signal it to exit.
    pub async fn close(&self) {
        debug!(path = %self.path.display(), "closing file");
        if self.finished.is_set() {
            debug!(path = %self.path.display(), "file already closed");
            return;
        }
        self.task_started.wait().await;
        self.wait_writes_done().await;
        self.shutdown.set();
        self.finished.wait().await;
        debug!(path = %self.path.display(), "closed file");
    }

    /// Close every live managed file and poll briefly for the registry to
    /// drain.
    pub async fn close_all() {
        let files: Vec<Arc<Self>> = {
            let open = OPEN_FILES.lock().expect("open-files lock poisoned");
            open.values().cloned().collect()
        };
        for file in files {
            file.close().await;
        }
        let mut polls = 0;
        while Self::num_files() > 0 && polls < 20 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            polls += 1;
        }
    }

    async fn manage(file: Arc<Self>, mut rx: mpsc::Receiver<Arc<MessageObject>>, params: FileParams) {
        file.task_started.set();
        info!(path = %file.path.display(), "opening file");
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).write(true);
        match params.mode {
            Mode::Append => options.append(true),
            Mode::Truncate => options.truncate(true),
        };
        match options.open(&file.path).await {
            Ok(handle) => {
                let mut writer = BufWriter::with_capacity(params.buffering, handle);
                let cause = Self::write_loop(&file, &mut rx, &mut writer, &params).await;
                match cause {
                    CloseCause::Timeout => {
                        info!(path = %file.path.display(), "file closing due to timeout");
                    }
                    CloseCause::Shutdown | CloseCause::Disconnected => {
                        info!(path = %file.path.display(), "file closing");
                    }
                    CloseCause::Io(io_error) => {
                        error!(path = %file.path.display(), error = %io_error, "file write failed");
                    }
                }
            }
            Err(io_error) => {
                error!(path = %file.path.display(), error = %io_error, "failed to open file");
            }
        }
        // Whatever ended the loop, every message still queued must be
        // marked processed so accounting stays consistent.
        rx.close();
        while let Ok(msg) = rx.try_recv() {
            msg.processed();
            file.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        }
        {
            let mut open = OPEN_FILES.lock().expect("open-files lock poisoned");
            if let Some(current) = open.get(&file.path) {
                if Arc::ptr_eq(current, &file) {
                    open.remove(&file.path);
                }
            }
        }
        file.finished.set();
        debug!(path = %file.path.display(), "cleanup completed");
    }

    async fn write_loop(
        file: &Arc<Self>,
        rx: &mut mpsc::Receiver<Arc<MessageObject>>,
        writer: &mut BufWriter<tokio::fs::File>,
        params: &FileParams,
    ) -> CloseCause {
        loop {
            let first = tokio::select! {
                () = file.shutdown.wait() => return CloseCause::Shutdown,
                msg = tokio::time::timeout(params.timeout, rx.recv()) => match msg {
                    Err(_) => return CloseCause::Timeout,
                    Ok(None) => return CloseCause::Disconnected,
                    Ok(Some(msg)) => msg,
                },
            };
            let mut msgs = vec![first];
            while let Ok(msg) = rx.try_recv() {
                msgs.push(msg);
            }
            let mut data =
                Vec::with_capacity(msgs.iter().map(|m| m.encoded().len()).sum::<usize>());
            for msg in &msgs {
                data.extend_from_slice(msg.encoded());
                data.extend_from_slice(&params.separator);
            }
            let result = async {
                writer.write_all(&data).await?;
                writer.flush().await
            }
            .await;
            for msg in &msgs {
                msg.processed();
                file.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            }
            match result {
                Ok(()) => {
                    debug!(
                        path = %file.path.display(),
                        bytes = data.len(),
                        items = msgs.len(),
                        "batch written"
                    );
                    metrics::counter!("file_bytes_written").increment(data.len() as u64);
                }
                Err(io_error) => return CloseCause::Io(io_error),
            }
        }
    }
}

/// Batch-append storage: messages are enqueued on managed files and flushed
/// in coalesced batches.
#[derive(Debug)]
pub struct BufferedFileStorage {
    config: Config,
    created_dirs: Mutex<FxHashSet<PathBuf>>,
    outstanding_paths: Mutex<FxHashSet<PathBuf>>,
}

impl BufferedFileStorage {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            created_dirs: Mutex::new(FxHashSet::default()),
            outstanding_paths: Mutex::new(FxHashSet::default()),
        }
    }

    async fn ensure_parent_dir(&self, full_path: &Path) -> Result<(), ActionError> {
        let Some(parent) = full_path.parent() else {
            return Ok(());
        };
        {
            let created = self.created_dirs.lock().expect("dir cache lock poisoned");
            if created.contains(parent) {
                return Ok(());
            }
        }
        tokio::fs::create_dir_all(parent).await?;
        self.created_dirs
            .lock()
            .expect("dir cache lock poisoned")
            .insert(parent.to_owned());
        Ok(())
    }
}

#[async_trait]
impl Action for BufferedFileStorage {
    async fn do_one(
        &self,
        msg: Arc<MessageObject>,
    ) -> Result<Option<serde_json::Value>, ActionError> {
        debug!(msg = %msg, "storing message");
        let rel = render_path(&self.config.path, &msg)?;
        let full_path = self.config.base_path.join(rel);
        self.ensure_parent_dir(&full_path).await?;
        let params = self.config.params();
        let file = ManagedFile::get_or_open(full_path.clone(), &params);
        let result = match file.write(Arc::clone(&msg)) {
            Err(WriteError::Stopped) => {
                // The writer idled out between lookup and enqueue; reopen.
                ManagedFile::get_or_open(full_path.clone(), &params).write(msg)
            }
            other => other,
        };
        match result {
            Ok(()) => {}
            Err(WriteError::Full) => {
                return Err(ActionError::Backpressure { path: full_path });
            }
            Err(WriteError::Stopped) => {
                return Err(ActionError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "file writer stopped",
                )));
            }
        }
        self.outstanding_paths
            .lock()
            .expect("outstanding lock poisoned")
            .insert(full_path);
        Ok(None)
    }

    async fn wait_complete(&self) -> Result<(), ActionError> {
        let paths: Vec<PathBuf> = {
            let mut outstanding = self
                .outstanding_paths
                .lock()
                .expect("outstanding lock poisoned");
            outstanding.drain().collect()
        };
        debug!(paths = paths.len(), "waiting for outstanding writes");
        for path in paths {
            if let Some(file) = ManagedFile::lookup(&path) {
                file.wait_writes_done().await;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ActionError> {
        ManagedFile::close_all().await;
        Ok(())
    }
}

/// One-shot storage: open, write, close per message. Useful when each
/// message lands in its own file.
#[derive(Debug)]
pub struct FileStorage {
    config: Config,
}

impl FileStorage {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Action for FileStorage {
    async fn do_one(
        &self,
        msg: Arc<MessageObject>,
    ) -> Result<Option<serde_json::Value>, ActionError> {
        let rel = render_path(&self.config.path, &msg)?;
        let full_path = self.config.base_path.join(rel);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).write(true);
        match self.config.mode {
            Mode::Append => options.append(true),
            Mode::Truncate => options.truncate(true),
        };
        let mut handle = options.open(&full_path).await?;
        handle.write_all(msg.encoded()).await?;
        if !self.config.separator.is_empty() {
            handle.write_all(self.config.separator.as_bytes()).await?;
        }
        handle.flush().await?;
        msg.processed();
        debug!(path = %full_path.display(), "message written");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::SystemTime;

    use super::*;
    use crate::message::Context;

    fn msg_from(host: &str, body: &str) -> Arc<MessageObject> {
        let context = Context {
            host: Some(host.parse::<IpAddr>().unwrap()),
            peer: format!("{host}:12345"),
            alias: host.to_owned(),
            ..Context::default()
        };
        Arc::new(MessageObject::new(
            Bytes::from(body.as_bytes().to_vec()),
            serde_json::from_str(body).unwrap_or(serde_json::Value::Null),
            Arc::new(context),
            SystemTime::now(),
        ))
    }

    fn storage_config(base: &Path) -> Config {
        Config {
            base_path: base.to_owned(),
            path: "{msg.host}.JSON".to_owned(),
            separator: "\n".to_owned(),
            mode: Mode::Append,
            buffering: default_buffering(),
            timeout_secs: 1,
            queue_size: 64,
        }
    }

    #[test]
    fn render_path_substitutes_fields() {
        let msg = msg_from("10.1.2.3", "{\"id\":1}");
        assert_eq!(
            render_path("{msg.host}.JSON", &msg).unwrap(),
            PathBuf::from("10.1.2.3.JSON")
        );
        assert_eq!(
            render_path("logs/{msg.sender}/out.txt", &msg).unwrap(),
            PathBuf::from("logs/10.1.2.3/out.txt")
        );
        assert!(render_path("{msg.bogus}", &msg).is_err());
    }

    #[tokio::test]
    async fn buffered_storage_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BufferedFileStorage::new(storage_config(dir.path()));
        let first = msg_from("127.0.0.1", "{\"id\":1,\"method\":\"login\"}");
        let second = msg_from("127.0.0.1", "{\"id\":2,\"method\":\"logout\"}");
        storage.do_one(Arc::clone(&first)).await.unwrap();
        storage.do_one(Arc::clone(&second)).await.unwrap();
        storage.wait_complete().await.unwrap();
        assert!(first.is_processed());
        assert!(second.is_processed());
        let written = tokio::fs::read_to_string(dir.path().join("127.0.0.1.JSON"))
            .await
            .unwrap();
        assert_eq!(
            written,
            "{\"id\":1,\"method\":\"login\"}\n{\"id\":2,\"method\":\"logout\"}\n"
        );
        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn one_writer_per_path_and_close_all_drains_registry() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BufferedFileStorage::new(storage_config(dir.path()));
        for i in 0..10 {
            storage
                .do_one(msg_from("192.0.2.7", &format!("{{\"id\":{i}}}")))
                .await
                .unwrap();
        }
        let path = dir.path().join("192.0.2.7.JSON");
        assert!(ManagedFile::lookup(&path).is_some());
        storage.close().await.unwrap();
        assert!(ManagedFile::lookup(&path).is_none());
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(written.lines().count(), 10);
    }

    #[tokio::test]
    async fn full_queue_surfaces_backpressure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = storage_config(dir.path());
        config.queue_size = 1;
        config.path = "bp.JSON".to_owned();
        let full_path = dir.path().join("bp.JSON");
        let params = config.params();
        let file = ManagedFile::get_or_open(full_path.clone(), &params);
        // Stop the writer from draining so the queue can fill: signal
        // shutdown only after observing the error.
        let mut results = Vec::new();
        for i in 0..16 {
            results.push(file.write(msg_from("198.51.100.1", &format!("{{\"id\":{i}}}"))));
        }
        // At least the writes past queue capacity plus the in-progress batch
        // must have been rejected.
        assert!(results.iter().any(|r| matches!(r, Err(WriteError::Full))));
        file.close().await;
    }

    #[tokio::test]
    async fn idle_writer_times_out_and_reopens_on_next_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = storage_config(dir.path());
        config.timeout_secs = 1;
        config.path = "idle.JSON".to_owned();
        let storage = BufferedFileStorage::new(config);
        let path = dir.path().join("idle.JSON");

        storage
            .do_one(msg_from("203.0.113.9", "{\"id\":1}"))
            .await
            .unwrap();
        storage.wait_complete().await.unwrap();
        // Wait out the idle timeout; the writer closes and deregisters.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(ManagedFile::lookup(&path).is_none());

        storage
            .do_one(msg_from("203.0.113.9", "{\"id\":2}"))
            .await
            .unwrap();
        storage.wait_complete().await.unwrap();
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(written, "{\"id\":1}\n{\"id\":2}\n");
        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn one_shot_storage_writes_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = storage_config(dir.path());
        config.path = "{msg.request_id}.JSON".to_owned();
        let storage = FileStorage::new(config);
        let msg = msg_from("127.0.0.1", "{\"id\":41}");
        storage.do_one(Arc::clone(&msg)).await.unwrap();
        assert!(msg.is_processed());
        let written = tokio::fs::read_to_string(dir.path().join("41.JSON"))
            .await
            .unwrap();
        assert_eq!(written, "{\"id\":41}\n");
    }
}
