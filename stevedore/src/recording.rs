//! Traffic recording.
//!
//! The [`Recorder`] preaction appends a framed record of every inbound
//! buffer, before decoding, so a session can be replayed later with the
//! original pacing. Records are self-delimiting:
//!
//! ```text
//! sent_by_server: u8 | elapsed_ms: u32 | sender_len: u16 | sender | data_len: u32 | data
//! ```
//!
//! All integers are big-endian.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::action::file_storage::{BufferedFileStorage, Config as StorageConfig};
use crate::action::{Action, ActionError};
use crate::message::MessageObject;

/// One replayable record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub sent_by_server: bool,
    /// Time since the previous record on the same connection.
    pub elapsed: Duration,
    pub sender: String,
    pub data: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("truncated record at byte {offset}")]
    Truncated { offset: usize },
    #[error("record sender is not valid UTF-8")]
    BadSender,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Render one record to its framed form.
#[must_use]
pub fn encode_record(record: &Record) -> Bytes {
    let sender = record.sender.as_bytes();
    let mut out = BytesMut::with_capacity(1 + 4 + 2 + sender.len() + 4 + record.data.len());
    out.put_u8(u8::from(record.sent_by_server));
    out.put_u32(record.elapsed.as_millis().min(u128::from(u32::MAX)) as u32);
    out.put_u16(sender.len() as u16);
    out.put_slice(sender);
    out.put_u32(record.data.len() as u32);
    out.put_slice(&record.data);
    out.freeze()
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
    record_start: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], RecordingError> {
        let end = self.offset + n;
        if end > self.data.len() {
            return Err(RecordingError::Truncated {
                offset: self.record_start,
            });
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }
}

/// Decode every record in a recording buffer.
pub fn decode_records(data: &[u8]) -> Result<Vec<Record>, RecordingError> {
    let mut records = Vec::new();
    let mut cursor = Cursor {
        data,
        offset: 0,
        record_start: 0,
    };
    while cursor.offset < data.len() {
        cursor.record_start = cursor.offset;
        let sent_by_server = cursor.take(1)?[0] != 0;
        let elapsed_ms = u32::from_be_bytes(cursor.take(4)?.try_into().expect("4 bytes"));
        let sender_len = u16::from_be_bytes(cursor.take(2)?.try_into().expect("2 bytes")) as usize;
        let sender = std::str::from_utf8(cursor.take(sender_len)?)
            .map_err(|_| RecordingError::BadSender)?
            .to_owned();
        let data_len = u32::from_be_bytes(cursor.take(4)?.try_into().expect("4 bytes")) as usize;
        let payload = Bytes::copy_from_slice(cursor.take(data_len)?);
        records.push(Record {
            sent_by_server,
            elapsed: Duration::from_millis(u64::from(elapsed_ms)),
            sender,
            data: payload,
        });
    }
    Ok(records)
}

/// Read a recording file back as records.
pub async fn read_recording(path: &Path) -> Result<Vec<Record>, RecordingError> {
    let data = tokio::fs::read(path).await?;
    decode_records(&data)
}

/// Preaction that appends a framed record for every inbound buffer through
/// the managed-file machinery.
#[derive(Debug)]
pub struct Recorder {
    inner: BufferedFileStorage,
    last_seen: Mutex<FxHashMap<String, SystemTime>>,
}

impl Recorder {
    #[must_use]
    pub fn new(mut config: StorageConfig) -> Self {
        // Frames are self-delimiting.
        config.separator = String::new();
        Self {
            inner: BufferedFileStorage::new(config),
            last_seen: Mutex::new(FxHashMap::default()),
        }
    }

    fn elapsed_for(&self, peer: &str, received: SystemTime) -> Duration {
        let mut last_seen = self.last_seen.lock().expect("recorder lock poisoned");
        let elapsed = match last_seen.get(peer) {
            Some(previous) => received
                .duration_since(*previous)
                .unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        };
        last_seen.insert(peer.to_owned(), received);
        elapsed
    }
}

#[async_trait]
impl Action for Recorder {
    async fn do_one(
        &self,
        msg: Arc<MessageObject>,
    ) -> Result<Option<serde_json::Value>, ActionError> {
        let context = msg.context();
        let record = Record {
            sent_by_server: false,
            elapsed: self.elapsed_for(&context.peer, msg.received_timestamp()),
            sender: msg.sender().to_owned(),
            data: msg.encoded().clone(),
        };
        let framed = Arc::new(MessageObject::new(
            encode_record(&record),
            serde_json::Value::Null,
            Arc::clone(context),
            msg.received_timestamp(),
        ));
        debug!(peer = %context.peer, bytes = record.data.len(), "recording buffer");
        self.inner.do_one(framed).await
    }

    async fn wait_complete(&self) -> Result<(), ActionError> {
        self.inner.wait_complete().await
    }

    async fn close(&self) -> Result<(), ActionError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sender: &str, data: &'static [u8], elapsed_ms: u64) -> Record {
        Record {
            sent_by_server: false,
            elapsed: Duration::from_millis(elapsed_ms),
            sender: sender.to_owned(),
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn records_round_trip() {
        let records = vec![
            sample("127.0.0.1", b"{\"id\":1}", 0),
            sample("127.0.0.1", b"{\"id\":2}", 250),
        ];
        let mut framed = Vec::new();
        for record in &records {
            framed.extend_from_slice(&encode_record(record));
        }
        let decoded = decode_records(&framed).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let framed = encode_record(&sample("a", b"payload", 10));
        let err = decode_records(&framed[..framed.len() - 3]).unwrap_err();
        assert!(matches!(err, RecordingError::Truncated { .. }));
    }

    #[tokio::test]
    async fn recorder_writes_replayable_file() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(StorageConfig {
            base_path: dir.path().to_owned(),
            path: "session.record".to_owned(),
            separator: String::new(),
            mode: crate::action::file_storage::Mode::Append,
            buffering: 1024,
            timeout_secs: 5,
            queue_size: 64,
        });
        let context = Arc::new(crate::message::Context {
            peer: "127.0.0.1:5050".to_owned(),
            alias: "127.0.0.1".to_owned(),
            ..crate::message::Context::default()
        });
        for body in [&b"{\"id\":1}"[..], &b"{\"id\":2}"[..]] {
            let msg = Arc::new(MessageObject::buffer(
                Bytes::copy_from_slice(body),
                Arc::clone(&context),
                SystemTime::now(),
            ));
            recorder.do_one(msg).await.unwrap();
        }
        recorder.wait_complete().await.unwrap();
        recorder.close().await.unwrap();

        let records = read_recording(&dir.path().join("session.record"))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sender, "127.0.0.1");
        assert_eq!(records[0].data, Bytes::from_static(b"{\"id\":1}"));
        assert_eq!(records[0].elapsed, Duration::ZERO);
    }
}
