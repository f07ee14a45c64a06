//! Byte/object framing.
//!
//! A [`Codec`] cuts a raw byte buffer into [`MessageObject`]s and renders
//! decoded values back to wire bytes. Stream transports may hand the codec a
//! buffer that ends mid-message; `decode_buffer` reports how many bytes it
//! consumed so the caller can carry the remainder into the next read.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::message::{Context, MessageObject};

/// Errors from decoding wire bytes.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The buffer contains a syntactically invalid message.
    #[error("invalid message at byte {offset}: {source}")]
    Invalid {
        offset: usize,
        #[source]
        source: serde_json::Error,
    },
    /// Reading a message file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The result of decoding one buffer.
#[derive(Debug)]
pub struct Decoded {
    /// Complete messages, in wire order.
    pub objects: Vec<MessageObject>,
    /// Bytes consumed from the front of the buffer. Anything past this is an
    /// incomplete trailing message the caller should retain.
    pub consumed: usize,
}

/// A byte/object translator, also capable of streaming objects back out of
/// the files the storage actions write.
#[async_trait]
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Short name used in filenames and logs, e.g. `"JSON"`.
    fn name(&self) -> &'static str;

    /// Cut `data` into complete message objects.
    fn decode_buffer(
        &self,
        data: &Bytes,
        context: &Arc<Context>,
        received: SystemTime,
    ) -> Result<Decoded, DecodeError>;

    /// Render a decoded value to wire bytes.
    fn encode(&self, decoded: &serde_json::Value) -> Bytes;

    /// Build a message object from a decoded value, encoding it on the way.
    fn from_decoded(&self, decoded: serde_json::Value, context: &Arc<Context>) -> MessageObject {
        let encoded = self.encode(&decoded);
        MessageObject::new(encoded, decoded, context.clone(), SystemTime::now())
    }

    /// Decode every message stored in a file written by a storage action.
    async fn from_file(
        &self,
        path: &Path,
        context: &Arc<Context>,
    ) -> Result<Vec<MessageObject>, DecodeError> {
        let data = tokio::fs::read(path).await?;
        let decoded = self.decode_buffer(&Bytes::from(data), context, SystemTime::now())?;
        Ok(decoded.objects)
    }
}

/// Which bundled codec an endpoint runs.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Config {
    #[default]
    Json,
}

impl Config {
    #[must_use]
    pub fn build(self) -> Arc<dyn Codec> {
        match self {
            Self::Json => Arc::new(JsonCodec),
        }
    }
}

/// Concatenated-JSON codec: a buffer holds zero or more JSON documents
/// separated by optional whitespace. Encoding is compact, so
/// `encode(decode(x)) == x` holds byte-exact for compact input.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[async_trait]
impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "JSON"
    }

    fn decode_buffer(
        &self,
        data: &Bytes,
        context: &Arc<Context>,
        received: SystemTime,
    ) -> Result<Decoded, DecodeError> {
        let mut objects = Vec::new();
        let mut stream =
            serde_json::Deserializer::from_slice(data).into_iter::<serde_json::Value>();
        let mut consumed = 0usize;
        loop {
            let start = stream.byte_offset();
            match stream.next() {
                Some(Ok(decoded)) => {
                    let end = stream.byte_offset();
                    let raw = data.slice(start..end);
                    let encoded = trim_ascii_whitespace(raw);
                    objects.push(MessageObject::new(
                        encoded,
                        decoded,
                        context.clone(),
                        received,
                    ));
                    consumed = end;
                }
                Some(Err(err)) if err.is_eof() => break,
                Some(Err(err)) => {
                    return Err(DecodeError::Invalid {
                        offset: start,
                        source: err,
                    });
                }
                None => {
                    consumed = data.len();
                    break;
                }
            }
        }
        Ok(Decoded { objects, consumed })
    }

    fn encode(&self, decoded: &serde_json::Value) -> Bytes {
        Bytes::from(decoded.to_string())
    }
}

fn trim_ascii_whitespace(raw: Bytes) -> Bytes {
    let start = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    raw.slice(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Arc<Context> {
        Arc::new(Context::default())
    }

    #[test]
    fn decodes_concatenated_documents_in_order() {
        let codec = JsonCodec;
        let data = Bytes::from_static(
            b"{\"id\":1,\"method\":\"login\",\"params\":[\"user1\",\"password\"]}{\"id\":2,\"method\":\"logout\"}",
        );
        let decoded = codec
            .decode_buffer(&data, &ctx(), SystemTime::now())
            .unwrap();
        assert_eq!(decoded.objects.len(), 2);
        assert_eq!(decoded.consumed, data.len());
        assert_eq!(decoded.objects[0].request_id(), Some("1".to_owned()));
        assert_eq!(decoded.objects[1].request_id(), Some("2".to_owned()));
        assert_eq!(
            decoded.objects[0].decoded()["method"],
            serde_json::json!("login")
        );
    }

    #[test]
    fn partial_trailing_document_is_left_unconsumed() {
        let codec = JsonCodec;
        let data = Bytes::from_static(b"{\"id\":1}{\"id\":2,\"meth");
        let decoded = codec
            .decode_buffer(&data, &ctx(), SystemTime::now())
            .unwrap();
        assert_eq!(decoded.objects.len(), 1);
        assert_eq!(decoded.consumed, 8);
    }

    #[test]
    fn invalid_document_is_an_error() {
        let codec = JsonCodec;
        let data = Bytes::from_static(b"{\"id\":1}not json");
        let err = codec
            .decode_buffer(&data, &ctx(), SystemTime::now())
            .unwrap_err();
        match err {
            DecodeError::Invalid { offset, .. } => assert_eq!(offset, 8),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn encode_round_trips_compact_bytes() {
        let codec = JsonCodec;
        let data = Bytes::from_static(b"{\"id\":1,\"method\":\"login\"}");
        let decoded = codec
            .decode_buffer(&data, &ctx(), SystemTime::now())
            .unwrap();
        let object = &decoded.objects[0];
        assert_eq!(object.encoded(), &data);
        assert_eq!(codec.encode(object.decoded()), data);
    }

    #[tokio::test]
    async fn from_file_reads_stored_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.JSON");
        tokio::fs::write(&path, b"{\"id\":1}\n{\"id\":2}\n")
            .await
            .unwrap();
        let codec = JsonCodec;
        let objects = codec.from_file(&path, &ctx()).await.unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].request_id(), Some("2".to_owned()));
    }
}
