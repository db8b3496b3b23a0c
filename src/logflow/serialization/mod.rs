//! Record (de)serialization, negotiated per log.
//!
//! The engine treats records as opaque key + bytes + watermark; a [`Codec`]
//! turns a [`Record`] into stored bytes and back. A log remembers the codec
//! name of the first appender or tailer opened on it and rejects a mismatch,
//! so one log is never written with one encoding and read with another.

use crate::logflow::computation::record::Record;
use thiserror::Error;

/// Errors raised while encoding or decoding records.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// JSON encoding/decoding failed
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The byte stream does not match the codec's framing
    #[error("invalid record format: {message}")]
    InvalidFormat { message: String },
}

impl SerializationError {
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }
}

/// Converts records to bytes and back.
///
/// Codecs are pluggable per log; the `name` identifies the encoding so a
/// backend can refuse mixed encodings on the same log.
pub trait Codec: Send + Sync {
    /// Short stable identifier of the encoding ("json", "raw", ...)
    fn name(&self) -> &'static str;

    /// Serialize a record to bytes
    fn encode(&self, record: &Record) -> Result<Vec<u8>, SerializationError>;

    /// Deserialize bytes to a record
    fn decode(&self, bytes: &[u8]) -> Result<Record, SerializationError>;
}

/// JSON codec backed by serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, record: &Record) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(record)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Record, SerializationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Schema-less binary codec: watermark, key length, key bytes, data.
///
/// Cheaper than JSON for large payloads since the data bytes are copied
/// verbatim instead of being base64/array encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn encode(&self, record: &Record) -> Result<Vec<u8>, SerializationError> {
        let key = record.key.as_bytes();
        if key.len() > u32::MAX as usize {
            return Err(SerializationError::invalid_format("record key too long"));
        }
        let mut out = Vec::with_capacity(12 + key.len() + record.data.len());
        out.extend_from_slice(&record.watermark.to_be_bytes());
        out.extend_from_slice(&(key.len() as u32).to_be_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(&record.data);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Record, SerializationError> {
        if bytes.len() < 12 {
            return Err(SerializationError::invalid_format("truncated record header"));
        }
        let watermark = i64::from_be_bytes(
            bytes[0..8]
                .try_into()
                .map_err(|_| SerializationError::invalid_format("bad watermark field"))?,
        );
        let key_len = u32::from_be_bytes(
            bytes[8..12]
                .try_into()
                .map_err(|_| SerializationError::invalid_format("bad key length field"))?,
        ) as usize;
        if bytes.len() < 12 + key_len {
            return Err(SerializationError::invalid_format("truncated record key"));
        }
        let key = std::str::from_utf8(&bytes[12..12 + key_len])
            .map_err(|_| SerializationError::invalid_format("record key is not UTF-8"))?
            .to_string();
        let data = bytes[12 + key_len..].to_vec();
        Ok(Record {
            key,
            data,
            watermark,
        })
    }
}
