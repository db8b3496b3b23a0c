//! The atomic unit of data flowing through the engine.

use crate::logflow::computation::watermark::Watermark;
use serde::{Deserialize, Serialize};

/// An immutable record: a routing key, an opaque payload and the watermark
/// stamped when the record was minted.
///
/// The key drives partition selection (`hash(key) % partitions`) so records
/// sharing a key always land on the same partition and keep their relative
/// order. The watermark is a logical timestamp; see [`Watermark`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub data: Vec<u8>,
    pub watermark: i64,
}

impl Record {
    /// Create a record stamped with a fresh watermark.
    ///
    /// Two records minted within the same millisecond get distinct,
    /// strictly increasing watermarks.
    pub fn of(key: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            data,
            watermark: Watermark::of_now().value(),
        }
    }

    /// Create a record carrying an explicit watermark.
    pub fn with_watermark(key: impl Into<String>, data: Vec<u8>, watermark: i64) -> Self {
        Self {
            key: key.into(),
            data,
            watermark,
        }
    }

    /// The watermark as a typed value.
    pub fn watermark(&self) -> Watermark {
        Watermark::of_value(self.watermark)
    }
}
