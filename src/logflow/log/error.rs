//! Errors raised by the log abstraction.

use crate::logflow::log::types::{LogOffset, LogPartition};
use crate::logflow::serialization::SerializationError;
use thiserror::Error;

/// Log backend errors.
///
/// `Rebalance` is not a failure: it is the distinguished recoverable signal
/// telling the caller its partition assignment changed and must be refreshed
/// before the next read.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log '{name}' does not exist")]
    NotFound { name: String },

    #[error("log '{name}' exists with {existing} partitions, requested {requested}")]
    PartitionMismatch {
        name: String,
        existing: u32,
        requested: u32,
    },

    #[error("invalid partition {partition} for log '{name}' of size {size}")]
    InvalidPartition {
        name: String,
        partition: u32,
        size: u32,
    },

    #[error("group '{group}' already has a reader on {partition}")]
    AlreadyOpened {
        group: String,
        partition: LogPartition,
    },

    #[error("codec mismatch on log '{name}': log uses '{existing}', requested '{requested}'")]
    CodecMismatch {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("partition assignment changed, refresh assignments before reading")]
    Rebalance,

    #[error("tailer is closed")]
    Closed,

    #[error("offset {offset} is not on an assigned partition")]
    UnassignedPartition { offset: LogOffset },

    #[error("record serialization failed")]
    Serialization(#[from] SerializationError),

    #[error("backend I/O failure: {message}")]
    Io { message: String },
}

impl LogError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Whether the error is the recoverable rebalance signal rather than a
    /// real failure.
    pub fn is_rebalance(&self) -> bool {
        matches!(self, LogError::Rebalance)
    }
}
