//! Crate-level error type aggregating the per-layer enums.

use crate::logflow::computation::topology::TopologyError;
use crate::logflow::log::error::LogError;
use crate::logflow::serialization::SerializationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogFlowError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("computation '{computation}' failed: {message}")]
    Computation {
        computation: String,
        message: String,
    },

    #[error("processor: {message}")]
    Processor { message: String },
}

impl LogFlowError {
    pub fn computation(computation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Computation {
            computation: computation.into(),
            message: message.into(),
        }
    }

    pub fn processor(message: impl Into<String>) -> Self {
        Self::Processor {
            message: message.into(),
        }
    }
}
