//! Computations and the runtime that drives them.
//!
//! A [`Computation`] is user logic with named input and output streams. It
//! never talks to the log directly: records arrive through
//! [`process_record`](Computation::process_record), output goes through the
//! [`ComputationContext`] buffers and is flushed at checkpoints by the
//! runner.

pub mod context;
pub mod policy;
pub mod processor;
pub mod record;
pub mod runner;
pub mod topology;
pub mod watermark;

use crate::logflow::computation::context::ComputationContext;
use crate::logflow::computation::record::Record;
use async_trait::async_trait;
use thiserror::Error;

/// What a computation returns when its own logic fails. The runner decides
/// whether to retry, skip or block based on the active policy.
pub type ComputationFailure = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the context on behalf of a computation.
#[derive(Debug, Error)]
pub enum ComputationError {
    #[error("stream '{stream}' is not an output of computation '{computation}'")]
    UnboundStream { computation: String, stream: String },
}

/// User-supplied stream logic.
///
/// One instance processes records from its assigned partitions strictly
/// sequentially, so implementations can keep plain mutable state. Anything
/// written through the context is buffered and only becomes visible
/// downstream at the next checkpoint.
#[async_trait]
pub trait Computation: Send {
    /// Called once before any record, after partition assignment.
    async fn init(&mut self, _ctx: &mut ComputationContext) -> Result<(), ComputationFailure> {
        Ok(())
    }

    /// Handle one record from `input_stream`.
    ///
    /// Returning an error triggers the retry policy; the same record is
    /// re-delivered on each retry.
    async fn process_record(
        &mut self,
        ctx: &mut ComputationContext,
        input_stream: &str,
        record: Record,
    ) -> Result<(), ComputationFailure>;

    /// Handle a due timer previously registered with
    /// [`ComputationContext::set_timer`].
    async fn process_timer(
        &mut self,
        _ctx: &mut ComputationContext,
        _key: &str,
        _timestamp_ms: i64,
    ) -> Result<(), ComputationFailure> {
        Ok(())
    }

    /// Called once when the runner stops, after the final checkpoint.
    async fn destroy(&mut self) {}
}
