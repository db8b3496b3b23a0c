//! Per-instance execution context handed to computation callbacks.
//!
//! Everything a computation does to the outside world goes through here and
//! stays buffered until the runner checkpoints: produced records, the
//! checkpoint/termination requests and the source low watermark. The runner
//! can therefore roll back a failed processing attempt by truncating the
//! buffers to their pre-attempt length.

use crate::logflow::computation::record::Record;
use crate::logflow::computation::topology::ComputationMetadata;
use crate::logflow::computation::ComputationError;
use crate::logflow::log::types::LogPartition;
use std::collections::HashMap;

pub struct ComputationContext {
    metadata: ComputationMetadata,
    assignments: Vec<LogPartition>,
    state: HashMap<String, Vec<u8>>,
    timers: HashMap<String, i64>,
    /// Buffered output, one vector per output stream, aligned with
    /// `metadata.output_streams` so the flush order is deterministic.
    buffers: Vec<Vec<Record>>,
    source_low_watermark: i64,
    checkpoint_requested: bool,
    termination_requested: bool,
}

impl ComputationContext {
    pub fn new(metadata: ComputationMetadata, assignments: Vec<LogPartition>) -> Self {
        let buffers = metadata.output_streams.iter().map(|_| Vec::new()).collect();
        Self {
            metadata,
            assignments,
            state: HashMap::new(),
            timers: HashMap::new(),
            buffers,
            source_low_watermark: 0,
            checkpoint_requested: false,
            termination_requested: false,
        }
    }

    pub fn metadata(&self) -> &ComputationMetadata {
        &self.metadata
    }

    /// Partitions this instance reads from.
    pub fn assignments(&self) -> &[LogPartition] {
        &self.assignments
    }

    /// Store an opaque state value. Local to this instance; survives until
    /// the instance stops or rebalances.
    pub fn set_state(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.state.insert(key.into(), value);
    }

    pub fn get_state(&self, key: &str) -> Option<&[u8]> {
        self.state.get(key).map(|v| v.as_slice())
    }

    /// Register a timer due at `timestamp_ms`. One timer per key: a second
    /// registration overwrites the first.
    pub fn set_timer(&mut self, key: impl Into<String>, timestamp_ms: i64) {
        self.timers.insert(key.into(), timestamp_ms);
    }

    /// Buffer a record for `stream`. The record only reaches the log at the
    /// next checkpoint. Fails when the stream is not an output of this
    /// computation.
    pub fn produce_record(&mut self, stream: &str, record: Record) -> Result<(), ComputationError> {
        match self
            .metadata
            .output_streams
            .iter()
            .position(|s| s == stream)
        {
            Some(index) => {
                self.buffers[index].push(record);
                Ok(())
            }
            None => Err(ComputationError::UnboundStream {
                computation: self.metadata.name.clone(),
                stream: stream.to_string(),
            }),
        }
    }

    /// For source computations only: declare how far this source has
    /// progressed, since there is no input watermark to derive it from.
    pub fn set_source_low_watermark(&mut self, watermark: i64) {
        self.source_low_watermark = watermark;
    }

    /// Ask the runner to checkpoint after the current callback returns.
    pub fn ask_for_checkpoint(&mut self) {
        self.checkpoint_requested = true;
    }

    pub fn cancel_ask_for_checkpoint(&mut self) {
        self.checkpoint_requested = false;
    }

    /// Ask the runner to stop this instance after a final checkpoint.
    pub fn ask_for_termination(&mut self) {
        self.termination_requested = true;
    }

    // ---- runner-facing surface ----

    pub(crate) fn source_low_watermark(&self) -> i64 {
        self.source_low_watermark
    }

    pub(crate) fn buffered_count(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    /// Snapshot of buffer lengths, taken before a processing attempt.
    pub(crate) fn buffer_marks(&self) -> Vec<usize> {
        self.buffers.iter().map(|b| b.len()).collect()
    }

    /// Discard everything buffered after `marks` (failed attempt rollback).
    pub(crate) fn truncate_buffers(&mut self, marks: &[usize]) {
        for (buffer, mark) in self.buffers.iter_mut().zip(marks) {
            buffer.truncate(*mark);
        }
    }

    /// Take all buffered records, stream by stream in declaration order.
    pub(crate) fn drain_buffers(&mut self) -> Vec<(String, Vec<Record>)> {
        self.metadata
            .output_streams
            .clone()
            .into_iter()
            .zip(self.buffers.iter_mut())
            .filter(|(_, b)| !b.is_empty())
            .map(|(stream, b)| (stream, std::mem::take(b)))
            .collect()
    }

    /// Drop buffers, timers and state after a rebalance; another instance may
    /// now own these partitions.
    pub(crate) fn invalidate(&mut self, assignments: Vec<LogPartition>) {
        self.assignments = assignments;
        self.state.clear();
        self.timers.clear();
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        self.checkpoint_requested = false;
    }

    pub(crate) fn take_checkpoint_request(&mut self) -> bool {
        std::mem::take(&mut self.checkpoint_requested)
    }

    pub(crate) fn termination_requested(&self) -> bool {
        self.termination_requested
    }

    /// Remove and return timers due at `now_ms`, ordered by due time then key
    /// so firing is deterministic.
    pub(crate) fn due_timers(&mut self, now_ms: i64) -> Vec<(String, i64)> {
        let mut due: Vec<(String, i64)> = self
            .timers
            .iter()
            .filter(|(_, ts)| **ts <= now_ms)
            .map(|(k, ts)| (k.clone(), *ts))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        for (key, _) in &due {
            self.timers.remove(key);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ComputationContext {
        let metadata =
            ComputationMetadata::from_bindings("c1", &["i1:in", "o1:out1", "o2:out2"]).unwrap();
        ComputationContext::new(metadata, vec![LogPartition::of("in", 0)])
    }

    #[test]
    fn test_produce_validates_output_binding() {
        let mut ctx = ctx();
        ctx.produce_record("out1", Record::of("k", vec![1])).unwrap();
        assert!(matches!(
            ctx.produce_record("in", Record::of("k", vec![2])),
            Err(ComputationError::UnboundStream { .. })
        ));
        assert_eq!(1, ctx.buffered_count());
    }

    #[test]
    fn test_buffer_rollback() {
        let mut ctx = ctx();
        ctx.produce_record("out1", Record::of("a", vec![])).unwrap();
        let marks = ctx.buffer_marks();
        ctx.produce_record("out1", Record::of("b", vec![])).unwrap();
        ctx.produce_record("out2", Record::of("c", vec![])).unwrap();
        ctx.truncate_buffers(&marks);
        assert_eq!(1, ctx.buffered_count());
        let drained = ctx.drain_buffers();
        assert_eq!(1, drained.len());
        assert_eq!("out1", drained[0].0);
        assert_eq!("a", drained[0].1[0].key);
        assert_eq!(0, ctx.buffered_count());
    }

    #[test]
    fn test_timers_overwrite_per_key_and_fire_in_order() {
        let mut ctx = ctx();
        ctx.set_timer("b", 200);
        ctx.set_timer("a", 300);
        ctx.set_timer("a", 100);
        assert!(ctx.due_timers(50).is_empty());
        let due = ctx.due_timers(250);
        assert_eq!(vec![("a".to_string(), 100), ("b".to_string(), 200)], due);
        assert!(ctx.due_timers(250).is_empty());
    }

    #[test]
    fn test_flags() {
        let mut ctx = ctx();
        ctx.ask_for_checkpoint();
        ctx.cancel_ask_for_checkpoint();
        assert!(!ctx.take_checkpoint_request());
        ctx.ask_for_checkpoint();
        assert!(ctx.take_checkpoint_request());
        assert!(!ctx.take_checkpoint_request());
        ctx.ask_for_termination();
        assert!(ctx.termination_requested());
    }

    #[test]
    fn test_invalidate_clears_uncommitted_work() {
        let mut ctx = ctx();
        ctx.set_state("s", vec![1]);
        ctx.set_timer("t", 1);
        ctx.produce_record("out1", Record::of("k", vec![])).unwrap();
        ctx.ask_for_checkpoint();
        ctx.invalidate(vec![LogPartition::of("in", 1)]);
        assert_eq!(0, ctx.buffered_count());
        assert!(ctx.get_state("s").is_none());
        assert!(!ctx.take_checkpoint_request());
        assert_eq!(&[LogPartition::of("in", 1)], ctx.assignments());
    }
}
