//! Drives one computation instance against its assigned partitions.
//!
//! The runner owns the read loop: tail the input streams round-robin, hand
//! each record to the computation, fire due timers between reads, and
//! checkpoint per the active policy. A checkpoint always flushes buffered
//! output before committing input offsets, so a crash in between replays
//! input (possible duplicates downstream) but never loses records.

use crate::logflow::computation::context::ComputationContext;
use crate::logflow::computation::policy::ComputationPolicy;
use crate::logflow::computation::processor::IDLE_WATERMARK;
use crate::logflow::computation::record::Record;
use crate::logflow::computation::topology::ComputationMetadata;
use crate::logflow::computation::watermark::Watermark;
use crate::logflow::computation::Computation;
use crate::logflow::log::error::LogError;
use crate::logflow::log::traits::{LogAppender, LogTailer};
use crate::logflow::log::types::LogPartition;
use crate::logflow::observability::RunnerProbe;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Lifecycle of a runner.
///
/// Normal path `Init -> Running -> Stopping -> Stopped`; on exhausted
/// retries without `continue_on_failure` the runner takes
/// `Running -> Fallback -> Blocked` and parks until shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Init,
    Running,
    Stopping,
    Stopped,
    Fallback,
    Blocked,
}

/// Loop granularity: upper bound on one blocking read, which is also how
/// often timers and the shutdown signal are checked.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

enum Step {
    Continue,
    Block,
}

pub struct ComputationRunner {
    name: String,
    computation: Box<dyn Computation>,
    context: ComputationContext,
    policy: ComputationPolicy,
    /// None for source computations, which have no input stream.
    tailer: Option<Box<dyn LogTailer>>,
    appenders: HashMap<String, Box<dyn LogAppender>>,
    probe: Arc<dyn RunnerProbe>,
    shutdown: watch::Receiver<bool>,
    /// Published at each checkpoint, read by the processor.
    low_watermark: Arc<AtomicI64>,
    state: RunnerState,
    /// Last watermark seen per assigned partition since the last rebalance.
    partition_watermarks: HashMap<LogPartition, i64>,
    batch_size: usize,
    batch_since: Instant,
}

impl ComputationRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: ComputationMetadata,
        computation: Box<dyn Computation>,
        policy: ComputationPolicy,
        tailer: Option<Box<dyn LogTailer>>,
        appenders: HashMap<String, Box<dyn LogAppender>>,
        probe: Arc<dyn RunnerProbe>,
        shutdown: watch::Receiver<bool>,
        low_watermark: Arc<AtomicI64>,
    ) -> Self {
        let assignments = tailer.as_ref().map(|t| t.assignments()).unwrap_or_default();
        let name = metadata.name.clone();
        Self {
            name,
            computation,
            context: ComputationContext::new(metadata, assignments),
            policy,
            tailer,
            appenders,
            probe,
            shutdown,
            low_watermark,
            state: RunnerState::Init,
            partition_watermarks: HashMap::new(),
            batch_size: 0,
            batch_since: Instant::now(),
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Run to completion. Returns when the runner reaches `Stopped`.
    pub async fn run(mut self) {
        self.transition(RunnerState::Init);
        if let Err(e) = self.computation.init(&mut self.context).await {
            error!("computation '{}' init failed: {}", self.name, e);
            self.probe
                .on_failure(&self.name, self.context.assignments(), 0);
            self.block_until_shutdown().await;
            self.finish(false).await;
            return;
        }
        self.transition(RunnerState::Running);
        self.publish_low_watermark();

        let mut read_failures: u32 = 0;
        loop {
            if *self.shutdown.borrow() || self.context.termination_requested() {
                break;
            }
            if let Step::Block = self.fire_due_timers().await {
                self.block_until_shutdown().await;
                self.finish(false).await;
                return;
            }
            let read_result = match &mut self.tailer {
                Some(tailer) => Some(tailer.read(READ_TIMEOUT).await),
                // a source has nothing to read; timers drive it
                None => {
                    tokio::time::sleep(READ_TIMEOUT).await;
                    None
                }
            };
            match read_result {
                Some(Ok(Some(log_record))) => {
                    read_failures = 0;
                    let partition = log_record.offset.partition;
                    if let Step::Block = self.handle_record(log_record.record, &partition).await {
                        self.block_until_shutdown().await;
                        self.finish(false).await;
                        return;
                    }
                }
                Some(Ok(None)) => {
                    read_failures = 0;
                }
                Some(Err(e)) if e.is_rebalance() => {
                    self.handle_rebalance();
                }
                Some(Err(e)) => {
                    read_failures += 1;
                    warn!(
                        "computation '{}' read failure #{}: {}",
                        self.name, read_failures, e
                    );
                    if read_failures > self.policy.max_retries {
                        self.probe.on_failure(
                            &self.name,
                            self.context.assignments(),
                            self.policy.max_retries,
                        );
                        self.block_until_shutdown().await;
                        self.finish(false).await;
                        return;
                    }
                    tokio::time::sleep(self.policy.delay_for_attempt(read_failures)).await;
                }
                None => {}
            }
            if self.checkpoint_due() {
                if let Err(e) = self.checkpoint().await {
                    if e.is_rebalance() {
                        self.handle_rebalance();
                        continue;
                    }
                    error!("computation '{}' checkpoint failed: {}", self.name, e);
                    self.probe
                        .on_failure(&self.name, self.context.assignments(), 0);
                    self.block_until_shutdown().await;
                    self.finish(false).await;
                    return;
                }
            }
        }

        self.transition(RunnerState::Stopping);
        self.finish(true).await;
    }

    /// Final checkpoint (unless blocked), destroy, close, `Stopped`.
    async fn finish(&mut self, checkpoint: bool) {
        if checkpoint {
            if let Err(e) = self.checkpoint().await {
                // at-least-once: uncommitted records replay on restart
                warn!(
                    "computation '{}' final checkpoint failed, uncommitted work will replay: {}",
                    self.name, e
                );
            }
        }
        self.computation.destroy().await;
        if let Some(tailer) = &mut self.tailer {
            if let Err(e) = tailer.close().await {
                warn!("computation '{}' tailer close failed: {}", self.name, e);
            }
        }
        self.transition(RunnerState::Stopped);
    }

    /// Deliver one record, retrying per policy. Buffered output of a failed
    /// attempt is rolled back so a retry starts clean.
    async fn handle_record(&mut self, record: Record, from: &LogPartition) -> Step {
        let stream = from.name.clone();
        let marks = self.context.buffer_marks();
        let mut attempt: u32 = 0;
        loop {
            let outcome = self
                .computation
                .process_record(&mut self.context, &stream, record.clone())
                .await;
            match outcome {
                Ok(()) => {
                    self.partition_watermarks
                        .insert(from.clone(), record.watermark);
                    self.batch_size += 1;
                    return Step::Continue;
                }
                Err(e) => {
                    self.context.truncate_buffers(&marks);
                    self.context.cancel_ask_for_checkpoint();
                    if attempt >= self.policy.max_retries {
                        return self.exhausted(&record, from, e.as_ref()).await;
                    }
                    attempt += 1;
                    warn!(
                        "computation '{}' failed on key='{}' (attempt {}/{}): {}",
                        self.name, record.key, attempt, self.policy.max_retries, e
                    );
                    tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
                }
            }
        }
    }

    /// Retries are exhausted: skip the record or fall back to `Blocked`.
    async fn exhausted(
        &mut self,
        record: &Record,
        from: &LogPartition,
        cause: &(dyn std::error::Error + Send + Sync),
    ) -> Step {
        error!(
            "computation '{}' gave up on key='{}' after {} retries: {}",
            self.name, record.key, self.policy.max_retries, cause
        );
        self.probe
            .on_failure(&self.name, self.context.assignments(), self.policy.max_retries);
        if self.policy.continue_on_failure {
            self.probe.on_skip(&self.name, record);
            // move the committed position past the poisoned record
            self.partition_watermarks
                .insert(from.clone(), record.watermark);
            self.batch_size += 1;
            self.context.ask_for_checkpoint();
            Step::Continue
        } else {
            Step::Block
        }
    }

    /// Fire timers due now, with the same retry/rollback treatment as
    /// records.
    async fn fire_due_timers(&mut self) -> Step {
        let now = chrono::Utc::now().timestamp_millis();
        for (key, timestamp) in self.context.due_timers(now) {
            let marks = self.context.buffer_marks();
            let mut attempt: u32 = 0;
            loop {
                let outcome = self
                    .computation
                    .process_timer(&mut self.context, &key, timestamp)
                    .await;
                match outcome {
                    Ok(()) => break,
                    Err(e) => {
                        self.context.truncate_buffers(&marks);
                        self.context.cancel_ask_for_checkpoint();
                        if attempt >= self.policy.max_retries {
                            error!(
                                "computation '{}' timer '{}' gave up after {} retries: {}",
                                self.name, key, self.policy.max_retries, e
                            );
                            self.probe.on_failure(
                                &self.name,
                                self.context.assignments(),
                                self.policy.max_retries,
                            );
                            if self.policy.continue_on_failure {
                                break;
                            }
                            return Step::Block;
                        }
                        attempt += 1;
                        tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }
        Step::Continue
    }

    fn checkpoint_due(&mut self) -> bool {
        if self.context.take_checkpoint_request() {
            return true;
        }
        if self.batch_size >= self.policy.batch_capacity && self.batch_size > 0 {
            return true;
        }
        let pending = self.batch_size > 0 || self.context.buffered_count() > 0;
        pending && self.batch_since.elapsed() >= self.policy.batch_threshold
    }

    /// Flush buffered output, then commit input offsets. Never the reverse.
    async fn checkpoint(&mut self) -> Result<(), LogError> {
        for (stream, records) in self.context.drain_buffers() {
            let appender = self
                .appenders
                .get(&stream)
                .ok_or_else(|| LogError::io(format!("no appender wired for stream '{stream}'")))?;
            for record in records {
                appender.append_by_key(record).await?;
            }
        }
        if let Some(tailer) = &mut self.tailer {
            tailer.commit().await?;
        }
        self.publish_low_watermark();
        self.batch_size = 0;
        self.batch_since = Instant::now();
        debug!("computation '{}' checkpoint done", self.name);
        Ok(())
    }

    /// Low watermark after a checkpoint: for a source the value it declared,
    /// otherwise the min of the last-seen watermark across assigned input
    /// partitions. Unknown (0) until every assigned partition delivered at
    /// least once.
    fn publish_low_watermark(&self) {
        let low = if self.tailer.is_none() {
            self.context.source_low_watermark()
        } else {
            let assignments = self.context.assignments();
            if assignments.is_empty() {
                // no partition to report on, keep out of the global min
                self.low_watermark.store(IDLE_WATERMARK, Ordering::SeqCst);
                return;
            }
            let mut low = i64::MAX;
            for partition in assignments {
                match self.partition_watermarks.get(partition) {
                    Some(wm) => low = low.min(*wm),
                    None => return,
                }
            }
            low
        };
        if low > 0 {
            let completed = Watermark::of_value(low).completed().value();
            self.low_watermark.store(completed, Ordering::SeqCst);
        }
    }

    /// The assignment changed under us: drop every uncommitted effect and
    /// start over from the new assignment's committed positions.
    fn handle_rebalance(&mut self) {
        let assignments = self
            .tailer
            .as_ref()
            .map(|t| t.assignments())
            .unwrap_or_default();
        warn!(
            "computation '{}' rebalanced, new assignment: {:?}",
            self.name, assignments
        );
        self.context.invalidate(assignments);
        self.partition_watermarks.clear();
        self.batch_size = 0;
        self.batch_since = Instant::now();
        self.publish_low_watermark();
    }

    /// Park in `Blocked` until shutdown; nothing gets committed from here.
    async fn block_until_shutdown(&mut self) {
        self.transition(RunnerState::Fallback);
        self.transition(RunnerState::Blocked);
        while !*self.shutdown.borrow() {
            if self.shutdown.changed().await.is_err() {
                break;
            }
        }
        self.transition(RunnerState::Stopping);
    }

    fn transition(&mut self, state: RunnerState) {
        info!("computation '{}': {:?} -> {:?}", self.name, self.state, state);
        self.state = state;
        self.probe.on_state(&self.name, state);
    }
}
