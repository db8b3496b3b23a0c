//! The pluggable log backend seam.
//!
//! A backend provides named partitioned append-only logs with consumer-group
//! semantics: create-if-not-exists, durable append, timed read, offset
//! commit, seeks and lag queries. The engine never touches physical storage,
//! replication or retention; those belong to the backend behind these traits.

use crate::logflow::computation::record::Record;
use crate::logflow::log::error::LogError;
use crate::logflow::log::types::{LogLag, LogOffset, LogPartition, LogRecord};
use crate::logflow::serialization::Codec;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Entry point to a log backend: log lifecycle, appenders, tailers and lag
/// queries.
#[async_trait]
pub trait LogManager: Send + Sync {
    /// Create a log if it does not exist yet. Returns true when the log was
    /// created by this call. Fails if the log exists with a different
    /// partition count.
    async fn create_if_not_exists(&self, name: &str, partitions: u32) -> Result<bool, LogError>;

    /// Whether the log exists.
    async fn exists(&self, name: &str) -> bool;

    /// Partition count of an existing log.
    async fn size(&self, name: &str) -> Result<u32, LogError>;

    /// Names of all logs known to the backend.
    async fn list_all(&self) -> Vec<String>;

    /// Consumer groups that committed at least once on the log.
    async fn list_consumer_groups(&self, name: &str) -> Result<Vec<String>, LogError>;

    /// Open an appender on an existing log. Appends are durable before
    /// returning and safe to issue from multiple callers concurrently.
    async fn get_appender(
        &self,
        name: &str,
        codec: Arc<dyn Codec>,
    ) -> Result<Box<dyn LogAppender>, LogError>;

    /// Open a tailer with a static partition assignment. A (group,
    /// partition) pair accepts a single reader at a time.
    async fn create_tailer(
        &self,
        group: &str,
        partitions: Vec<LogPartition>,
        codec: Arc<dyn Codec>,
    ) -> Result<Box<dyn LogTailer>, LogError>;

    /// Join a consumer group on a set of logs with dynamic assignment.
    /// Members of one group receive disjoint partitions; a membership change
    /// surfaces as [`LogError::Rebalance`] on the next read.
    async fn subscribe(
        &self,
        group: &str,
        names: Vec<String>,
        codec: Arc<dyn Codec>,
    ) -> Result<Box<dyn LogTailer>, LogError>;

    /// Aggregated lag of a group over all partitions of a log.
    async fn get_lag(&self, name: &str, group: &str) -> Result<LogLag, LogError>;

    /// Per-partition lag of a group, indexed by partition.
    async fn get_lag_per_partition(
        &self,
        name: &str,
        group: &str,
    ) -> Result<Vec<LogLag>, LogError>;
}

/// Writes records to one log.
#[async_trait]
pub trait LogAppender: Send + Sync {
    /// Log name this appender writes to.
    fn name(&self) -> &str;

    /// Partition count of the log.
    fn size(&self) -> u32;

    /// Append to an explicit partition; per-partition order is the append
    /// order. Returns the offset the record landed at.
    async fn append(&self, partition: u32, record: Record) -> Result<LogOffset, LogError>;

    /// Append selecting the partition as `hash(key) % partitions`.
    async fn append_by_key(&self, record: Record) -> Result<LogOffset, LogError>;

    /// Wait until `group` has committed a position at or past `offset`.
    /// Returns false on timeout.
    async fn wait_for(
        &self,
        offset: &LogOffset,
        group: &str,
        timeout: Duration,
    ) -> Result<bool, LogError>;
}

/// Reads records from assigned partitions within a consumer group.
///
/// Reads scan assigned partitions round-robin so no partition starves.
/// Within one partition records arrive strictly in append order; there is no
/// ordering guarantee across partitions.
#[async_trait]
pub trait LogTailer: Send {
    /// Consumer group this tailer belongs to.
    fn group(&self) -> &str;

    /// Current partition assignment.
    fn assignments(&self) -> Vec<LogPartition>;

    /// Read the next record, blocking up to `timeout`. `Ok(None)` means the
    /// timeout elapsed with no data. `Err(LogError::Rebalance)` means the
    /// assignment changed; the tailer has already refreshed it and uncommitted
    /// positions were reset to the last committed ones.
    async fn read(&mut self, timeout: Duration) -> Result<Option<LogRecord>, LogError>;

    /// Durably commit the position after the last delivered record, for
    /// every assigned partition.
    async fn commit(&mut self) -> Result<(), LogError>;

    /// Commit an explicit offset on its partition.
    async fn commit_offset(&mut self, offset: &LogOffset) -> Result<(), LogError>;

    /// Position all assigned partitions at their first record.
    async fn to_start(&mut self) -> Result<(), LogError>;

    /// Position all assigned partitions after their last record.
    async fn to_end(&mut self) -> Result<(), LogError>;

    /// Position all assigned partitions at their last committed offset.
    async fn to_last_committed(&mut self) -> Result<(), LogError>;

    /// Position one assigned partition at an explicit offset.
    async fn seek(&mut self, offset: &LogOffset) -> Result<(), LogError>;

    /// Position each assigned partition at the first record whose watermark
    /// is >= `watermark`; a partition with only older records is positioned
    /// at its end.
    async fn position_by_watermark(&mut self, watermark: i64) -> Result<(), LogError>;

    /// Forget the group's committed positions on the assigned partitions and
    /// go back to the start.
    async fn reset(&mut self) -> Result<(), LogError>;

    /// Release the tailer's partitions. Reading after close fails with
    /// [`LogError::Closed`].
    async fn close(&mut self) -> Result<(), LogError>;

    /// Whether the tailer was closed.
    fn closed(&self) -> bool;
}
