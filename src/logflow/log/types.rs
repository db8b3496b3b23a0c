//! Value types shared by the log abstraction.

use crate::logflow::computation::record::Record;
use serde::{Deserialize, Serialize};

/// Identifies one ordered, append-only sequence within a named log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPartition {
    pub name: String,
    pub partition: u32,
}

impl LogPartition {
    pub fn of(name: impl Into<String>, partition: u32) -> Self {
        Self {
            name: name.into(),
            partition,
        }
    }
}

impl std::fmt::Display for LogPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:02}", self.name, self.partition)
    }
}

/// A position within one partition.
///
/// Offsets are comparable only within their partition; `position_cmp`
/// returns `None` across partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogOffset {
    pub partition: LogPartition,
    pub offset: u64,
}

impl LogOffset {
    pub fn of(partition: LogPartition, offset: u64) -> Self {
        Self { partition, offset }
    }

    /// Compare positions; `None` when the offsets belong to different
    /// partitions.
    pub fn position_cmp(&self, other: &LogOffset) -> Option<std::cmp::Ordering> {
        if self.partition == other.partition {
            Some(self.offset.cmp(&other.offset))
        } else {
            None
        }
    }

    /// The offset immediately after this one.
    pub fn next(&self) -> LogOffset {
        LogOffset {
            partition: self.partition.clone(),
            offset: self.offset + 1,
        }
    }
}

impl std::fmt::Display for LogOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:+{}", self.partition, self.offset)
    }
}

/// A record delivered by a tailer, together with the offset it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub record: Record,
    pub offset: LogOffset,
}

/// Consumer lag: committed position versus end of partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogLag {
    /// Records not yet committed by the group
    pub lag: u64,
    /// Total records appended (end offset)
    pub end: u64,
}

impl LogLag {
    pub fn of(lag: u64, end: u64) -> Self {
        Self { lag, end }
    }

    /// Lag with an unknown end position, used when only the distance matters.
    pub fn lag_of(lag: u64) -> Self {
        Self { lag, end: lag }
    }

    /// Sum per-partition lags into an aggregate.
    pub fn aggregate(lags: &[LogLag]) -> Self {
        lags.iter().fold(LogLag::default(), |acc, l| LogLag {
            lag: acc.lag + l.lag,
            end: acc.end + l.end,
        })
    }
}

impl std::fmt::Display for LogLag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lag {}/{}", self.lag, self.end)
    }
}
