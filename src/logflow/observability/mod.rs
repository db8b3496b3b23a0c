//! Runner health reporting.
//!
//! A probe is injected into each runner at construction; there is no
//! process-wide registry. The processor shares one probe across all of its
//! runners so a single blocked computation is visible at the processor level.

use crate::logflow::computation::record::Record;
use crate::logflow::computation::runner::RunnerState;
use crate::logflow::log::types::LogPartition;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Receives runner lifecycle and failure events.
pub trait RunnerProbe: Send + Sync {
    /// Retries are exhausted on `partitions`; the runner will block or skip.
    fn on_failure(&self, computation: &str, partitions: &[LogPartition], retries: u32);

    /// A poisoned record was skipped under `continue_on_failure`.
    fn on_skip(&self, computation: &str, record: &Record);

    /// The runner moved to `state`.
    fn on_state(&self, computation: &str, state: RunnerState);
}

/// Default probe: counters plus the set of blocked computations.
#[derive(Default)]
pub struct CounterProbe {
    failures: AtomicU64,
    skipped: AtomicU64,
    running: AtomicU64,
    blocked: Mutex<HashSet<String>>,
}

impl CounterProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of exhausted-retry failures across all runners.
    pub fn global_failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn skipped_count(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Number of runner instances that reached `Running`, i.e. that hold
    /// their partition assignment. Runners enter `Running` at most once.
    pub fn running_count(&self) -> u64 {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_blocked(&self, computation: &str) -> bool {
        self.lock_blocked().contains(computation)
    }

    pub fn has_blocked(&self) -> bool {
        !self.lock_blocked().is_empty()
    }

    fn lock_blocked(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // never poisoned: no panics while held
        self.blocked.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RunnerProbe for CounterProbe {
    fn on_failure(&self, computation: &str, partitions: &[LogPartition], retries: u32) {
        log::error!(
            "computation '{}' failed after {} retries on {:?}",
            computation,
            retries,
            partitions
        );
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn on_skip(&self, computation: &str, record: &Record) {
        log::warn!(
            "computation '{}' skipping record key='{}'",
            computation,
            record.key
        );
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    fn on_state(&self, computation: &str, state: RunnerState) {
        log::debug!("computation '{}' -> {:?}", computation, state);
        match state {
            RunnerState::Running => {
                self.running.fetch_add(1, Ordering::SeqCst);
            }
            RunnerState::Blocked => {
                self.lock_blocked().insert(computation.to_string());
            }
            _ => {}
        }
    }
}
