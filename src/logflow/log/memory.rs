//! In-process log backend.
//!
//! Reference implementation of the [`LogManager`] seam: per-partition record
//! vectors behind a mutex, committed positions per (group, partition), and a
//! `Notify`-based wakeup for blocked readers. Consumer groups joined through
//! [`LogManager::subscribe`] get round-robin partition assignment with a
//! generation counter; a membership change bumps the generation and every
//! member observes [`LogError::Rebalance`] on its next read.
//!
//! Records are stored encoded, so the codec seam is exercised exactly as it
//! would be against an external broker.

use crate::logflow::computation::record::Record;
use crate::logflow::log::error::LogError;
use crate::logflow::log::traits::{LogAppender, LogManager, LogTailer};
use crate::logflow::log::types::{LogLag, LogOffset, LogPartition, LogRecord};
use crate::logflow::serialization::Codec;
use async_trait::async_trait;
use log::debug;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

// Blocked readers poll in short slices instead of relying on a registered
// waker, which avoids missed-wakeup races around Notify registration.
const WAIT_SLICE: Duration = Duration::from_millis(10);

struct StoredRecord {
    watermark: i64,
    bytes: Arc<Vec<u8>>,
}

struct GroupState {
    /// Next uncommitted position, per partition.
    committed: Vec<u64>,
    /// Partitions with an open static reader (single-reader rule).
    readers: HashSet<u32>,
}

impl GroupState {
    fn new(partitions: u32) -> Self {
        Self {
            committed: vec![0; partitions as usize],
            readers: HashSet::new(),
        }
    }
}

struct LogState {
    partitions: Vec<Vec<StoredRecord>>,
    groups: HashMap<String, GroupState>,
    codec_name: Option<String>,
}

impl LogState {
    fn size(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn check_codec(&mut self, name: &str, codec: &dyn Codec) -> Result<(), LogError> {
        match &self.codec_name {
            Some(existing) if existing != codec.name() => Err(LogError::CodecMismatch {
                name: name.to_string(),
                existing: existing.clone(),
                requested: codec.name().to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.codec_name = Some(codec.name().to_string());
                Ok(())
            }
        }
    }
}

struct SubscriptionGroup {
    /// Log names covered by the group, sorted for deterministic assignment.
    names: BTreeSet<String>,
    /// Members in join order.
    members: Vec<u64>,
    generation: u64,
}

#[derive(Default)]
struct ManagerState {
    logs: HashMap<String, LogState>,
    subscriptions: HashMap<String, SubscriptionGroup>,
    next_member_id: u64,
}

impl ManagerState {
    fn log(&self, name: &str) -> Result<&LogState, LogError> {
        self.logs.get(name).ok_or_else(|| LogError::not_found(name))
    }

    fn log_mut(&mut self, name: &str) -> Result<&mut LogState, LogError> {
        self.logs
            .get_mut(name)
            .ok_or_else(|| LogError::not_found(name))
    }

    /// Partitions of `names` dealt round-robin to the member at `index`.
    fn assignment_for(&self, group: &SubscriptionGroup, index: usize) -> Vec<LogPartition> {
        let mut all = Vec::new();
        for name in &group.names {
            if let Some(log) = self.logs.get(name) {
                for p in 0..log.size() {
                    all.push(LogPartition::of(name.clone(), p));
                }
            }
        }
        all.into_iter()
            .enumerate()
            .filter(|(i, _)| i % group.members.len() == index)
            .map(|(_, p)| p)
            .collect()
    }
}

/// Shared handle to the backend internals, cloned into appenders and tailers.
#[derive(Clone)]
struct Shared {
    state: Arc<Mutex<ManagerState>>,
    notify: Arc<Notify>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        // the mutex is never poisoned: no panics while held
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory [`LogManager`].
pub struct MemoryLogManager {
    shared: Shared,
}

impl MemoryLogManager {
    pub fn new() -> Self {
        Self {
            shared: Shared {
                state: Arc::new(Mutex::new(ManagerState::default())),
                notify: Arc::new(Notify::new()),
            },
        }
    }
}

impl Default for MemoryLogManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogManager for MemoryLogManager {
    async fn create_if_not_exists(&self, name: &str, partitions: u32) -> Result<bool, LogError> {
        let mut state = self.shared.lock();
        match state.logs.get(name) {
            Some(log) if log.size() == partitions => Ok(false),
            Some(log) => Err(LogError::PartitionMismatch {
                name: name.to_string(),
                existing: log.size(),
                requested: partitions,
            }),
            None => {
                debug!("creating log '{}' with {} partitions", name, partitions);
                state.logs.insert(
                    name.to_string(),
                    LogState {
                        partitions: (0..partitions).map(|_| Vec::new()).collect(),
                        groups: HashMap::new(),
                        codec_name: None,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn exists(&self, name: &str) -> bool {
        self.shared.lock().logs.contains_key(name)
    }

    async fn size(&self, name: &str) -> Result<u32, LogError> {
        Ok(self.shared.lock().log(name)?.size())
    }

    async fn list_all(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().logs.keys().cloned().collect();
        names.sort();
        names
    }

    async fn list_consumer_groups(&self, name: &str) -> Result<Vec<String>, LogError> {
        let state = self.shared.lock();
        let mut groups: Vec<String> = state.log(name)?.groups.keys().cloned().collect();
        groups.sort();
        Ok(groups)
    }

    async fn get_appender(
        &self,
        name: &str,
        codec: Arc<dyn Codec>,
    ) -> Result<Box<dyn LogAppender>, LogError> {
        let size = {
            let mut state = self.shared.lock();
            let log = state.log_mut(name)?;
            log.check_codec(name, codec.as_ref())?;
            log.size()
        };
        Ok(Box::new(MemoryLogAppender {
            name: name.to_string(),
            size,
            codec,
            shared: self.shared.clone(),
        }))
    }

    async fn create_tailer(
        &self,
        group: &str,
        partitions: Vec<LogPartition>,
        codec: Arc<dyn Codec>,
    ) -> Result<Box<dyn LogTailer>, LogError> {
        let mut positions = HashMap::new();
        {
            let mut state = self.shared.lock();
            // validate everything, codecs included, before registering any
            // reader: a partial registration would leave partitions locked
            // with no tailer to release them
            for p in &partitions {
                let log = state.log_mut(&p.name)?;
                if p.partition >= log.size() {
                    return Err(LogError::InvalidPartition {
                        name: p.name.clone(),
                        partition: p.partition,
                        size: log.size(),
                    });
                }
                log.check_codec(&p.name, codec.as_ref())?;
                if let Some(g) = log.groups.get(group) {
                    if g.readers.contains(&p.partition) {
                        return Err(LogError::AlreadyOpened {
                            group: group.to_string(),
                            partition: p.clone(),
                        });
                    }
                }
            }
            for p in &partitions {
                let log = state.log_mut(&p.name)?;
                let size = log.size();
                let g = log
                    .groups
                    .entry(group.to_string())
                    .or_insert_with(|| GroupState::new(size));
                g.readers.insert(p.partition);
                // a new tailer opens on the last committed position
                positions.insert(p.clone(), g.committed[p.partition as usize]);
            }
        }
        let last_delivered = positions.clone();
        Ok(Box::new(MemoryLogTailer {
            group: group.to_string(),
            assignments: partitions,
            positions,
            last_delivered,
            next_partition: 0,
            codec,
            shared: self.shared.clone(),
            member_id: None,
            seen_generation: 0,
            is_closed: false,
        }))
    }

    async fn subscribe(
        &self,
        group: &str,
        names: Vec<String>,
        codec: Arc<dyn Codec>,
    ) -> Result<Box<dyn LogTailer>, LogError> {
        let mut tailer = {
            let mut state = self.shared.lock();
            for name in &names {
                state.log_mut(name)?.check_codec(name, codec.as_ref())?;
            }
            let member_id = state.next_member_id;
            state.next_member_id += 1;
            let sub = state
                .subscriptions
                .entry(group.to_string())
                .or_insert_with(|| SubscriptionGroup {
                    names: BTreeSet::new(),
                    members: Vec::new(),
                    generation: 0,
                });
            sub.names.extend(names.iter().cloned());
            sub.members.push(member_id);
            sub.generation += 1;
            let generation = sub.generation;
            debug!(
                "group '{}' member {} joined, generation {}",
                group, member_id, generation
            );
            MemoryLogTailer {
                group: group.to_string(),
                assignments: Vec::new(),
                positions: HashMap::new(),
                last_delivered: HashMap::new(),
                next_partition: 0,
                codec,
                shared: self.shared.clone(),
                member_id: Some(member_id),
                seen_generation: generation,
                is_closed: false,
            }
        };
        tailer.refresh_assignment()?;
        // wake members of the group so they observe the new generation
        self.shared.notify.notify_waiters();
        Ok(Box::new(tailer))
    }

    async fn get_lag(&self, name: &str, group: &str) -> Result<LogLag, LogError> {
        Ok(LogLag::aggregate(
            &self.get_lag_per_partition(name, group).await?,
        ))
    }

    async fn get_lag_per_partition(
        &self,
        name: &str,
        group: &str,
    ) -> Result<Vec<LogLag>, LogError> {
        let state = self.shared.lock();
        let log = state.log(name)?;
        let mut lags = Vec::with_capacity(log.partitions.len());
        for (i, partition) in log.partitions.iter().enumerate() {
            let end = partition.len() as u64;
            let committed = log
                .groups
                .get(group)
                .map(|g| g.committed[i])
                .unwrap_or(0);
            lags.push(LogLag::of(end.saturating_sub(committed), end));
        }
        Ok(lags)
    }
}

struct MemoryLogAppender {
    name: String,
    size: u32,
    codec: Arc<dyn Codec>,
    shared: Shared,
}

#[async_trait]
impl LogAppender for MemoryLogAppender {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u32 {
        self.size
    }

    async fn append(&self, partition: u32, record: Record) -> Result<LogOffset, LogError> {
        if partition >= self.size {
            return Err(LogError::InvalidPartition {
                name: self.name.clone(),
                partition,
                size: self.size,
            });
        }
        let watermark = record.watermark;
        let bytes = Arc::new(self.codec.encode(&record)?);
        let offset = {
            let mut state = self.shared.lock();
            let log = state.log_mut(&self.name)?;
            let records = &mut log.partitions[partition as usize];
            records.push(StoredRecord { watermark, bytes });
            records.len() as u64 - 1
        };
        self.shared.notify.notify_waiters();
        Ok(LogOffset::of(
            LogPartition::of(self.name.clone(), partition),
            offset,
        ))
    }

    async fn append_by_key(&self, record: Record) -> Result<LogOffset, LogError> {
        let mut hasher = DefaultHasher::new();
        record.key.hash(&mut hasher);
        let partition = (hasher.finish() % self.size as u64) as u32;
        self.append(partition, record).await
    }

    async fn wait_for(
        &self,
        offset: &LogOffset,
        group: &str,
        timeout: Duration,
    ) -> Result<bool, LogError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let state = self.shared.lock();
                let log = state.log(&offset.partition.name)?;
                if let Some(g) = log.groups.get(group) {
                    if g.committed[offset.partition.partition as usize] > offset.offset {
                        return Ok(true);
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let wait = WAIT_SLICE.min(deadline - now);
            let _ = tokio::time::timeout(wait, self.shared.notify.notified()).await;
        }
    }
}

struct MemoryLogTailer {
    group: String,
    assignments: Vec<LogPartition>,
    /// Next read position per assigned partition.
    positions: HashMap<LogPartition, u64>,
    /// Position after the last delivered record, the target of `commit`.
    last_delivered: HashMap<LogPartition, u64>,
    /// Round-robin cursor over `assignments`.
    next_partition: usize,
    codec: Arc<dyn Codec>,
    shared: Shared,
    /// Present for tailers created through `subscribe`.
    member_id: Option<u64>,
    seen_generation: u64,
    is_closed: bool,
}

impl MemoryLogTailer {
    /// Recompute the assignment from the subscription group and reposition
    /// everything on the last committed offsets.
    fn refresh_assignment(&mut self) -> Result<(), LogError> {
        let member_id = match self.member_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let mut state = self.shared.lock();
        let sub = match state.subscriptions.get(&self.group) {
            Some(sub) => sub,
            None => {
                self.assignments.clear();
                return Ok(());
            }
        };
        let index = match sub.members.iter().position(|m| *m == member_id) {
            Some(index) => index,
            None => {
                self.assignments.clear();
                return Ok(());
            }
        };
        self.seen_generation = sub.generation;
        self.assignments = state.assignment_for(sub, index);
        self.positions.clear();
        self.last_delivered.clear();
        self.next_partition = 0;
        for p in &self.assignments {
            let size = state.log(&p.name)?.size();
            let log = state.log_mut(&p.name)?;
            let g = log
                .groups
                .entry(self.group.clone())
                .or_insert_with(|| GroupState::new(size));
            let committed = g.committed[p.partition as usize];
            self.positions.insert(p.clone(), committed);
            self.last_delivered.insert(p.clone(), committed);
        }
        Ok(())
    }

    /// True when the subscription generation moved since the last read.
    fn rebalance_pending(&self) -> bool {
        match self.member_id {
            Some(_) => {
                let state = self.shared.lock();
                state
                    .subscriptions
                    .get(&self.group)
                    .map(|sub| sub.generation != self.seen_generation)
                    .unwrap_or(false)
            }
            None => false,
        }
    }

    /// One non-blocking scan over the assigned partitions, round-robin.
    fn poll_once(&mut self) -> Result<Option<LogRecord>, LogError> {
        if self.assignments.is_empty() {
            return Ok(None);
        }
        let found = {
            let state = self.shared.lock();
            let mut found = None;
            for i in 0..self.assignments.len() {
                let idx = (self.next_partition + i) % self.assignments.len();
                let p = &self.assignments[idx];
                let log = state.log(&p.name)?;
                let records = &log.partitions[p.partition as usize];
                let pos = self.positions.get(p).copied().unwrap_or(0);
                if (records.len() as u64) > pos {
                    let bytes = records[pos as usize].bytes.clone();
                    found = Some((idx, p.clone(), pos, bytes));
                    break;
                }
            }
            found
        };
        match found {
            Some((idx, partition, pos, bytes)) => {
                self.positions.insert(partition.clone(), pos + 1);
                self.last_delivered.insert(partition.clone(), pos + 1);
                self.next_partition = (idx + 1) % self.assignments.len();
                let record = self.codec.decode(&bytes)?;
                Ok(Some(LogRecord {
                    record,
                    offset: LogOffset::of(partition, pos),
                }))
            }
            None => Ok(None),
        }
    }

    fn reposition<F>(&mut self, mut target: F) -> Result<(), LogError>
    where
        F: FnMut(&ManagerState, &LogPartition) -> u64,
    {
        let state = self.shared.lock();
        let mut updates = Vec::with_capacity(self.assignments.len());
        for p in &self.assignments {
            // validate the log still exists
            state.log(&p.name)?;
            updates.push((p.clone(), target(&state, p)));
        }
        drop(state);
        for (p, pos) in updates {
            self.positions.insert(p.clone(), pos);
            self.last_delivered.insert(p, pos);
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;
        let mut state = self.shared.lock();
        match self.member_id {
            Some(member_id) => {
                if let Some(sub) = state.subscriptions.get_mut(&self.group) {
                    if let Some(index) = sub.members.iter().position(|m| *m == member_id) {
                        sub.members.remove(index);
                        sub.generation += 1;
                        debug!(
                            "group '{}' member {} left, generation {}",
                            self.group, member_id, sub.generation
                        );
                    }
                }
            }
            None => {
                for p in &self.assignments {
                    if let Some(log) = state.logs.get_mut(&p.name) {
                        if let Some(g) = log.groups.get_mut(&self.group) {
                            g.readers.remove(&p.partition);
                        }
                    }
                }
            }
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl LogTailer for MemoryLogTailer {
    fn group(&self) -> &str {
        &self.group
    }

    fn assignments(&self) -> Vec<LogPartition> {
        self.assignments.clone()
    }

    async fn read(&mut self, timeout: Duration) -> Result<Option<LogRecord>, LogError> {
        if self.is_closed {
            return Err(LogError::Closed);
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.rebalance_pending() {
                self.refresh_assignment()?;
                return Err(LogError::Rebalance);
            }
            if let Some(entry) = self.poll_once()? {
                return Ok(Some(entry));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = WAIT_SLICE.min(deadline - now);
            let _ = tokio::time::timeout(wait, self.shared.notify.notified()).await;
        }
    }

    async fn commit(&mut self) -> Result<(), LogError> {
        if self.is_closed {
            return Err(LogError::Closed);
        }
        {
            let mut state = self.shared.lock();
            for p in &self.assignments {
                let pos = match self.last_delivered.get(p) {
                    Some(pos) => *pos,
                    None => continue,
                };
                let size = state.log(&p.name)?.size();
                let log = state.log_mut(&p.name)?;
                let g = log
                    .groups
                    .entry(self.group.clone())
                    .or_insert_with(|| GroupState::new(size));
                g.committed[p.partition as usize] = pos;
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn commit_offset(&mut self, offset: &LogOffset) -> Result<(), LogError> {
        if self.is_closed {
            return Err(LogError::Closed);
        }
        if !self.assignments.contains(&offset.partition) {
            return Err(LogError::UnassignedPartition {
                offset: offset.clone(),
            });
        }
        {
            let mut state = self.shared.lock();
            let size = state.log(&offset.partition.name)?.size();
            let log = state.log_mut(&offset.partition.name)?;
            let g = log
                .groups
                .entry(self.group.clone())
                .or_insert_with(|| GroupState::new(size));
            g.committed[offset.partition.partition as usize] = offset.offset + 1;
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn to_start(&mut self) -> Result<(), LogError> {
        self.reposition(|_, _| 0)
    }

    async fn to_end(&mut self) -> Result<(), LogError> {
        self.reposition(|state, p| {
            state.logs[&p.name].partitions[p.partition as usize].len() as u64
        })
    }

    async fn to_last_committed(&mut self) -> Result<(), LogError> {
        let group = self.group.clone();
        self.reposition(|state, p| {
            state.logs[&p.name]
                .groups
                .get(&group)
                .map(|g| g.committed[p.partition as usize])
                .unwrap_or(0)
        })
    }

    async fn seek(&mut self, offset: &LogOffset) -> Result<(), LogError> {
        if !self.assignments.contains(&offset.partition) {
            return Err(LogError::UnassignedPartition {
                offset: offset.clone(),
            });
        }
        self.positions
            .insert(offset.partition.clone(), offset.offset);
        self.last_delivered
            .insert(offset.partition.clone(), offset.offset);
        Ok(())
    }

    async fn position_by_watermark(&mut self, watermark: i64) -> Result<(), LogError> {
        self.reposition(|state, p| {
            let records = &state.logs[&p.name].partitions[p.partition as usize];
            records
                .iter()
                .position(|r| r.watermark >= watermark)
                .map(|i| i as u64)
                .unwrap_or(records.len() as u64)
        })
    }

    async fn reset(&mut self) -> Result<(), LogError> {
        {
            let mut state = self.shared.lock();
            for p in &self.assignments {
                let size = state.log(&p.name)?.size();
                let log = state.log_mut(&p.name)?;
                let g = log
                    .groups
                    .entry(self.group.clone())
                    .or_insert_with(|| GroupState::new(size));
                g.committed[p.partition as usize] = 0;
            }
        }
        self.to_start().await
    }

    async fn close(&mut self) -> Result<(), LogError> {
        self.release();
        Ok(())
    }

    fn closed(&self) -> bool {
        self.is_closed
    }
}

impl Drop for MemoryLogTailer {
    fn drop(&mut self) {
        self.release();
    }
}
