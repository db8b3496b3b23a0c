//! Deploys a topology onto a log backend and supervises its runners.

use crate::logflow::computation::policy::ComputationPolicy;
use crate::logflow::computation::runner::ComputationRunner;
use crate::logflow::computation::topology::Topology;
use crate::logflow::computation::watermark::Watermark;
use crate::logflow::error::LogFlowError;
use crate::logflow::log::traits::{LogAppender, LogManager};
use crate::logflow::observability::CounterProbe;
use crate::logflow::serialization::{Codec, JsonCodec};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Idle-instance marker: a runner with no assigned partition publishes this
/// so the processor can leave it out of the global low watermark.
pub(crate) const IDLE_WATERMARK: i64 = i64::MAX;

/// Deployment settings with per-computation and per-stream overrides.
#[derive(Clone)]
pub struct Settings {
    default_concurrency: u32,
    default_partitions: u32,
    default_codec: Arc<dyn Codec>,
    default_policy: ComputationPolicy,
    concurrency: HashMap<String, u32>,
    policies: HashMap<String, ComputationPolicy>,
    partitions: HashMap<String, u32>,
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl Settings {
    pub fn new(default_concurrency: u32, default_partitions: u32) -> Self {
        Self {
            default_concurrency: default_concurrency.max(1),
            default_partitions: default_partitions.max(1),
            default_codec: Arc::new(JsonCodec),
            default_policy: ComputationPolicy::default(),
            concurrency: HashMap::new(),
            policies: HashMap::new(),
            partitions: HashMap::new(),
            codecs: HashMap::new(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.default_codec = codec;
        self
    }

    pub fn with_policy(mut self, policy: ComputationPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Runner instances for one computation.
    pub fn with_concurrency(mut self, computation: impl Into<String>, concurrency: u32) -> Self {
        self.concurrency.insert(computation.into(), concurrency.max(1));
        self
    }

    pub fn with_computation_policy(
        mut self,
        computation: impl Into<String>,
        policy: ComputationPolicy,
    ) -> Self {
        self.policies.insert(computation.into(), policy);
        self
    }

    /// Partition count for one stream.
    pub fn with_partitions(mut self, stream: impl Into<String>, partitions: u32) -> Self {
        self.partitions.insert(stream.into(), partitions.max(1));
        self
    }

    pub fn with_stream_codec(mut self, stream: impl Into<String>, codec: Arc<dyn Codec>) -> Self {
        self.codecs.insert(stream.into(), codec);
        self
    }

    pub fn concurrency_for(&self, computation: &str) -> u32 {
        self.concurrency
            .get(computation)
            .copied()
            .unwrap_or(self.default_concurrency)
    }

    pub fn policy_for(&self, computation: &str) -> ComputationPolicy {
        self.policies
            .get(computation)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    pub fn partitions_for(&self, stream: &str) -> u32 {
        self.partitions
            .get(stream)
            .copied()
            .unwrap_or(self.default_partitions)
    }

    pub fn codec_for(&self, stream: &str) -> Arc<dyn Codec> {
        self.codecs
            .get(stream)
            .cloned()
            .unwrap_or_else(|| self.default_codec.clone())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

/// Orchestrates a deployed topology: creates the streams, spawns one runner
/// task per computation instance, tracks low watermarks and drives shutdown.
pub struct StreamProcessor {
    manager: Arc<dyn LogManager>,
    topology: Arc<Topology>,
    settings: Settings,
    probe: Arc<CounterProbe>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    /// One published low watermark per runner instance.
    watermarks: Vec<(String, Arc<AtomicI64>)>,
    started: bool,
}

impl StreamProcessor {
    pub fn init(manager: Arc<dyn LogManager>, topology: Topology, settings: Settings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            manager,
            topology: Arc::new(topology),
            settings,
            probe: Arc::new(CounterProbe::new()),
            shutdown_tx,
            handles: Vec::new(),
            watermarks: Vec::new(),
            started: false,
        }
    }

    /// The shared probe, for failure counts and blocked computations.
    pub fn probe(&self) -> Arc<CounterProbe> {
        self.probe.clone()
    }

    /// Create every stream and spawn the runners. Consumer group name =
    /// computation name, so instances of one computation share the work and
    /// distinct computations each see the full stream.
    pub async fn start(&mut self) -> Result<(), LogFlowError> {
        if self.started {
            return Err(LogFlowError::processor("already started"));
        }
        self.started = true;
        for stream in self.topology.streams() {
            self.manager
                .create_if_not_exists(&stream, self.settings.partitions_for(&stream))
                .await?;
        }
        let computations: Vec<_> = self.topology.computations().to_vec();
        for metadata in computations {
            let concurrency = self.settings.concurrency_for(&metadata.name);
            info!(
                "starting computation '{}' with {} instance(s)",
                metadata.name, concurrency
            );
            for _ in 0..concurrency {
                let tailer = if metadata.input_streams.is_empty() {
                    None
                } else {
                    // one codec per subscription; inputs of one computation
                    // must agree on it
                    let codec = self.settings.codec_for(&metadata.input_streams[0]);
                    Some(
                        self.manager
                            .subscribe(&metadata.name, metadata.input_streams.clone(), codec)
                            .await?,
                    )
                };
                let mut appenders: HashMap<String, Box<dyn LogAppender>> = HashMap::new();
                for stream in &metadata.output_streams {
                    let codec = self.settings.codec_for(stream);
                    appenders.insert(
                        stream.clone(),
                        self.manager.get_appender(stream, codec).await?,
                    );
                }
                let factory = self
                    .topology
                    .factory(&metadata.name)
                    .ok_or_else(|| LogFlowError::processor("factory missing"))?;
                let low_watermark = Arc::new(AtomicI64::new(0));
                self.watermarks
                    .push((metadata.name.clone(), low_watermark.clone()));
                let runner = ComputationRunner::new(
                    metadata.clone(),
                    factory(),
                    self.settings.policy_for(&metadata.name),
                    tailer,
                    appenders,
                    self.probe.clone(),
                    self.shutdown_tx.subscribe(),
                    low_watermark,
                );
                self.handles.push(tokio::spawn(runner.run()));
            }
        }
        Ok(())
    }

    /// Wait until every runner instance holds its partition assignment and
    /// is running, so records appended afterwards are guaranteed to be seen.
    /// Returns false when `timeout` elapsed first.
    pub async fn wait_for_assignments(&self, timeout: Duration) -> bool {
        let expected = self.handles.len() as u64;
        let deadline = Instant::now() + timeout;
        while self.probe.running_count() < expected {
            if Instant::now() >= deadline {
                warn!(
                    "assignments incomplete: {}/{} runner(s) running",
                    self.probe.running_count(),
                    expected
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Cooperative stop: signal every runner and wait for its final
    /// checkpoint.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for outcome in futures::future::join_all(self.handles.drain(..)).await {
            if let Err(e) = outcome {
                warn!("runner task failed: {}", e);
            }
        }
    }

    /// Hard stop: signal, give runners a short grace period, then abort.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let abort = handle.abort_handle();
            match tokio::time::timeout(Duration::from_secs(1), handle).await {
                Ok(Err(e)) if !e.is_cancelled() => warn!("runner task failed: {}", e),
                Ok(_) => {}
                Err(_) => {
                    warn!("runner did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
    }

    /// Wait until every stream is fully consumed and low watermarks are
    /// stable, then stop. Returns false when `timeout` elapsed first (the
    /// processor is stopped either way).
    pub async fn drain_and_stop(&mut self, timeout: Duration) -> Result<bool, LogFlowError> {
        let deadline = Instant::now() + timeout;
        let mut previous = self.watermark_snapshot();
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let drained = self.total_lag().await? == 0;
            let snapshot = self.watermark_snapshot();
            let stable = snapshot == previous;
            if drained && stable {
                info!("drained, stopping");
                self.stop().await;
                return Ok(true);
            }
            previous = snapshot;
            if Instant::now() >= deadline {
                warn!("drain timed out, stopping anyway");
                self.stop().await;
                return Ok(false);
            }
        }
    }

    async fn total_lag(&self) -> Result<u64, LogFlowError> {
        let mut total = 0;
        for metadata in self.topology.computations() {
            for stream in &metadata.input_streams {
                total += self.manager.get_lag(stream, &metadata.name).await?.lag;
            }
        }
        Ok(total)
    }

    fn watermark_snapshot(&self) -> Vec<i64> {
        self.watermarks
            .iter()
            .map(|(_, wm)| wm.load(Ordering::SeqCst))
            .collect()
    }

    /// Global low watermark: the min across runner instances. `LOWEST` while
    /// any active instance has not checkpointed yet.
    pub fn low_watermark(&self) -> Watermark {
        Self::combine(self.watermarks.iter().map(|(_, wm)| wm.load(Ordering::SeqCst)))
    }

    /// Low watermark of one computation's instances.
    pub fn low_watermark_for(&self, computation: &str) -> Watermark {
        Self::combine(
            self.watermarks
                .iter()
                .filter(|(name, _)| name == computation)
                .map(|(_, wm)| wm.load(Ordering::SeqCst)),
        )
    }

    fn combine(values: impl Iterator<Item = i64>) -> Watermark {
        let mut low = i64::MAX;
        let mut seen = false;
        for value in values {
            if value == IDLE_WATERMARK {
                continue;
            }
            if value == 0 {
                return Watermark::LOWEST;
            }
            seen = true;
            low = low.min(value);
        }
        if seen {
            Watermark::of_value(low)
        } else {
            Watermark::LOWEST
        }
    }

    /// Whether everything up to `timestamp_ms` has been fully processed.
    pub fn is_done(&self, timestamp_ms: i64) -> bool {
        self.low_watermark().is_done(timestamp_ms)
    }

    /// True once every runner task has finished.
    pub fn is_terminated(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }
}
