//! # logflow
//!
//! A log-based stream-computation engine: named partitioned append-only logs
//! with consumer-group semantics over a pluggable backend, computation
//! topologies wired together by those logs, and a checkpointed runtime that
//! drives per-partition consumption with retry and failure fallback.
//!
//! ## Features
//!
//! - **Partitioned logs**: durable append, per-partition ordering, independent
//!   consumer-group positions, seek by offset or watermark
//! - **Pluggable backend**: the `LogManager`/`LogAppender`/`LogTailer` trait
//!   seam; an in-memory backend ships with the crate
//! - **Topologies**: declarative computation/stream bindings validated for
//!   acyclicity at build time
//! - **At-least-once checkpointing**: buffered output is flushed before input
//!   offsets are committed, never the reverse
//! - **Failure fallback**: exhausted retries block a single computation
//!   without taking the process down
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use logflow::{MemoryLogManager, LogManager, LogAppender, LogTailer, JsonCodec, Record};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Arc::new(MemoryLogManager::new());
//!     let codec = Arc::new(JsonCodec);
//!
//!     manager.create_if_not_exists("orders", 4).await?;
//!
//!     let appender = manager.get_appender("orders", codec.clone()).await?;
//!     appender.append_by_key(Record::of("key-1", b"payload".to_vec())).await?;
//!
//!     let mut tailer = manager
//!         .subscribe("billing", vec!["orders".to_string()], codec)
//!         .await?;
//!     if let Some(entry) = tailer.read(Duration::from_secs(1)).await? {
//!         println!("got {} at {}", entry.record.key, entry.offset);
//!         tailer.commit().await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod logflow;

pub use logflow::computation::context::ComputationContext;
pub use logflow::computation::policy::{ComputationPolicy, ComputationPolicyBuilder};
pub use logflow::computation::processor::{Settings, StreamProcessor};
pub use logflow::computation::record::Record;
pub use logflow::computation::runner::{ComputationRunner, RunnerState};
pub use logflow::computation::topology::{
    ComputationFactory, ComputationMetadata, Topology, TopologyBuilder, TopologyError,
};
pub use logflow::computation::watermark::Watermark;
pub use logflow::computation::{Computation, ComputationError, ComputationFailure};
pub use logflow::error::LogFlowError;
pub use logflow::log::error::LogError;
pub use logflow::log::memory::MemoryLogManager;
pub use logflow::log::traits::{LogAppender, LogManager, LogTailer};
pub use logflow::log::types::{LogLag, LogOffset, LogPartition, LogRecord};
pub use logflow::observability::{CounterProbe, RunnerProbe};
pub use logflow::serialization::{Codec, JsonCodec, RawCodec, SerializationError};
