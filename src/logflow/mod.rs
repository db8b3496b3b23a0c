//! Core modules of the logflow engine.
//!
//! - `log`: partitioned append-only logs with consumer-group semantics over
//!   a pluggable backend
//! - `computation`: records, watermarks, topologies and the checkpointed
//!   computation runtime
//! - `serialization`: the codec seam between records and stored bytes
//! - `observability`: the read-only failure probe consumed by health checks
//! - `error`: top-level error type aggregating the per-layer errors

pub mod computation;
pub mod error;
pub mod log;
pub mod observability;
pub mod serialization;
