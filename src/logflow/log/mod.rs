//! Partitioned append-only logs with consumer groups.

pub mod error;
pub mod memory;
pub mod traits;
pub mod types;
