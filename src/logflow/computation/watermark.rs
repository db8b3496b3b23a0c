//! Logical timestamps used for ordering and low-watermark propagation.

use std::sync::atomic::{AtomicI64, Ordering};

/// A 64-bit logical timestamp.
///
/// Layout, from high to low bits:
///
/// ```text
/// | timestamp (ms since epoch) | sequence (16 bits) | completed (1 bit) |
/// ```
///
/// The sequence disambiguates records minted within the same millisecond so
/// comparison of the raw value is a strict total order per minting process.
/// The completed bit marks a watermark whose timestamp has been fully
/// processed, which matters when testing `is_done` against an exact instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark {
    value: i64,
}

const TIMESTAMP_SHIFT: u32 = 17;
const SEQUENCE_SHIFT: u32 = 1;
const SEQUENCE_MASK: i64 = 0xFFFF;
const COMPLETED_BIT: i64 = 1;

// Last minted value, shared by all producers in the process.
static LAST_MINTED: AtomicI64 = AtomicI64::new(0);

impl Watermark {
    /// The lowest possible watermark, below any minted value.
    pub const LOWEST: Watermark = Watermark { value: 0 };

    /// Wrap a raw value (e.g. read back from a record).
    pub fn of_value(value: i64) -> Self {
        Self { value }
    }

    /// Watermark for an explicit timestamp, sequence zero, not completed.
    pub fn of_timestamp(timestamp_ms: i64) -> Self {
        Self::of(timestamp_ms, 0)
    }

    fn of(timestamp_ms: i64, sequence: i64) -> Self {
        Self {
            value: (timestamp_ms << TIMESTAMP_SHIFT)
                | ((sequence & SEQUENCE_MASK) << SEQUENCE_SHIFT),
        }
    }

    /// Mint a fresh watermark from the wall clock.
    ///
    /// Same-millisecond mints bump the sequence so consecutive calls always
    /// return strictly increasing values.
    pub fn of_now() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        loop {
            let prev = LAST_MINTED.load(Ordering::SeqCst);
            let prev_wm = Watermark::of_value(prev);
            let next = if prev_wm.timestamp() >= now {
                // clock did not advance (or went backwards): keep the old
                // timestamp and bump the sequence to preserve total order
                Watermark::of(prev_wm.timestamp(), prev_wm.sequence() + 1)
            } else {
                Watermark::of(now, 0)
            };
            if LAST_MINTED
                .compare_exchange(prev, next.value, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    /// The raw comparable value.
    pub fn value(&self) -> i64 {
        self.value
    }

    /// Wall-clock milliseconds encoded in the high bits.
    pub fn timestamp(&self) -> i64 {
        self.value >> TIMESTAMP_SHIFT
    }

    /// Per-millisecond sequence counter.
    pub fn sequence(&self) -> i64 {
        (self.value >> SEQUENCE_SHIFT) & SEQUENCE_MASK
    }

    /// Whether the completed bit is set.
    pub fn is_completed(&self) -> bool {
        self.value & COMPLETED_BIT != 0
    }

    /// A copy of this watermark with the completed bit set.
    pub fn completed(&self) -> Self {
        Self {
            value: self.value | COMPLETED_BIT,
        }
    }

    /// True once this watermark guarantees everything up to `timestamp_ms`
    /// has been processed.
    pub fn is_done(&self, timestamp_ms: i64) -> bool {
        let ts = self.timestamp();
        ts > timestamp_ms || (ts == timestamp_ms && self.is_completed())
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "wm({}:{}{})",
            self.timestamp(),
            self.sequence(),
            if self.is_completed() { ", completed" } else { "" }
        )
    }
}
