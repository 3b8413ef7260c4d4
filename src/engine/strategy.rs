//! Pluggable compaction strategies.
//!
//! A strategy inspects cells as compaction (or a read) walks them in
//! internal-key order and decides whether a physically present cell is
//! logically dead: expired by TTL, past its family's version cap, or
//! otherwise droppable. Strategies are stateful across consecutive cells of
//! one walk, so each run builds a fresh instance from the factory; an
//! in-flight compaction keeps the instance it started with across schema
//! swaps.
//!
//! The engine is agnostic to the raw-key layout. The tablet layer, which
//! owns the cell codec and the schema, provides the real strategies; the
//! engine ships only the passthrough.

use crate::engine::key::ValueKind;

pub trait CompactionStrategy: Send {
    /// True when the cell is logically dead and may be dropped. Only
    /// consulted for entries at or below the smallest live snapshot, so
    /// dropping never changes what a pinned snapshot reads.
    fn drop_cell(&mut self, raw_key: &[u8], kind: ValueKind, value: &[u8]) -> bool;

    /// Expiry instant (microseconds) of a TTL-carrying cell, for the
    /// table's expiry percentile statistic.
    fn expiry_of(&mut self, raw_key: &[u8]) -> Option<u64>;

    /// Whether runs of atomic-add cells for one key may be coalesced into a
    /// single delta below the smallest snapshot.
    fn merge_atomics(&self) -> bool {
        false
    }
}

pub trait StrategyFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn create(&self) -> Box<dyn CompactionStrategy>;
}

/// Keeps everything. Used by engines with no schema semantics attached,
/// including the persistent cache's metadata store.
pub struct PassthroughStrategy;

impl CompactionStrategy for PassthroughStrategy {
    fn drop_cell(&mut self, _raw_key: &[u8], _kind: ValueKind, _value: &[u8]) -> bool {
        false
    }

    fn expiry_of(&mut self, _raw_key: &[u8]) -> Option<u64> {
        None
    }
}

pub struct PassthroughFactory;

impl StrategyFactory for PassthroughFactory {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn create(&self) -> Box<dyn CompactionStrategy> {
        Box::new(PassthroughStrategy)
    }
}

/// Coalesces atomic-add runs but drops nothing on its own.
pub struct CounterMergeStrategy;

impl CompactionStrategy for CounterMergeStrategy {
    fn drop_cell(&mut self, _raw_key: &[u8], _kind: ValueKind, _value: &[u8]) -> bool {
        false
    }

    fn expiry_of(&mut self, _raw_key: &[u8]) -> Option<u64> {
        None
    }

    fn merge_atomics(&self) -> bool {
        true
    }
}

pub struct CounterMergeFactory;

impl StrategyFactory for CounterMergeFactory {
    fn name(&self) -> &'static str {
        "counter-merge"
    }

    fn create(&self) -> Box<dyn CompactionStrategy> {
        Box::new(CounterMergeStrategy)
    }
}

/// Fold a run of little-endian i64 deltas into one.
pub fn sum_counter(values: impl IntoIterator<Item = i64>) -> i64 {
    values.into_iter().fold(0i64, |acc, v| acc.wrapping_add(v))
}

/// Decode a counter cell value; malformed payloads count as zero.
pub fn decode_counter(value: &[u8]) -> i64 {
    match value.try_into() {
        Ok(bytes) => i64::from_le_bytes(bytes),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_keeps_all() {
        let mut strategy = PassthroughFactory.create();
        assert!(!strategy.drop_cell(b"k", ValueKind::Value, b"v"));
        assert!(!strategy.drop_cell(b"k", ValueKind::Deletion, b""));
        assert!(!strategy.merge_atomics());
    }

    #[test]
    fn test_counter_helpers() {
        assert_eq!(sum_counter([1, 2, 3]), 6);
        assert_eq!(sum_counter([i64::MAX, 1]), i64::MIN);
        assert_eq!(decode_counter(&7i64.to_le_bytes()), 7);
        assert_eq!(decode_counter(b"bad"), 0);
        assert!(CounterMergeFactory.create().merge_atomics());
    }
}
