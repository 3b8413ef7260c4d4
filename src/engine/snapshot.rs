//! Snapshot pinning and rollback windows.

use std::collections::BTreeMap;

use crate::engine::key::{Sequence, MAX_SEQUENCE};

/// Multiset of pinned snapshot sequences. Compaction keeps every version a
/// pinned snapshot can still see; the set minimum is the compaction's
/// `smallest_snapshot`.
#[derive(Debug, Default)]
pub struct SnapshotList {
    pinned: BTreeMap<Sequence, usize>,
}

impl SnapshotList {
    pub fn acquire(&mut self, sequence: Sequence) -> Sequence {
        *self.pinned.entry(sequence).or_insert(0) += 1;
        sequence
    }

    /// Remove one occurrence. Releasing an unpinned sequence is a no-op.
    pub fn release(&mut self, sequence: Sequence) {
        if let Some(count) = self.pinned.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                self.pinned.remove(&sequence);
            }
        }
    }

    pub fn smallest(&self) -> Sequence {
        self.pinned.keys().next().copied().unwrap_or(MAX_SEQUENCE)
    }

    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty()
    }

    pub fn sequences(&self) -> Vec<Sequence> {
        self.pinned.keys().copied().collect()
    }
}

/// Recorded rollback windows. `record(snapshot, point)` erases the writes in
/// `(snapshot, point]` from every subsequent read and from compaction
/// output.
#[derive(Debug, Default, Clone)]
pub struct RollbackMap {
    windows: BTreeMap<Sequence, Sequence>,
}

impl RollbackMap {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Sequence, Sequence)>) -> Self {
        let mut map = Self::default();
        for (snapshot, point) in pairs {
            map.record(snapshot, point);
        }
        map
    }

    pub fn record(&mut self, snapshot: Sequence, point: Sequence) {
        if point <= snapshot {
            return;
        }
        // Widen an existing window for the same snapshot.
        let entry = self.windows.entry(snapshot).or_insert(point);
        *entry = (*entry).max(point);
    }

    /// True when `sequence` falls inside any erased window.
    pub fn hides(&self, sequence: Sequence) -> bool {
        self.windows
            .range(..sequence)
            .any(|(_, point)| sequence <= *point)
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn pairs(&self) -> Vec<(Sequence, Sequence)> {
        self.windows.iter().map(|(s, p)| (*s, *p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_multiset() {
        let mut snapshots = SnapshotList::default();
        assert_eq!(snapshots.smallest(), MAX_SEQUENCE);

        snapshots.acquire(30);
        snapshots.acquire(10);
        snapshots.acquire(10);
        assert_eq!(snapshots.smallest(), 10);

        snapshots.release(10);
        assert_eq!(snapshots.smallest(), 10);
        snapshots.release(10);
        assert_eq!(snapshots.smallest(), 30);

        snapshots.release(99); // unpinned, ignored
        snapshots.release(30);
        assert_eq!(snapshots.smallest(), MAX_SEQUENCE);
    }

    #[test]
    fn test_rollback_window() {
        let mut rollbacks = RollbackMap::default();
        rollbacks.record(10, 15);

        assert!(!rollbacks.hides(10));
        assert!(rollbacks.hides(11));
        assert!(rollbacks.hides(15));
        assert!(!rollbacks.hides(16));
    }

    #[test]
    fn test_rollback_window_widens() {
        let mut rollbacks = RollbackMap::default();
        rollbacks.record(10, 12);
        rollbacks.record(10, 20);
        rollbacks.record(10, 14); // narrower, ignored
        assert!(rollbacks.hides(20));
        assert!(!rollbacks.hides(21));
    }

    #[test]
    fn test_empty_point_ignored() {
        let mut rollbacks = RollbackMap::default();
        rollbacks.record(10, 10);
        rollbacks.record(10, 5);
        assert!(rollbacks.is_empty());
    }

    #[test]
    fn test_disjoint_windows() {
        let rollbacks = RollbackMap::from_pairs([(10, 15), (30, 33)]);
        assert!(rollbacks.hides(12));
        assert!(!rollbacks.hides(20));
        assert!(rollbacks.hides(31));
        assert!(!rollbacks.hides(34));
    }
}
