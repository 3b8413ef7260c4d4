//! In-memory ordered write buffer.
//!
//! Entries live in one or more concurrent skip lists keyed by
//! [`InternalKey`], so readers never block writers. The sharded variant
//! hashes the raw key across `N` independent lists to spread contention on
//! hot write paths; its iterator is a merge of the per-shard iterators.
//!
//! Once a memtable is marked as being flushed it refuses further inserts;
//! iterators hold an `Arc` to the shard data and stay valid after the
//! memtable has been swapped out of the engine.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_skiplist::SkipMap;

use crate::engine::key::{InternalKey, Sequence, ValueKind};
use crate::engine::snapshot::RollbackMap;
use crate::error::{Error, Result};

/// One visible cell version, newest first in collection order.
pub type VersionEntry = (Sequence, ValueKind, Vec<u8>);

type Shard = Arc<SkipMap<InternalKey, Vec<u8>>>;

pub struct MemTable {
    shards: Vec<Shard>,
    size: AtomicUsize,
    being_flushed: AtomicBool,
    /// Sequences pinned by open snapshots; flush asserts none below the
    /// smallest pinned sequence are dropped early.
    pinned: Mutex<Vec<Sequence>>,
}

impl MemTable {
    /// `shard_count` of 1 builds the plain single-list variant.
    pub fn new(shard_count: usize) -> Arc<Self> {
        let shards = (0..shard_count.max(1)).map(|_| Arc::new(SkipMap::new())).collect();
        Arc::new(Self {
            shards,
            size: AtomicUsize::new(0),
            being_flushed: AtomicBool::new(false),
            pinned: Mutex::new(Vec::new()),
        })
    }

    fn shard_for(&self, raw_key: &[u8]) -> &Shard {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        raw_key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn add(
        &self,
        sequence: Sequence,
        kind: ValueKind,
        raw_key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        if self.being_flushed.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        let key = InternalKey::new(raw_key.to_vec(), sequence, kind);
        let charge = raw_key.len() + value.len() + 24;
        self.shard_for(raw_key).insert(key, value.to_vec());
        self.size.fetch_add(charge, Ordering::SeqCst);
        Ok(())
    }

    /// Append every version of `raw_key` visible at `snapshot` (newest
    /// first), stopping after the first base entry (value or deletion).
    /// Atomic-add deltas above the base are all collected so the caller can
    /// fold them.
    pub fn collect_visible(
        &self,
        raw_key: &[u8],
        snapshot: Sequence,
        rollbacks: &RollbackMap,
        out: &mut Vec<VersionEntry>,
    ) {
        let shard = self.shard_for(raw_key);
        let lookup = InternalKey::for_lookup(raw_key, snapshot);
        for entry in shard.range((Bound::Included(lookup), Bound::Unbounded)) {
            let key = entry.key();
            if key.raw_key != raw_key {
                break;
            }
            if rollbacks.hides(key.sequence) {
                continue;
            }
            let base = key.kind != ValueKind::AtomicAdd;
            out.push((key.sequence, key.kind, entry.value().clone()));
            if base {
                break;
            }
        }
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Seal against further writes ahead of a flush.
    pub fn set_being_flushed(&self, flushed: bool) {
        self.being_flushed.store(flushed, Ordering::SeqCst);
    }

    pub fn is_being_flushed(&self) -> bool {
        self.being_flushed.load(Ordering::SeqCst)
    }

    pub fn pin_snapshot(&self, sequence: Sequence) {
        self.pinned.lock().unwrap().push(sequence);
    }

    pub fn release_snapshot(&self, sequence: Sequence) {
        let mut pinned = self.pinned.lock().unwrap();
        if let Some(pos) = pinned.iter().position(|s| *s == sequence) {
            pinned.swap_remove(pos);
        }
    }

    /// Iterators over every shard, each sorted by internal key. Single-shard
    /// memtables return one iterator; callers merge.
    pub fn iters(&self, start: Option<&InternalKey>) -> Vec<MemTableIterator> {
        self.shards
            .iter()
            .map(|shard| MemTableIterator::new(shard.clone(), start.cloned()))
            .collect()
    }
}

/// Lazily walks one shard. Holds an `Arc` to the shard so the data outlives
/// the memtable's place in the engine; each step re-enters the skip list
/// after the last returned key, which keeps the iterator valid across
/// concurrent inserts.
pub struct MemTableIterator {
    shard: Shard,
    after: Option<InternalKey>,
    start: Option<InternalKey>,
    exhausted: bool,
}

impl MemTableIterator {
    fn new(shard: Shard, start: Option<InternalKey>) -> Self {
        Self {
            shard,
            after: None,
            start,
            exhausted: false,
        }
    }
}

impl Iterator for MemTableIterator {
    type Item = Result<(InternalKey, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let lower = match (&self.after, &self.start) {
            (Some(last), _) => Bound::Excluded(last.clone()),
            (None, Some(start)) => Bound::Included(start.clone()),
            (None, None) => Bound::Unbounded,
        };
        match self.shard.range((lower, Bound::Unbounded)).next() {
            Some(entry) => {
                let key = entry.key().clone();
                self.after = Some(key.clone());
                Some(Ok((key, entry.value().clone())))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}
