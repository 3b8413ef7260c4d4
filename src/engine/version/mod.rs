//! Versions: immutable snapshots of an engine's file set.
//!
//! A version is the set of SSTables per level at one point in time. Edits
//! (flush outputs, compaction results) never mutate a version; they build a
//! new one while iterators pin the old one through `Arc`. Level 0 files may
//! overlap each other and are probed newest first; files at levels 1 and up
//! are disjoint and sorted, so one binary search locates the only candidate.

pub mod edit;
pub mod set;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::engine::iterator::EngineIter;
use crate::engine::key::{InternalKey, Sequence};
use crate::engine::memtable::VersionEntry;
use crate::engine::snapshot::RollbackMap;
use crate::engine::sstable::{TableCache, TableIterator};
use crate::error::Result;

pub use edit::{FileMeta, VersionEdit};
pub use set::VersionSet;

pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that starts delaying writers by ~1ms each.
pub const L0_SLOWDOWN_TRIGGER: usize = 8;
/// Level-0 file count that stops writers until compaction drains.
pub const L0_STOP_TRIGGER: usize = 12;
/// Level-0 file count that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Highest level a fresh memtable flush may be placed at when nothing
/// overlaps it.
const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// A file pinned into a version, with its read-path seek budget. When the
/// budget runs out the file becomes a seek-triggered compaction candidate.
#[derive(Debug)]
pub struct LevelFile {
    pub meta: FileMeta,
    allowed_seeks: AtomicI64,
}

impl LevelFile {
    pub fn new(meta: FileMeta) -> Arc<Self> {
        // One seek is worth ~16KiB of compaction work; never go below a
        // floor so tiny files aren't compacted after a handful of misses.
        let allowed = ((meta.size / 16384) as i64).max(100);
        Arc::new(Self {
            meta,
            allowed_seeks: AtomicI64::new(allowed),
        })
    }

    pub fn smallest_raw(&self) -> &[u8] {
        InternalKey::raw_of(&self.meta.smallest)
    }

    pub fn largest_raw(&self) -> &[u8] {
        InternalKey::raw_of(&self.meta.largest)
    }

    fn contains_raw(&self, raw_key: &[u8]) -> bool {
        raw_key >= self.smallest_raw() && raw_key <= self.largest_raw()
    }

    /// Charge one wasted seek; true when the budget just ran out.
    pub fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) == 1
    }
}

#[derive(Debug, Default)]
pub struct Version {
    pub files: Vec<Vec<Arc<LevelFile>>>,
}

impl Version {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            files: vec![Vec::new(); NUM_LEVELS],
        })
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.meta.size).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        (0..NUM_LEVELS).map(|l| self.level_bytes(l)).sum()
    }

    pub fn live_files(&self) -> Vec<Arc<LevelFile>> {
        self.files.iter().flatten().cloned().collect()
    }

    /// Probe the version for `raw_key`, appending visible versions newest
    /// first until a base entry, exactly like the memtable path. Returns
    /// the level and file to charge for a wasted multi-file seek, if any.
    pub fn collect_visible(
        &self,
        table_cache: &TableCache,
        raw_key: &[u8],
        snapshot: Sequence,
        rollbacks: &RollbackMap,
        out: &mut Vec<VersionEntry>,
    ) -> Result<Option<(usize, Arc<LevelFile>)>> {
        let mut first_probed: Option<(usize, Arc<LevelFile>)> = None;
        let mut probed = 0usize;
        let mut found_base = false;

        let mut visit = |level: usize,
                         file: &Arc<LevelFile>,
                         out: &mut Vec<VersionEntry>|
         -> Result<bool> {
            let table = table_cache.open(&file.meta.sst_path(), file.meta.number)?;
            let before = out.len();
            let touched = table.collect_visible(raw_key, snapshot, rollbacks, out)?;
            if touched {
                probed += 1;
                if first_probed.is_none() {
                    first_probed = Some((level, file.clone()));
                }
            }
            // A base entry ends the search; collect_visible stops at one.
            Ok(out[before..]
                .last()
                .map(|(_, kind, _)| *kind != crate::engine::key::ValueKind::AtomicAdd)
                .unwrap_or(false))
        };

        // Level 0: overlapping files, newest (highest number) first.
        let mut l0: Vec<&Arc<LevelFile>> = self.files[0]
            .iter()
            .filter(|f| f.contains_raw(raw_key))
            .collect();
        l0.sort_by(|a, b| b.meta.number.cmp(&a.meta.number));
        for file in l0 {
            if visit(0, file, out)? {
                found_base = true;
                break;
            }
        }

        if !found_base {
            for level in 1..NUM_LEVELS {
                let files = &self.files[level];
                let idx = files.partition_point(|f| f.largest_raw() < raw_key);
                if let Some(file) = files.get(idx) {
                    if file.contains_raw(raw_key) && visit(level, file, out)? {
                        break;
                    }
                }
            }
        }

        // Charging only applies when more than one file was consulted.
        Ok(if probed > 1 { first_probed } else { None })
    }

    /// Every file at `level` whose raw-key range intersects
    /// `[smallest, largest]`. At level 0 the range grows transitively, since
    /// overlapping level-0 files must compact together.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        smallest: &[u8],
        largest: &[u8],
    ) -> Vec<Arc<LevelFile>> {
        let mut begin = smallest.to_vec();
        let mut end = largest.to_vec();
        loop {
            let mut inputs: Vec<Arc<LevelFile>> = self.files[level]
                .iter()
                .filter(|f| f.largest_raw() >= begin.as_slice() && f.smallest_raw() <= end.as_slice())
                .cloned()
                .collect();
            if level == 0 {
                // Widen to cover transitive overlap.
                let new_begin = inputs
                    .iter()
                    .map(|f| f.smallest_raw().to_vec())
                    .min()
                    .unwrap_or_else(|| begin.clone())
                    .min(begin.clone());
                let new_end = inputs
                    .iter()
                    .map(|f| f.largest_raw().to_vec())
                    .max()
                    .unwrap_or_else(|| end.clone())
                    .max(end.clone());
                if new_begin < begin || new_end > end {
                    begin = new_begin;
                    end = new_end;
                    continue;
                }
            }
            inputs.sort_by(|a, b| a.meta.smallest.cmp(&b.meta.smallest));
            return inputs;
        }
    }

    /// Deepest level a flushed memtable may land at without overlapping
    /// existing data or dragging too much grandparent range.
    pub fn pick_level_for_output(&self, smallest_raw: &[u8], largest_raw: &[u8]) -> usize {
        let mut level = 0;
        if self
            .overlapping_inputs(0, smallest_raw, largest_raw)
            .is_empty()
        {
            while level < MAX_MEM_COMPACT_LEVEL {
                if !self
                    .overlapping_inputs(level + 1, smallest_raw, largest_raw)
                    .is_empty()
                {
                    break;
                }
                if level + 2 < NUM_LEVELS {
                    let grandparents =
                        self.overlapping_inputs(level + 2, smallest_raw, largest_raw);
                    let overlap: u64 = grandparents.iter().map(|f| f.meta.size).sum();
                    if overlap > super::compaction::MAX_GRANDPARENT_OVERLAP_BYTES {
                        break;
                    }
                }
                level += 1;
            }
        }
        level
    }

    /// Iterator sources covering the whole version, each positioned at
    /// `start` when given.
    pub fn iters(
        &self,
        table_cache: &Arc<TableCache>,
        start: Option<&[u8]>,
    ) -> Result<Vec<EngineIter>> {
        let mut sources: Vec<EngineIter> = Vec::new();
        let mut l0: Vec<Arc<LevelFile>> = self.files[0].clone();
        l0.sort_by(|a, b| b.meta.number.cmp(&a.meta.number));
        for file in l0 {
            let table = table_cache.open(&file.meta.sst_path(), file.meta.number)?;
            sources.push(Box::new(table.iter(start)?));
        }
        for level in 1..NUM_LEVELS {
            if self.files[level].is_empty() {
                continue;
            }
            sources.push(Box::new(LevelIter::new(
                self.files[level].clone(),
                table_cache.clone(),
                start.map(|s| s.to_vec()),
            )));
        }
        Ok(sources)
    }

    /// A raw key splitting the version's byte span at roughly `ratio`.
    /// Resolves to block granularity inside the file the target offset
    /// lands in, so even a single-file version splits sensibly.
    pub fn find_split_key(&self, table_cache: &TableCache, ratio: f64) -> Option<Vec<u8>> {
        let total = self.total_bytes();
        if total == 0 {
            return None;
        }
        let target = (total as f64 * ratio.clamp(0.0, 1.0)) as u64;

        let mut spans: Vec<&Arc<LevelFile>> = self.files.iter().flatten().collect();
        spans.sort_by(|a, b| a.largest_raw().cmp(b.largest_raw()));

        let mut acc = 0u64;
        for file in &spans {
            if acc + file.meta.size >= target {
                let within = (target - acc) as f64 / file.meta.size.max(1) as f64;
                if let Ok(table) = table_cache.open(&file.meta.sst_path(), file.meta.number) {
                    if let Some(hint) = table.split_key_hint(within) {
                        return Some(hint);
                    }
                }
                return Some(file.largest_raw().to_vec());
            }
            acc += file.meta.size;
        }
        spans.last().map(|f| f.largest_raw().to_vec())
    }
}

/// Concatenating iterator over the sorted, disjoint files of one level.
/// Tables open lazily as the walk reaches them.
pub struct LevelIter {
    files: Vec<Arc<LevelFile>>,
    table_cache: Arc<TableCache>,
    start: Option<Vec<u8>>,
    next_file: usize,
    current: Option<TableIterator>,
}

impl LevelIter {
    pub fn new(
        files: Vec<Arc<LevelFile>>,
        table_cache: Arc<TableCache>,
        start: Option<Vec<u8>>,
    ) -> Self {
        let next_file = match &start {
            Some(start) => files.partition_point(|f| {
                InternalKey::compare_encoded(&f.meta.largest, start) == Ordering::Less
            }),
            None => 0,
        };
        Self {
            files,
            table_cache,
            start,
            next_file,
            current: None,
        }
    }

    fn open_next(&mut self) -> Result<bool> {
        let file = match self.files.get(self.next_file) {
            Some(f) => f.clone(),
            None => return Ok(false),
        };
        let table = self
            .table_cache
            .open(&file.meta.sst_path(), file.meta.number)?;
        // Only the first opened file needs seeking; later files start at
        // their beginning.
        let start = self.start.take();
        self.current = Some(table.iter(start.as_deref())?);
        self.next_file += 1;
        Ok(true)
    }
}

impl Iterator for LevelIter {
    type Item = Result<(InternalKey, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                if let Some(entry) = iter.next() {
                    return Some(entry);
                }
                self.current = None;
            }
            match self.open_next() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.next_file = self.files.len();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Applies edits on top of a base version to produce the next one.
pub struct VersionBuilder {
    levels: Vec<Vec<Arc<LevelFile>>>,
}

impl VersionBuilder {
    pub fn from(base: &Version) -> Self {
        Self {
            levels: base.files.clone(),
        }
    }

    pub fn apply(&mut self, edit: &VersionEdit) {
        for (level, number) in &edit.deleted_files {
            self.levels[*level].retain(|f| f.meta.number != *number);
        }
        for (level, meta) in &edit.added_files {
            self.levels[*level].push(LevelFile::new(meta.clone()));
        }
    }

    pub fn finish(mut self) -> Arc<Version> {
        for (level, files) in self.levels.iter_mut().enumerate() {
            if level == 0 {
                files.sort_by(|a, b| a.meta.number.cmp(&b.meta.number));
            } else {
                files.sort_by(|a, b| a.meta.smallest.cmp(&b.meta.smallest));
            }
        }
        Arc::new(Version { files: self.levels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::key::ValueKind;
    use std::path::PathBuf;

    fn meta(number: u64, smallest: &[u8], largest: &[u8], size: u64) -> FileMeta {
        FileMeta {
            number,
            size,
            entries: 10,
            delete_tag_percent: 0,
            ttl_percentile_expiry: 0,
            smallest: InternalKey::new(smallest.to_vec(), 100, ValueKind::Value).encode(),
            largest: InternalKey::new(largest.to_vec(), 1, ValueKind::Value).encode(),
            dir: PathBuf::from("/x"),
        }
    }

    fn version(levels: Vec<Vec<FileMeta>>) -> Arc<Version> {
        let mut builder = VersionBuilder::from(&Version {
            files: vec![Vec::new(); NUM_LEVELS],
        });
        let mut edit = VersionEdit::default();
        for (level, files) in levels.into_iter().enumerate() {
            for file in files {
                edit.add_file(level, file);
            }
        }
        builder.apply(&edit);
        builder.finish()
    }

    #[test]
    fn test_builder_applies_and_sorts() {
        let v = version(vec![
            vec![meta(3, b"d", b"m", 100), meta(2, b"a", b"f", 100)],
            vec![meta(5, b"n", b"p", 100), meta(4, b"a", b"c", 100)],
        ]);
        // L0 by file number, L1 by smallest key.
        assert_eq!(v.files[0][0].meta.number, 2);
        assert_eq!(v.files[1][0].meta.number, 4);

        let mut edit = VersionEdit::default();
        edit.delete_file(0, 2);
        let mut builder = VersionBuilder::from(&v);
        builder.apply(&edit);
        let v2 = builder.finish();
        assert_eq!(v2.num_files(0), 1);
        assert_eq!(v.num_files(0), 2); // base untouched
    }

    #[test]
    fn test_overlapping_inputs_l0_widens() {
        let v = version(vec![vec![
            meta(1, b"a", b"e", 100),
            meta(2, b"d", b"j", 100),
            meta(3, b"p", b"q", 100),
        ]]);
        // Asking for [a,b] must drag file 2 in through file 1's overlap.
        let inputs = v.overlapping_inputs(0, b"a", b"b");
        assert_eq!(inputs.len(), 2);

        let inputs = v.overlapping_inputs(0, b"p", b"z");
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].meta.number, 3);
    }

    #[test]
    fn test_pick_level_for_output() {
        let v = version(vec![
            vec![],
            vec![],
            vec![meta(9, b"m", b"z", 100)],
        ]);
        // No overlap anywhere: pushed to the max memtable level.
        assert_eq!(v.pick_level_for_output(b"a", b"c"), 2);
        // Overlap at level 2 stops the descent at level 1.
        assert_eq!(v.pick_level_for_output(b"n", b"o"), 1);
    }

    #[test]
    fn test_split_key_midpoint() {
        // Files under /x don't exist, so the hint falls back to the file
        // boundary keys.
        let cache = TableCache::new(crate::dfs::LocalDfs::new(), 4, None);
        let v = version(vec![
            vec![],
            vec![
                meta(1, b"a", b"f", 100),
                meta(2, b"g", b"m", 100),
                meta(3, b"n", b"s", 100),
                meta(4, b"t", b"z", 100),
            ],
        ]);
        let split = v.find_split_key(&cache, 0.5).unwrap();
        assert_eq!(split, b"m".to_vec());
        assert!(v.find_split_key(&cache, 0.0).is_some());
        assert!(Version::empty().find_split_key(&cache, 0.5).is_none());
    }

    #[test]
    fn test_seek_charging_floor() {
        let file = LevelFile::new(meta(1, b"a", b"b", 1024));
        // Floor of 100 seeks for tiny files.
        for _ in 0..99 {
            assert!(!file.charge_seek());
        }
        assert!(file.charge_seek());
    }
}
