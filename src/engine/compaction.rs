//! Background compaction: picking inputs and merging them into the next
//! level.
//!
//! The picker prefers size-triggered work (level score above 1.0, with level
//! 0 scored by file count), falls back to seek-triggered work (a file whose
//! read-path seek budget ran out), and serves manual range requests. The
//! merge walk keeps every version newer than the smallest pinned snapshot
//! and at most the first older one per key; tombstones die at the base
//! level, rollback windows are erased, and the pluggable strategy drops
//! logically dead cells and coalesces counter deltas.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dfs::Dfs;
use crate::engine::iterator::{EngineIter, MergeIter};
use crate::engine::key::{InternalKey, Sequence, ValueKind};
use crate::engine::snapshot::RollbackMap;
use crate::engine::sstable::{TableBuilder, TableCache};
use crate::engine::strategy::{decode_counter, StrategyFactory};
use crate::engine::version::set::sst_name;
use crate::engine::version::{FileMeta, LevelFile, Version, L0_COMPACTION_TRIGGER, NUM_LEVELS};
use crate::error::{Error, Result};

pub const MAX_OUTPUT_FILE_SIZE: u64 = 2 << 20;
pub const MAX_GRANDPARENT_OVERLAP_BYTES: u64 = 10 * MAX_OUTPUT_FILE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    Size,
    Seek,
    Manual,
}

pub struct CompactionJob {
    pub level: usize,
    pub inputs0: Vec<Arc<LevelFile>>,
    pub inputs1: Vec<Arc<LevelFile>>,
    pub grandparents: Vec<Arc<LevelFile>>,
    pub reason: CompactionReason,
}

impl CompactionJob {
    pub fn output_level(&self) -> usize {
        self.level + 1
    }

    pub fn input_files(&self) -> impl Iterator<Item = &Arc<LevelFile>> {
        self.inputs0.iter().chain(self.inputs1.iter())
    }

    pub fn total_input_bytes(&self) -> u64 {
        self.input_files().map(|f| f.meta.size).sum()
    }

    /// A single input with nothing to merge against can be moved to the
    /// next level by edit alone, unless it would drag too much grandparent
    /// range into future compactions.
    pub fn is_trivial_move(&self) -> bool {
        self.inputs0.len() == 1
            && self.inputs1.is_empty()
            && self.grandparents.iter().map(|f| f.meta.size).sum::<u64>()
                <= MAX_GRANDPARENT_OVERLAP_BYTES
    }

    fn key_range(&self) -> (Vec<u8>, Vec<u8>) {
        let smallest = self
            .input_files()
            .map(|f| f.smallest_raw().to_vec())
            .min()
            .unwrap_or_default();
        let largest = self
            .input_files()
            .map(|f| f.largest_raw().to_vec())
            .max()
            .unwrap_or_default();
        (smallest, largest)
    }
}

/// Byte budget for a level; level 0 is scored by file count instead.
fn target_bytes(level: usize) -> u64 {
    let mut budget = 10 << 20;
    for _ in 1..level {
        budget *= 10;
    }
    budget
}

/// Size-triggered score of each level; the best level above 1.0 wins.
pub fn pick_size_compaction(
    version: &Version,
    compact_pointers: &[Vec<u8>],
) -> Option<CompactionJob> {
    let mut best: Option<(f64, usize)> = None;
    for level in 0..NUM_LEVELS - 1 {
        let score = if level == 0 {
            version.num_files(0) as f64 / L0_COMPACTION_TRIGGER as f64
        } else {
            version.level_bytes(level) as f64 / target_bytes(level) as f64
        };
        if score >= 1.0 && best.map(|(s, _)| score > s).unwrap_or(true) {
            best = Some((score, level));
        }
    }
    let (_, level) = best?;

    // Resume after the last compacted key at this level, wrapping around.
    let pointer = compact_pointers.get(level).filter(|p| !p.is_empty());
    let mut seed = version.files[level]
        .iter()
        .find(|f| match pointer {
            Some(pointer) => {
                InternalKey::compare_encoded(&f.meta.largest, pointer)
                    == std::cmp::Ordering::Greater
            }
            None => true,
        })
        .cloned();
    if seed.is_none() {
        seed = version.files[level].first().cloned();
    }
    let seed = seed?;

    Some(build_job(
        version,
        level,
        vec![seed],
        CompactionReason::Size,
    ))
}

/// Compaction for a file whose seek budget ran out.
pub fn pick_seek_compaction(
    version: &Version,
    level: usize,
    file: Arc<LevelFile>,
) -> Option<CompactionJob> {
    if level >= NUM_LEVELS - 1 {
        return None;
    }
    version.files[level]
        .iter()
        .any(|f| f.meta.number == file.meta.number)
        .then(|| build_job(version, level, vec![file], CompactionReason::Seek))
}

/// Manual compaction of `[begin, end]` at `level`, if anything overlaps.
pub fn pick_manual_compaction(
    version: &Version,
    level: usize,
    begin: &[u8],
    end: &[u8],
) -> Option<CompactionJob> {
    if level >= NUM_LEVELS - 1 {
        return None;
    }
    let inputs0 = version.overlapping_inputs(level, begin, end);
    if inputs0.is_empty() {
        return None;
    }
    Some(build_job(version, level, inputs0, CompactionReason::Manual))
}

fn build_job(
    version: &Version,
    level: usize,
    mut inputs0: Vec<Arc<LevelFile>>,
    reason: CompactionReason,
) -> CompactionJob {
    // Level 0 inputs must absorb every transitively overlapping file.
    if level == 0 {
        let smallest = inputs0.iter().map(|f| f.smallest_raw().to_vec()).min().unwrap();
        let largest = inputs0.iter().map(|f| f.largest_raw().to_vec()).max().unwrap();
        inputs0 = version.overlapping_inputs(0, &smallest, &largest);
    }

    let mut job = CompactionJob {
        level,
        inputs0,
        inputs1: Vec::new(),
        grandparents: Vec::new(),
        reason,
    };
    let (smallest, largest) = job.key_range();
    job.inputs1 = version.overlapping_inputs(level + 1, &smallest, &largest);

    let (smallest, largest) = job.key_range();
    if level + 2 < NUM_LEVELS {
        job.grandparents = version.overlapping_inputs(level + 2, &smallest, &largest);
    }
    job
}

pub struct CompactionContext {
    pub dir: PathBuf,
    pub dfs: Arc<dyn Dfs>,
    pub table_cache: Arc<TableCache>,
    pub strategy_factory: Arc<dyn StrategyFactory>,
    pub block_size: usize,
    pub bloom: bool,
    pub smallest_snapshot: Sequence,
    pub rollbacks: RollbackMap,
    /// Drop tombstones once they reach the deepest populated level.
    pub drop_base_level_del: bool,
    pub ignore_corruption: bool,
    pub shutdown: Arc<AtomicBool>,
    /// Maximum parallel sub-compaction shards for one job.
    pub max_subcompactions: usize,
}

/// Execute a non-trivial compaction and return the output file metadata in
/// key order. The caller applies the edit (delete inputs, add outputs)
/// under its own lock.
pub fn run(
    job: &CompactionJob,
    version: &Version,
    ctx: &CompactionContext,
    alloc_file_number: &(dyn Fn() -> u64 + Sync),
) -> Result<Vec<FileMeta>> {
    let boundaries = shard_boundaries(job, ctx.max_subcompactions);

    if boundaries.is_empty() {
        return run_shard(job, version, ctx, alloc_file_number, None, None);
    }

    // Shard ranges: (..b0), [b0..b1), ..., [bn..). Each shard owns whole
    // raw keys, so the per-key drop rules never straddle shards.
    let mut ranges: Vec<(Option<Vec<u8>>, Option<Vec<u8>>)> = Vec::new();
    let mut prev: Option<Vec<u8>> = None;
    for boundary in boundaries {
        ranges.push((prev.clone(), Some(boundary.clone())));
        prev = Some(boundary);
    }
    ranges.push((prev, None));

    let results: Vec<Result<Vec<FileMeta>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = ranges
            .into_iter()
            .map(|(start, end)| {
                scope.spawn(move || {
                    run_shard(job, version, ctx, alloc_file_number, start, end)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut outputs = Vec::new();
    for result in results {
        outputs.extend(result?);
    }
    Ok(outputs)
}

/// Boundary raw keys partitioning a large job, taken from the next-level
/// input file edges.
fn shard_boundaries(job: &CompactionJob, max_subcompactions: usize) -> Vec<Vec<u8>> {
    if max_subcompactions <= 1 || job.inputs1.len() < 2 {
        return Vec::new();
    }
    let shards = job.inputs1.len().min(max_subcompactions);
    let step = job.inputs1.len() / shards;
    job.inputs1
        .iter()
        .skip(step)
        .step_by(step.max(1))
        .take(shards - 1)
        .map(|f| f.smallest_raw().to_vec())
        .collect()
}

fn run_shard(
    job: &CompactionJob,
    version: &Version,
    ctx: &CompactionContext,
    alloc_file_number: &(dyn Fn() -> u64 + Sync),
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
) -> Result<Vec<FileMeta>> {
    let seek = start
        .as_ref()
        .map(|raw| InternalKey::for_lookup(raw, crate::engine::key::MAX_SEQUENCE).encode());
    let mut sources: Vec<EngineIter> = Vec::new();
    for file in job.input_files() {
        let table = ctx
            .table_cache
            .open(&file.meta.sst_path(), file.meta.number)?;
        sources.push(Box::new(table.iter(seek.as_deref())?));
    }
    let mut merged = MergeIter::new(sources);
    let mut strategy = ctx.strategy_factory.create();

    let mut writer = OutputWriter::new(job, ctx, alloc_file_number);
    let mut current_raw: Option<Vec<u8>> = None;
    let mut last_seq_for_key: Sequence = crate::engine::key::MAX_SEQUENCE;
    let mut dropped = 0u64;

    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Aborted);
        }
        let (key, value) = match merged.next() {
            Some(Ok(entry)) => entry,
            Some(Err(e)) if ctx.ignore_corruption => {
                tracing::warn!(error = %e, "corruption during compaction, tail skipped");
                break;
            }
            Some(Err(e)) => return Err(e),
            None => break,
        };
        if let Some(end) = &end {
            if key.raw_key.as_slice() >= end.as_slice() {
                break;
            }
        }

        if current_raw.as_deref() != Some(key.raw_key.as_slice()) {
            current_raw = Some(key.raw_key.clone());
            last_seq_for_key = crate::engine::key::MAX_SEQUENCE;
        }

        if ctx.rollbacks.hides(key.sequence) {
            last_seq_for_key = key.sequence;
            dropped += 1;
            continue;
        }

        // A counter delta folding into the pending run is consumed by the
        // merge and never reaches the shadowing rule, and the run's base
        // entry is what the folded deltas apply to, so it is not shadowed
        // by them either.
        let in_merge_run = strategy.merge_atomics()
            && key.sequence <= ctx.smallest_snapshot
            && writer.pending_is_add_run(&key.raw_key, ctx.smallest_snapshot);
        if in_merge_run && key.kind == ValueKind::AtomicAdd {
            writer.fold_delta(&value);
            continue;
        }

        let mut drop = false;
        if !in_merge_run
            && last_seq_for_key <= ctx.smallest_snapshot
            && last_seq_for_key != crate::engine::key::MAX_SEQUENCE
        {
            // A newer entry for this key is already visible below every
            // snapshot; this one can never be read again.
            drop = true;
        } else if key.sequence <= ctx.smallest_snapshot {
            if key.kind == ValueKind::Deletion
                && ctx.drop_base_level_del
                && is_base_level_for_key(version, job.output_level(), &key.raw_key)
            {
                drop = true;
            } else if strategy.drop_cell(&key.raw_key, key.kind, &value) {
                drop = true;
            }
        }
        last_seq_for_key = key.sequence;

        if drop {
            dropped += 1;
            continue;
        }

        let expiry = strategy.expiry_of(&key.raw_key);
        writer.push(key, value, expiry)?;
    }

    let outputs = writer.finish()?;
    tracing::info!(
        level = job.level,
        reason = ?job.reason,
        outputs = outputs.len(),
        dropped = dropped,
        "compaction shard done"
    );
    Ok(outputs)
}

/// True when no level at or below `output_level` can still hold the key, so
/// a tombstone has nothing left to shadow.
fn is_base_level_for_key(version: &Version, output_level: usize, raw_key: &[u8]) -> bool {
    for level in output_level + 1..NUM_LEVELS {
        let files = &version.files[level];
        let idx = files.partition_point(|f| f.largest_raw() < raw_key);
        if let Some(file) = files.get(idx) {
            if file.smallest_raw() <= raw_key {
                return false;
            }
        }
    }
    true
}

/// Streams kept entries into output tables, splitting on size and on
/// grandparent overlap, and coalescing adjacent counter deltas.
struct OutputWriter<'a> {
    job: &'a CompactionJob,
    ctx: &'a CompactionContext,
    alloc_file_number: &'a (dyn Fn() -> u64 + Sync),
    builder: Option<(u64, TableBuilder)>,
    pending: Option<(InternalKey, Vec<u8>)>,
    outputs: Vec<FileMeta>,
    grandparent_index: usize,
    overlapped_bytes: u64,
}

impl<'a> OutputWriter<'a> {
    fn new(
        job: &'a CompactionJob,
        ctx: &'a CompactionContext,
        alloc_file_number: &'a (dyn Fn() -> u64 + Sync),
    ) -> Self {
        Self {
            job,
            ctx,
            alloc_file_number,
            builder: None,
            pending: None,
            outputs: Vec::new(),
            grandparent_index: 0,
            overlapped_bytes: 0,
        }
    }

    /// Whether the pending entry is a counter-delta run for `raw_key` that
    /// sits at or below the smallest snapshot, i.e. older same-key deltas
    /// may fold into it.
    fn pending_is_add_run(&self, raw_key: &[u8], smallest_snapshot: Sequence) -> bool {
        match &self.pending {
            Some((key, _)) => {
                key.kind == ValueKind::AtomicAdd
                    && key.sequence <= smallest_snapshot
                    && key.raw_key == raw_key
            }
            None => false,
        }
    }

    /// Fold an older delta into the newer pending one.
    fn fold_delta(&mut self, value: &[u8]) {
        if let Some((_, pending_value)) = &mut self.pending {
            let sum = decode_counter(pending_value).wrapping_add(decode_counter(value));
            *pending_value = sum.to_le_bytes().to_vec();
        }
    }

    fn push(&mut self, key: InternalKey, value: Vec<u8>, expiry: Option<u64>) -> Result<()> {
        let previous = self.pending.replace((key, value));
        if let Some((key, value)) = previous {
            self.emit(&key, &value)?;
        }
        if let Some(expiry) = expiry {
            if let Some((_, builder)) = &mut self.builder {
                builder.observe_expiry(expiry);
            }
        }
        Ok(())
    }

    fn emit(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        if self.should_stop_before(&key.raw_key) {
            self.close_output()?;
        }
        if self.builder.is_none() {
            let number = (self.alloc_file_number)();
            let path = self.ctx.dir.join(sst_name(number));
            let file = self.ctx.dfs.create(&path)?;
            self.builder = Some((
                number,
                TableBuilder::new(file, self.ctx.block_size, self.ctx.bloom),
            ));
        }
        let (_, builder) = self.builder.as_mut().unwrap();
        builder.add(key, value)?;
        if builder.estimated_size() >= MAX_OUTPUT_FILE_SIZE {
            self.close_output()?;
        }
        Ok(())
    }

    /// Grandparent-overlap guard: close the output before a key that would
    /// make this file overlap too much of level+2, bounding the cost of
    /// compacting it later.
    fn should_stop_before(&mut self, raw_key: &[u8]) -> bool {
        let grandparents = &self.job.grandparents;
        while self.grandparent_index < grandparents.len()
            && raw_key > grandparents[self.grandparent_index].largest_raw()
        {
            if self.builder.is_some() {
                self.overlapped_bytes += grandparents[self.grandparent_index].meta.size;
            }
            self.grandparent_index += 1;
        }
        if self.overlapped_bytes > MAX_GRANDPARENT_OVERLAP_BYTES {
            self.overlapped_bytes = 0;
            return true;
        }
        false
    }

    fn close_output(&mut self) -> Result<()> {
        if let Some((number, builder)) = self.builder.take() {
            let stats = builder.finish()?;
            self.outputs.push(FileMeta {
                number,
                size: stats.file_size,
                entries: stats.entries,
                delete_tag_percent: stats.delete_tag_percent,
                ttl_percentile_expiry: stats.ttl_percentile_expiry,
                smallest: stats.smallest,
                largest: stats.largest,
                dir: self.ctx.dir.clone(),
            });
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<FileMeta>> {
        if let Some((key, value)) = self.pending.take() {
            self.emit(&key, &value)?;
        }
        self.close_output()?;
        Ok(self.outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfs::LocalDfs;
    use crate::engine::strategy::{CounterMergeFactory, PassthroughFactory};
    use crate::engine::version::{VersionBuilder, VersionEdit};
    use std::path::Path;
    use std::sync::atomic::AtomicU64;

    fn write_sst(
        dfs: &dyn Dfs,
        dir: &Path,
        number: u64,
        entries: &[(&[u8], Sequence, ValueKind, &[u8])],
    ) -> FileMeta {
        let path = dir.join(sst_name(number));
        let mut builder = TableBuilder::new(dfs.create(&path).unwrap(), 4096, false);
        for (raw, seq, kind, value) in entries {
            builder
                .add(&InternalKey::new(raw.to_vec(), *seq, *kind), value)
                .unwrap();
        }
        let stats = builder.finish().unwrap();
        FileMeta {
            number,
            size: stats.file_size,
            entries: stats.entries,
            delete_tag_percent: stats.delete_tag_percent,
            ttl_percentile_expiry: stats.ttl_percentile_expiry,
            smallest: stats.smallest,
            largest: stats.largest,
            dir: dir.to_path_buf(),
        }
    }

    fn version_with(files: Vec<(usize, FileMeta)>) -> Arc<Version> {
        let mut edit = VersionEdit::default();
        for (level, meta) in files {
            edit.add_file(level, meta);
        }
        let mut builder = VersionBuilder::from(&Version {
            files: vec![Vec::new(); NUM_LEVELS],
        });
        builder.apply(&edit);
        builder.finish()
    }

    fn test_ctx(dir: &Path, smallest_snapshot: Sequence) -> CompactionContext {
        CompactionContext {
            dir: dir.to_path_buf(),
            dfs: LocalDfs::new(),
            table_cache: Arc::new(TableCache::new(LocalDfs::new(), 100, None)),
            strategy_factory: Arc::new(PassthroughFactory),
            block_size: 4096,
            bloom: false,
            smallest_snapshot,
            rollbacks: RollbackMap::default(),
            drop_base_level_del: true,
            ignore_corruption: false,
            shutdown: Arc::new(AtomicBool::new(false)),
            max_subcompactions: 1,
        }
    }

    fn run_job(
        job: &CompactionJob,
        version: &Version,
        ctx: &CompactionContext,
        first_output: u64,
    ) -> Vec<FileMeta> {
        let counter = AtomicU64::new(first_output);
        run(job, version, ctx, &move || {
            counter.fetch_add(1, Ordering::SeqCst)
        })
        .unwrap()
    }

    fn read_all(ctx: &CompactionContext, meta: &FileMeta) -> Vec<(InternalKey, Vec<u8>)> {
        let table = ctx.table_cache.open(&meta.sst_path(), meta.number).unwrap();
        table.iter(None).unwrap().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_pick_size_prefers_overfull_l0() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = LocalDfs::new();
        let mut files = Vec::new();
        for number in 1..=5 {
            files.push((
                0,
                write_sst(
                    dfs.as_ref(),
                    dir.path(),
                    number,
                    &[(b"a", number, ValueKind::Value, b"v")],
                ),
            ));
        }
        let version = version_with(files);
        let job = pick_size_compaction(&version, &vec![Vec::new(); NUM_LEVELS]).unwrap();
        assert_eq!(job.level, 0);
        assert_eq!(job.inputs0.len(), 5);
        assert_eq!(job.reason, CompactionReason::Size);
    }

    #[test]
    fn test_pick_nothing_when_balanced() {
        let version = Version::empty();
        assert!(pick_size_compaction(&version, &vec![Vec::new(); NUM_LEVELS]).is_none());
    }

    #[test]
    fn test_shadowed_versions_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = LocalDfs::new();
        let newer = write_sst(
            dfs.as_ref(),
            dir.path(),
            1,
            &[(b"k", 20, ValueKind::Value, b"v2")],
        );
        let older = write_sst(
            dfs.as_ref(),
            dir.path(),
            2,
            &[(b"k", 10, ValueKind::Value, b"v1")],
        );
        let version = version_with(vec![(0, newer.clone()), (0, older.clone())]);
        let ctx = test_ctx(dir.path(), crate::engine::key::MAX_SEQUENCE);

        let job = CompactionJob {
            level: 0,
            inputs0: version.files[0].clone(),
            inputs1: vec![],
            grandparents: vec![],
            reason: CompactionReason::Manual,
        };
        let outputs = run_job(&job, &version, &ctx, 10);
        assert_eq!(outputs.len(), 1);
        let entries = read_all(&ctx, &outputs[0]);
        // Only the newest survives: the older version is below every
        // snapshot and shadowed.
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.sequence, 20);
        assert_eq!(entries[0].1, b"v2");
    }

    #[test]
    fn test_snapshot_preserves_older_version() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = LocalDfs::new();
        let file = write_sst(
            dfs.as_ref(),
            dir.path(),
            1,
            &[
                (b"k", 20, ValueKind::Value, b"v2"),
                (b"k", 10, ValueKind::Value, b"v1"),
            ],
        );
        let version = version_with(vec![(0, file)]);
        // A snapshot at 15 still needs the seq-10 version.
        let ctx = test_ctx(dir.path(), 15);
        let job = CompactionJob {
            level: 0,
            inputs0: version.files[0].clone(),
            inputs1: vec![],
            grandparents: vec![],
            reason: CompactionReason::Manual,
        };
        let outputs = run_job(&job, &version, &ctx, 10);
        let entries = read_all(&ctx, &outputs[0]);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_tombstone_dies_at_base_level() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = LocalDfs::new();
        let file = write_sst(
            dfs.as_ref(),
            dir.path(),
            1,
            &[
                (b"gone", 7, ValueKind::Deletion, b""),
                (b"gone", 5, ValueKind::Value, b"v"),
                (b"kept", 3, ValueKind::Value, b"v"),
            ],
        );
        let version = version_with(vec![(0, file)]);
        let ctx = test_ctx(dir.path(), crate::engine::key::MAX_SEQUENCE);
        let job = CompactionJob {
            level: 0,
            inputs0: version.files[0].clone(),
            inputs1: vec![],
            grandparents: vec![],
            reason: CompactionReason::Manual,
        };
        let outputs = run_job(&job, &version, &ctx, 10);
        assert_eq!(outputs.len(), 1);
        let entries = read_all(&ctx, &outputs[0]);
        // Neither the tombstone nor the shadowed value survive.
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.raw_key, b"kept");
    }

    #[test]
    fn test_rollback_window_erased() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = LocalDfs::new();
        let file = write_sst(
            dfs.as_ref(),
            dir.path(),
            1,
            &[
                (b"k", 14, ValueKind::Value, b"rolled"),
                (b"k", 10, ValueKind::Value, b"keep"),
            ],
        );
        let version = version_with(vec![(0, file)]);
        // The rollback's snapshot stays pinned while the window is live, so
        // the pre-rollback value is not shadowed by the erased entry.
        let mut ctx = test_ctx(dir.path(), 10);
        ctx.rollbacks.record(10, 15);

        let job = CompactionJob {
            level: 0,
            inputs0: version.files[0].clone(),
            inputs1: vec![],
            grandparents: vec![],
            reason: CompactionReason::Manual,
        };
        let outputs = run_job(&job, &version, &ctx, 10);
        let entries = read_all(&ctx, &outputs[0]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, b"keep");
    }

    #[test]
    fn test_counter_runs_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = LocalDfs::new();
        let file = write_sst(
            dfs.as_ref(),
            dir.path(),
            1,
            &[
                (b"cnt", 30, ValueKind::AtomicAdd, &5i64.to_le_bytes()),
                (b"cnt", 20, ValueKind::AtomicAdd, &2i64.to_le_bytes()),
                (b"cnt", 10, ValueKind::Value, &1i64.to_le_bytes()),
            ],
        );
        let version = version_with(vec![(0, file)]);
        let mut ctx = test_ctx(dir.path(), crate::engine::key::MAX_SEQUENCE);
        ctx.strategy_factory = Arc::new(CounterMergeFactory);

        let job = CompactionJob {
            level: 0,
            inputs0: version.files[0].clone(),
            inputs1: vec![],
            grandparents: vec![],
            reason: CompactionReason::Manual,
        };
        let outputs = run_job(&job, &version, &ctx, 10);
        let entries = read_all(&ctx, &outputs[0]);
        // The two deltas fold into one; the base value stays separate.
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.kind, ValueKind::AtomicAdd);
        assert_eq!(decode_counter(&entries[0].1), 7);
        assert_eq!(entries[1].0.kind, ValueKind::Value);
    }

    #[test]
    fn test_subcompaction_shards_union_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = LocalDfs::new();
        let l0 = write_sst(
            dfs.as_ref(),
            dir.path(),
            1,
            &[
                (b"b", 40, ValueKind::Value, b"new-b"),
                (b"m", 41, ValueKind::Value, b"new-m"),
            ],
        );
        let l1a = write_sst(
            dfs.as_ref(),
            dir.path(),
            2,
            &[
                (b"a", 1, ValueKind::Value, b"a"),
                (b"c", 2, ValueKind::Value, b"c"),
            ],
        );
        let l1b = write_sst(
            dfs.as_ref(),
            dir.path(),
            3,
            &[
                (b"l", 3, ValueKind::Value, b"l"),
                (b"n", 4, ValueKind::Value, b"n"),
            ],
        );
        let version = version_with(vec![(0, l0), (1, l1a), (1, l1b)]);
        let mut ctx = test_ctx(dir.path(), crate::engine::key::MAX_SEQUENCE);
        ctx.max_subcompactions = 2;

        let job = CompactionJob {
            level: 0,
            inputs0: version.files[0].clone(),
            inputs1: version.files[1].clone(),
            grandparents: vec![],
            reason: CompactionReason::Size,
        };
        let outputs = run_job(&job, &version, &ctx, 10);
        // Two shards, two outputs; together they hold every live key.
        assert_eq!(outputs.len(), 2);
        let mut keys = Vec::new();
        for output in &outputs {
            for (key, _) in read_all(&ctx, output) {
                keys.push(key.raw_key);
            }
        }
        keys.sort();
        assert_eq!(keys, vec![
            b"a".to_vec(),
            b"b".to_vec(),
            b"c".to_vec(),
            b"l".to_vec(),
            b"m".to_vec(),
            b"n".to_vec(),
        ]);
    }

    #[test]
    fn test_trivial_move_detection() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = LocalDfs::new();
        let solo = write_sst(
            dfs.as_ref(),
            dir.path(),
            1,
            &[(b"q", 1, ValueKind::Value, b"v")],
        );
        let version = version_with(vec![(1, solo)]);
        let job = build_job(
            &version,
            1,
            version.files[1].clone(),
            CompactionReason::Size,
        );
        assert!(job.is_trivial_move());
    }

    #[test]
    fn test_shutdown_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let dfs = LocalDfs::new();
        let file = write_sst(
            dfs.as_ref(),
            dir.path(),
            1,
            &[(b"k", 1, ValueKind::Value, b"v")],
        );
        let version = version_with(vec![(0, file)]);
        let ctx = test_ctx(dir.path(), crate::engine::key::MAX_SEQUENCE);
        ctx.shutdown.store(true, Ordering::SeqCst);

        let job = CompactionJob {
            level: 0,
            inputs0: version.files[0].clone(),
            inputs1: vec![],
            grandparents: vec![],
            reason: CompactionReason::Manual,
        };
        let counter = AtomicU64::new(10);
        let result = run(&job, &version, &ctx, &move || {
            counter.fetch_add(1, Ordering::SeqCst)
        });
        assert!(matches!(result, Err(Error::Aborted)));
    }
}
