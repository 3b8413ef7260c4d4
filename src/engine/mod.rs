//! The per-locality-group LSM engine.
//!
//! One engine owns a directory on the DFS: a WAL, a MANIFEST/CURRENT pair
//! and levelled SSTables. A tablet holds one engine per locality group; the
//! persistent block cache embeds another one for its metadata. All of them
//! share the server-wide block and table caches passed in at open.
//!
//! # Concurrency
//!
//! A single mutex guards the mutable core (memtables, version set, snapshot
//! and rollback state, writer queue). Writers serialise through a ticket
//! queue: each writer enqueues, waits for its ticket to reach the front,
//! and only the head writer appends to the WAL and inserts into the
//! memtable before waking its successor. Background work (memtable flush,
//! compaction) runs outside the lock against pinned versions and re-locks
//! only to apply its version edit, so the WAL append and the MANIFEST apply
//! are never performed concurrently.

pub mod compaction;
pub mod iterator;
pub mod key;
pub mod memtable;
pub mod snapshot;
pub mod sstable;
pub mod strategy;
pub mod version;
pub mod wal;
pub mod writer;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use crate::dfs::Dfs;
use crate::engine::compaction::{CompactionContext, CompactionJob};
use crate::engine::iterator::{EngineIter, MergeIter};
use crate::engine::key::{InternalKey, Sequence, ValueKind, MAX_SEQUENCE};
use crate::engine::memtable::{MemTable, VersionEntry};
use crate::engine::snapshot::{RollbackMap, SnapshotList};
use crate::engine::sstable::{TableBuilder, TableCache};
use crate::engine::strategy::{decode_counter, PassthroughFactory, StrategyFactory};
use crate::engine::version::set::{log_name, parse_file_name, sst_name, FileKind};
use crate::engine::version::{
    FileMeta, LevelFile, Version, VersionEdit, VersionSet, L0_SLOWDOWN_TRIGGER, L0_STOP_TRIGGER,
    NUM_LEVELS,
};
use crate::engine::wal::{LogReader, LogWriter};
use crate::engine::writer::WriteBatch;
use crate::error::{Error, Result};

/// Per-engine tunables, derived from the locality group's schema by the
/// tablet layer. A schema update swaps these in place; background jobs pick
/// the new values up at their next iteration.
#[derive(Clone)]
pub struct EngineOptions {
    pub write_buffer_size: usize,
    pub block_size: usize,
    pub bloom_filter: bool,
    pub memtable_shards: usize,
    pub max_subcompactions: usize,
    pub drop_base_level_del: bool,
    pub ignore_corruption_in_open: bool,
    pub ignore_corruption_in_compaction: bool,
    pub strategy_factory: Arc<dyn StrategyFactory>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: 4 << 20,
            block_size: sstable::DEFAULT_BLOCK_SIZE,
            bloom_filter: true,
            memtable_shards: 1,
            max_subcompactions: 1,
            drop_base_level_del: true,
            ignore_corruption_in_open: false,
            ignore_corruption_in_compaction: false,
            strategy_factory: Arc::new(PassthroughFactory),
        }
    }
}

/// Backoff cap for failing background compactions.
const MAX_BACKOFF: Duration = Duration::from_secs(8);
/// Consecutive background failures before the engine gives up and asks to
/// be unloaded.
const MAX_BG_RETRIES: u32 = 20;

struct EngineCore {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    wal: Option<LogWriter>,
    wal_number: u64,
    versions: VersionSet,
    snapshots: SnapshotList,
    rollbacks: RollbackMap,
    /// Writer tickets; only the front ticket writes.
    writers: VecDeque<u64>,
    next_ticket: u64,
    compaction_running: bool,
    flush_running: bool,
    /// File numbers currently being written by background jobs, protected
    /// from the obsolete-file sweep.
    pending_outputs: HashSet<u64>,
    /// Versions still pinned by open iterators; their files stay live.
    old_versions: Vec<Weak<Version>>,
    /// A file whose seek budget ran out, waiting for compaction.
    seek_candidate: Option<(usize, Arc<LevelFile>)>,
    bg_error: Option<Error>,
    bg_retries: u32,
    next_bg_attempt: Instant,
}

pub struct Engine {
    dir: PathBuf,
    dfs: Arc<dyn Dfs>,
    table_cache: Arc<TableCache>,
    options: RwLock<EngineOptions>,
    core: Mutex<EngineCore>,
    /// Wakes stalled writers and queued tickets when background work or the
    /// head writer finishes.
    work_cv: Condvar,
    shutdown: Arc<AtomicBool>,
    force_unload: AtomicBool,
}

/// Point-in-time byte accounting for load balancing and `Query`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineInfo {
    pub mem_bytes: u64,
    pub level_bytes: Vec<u64>,
    pub level_files: Vec<usize>,
    pub last_sequence: Sequence,
}

impl EngineInfo {
    pub fn total_bytes(&self) -> u64 {
        self.mem_bytes + self.level_bytes.iter().sum::<u64>()
    }
}

impl Engine {
    /// Open or recover the engine in `dir`. `parents` point at the engine
    /// directories this one inherits from after a split or merge;
    /// `snapshots` and `rollbacks` restore pins recorded by the coordinator.
    pub fn open(
        dfs: Arc<dyn Dfs>,
        table_cache: Arc<TableCache>,
        dir: &Path,
        parents: &[PathBuf],
        snapshots: Vec<Sequence>,
        rollbacks: Vec<(Sequence, Sequence)>,
        options: EngineOptions,
    ) -> Result<Arc<Self>> {
        let versions = VersionSet::open(
            dfs.clone(),
            table_cache.clone(),
            dir,
            parents,
            options.ignore_corruption_in_open,
        )?;

        let mut snapshot_list = SnapshotList::default();
        for sequence in snapshots {
            snapshot_list.acquire(sequence);
        }

        let memtable_shards = options.memtable_shards;
        let engine = Self {
            dir: dir.to_path_buf(),
            dfs: dfs.clone(),
            table_cache,
            core: Mutex::new(EngineCore {
                mem: MemTable::new(memtable_shards),
                imm: None,
                wal: None,
                wal_number: 0,
                versions,
                snapshots: snapshot_list,
                rollbacks: RollbackMap::from_pairs(rollbacks),
                writers: VecDeque::new(),
                next_ticket: 0,
                compaction_running: false,
                flush_running: false,
                pending_outputs: HashSet::new(),
                old_versions: Vec::new(),
                seek_candidate: None,
                bg_error: None,
                bg_retries: 0,
                next_bg_attempt: Instant::now(),
            }),
            options: RwLock::new(options),
            work_cv: Condvar::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            force_unload: AtomicBool::new(false),
        };

        engine.replay_logs()?;
        tracing::info!(dir = %dir.display(), "engine opened");
        Ok(Arc::new(engine))
    }

    /// Replay WAL files at or above the recovered log number, flush the
    /// replayed data to level 0, and start a fresh WAL.
    fn replay_logs(&self) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let options = self.options.read().unwrap().clone();

        let mut log_numbers: Vec<u64> = self
            .dfs
            .list_dir(&self.dir)?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(parse_file_name))
            .filter_map(|kind| match kind {
                FileKind::Log(n) if n >= core.versions.log_number() => Some(n),
                _ => None,
            })
            .collect();
        log_numbers.sort_unstable();

        let mut max_sequence = core.versions.last_sequence();
        let mut edit = VersionEdit::default();
        let mut recovered = MemTable::new(options.memtable_shards);

        for number in &log_numbers {
            let path = self.dir.join(log_name(*number));
            let mut reader = LogReader::new(self.dfs.open_sequential(&path)?);
            while let Some(record) = reader.read_record()? {
                let (batch, base) = WriteBatch::decode(&record)?;
                batch.insert_into(&recovered, base)?;
                max_sequence = max_sequence.max(batch.last_sequence(base));

                if recovered.approximate_memory_usage() >= options.write_buffer_size {
                    let number = core.versions.new_file_number();
                    let version = core.versions.current();
                    if let Some((level, meta)) =
                        self.build_table_from_mem(&recovered, &options, &version, number)?
                    {
                        edit.add_file(level, meta);
                    }
                    recovered = MemTable::new(options.memtable_shards);
                }
            }
        }
        if !recovered.is_empty() {
            let number = core.versions.new_file_number();
            let version = core.versions.current();
            if let Some((level, meta)) =
                self.build_table_from_mem(&recovered, &options, &version, number)?
            {
                edit.add_file(level, meta);
            }
        }

        // Fresh WAL; everything older is obsolete once the edit commits.
        let wal_number = core.versions.new_file_number();
        let wal = LogWriter::new(self.dfs.create(&self.dir.join(log_name(wal_number)))?);
        core.wal = Some(wal);
        core.wal_number = wal_number;
        core.versions.set_last_sequence(max_sequence);
        edit.log_number = Some(wal_number);

        let old = core.versions.current();
        core.versions.log_and_apply(edit)?;
        core.old_versions.push(Arc::downgrade(&old));
        self.delete_obsolete_files(&mut core);

        if !log_numbers.is_empty() {
            tracing::info!(
                dir = %self.dir.display(),
                logs = log_numbers.len(),
                last_sequence = max_sequence,
                "wal replay complete"
            );
        }
        Ok(())
    }

    /// Build one table from a memtable, placed at the deepest
    /// non-overlapping level. Returns `None` for an empty memtable.
    fn build_table_from_mem(
        &self,
        mem: &MemTable,
        options: &EngineOptions,
        version: &Version,
        number: u64,
    ) -> Result<Option<(usize, FileMeta)>> {
        if mem.is_empty() {
            return Ok(None);
        }
        let path = self.dir.join(sst_name(number));
        let sources: Vec<EngineIter> = mem
            .iters(None)
            .into_iter()
            .map(|i| Box::new(i) as EngineIter)
            .collect();
        let mut builder = TableBuilder::new(
            self.dfs.create(&path)?,
            options.block_size,
            options.bloom_filter,
        );
        for entry in MergeIter::new(sources) {
            let (key, value) = entry?;
            builder.add(&key, &value)?;
        }
        let stats = builder.finish()?;
        let meta = FileMeta {
            number,
            size: stats.file_size,
            entries: stats.entries,
            delete_tag_percent: stats.delete_tag_percent,
            ttl_percentile_expiry: stats.ttl_percentile_expiry,
            smallest: stats.smallest,
            largest: stats.largest,
            dir: self.dir.clone(),
        };
        let level = version.pick_level_for_output(
            InternalKey::raw_of(&meta.smallest),
            InternalKey::raw_of(&meta.largest),
        );
        tracing::info!(
            dir = %self.dir.display(),
            file = number,
            level = level,
            entries = meta.entries,
            "memtable written to table"
        );
        Ok(Some((level, meta)))
    }

    /// Write a batch through the single-queue writer discipline.
    pub fn write(&self, batch: WriteBatch, sync: bool) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut core = self.core.lock().unwrap();
        core.next_ticket += 1;
        let ticket = core.next_ticket;
        core.writers.push_back(ticket);
        while core.writers.front() != Some(&ticket) {
            core = self.work_cv.wait(core).unwrap();
        }

        // This writer is now the queue head: make room, then commit.
        let options = self.options.read().unwrap().clone();
        let mut allow_delay = true;
        let mut result = Ok(());
        loop {
            if let Some(err) = &core.bg_error {
                result = Err(err.clone());
                break;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                result = Err(Error::Aborted);
                break;
            }
            let l0_files = core.versions.current().num_files(0);
            if allow_delay && l0_files >= L0_SLOWDOWN_TRIGGER && l0_files < L0_STOP_TRIGGER {
                // One ~1ms delay per write near the soft limit, taken
                // without the lock so compaction can make progress.
                allow_delay = false;
                drop(core);
                std::thread::sleep(Duration::from_millis(1));
                core = self.core.lock().unwrap();
                continue;
            }
            if l0_files >= L0_STOP_TRIGGER {
                tracing::warn!(dir = %self.dir.display(), l0_files, "writers stopped on level-0");
                core = self.work_cv.wait(core).unwrap();
                continue;
            }
            if core.mem.approximate_memory_usage() < options.write_buffer_size {
                break;
            }
            if core.imm.is_some() {
                // Previous rotation not yet flushed.
                core = self.work_cv.wait(core).unwrap();
                continue;
            }
            if let Err(e) = self.rotate_memtable(&mut core, &options) {
                result = Err(e);
                break;
            }
        }
        if result.is_ok() {
            result = self.commit_write(&mut core, &batch, sync);
        }

        core.writers.pop_front();
        drop(core);
        self.work_cv.notify_all();
        result
    }

    fn commit_write(&self, core: &mut EngineCore, batch: &WriteBatch, sync: bool) -> Result<()> {
        let base = batch
            .sequence()
            .unwrap_or_else(|| core.versions.last_sequence() + 1);

        // WAL first; the memtable is untouched if the append fails.
        let wal = core
            .wal
            .as_mut()
            .ok_or_else(|| Error::Background("engine has no wal".into()))?;
        wal.add_record(&batch.encode(base))?;
        if sync {
            wal.sync()?;
        } else {
            wal.flush()?;
        }

        batch.insert_into(&core.mem, base)?;
        let last = batch.last_sequence(base).max(core.versions.last_sequence());
        core.versions.set_last_sequence(last);
        Ok(())
    }

    fn rotate_memtable(&self, core: &mut EngineCore, options: &EngineOptions) -> Result<()> {
        let wal_number = core.versions.new_file_number();
        let wal = LogWriter::new(self.dfs.create(&self.dir.join(log_name(wal_number)))?);
        if let Some(mut old) = core.wal.take() {
            old.sync()?;
        }
        core.wal = Some(wal);
        core.wal_number = wal_number;

        let old_mem = std::mem::replace(&mut core.mem, MemTable::new(options.memtable_shards));
        old_mem.set_being_flushed(true);
        core.imm = Some(old_mem);
        Ok(())
    }

    /// One unit of background work: flush the immutable memtable if there
    /// is one, otherwise run the best pending compaction. Returns whether
    /// anything was done. Driven by the server's scheduler.
    pub fn background_work(&self) -> Result<bool> {
        if self.force_unload.load(Ordering::SeqCst) {
            return Err(Error::Background("engine is force-unloading".into()));
        }
        {
            let core = self.core.lock().unwrap();
            if Instant::now() < core.next_bg_attempt {
                return Ok(false);
            }
        }
        let result = self.background_work_inner();
        match &result {
            Ok(_) => self.core.lock().unwrap().bg_retries = 0,
            Err(err) => self.handle_bg_error(err),
        }
        result
    }

    fn background_work_inner(&self) -> Result<bool> {
        if self.flush_imm()? {
            return Ok(true);
        }

        let (job, version, ctx) = {
            let mut core = self.core.lock().unwrap();
            if core.compaction_running {
                return Ok(false);
            }
            let version = core.versions.current();
            let job = match core.seek_candidate.take() {
                Some((level, file)) => compaction::pick_seek_compaction(&version, level, file),
                None => None,
            }
            .or_else(|| {
                let pointers: Vec<Vec<u8>> = (0..NUM_LEVELS)
                    .map(|l| core.versions.compact_pointer(l).to_vec())
                    .collect();
                compaction::pick_size_compaction(&version, &pointers)
            });
            let job = match job {
                Some(job) => job,
                None => return Ok(false),
            };

            if job.is_trivial_move() {
                let file = job.inputs0[0].clone();
                let mut edit = VersionEdit::default();
                edit.delete_file(job.level, file.meta.number);
                edit.add_file(job.output_level(), file.meta.clone());
                let old = core.versions.current();
                core.versions.log_and_apply(edit)?;
                core.old_versions.push(Arc::downgrade(&old));
                tracing::info!(
                    dir = %self.dir.display(),
                    file = file.meta.number,
                    from = job.level,
                    "trivial move"
                );
                drop(core);
                self.work_cv.notify_all();
                return Ok(true);
            }

            core.compaction_running = true;
            let ctx = self.compaction_ctx(&core);
            (job, version, ctx)
        };

        let outcome = self.run_compaction(&job, &version, &ctx);
        self.apply_compaction_outcome(&job, outcome).map(|_| true)
    }

    fn compaction_ctx(&self, core: &EngineCore) -> CompactionContext {
        let options = self.options.read().unwrap().clone();
        CompactionContext {
            dir: self.dir.clone(),
            dfs: self.dfs.clone(),
            table_cache: self.table_cache.clone(),
            strategy_factory: options.strategy_factory.clone(),
            block_size: options.block_size,
            bloom: options.bloom_filter,
            // MAX_SEQUENCE when nothing is pinned; the compaction walk's
            // sentinel guard keeps each key's newest entry.
            smallest_snapshot: core.snapshots.smallest(),
            rollbacks: core.rollbacks.clone(),
            drop_base_level_del: options.drop_base_level_del,
            ignore_corruption: options.ignore_corruption_in_compaction,
            shutdown: self.shutdown.clone(),
            max_subcompactions: options.max_subcompactions,
        }
    }

    /// Run the merge outside the lock; on failure, forget and remove the
    /// partial outputs.
    fn run_compaction(
        &self,
        job: &CompactionJob,
        version: &Version,
        ctx: &CompactionContext,
    ) -> Result<Vec<FileMeta>> {
        let allocated: Mutex<Vec<u64>> = Mutex::new(Vec::new());
        let alloc = || {
            let mut core = self.core.lock().unwrap();
            let number = core.versions.new_file_number();
            core.pending_outputs.insert(number);
            allocated.lock().unwrap().push(number);
            number
        };
        let result = compaction::run(job, version, ctx, &alloc);
        if result.is_err() {
            let allocated = allocated.into_inner().unwrap();
            let mut core = self.core.lock().unwrap();
            for number in allocated {
                core.pending_outputs.remove(&number);
                let _ = self.dfs.delete(&self.dir.join(sst_name(number)));
            }
        }
        result
    }

    /// Re-lock, clear the running flag, and commit the edit for a finished
    /// compaction.
    fn apply_compaction_outcome(
        &self,
        job: &CompactionJob,
        outcome: Result<Vec<FileMeta>>,
    ) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.compaction_running = false;
        let outputs = match outcome {
            Ok(outputs) => outputs,
            Err(err) => {
                drop(core);
                self.work_cv.notify_all();
                return Err(err);
            }
        };

        let mut edit = VersionEdit::default();
        for file in &job.inputs0 {
            edit.delete_file(job.level, file.meta.number);
        }
        for file in &job.inputs1 {
            edit.delete_file(job.output_level(), file.meta.number);
        }
        for meta in &outputs {
            core.pending_outputs.remove(&meta.number);
            edit.add_file(job.output_level(), meta.clone());
        }
        if let Some(largest) = job.inputs0.iter().map(|f| f.meta.largest.clone()).max() {
            edit.compact_pointers.push((job.level, largest));
        }

        let old = core.versions.current();
        core.versions.log_and_apply(edit)?;
        core.old_versions.push(Arc::downgrade(&old));
        self.delete_obsolete_files(&mut core);
        drop(core);
        self.work_cv.notify_all();
        Ok(())
    }

    fn flush_imm(&self) -> Result<bool> {
        let (imm, options, version, number) = {
            let mut core = self.core.lock().unwrap();
            if core.flush_running {
                return Ok(false);
            }
            let imm = match &core.imm {
                Some(imm) => imm.clone(),
                None => return Ok(false),
            };
            core.flush_running = true;
            let number = core.versions.new_file_number();
            core.pending_outputs.insert(number);
            (
                imm,
                self.options.read().unwrap().clone(),
                core.versions.current(),
                number,
            )
        };

        let built = self.build_table_from_mem(&imm, &options, &version, number);

        let mut core = self.core.lock().unwrap();
        core.flush_running = false;
        core.pending_outputs.remove(&number);
        let built = match built {
            Ok(built) => built,
            Err(err) => {
                drop(core);
                self.work_cv.notify_all();
                return Err(err);
            }
        };

        let mut edit = VersionEdit::default();
        if let Some((level, meta)) = built {
            edit.add_file(level, meta);
        }
        edit.log_number = Some(core.wal_number);
        let old = core.versions.current();
        core.versions.log_and_apply(edit)?;
        core.old_versions.push(Arc::downgrade(&old));
        core.imm = None;
        self.delete_obsolete_files(&mut core);
        drop(core);
        self.work_cv.notify_all();
        Ok(true)
    }

    fn handle_bg_error(&self, err: &Error) {
        let mut core = self.core.lock().unwrap();
        if matches!(err, Error::PermissionDenied(_)) {
            tracing::error!(dir = %self.dir.display(), error = %err, "terminal storage error");
            core.bg_error = Some(err.clone());
            self.force_unload.store(true, Ordering::SeqCst);
        } else {
            core.bg_retries += 1;
            let backoff = Duration::from_millis(10)
                .saturating_mul(1u32 << core.bg_retries.min(12))
                .min(MAX_BACKOFF);
            core.next_bg_attempt = Instant::now() + backoff;
            tracing::warn!(
                dir = %self.dir.display(),
                error = %err,
                retries = core.bg_retries,
                backoff_ms = backoff.as_millis() as u64,
                "background work failed"
            );
            if core.bg_retries > MAX_BG_RETRIES {
                core.bg_error = Some(err.clone());
                self.force_unload.store(true, Ordering::SeqCst);
            }
        }
        drop(core);
        self.work_cv.notify_all();
    }

    /// Whether flush or compaction work is pending, for the scheduler.
    pub fn needs_background_work(&self) -> bool {
        let core = self.core.lock().unwrap();
        if core.imm.is_some() || core.seek_candidate.is_some() {
            return true;
        }
        let version = core.versions.current();
        let pointers: Vec<Vec<u8>> = (0..NUM_LEVELS)
            .map(|l| core.versions.compact_pointer(l).to_vec())
            .collect();
        compaction::pick_size_compaction(&version, &pointers).is_some()
    }

    /// Point lookup at `snapshot` (None = latest). Resolves counter deltas
    /// and tombstones; rollback windows are already erased.
    pub fn get(&self, raw_key: &[u8], snapshot: Option<Sequence>) -> Result<Option<Vec<u8>>> {
        let (mem, imm, version, rollbacks, snapshot) = {
            let core = self.core.lock().unwrap();
            (
                core.mem.clone(),
                core.imm.clone(),
                core.versions.current(),
                core.rollbacks.clone(),
                snapshot.unwrap_or_else(|| core.versions.last_sequence()),
            )
        };

        let mut entries: Vec<VersionEntry> = Vec::new();
        mem.collect_visible(raw_key, snapshot, &rollbacks, &mut entries);
        if !has_base(&entries) {
            if let Some(imm) = &imm {
                imm.collect_visible(raw_key, snapshot, &rollbacks, &mut entries);
            }
        }
        if !has_base(&entries) {
            let charged = version.collect_visible(
                &self.table_cache,
                raw_key,
                snapshot,
                &rollbacks,
                &mut entries,
            )?;
            if let Some((level, file)) = charged {
                if file.charge_seek() {
                    let mut core = self.core.lock().unwrap();
                    core.seek_candidate.get_or_insert((level, file));
                }
            }
        }
        Ok(resolve_entries(&entries))
    }

    /// Snapshot-consistent iterator over every visible version of every
    /// key, starting at `start_raw` when given. The handle pins the version
    /// and the memtables it reads.
    pub fn iter_at(
        &self,
        snapshot: Option<Sequence>,
        start_raw: Option<&[u8]>,
    ) -> Result<EngineIterHandle> {
        let (mem, imm, version, rollbacks, snapshot) = {
            let core = self.core.lock().unwrap();
            (
                core.mem.clone(),
                core.imm.clone(),
                core.versions.current(),
                core.rollbacks.clone(),
                snapshot.unwrap_or_else(|| core.versions.last_sequence()),
            )
        };

        let start_key = start_raw.map(|raw| InternalKey::for_lookup(raw, MAX_SEQUENCE));
        let mut sources: Vec<EngineIter> = Vec::new();
        for iter in mem.iters(start_key.as_ref()) {
            sources.push(Box::new(iter));
        }
        if let Some(imm) = &imm {
            for iter in imm.iters(start_key.as_ref()) {
                sources.push(Box::new(iter));
            }
        }
        let encoded_start = start_key.as_ref().map(|k| k.encode());
        sources.extend(version.iters(&self.table_cache, encoded_start.as_deref())?);

        Ok(EngineIterHandle {
            inner: MergeIter::new(sources),
            snapshot,
            rollbacks,
            _version: version,
            _mem: mem,
            _imm: imm,
        })
    }

    /// Pin `sequence` so compaction keeps everything it can see. Zero or
    /// MAX pins the current last sequence.
    pub fn get_snapshot(&self, sequence: Sequence) -> Sequence {
        let mut core = self.core.lock().unwrap();
        let sequence = if sequence == 0 || sequence == MAX_SEQUENCE {
            core.versions.last_sequence()
        } else {
            sequence
        };
        core.mem.pin_snapshot(sequence);
        core.snapshots.acquire(sequence)
    }

    pub fn release_snapshot(&self, sequence: Sequence) {
        let mut core = self.core.lock().unwrap();
        core.mem.release_snapshot(sequence);
        core.snapshots.release(sequence);
    }

    /// Record a rollback window: writes in `(snapshot, point]` disappear
    /// from reads and from future compaction output.
    pub fn rollback(&self, snapshot: Sequence, point: Sequence) {
        let mut core = self.core.lock().unwrap();
        core.rollbacks.record(snapshot, point);
    }

    pub fn rollback_pairs(&self) -> Vec<(Sequence, Sequence)> {
        self.core.lock().unwrap().rollbacks.pairs()
    }

    pub fn snapshot_sequences(&self) -> Vec<Sequence> {
        self.core.lock().unwrap().snapshots.sequences()
    }

    /// Flush everything in memory, then compact every populated level of
    /// `[begin, end]` down one. Used by `CompactTablet`.
    pub fn compact_range(&self, begin: &[u8], end: &[u8]) -> Result<()> {
        {
            let mut core = self.core.lock().unwrap();
            if !core.mem.is_empty() && core.imm.is_none() {
                let options = self.options.read().unwrap().clone();
                self.rotate_memtable(&mut core, &options)?;
            }
        }
        self.flush_imm()?;

        for level in 0..NUM_LEVELS - 1 {
            loop {
                let (job, version, ctx) = {
                    let mut core = self.core.lock().unwrap();
                    while core.compaction_running {
                        core = self.work_cv.wait(core).unwrap();
                    }
                    let version = core.versions.current();
                    let job =
                        match compaction::pick_manual_compaction(&version, level, begin, end) {
                            Some(job) => job,
                            None => break,
                        };
                    core.compaction_running = true;
                    let ctx = self.compaction_ctx(&core);
                    (job, version, ctx)
                };

                let outcome = self.run_compaction(&job, &version, &ctx);
                self.apply_compaction_outcome(&job, outcome)?;
            }
        }
        Ok(())
    }

    /// Raw key at roughly `ratio` through the engine's byte span, for
    /// tablet splits.
    pub fn find_split_key(&self, ratio: f64) -> Option<Vec<u8>> {
        let version = self.core.lock().unwrap().versions.current();
        version.find_split_key(&self.table_cache, ratio)
    }

    /// Swap in options derived from an updated schema. In-flight background
    /// jobs finish under the settings they started with.
    pub fn update_options(&self, options: EngineOptions) {
        *self.options.write().unwrap() = options;
        tracing::info!(dir = %self.dir.display(), "engine options updated");
    }

    pub fn last_sequence(&self) -> Sequence {
        self.core.lock().unwrap().versions.last_sequence()
    }

    /// Write pressure for load balancing: the live memtable's fill fraction
    /// of the write buffer, plus one whole buffer for a pending immutable
    /// memtable.
    pub fn write_pressure(&self) -> f64 {
        let buffer = self.options.read().unwrap().write_buffer_size.max(1);
        let core = self.core.lock().unwrap();
        let mut pressure = core.mem.approximate_memory_usage() as f64 / buffer as f64;
        if core.imm.is_some() {
            pressure += 1.0;
        }
        pressure
    }

    pub fn info(&self) -> EngineInfo {
        let core = self.core.lock().unwrap();
        let version = core.versions.current();
        EngineInfo {
            mem_bytes: core.mem.approximate_memory_usage() as u64
                + core
                    .imm
                    .as_ref()
                    .map(|m| m.approximate_memory_usage() as u64)
                    .unwrap_or(0),
            level_bytes: (0..NUM_LEVELS).map(|l| version.level_bytes(l)).collect(),
            level_files: (0..NUM_LEVELS).map(|l| version.num_files(l)).collect(),
            last_sequence: core.versions.last_sequence(),
        }
    }

    /// File numbers of live tables physically located outside this engine's
    /// directory: the inherited set the garbage collector must preserve.
    pub fn inherited_files(&self) -> Vec<u64> {
        let core = self.core.lock().unwrap();
        core.versions
            .current()
            .live_files()
            .iter()
            .filter(|f| f.meta.dir != self.dir)
            .map(|f| f.meta.number)
            .collect()
    }

    pub fn bg_error(&self) -> Option<Error> {
        self.core.lock().unwrap().bg_error.clone()
    }

    /// True when a terminal background error wants this engine off the
    /// server.
    pub fn should_force_unload(&self) -> bool {
        self.force_unload.load(Ordering::SeqCst)
    }

    /// Stop background work and sync the WAL. Readers holding iterator
    /// handles stay valid; new writers fail with `Aborted`.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.work_cv.notify_all();
        let mut core = self.core.lock().unwrap();
        while core.compaction_running || core.flush_running {
            core = self.work_cv.wait(core).unwrap();
        }
        if let Some(wal) = core.wal.as_mut() {
            wal.sync()?;
        }
        tracing::info!(dir = %self.dir.display(), "engine shut down");
        Ok(())
    }

    /// Delete files no live or pinned version references. Cache layers see
    /// the deletes through the DFS façade and evict accordingly.
    fn delete_obsolete_files(&self, core: &mut EngineCore) {
        let mut live = core.versions.live_paths();
        core.old_versions.retain(|weak| match weak.upgrade() {
            Some(version) => {
                for file in version.live_files() {
                    live.insert(file.meta.sst_path());
                }
                true
            }
            None => false,
        });
        for number in &core.pending_outputs {
            live.insert(self.dir.join(sst_name(*number)));
        }

        let entries = match self.dfs.list_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for path in entries {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            let doomed = match parse_file_name(name) {
                FileKind::Sst(_) => !live.contains(&path),
                FileKind::Log(number) => {
                    number < core.versions.log_number() && number != core.wal_number
                }
                FileKind::Manifest(_) => !live.contains(&path),
                FileKind::Current | FileKind::Other => false,
            };
            if doomed {
                if let Err(err) = self.dfs.delete(&path) {
                    tracing::warn!(path = %path.display(), error = %err, "obsolete delete failed");
                } else {
                    self.table_cache.evict(&path);
                }
            }
        }
    }
}

fn has_base(entries: &[VersionEntry]) -> bool {
    entries
        .last()
        .map(|(_, kind, _)| *kind != ValueKind::AtomicAdd)
        .unwrap_or(false)
}

/// Fold collected versions (newest first) into the caller-visible value.
fn resolve_entries(entries: &[VersionEntry]) -> Option<Vec<u8>> {
    let mut sum = 0i64;
    let mut saw_add = false;
    for (_, kind, value) in entries {
        match kind {
            ValueKind::AtomicAdd => {
                sum = sum.wrapping_add(decode_counter(value));
                saw_add = true;
            }
            ValueKind::Value => {
                return Some(if saw_add {
                    sum.wrapping_add(decode_counter(value)).to_le_bytes().to_vec()
                } else {
                    value.clone()
                });
            }
            ValueKind::Deletion => {
                // Adds over a tombstone restart the counter from zero.
                return saw_add.then(|| sum.to_le_bytes().to_vec());
            }
        }
    }
    saw_add.then(|| sum.to_le_bytes().to_vec())
}

/// Iterator handle pinning the engine state it reads.
pub struct EngineIterHandle {
    inner: MergeIter,
    snapshot: Sequence,
    rollbacks: RollbackMap,
    _version: Arc<Version>,
    _mem: Arc<MemTable>,
    _imm: Option<Arc<MemTable>>,
}

impl EngineIterHandle {
    pub fn snapshot(&self) -> Sequence {
        self.snapshot
    }
}

impl Iterator for EngineIterHandle {
    type Item = Result<(InternalKey, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            if key.sequence > self.snapshot || self.rollbacks.hides(key.sequence) {
                continue;
            }
            return Some(Ok((key, value)));
        }
    }
}
