//! Tablets: one contiguous row range of one table, backed by one LSM
//! engine per locality group.

pub mod cell;
pub mod manager;
pub mod scanner;
pub mod strategy;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dfs::Dfs;
use crate::engine::iterator::EngineIter;
use crate::engine::key::{Sequence, ValueKind};
use crate::engine::iterator::MergeIter;
use crate::engine::sstable::TableCache;
use crate::engine::writer::WriteBatch;
use crate::engine::{Engine, EngineInfo, EngineOptions};
use crate::error::{Error, Result, StatusCode};
use crate::schema::TableSchema;
use crate::errinput;

use cell::{now_micros, row_scan_start, CellKey};
use strategy::{CellFilter, SchemaStrategyFactory};

/// Tablet lifecycle. `Unloading` stops admitting new operations;
/// `Unloading2` is the second, stop-the-world phase that waits for the
/// last reference to drain before the tablet leaves the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletStatus {
    NotInit,
    OnLoad,
    Ready,
    OnSplit,
    Splitted,
    Unloading,
    Unloading2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactStatus {
    NotCompact,
    OnCompact,
    CompactDone,
}

/// Identity of a tablet as the master names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletId {
    pub table_name: String,
    /// Inclusive start row; empty means unbounded below.
    pub key_start: Vec<u8>,
    /// Exclusive end row; empty means unbounded above.
    pub key_end: Vec<u8>,
    pub create_time: u64,
    pub version: u64,
    /// Zero parents for a fresh tablet, one for a split child, two for a
    /// merge child.
    pub parents: Vec<String>,
}

impl TabletId {
    pub fn contains_row(&self, row: &[u8]) -> bool {
        (self.key_start.is_empty() || row >= self.key_start.as_slice())
            && (self.key_end.is_empty() || row < self.key_end.as_slice())
    }
}

/// One mutation against one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
    Put(Vec<u8>),
    DeleteCell,
    Add(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellMutation {
    pub family: String,
    pub qualifier: Vec<u8>,
    /// Microseconds; zero asks the server to stamp the current time.
    pub timestamp: u64,
    pub op: MutationOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMutation {
    pub row: Vec<u8>,
    pub cells: Vec<CellMutation>,
}

/// One materialised cell version returned to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub row: Vec<u8>,
    pub family: String,
    pub qualifier: Vec<u8>,
    pub timestamp: u64,
    pub value: Vec<u8>,
}

/// Column selection and budgets for a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub start_row: Vec<u8>,
    /// Exclusive; empty scans to the end of the tablet.
    pub end_row: Vec<u8>,
    /// Families to return; empty means all.
    pub families: HashSet<String>,
    /// Caps versions per cell on top of the schema's own caps; zero means
    /// schema only.
    pub max_versions: u32,
    /// Stop after roughly this many payload bytes; zero means default.
    pub byte_budget: usize,
    /// Stop after this many complete rows; zero means unlimited.
    pub row_budget: usize,
}

/// One page of scan output.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub cells: Vec<Cell>,
    pub complete: bool,
    /// Resume point when incomplete: first row not yet returned.
    pub next_row: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct TabletCounters {
    pub read_rows: AtomicU64,
    pub read_cells: AtomicU64,
    pub read_bytes: AtomicU64,
    pub write_rows: AtomicU64,
    pub write_cells: AtomicU64,
    pub write_bytes: AtomicU64,
    pub write_reject_rows: AtomicU64,
    pub scan_rows: AtomicU64,
    pub scan_cells: AtomicU64,
    pub scan_bytes: AtomicU64,
    /// Cells read below the latest version (historical reads).
    pub low_read_cells: AtomicU64,
    /// Reads rejected by the in-flight quota guard.
    pub busy_reads: AtomicU64,
}

/// Default cap on concurrently served reads per tablet.
pub const DEFAULT_READ_QUOTA: u32 = 512;

pub struct Tablet {
    id: TabletId,
    path: PathBuf,
    engines: Vec<Option<Arc<Engine>>>,
    strategy: Arc<SchemaStrategyFactory>,
    status: Mutex<TabletStatus>,
    compact_status: Mutex<CompactStatus>,
    ref_count: AtomicI32,
    /// In-flight read guard; reads beyond `read_quota` answer busy.
    inflight_reads: AtomicU32,
    read_quota: AtomicU32,
    /// Coordinator snapshot ids mapped to the per-engine sequences pinned
    /// under them.
    snapshot_ids: Mutex<BTreeMap<u64, Vec<Sequence>>>,
    pub counters: TabletCounters,
}

impl Tablet {
    /// Open every locality group engine and bring the tablet to `Ready`.
    /// A failing group aborts the load unless it is listed in
    /// `ignore_err_lgs`.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        dfs: Arc<dyn Dfs>,
        table_cache: Arc<TableCache>,
        id: TabletId,
        path: PathBuf,
        schema: TableSchema,
        parent_paths: Vec<PathBuf>,
        ignore_err_lgs: &HashSet<String>,
        snapshots: Vec<Sequence>,
        rollbacks: Vec<(Sequence, Sequence)>,
        ignore_corruption_in_open: bool,
        ignore_corruption_in_compaction: bool,
    ) -> Result<Arc<Self>> {
        schema.validate()?;
        let strategy = SchemaStrategyFactory::new(schema.clone());

        let opens: Vec<Result<Option<Arc<Engine>>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = schema
                .locality_groups
                .iter()
                .enumerate()
                .map(|(lg_no, lg)| {
                    let dfs = dfs.clone();
                    let table_cache = table_cache.clone();
                    let strategy = strategy.clone();
                    let lg_dir = path.join(format!("lg{}", lg_no));
                    let parents: Vec<PathBuf> = parent_paths
                        .iter()
                        .map(|p| p.join(format!("lg{}", lg_no)))
                        .collect();
                    let snapshots = snapshots.clone();
                    let rollbacks = rollbacks.clone();
                    scope.spawn(move || {
                        let options = EngineOptions {
                            bloom_filter: lg.bloom_filter,
                            memtable_shards: lg.memtable_shards,
                            strategy_factory: strategy,
                            ignore_corruption_in_open,
                            ignore_corruption_in_compaction,
                            ..Default::default()
                        };
                        Engine::open(
                            dfs,
                            table_cache,
                            &lg_dir,
                            &parents,
                            snapshots,
                            rollbacks,
                            options,
                        )
                        .map(Some)
                        .or_else(|err| {
                            if ignore_err_lgs.contains(&lg.name) {
                                tracing::warn!(
                                    lg = %lg.name,
                                    error = %err,
                                    "locality group skipped at load"
                                );
                                Ok(None)
                            } else {
                                Err(err)
                            }
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut engines = Vec::with_capacity(opens.len());
        for open in opens {
            engines.push(open?);
        }

        let tablet = Arc::new(Self {
            id,
            path,
            engines,
            strategy,
            status: Mutex::new(TabletStatus::OnLoad),
            compact_status: Mutex::new(CompactStatus::NotCompact),
            ref_count: AtomicI32::new(0),
            inflight_reads: AtomicU32::new(0),
            read_quota: AtomicU32::new(DEFAULT_READ_QUOTA),
            snapshot_ids: Mutex::new(BTreeMap::new()),
            counters: TabletCounters::default(),
        });
        tablet.set_status(TabletStatus::Ready);
        tracing::info!(
            table = %tablet.id.table_name,
            path = %tablet.path.display(),
            engines = tablet.engines.iter().filter(|e| e.is_some()).count(),
            "tablet loaded"
        );
        Ok(tablet)
    }

    pub fn id(&self) -> &TabletId {
        &self.id
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn schema(&self) -> Arc<TableSchema> {
        self.strategy.schema()
    }

    pub fn status(&self) -> TabletStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: TabletStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn compact_status(&self) -> CompactStatus {
        *self.compact_status.lock().unwrap()
    }

    pub fn add_ref(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn dec_ref(&self) -> i32 {
        self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.status() {
            TabletStatus::Ready | TabletStatus::OnSplit => Ok(()),
            status => Err(Error::Background(format!(
                "tablet not serving (status {:?})",
                status
            ))),
        }
    }

    pub fn set_read_quota(&self, quota: u32) {
        self.read_quota.store(quota, Ordering::SeqCst);
    }

    /// True when the read path is at its in-flight quota.
    pub fn is_busy(&self) -> bool {
        self.inflight_reads.load(Ordering::SeqCst) >= self.read_quota.load(Ordering::SeqCst)
    }

    /// Write pressure for the load balancer: the worst per-engine fill
    /// fraction of the write buffers.
    pub fn write_workload(&self) -> f64 {
        self.engines
            .iter()
            .flatten()
            .map(|engine| engine.write_pressure())
            .fold(0.0, f64::max)
    }

    /// Claim a read slot; over-quota requests answer busy instead of
    /// queueing behind slow reads.
    fn begin_read(&self) -> Result<ReadQuotaGuard<'_>> {
        let quota = self.read_quota.load(Ordering::SeqCst);
        let mut inflight = self.inflight_reads.load(Ordering::SeqCst);
        loop {
            if inflight >= quota {
                self.counters.busy_reads.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Busy);
            }
            match self.inflight_reads.compare_exchange(
                inflight,
                inflight + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(ReadQuotaGuard { tablet: self }),
                Err(actual) => inflight = actual,
            }
        }
    }

    /// Apply row mutations; one status per row, in order. The call itself
    /// succeeds even when individual rows fail.
    pub fn write(&self, rows: &[RowMutation], sync: bool) -> Vec<StatusCode> {
        let mut statuses = Vec::with_capacity(rows.len());
        for row in rows {
            statuses.push(match self.write_row(row, sync) {
                Ok(()) => {
                    self.counters.write_rows.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .write_cells
                        .fetch_add(row.cells.len() as u64, Ordering::Relaxed);
                    StatusCode::Ok
                }
                Err(err) => {
                    self.counters
                        .write_reject_rows
                        .fetch_add(1, Ordering::Relaxed);
                    StatusCode::from(&err)
                }
            });
        }
        statuses
    }

    fn write_row(&self, row: &RowMutation, sync: bool) -> Result<()> {
        self.ensure_ready()?;
        if !self.id.contains_row(&row.row) {
            return Err(Error::NotInRange);
        }

        // One batch per locality group, committed engine by engine.
        let schema = self.schema();
        let mut batches: HashMap<usize, WriteBatch> = HashMap::new();
        let mut bytes = 0u64;
        for cell in &row.cells {
            let lg_no = schema
                .group_of(&cell.family)
                .ok_or_else(|| errinput!("unknown column family {:?}", cell.family))?;
            let timestamp = if cell.timestamp == 0 {
                now_micros()
            } else {
                cell.timestamp
            };
            let raw = CellKey::new(&row.row, &cell.family, &cell.qualifier, timestamp).encode();
            let batch = batches.entry(lg_no).or_default();
            match &cell.op {
                MutationOp::Put(value) => {
                    bytes += (raw.len() + value.len()) as u64;
                    batch.put(&raw, value);
                }
                MutationOp::DeleteCell => {
                    bytes += raw.len() as u64;
                    batch.delete(&raw);
                }
                MutationOp::Add(delta) => {
                    bytes += (raw.len() + 8) as u64;
                    batch.atomic_add(&raw, *delta);
                }
            }
        }

        for (lg_no, batch) in batches {
            let engine = self.engines[lg_no]
                .as_ref()
                .ok_or_else(|| Error::Background("locality group unavailable".into()))?;
            engine.write(batch, sync)?;
        }
        self.counters.write_bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// All visible cells of one row, retention rules applied. Answers busy
    /// when the tablet's in-flight read quota is exhausted.
    pub fn read_row(&self, row: &[u8], snapshot_id: Option<u64>) -> Result<Vec<Cell>> {
        self.ensure_ready()?;
        let _quota = self.begin_read()?;
        if !self.id.contains_row(row) {
            return Err(Error::NotInRange);
        }
        let options = ScanOptions {
            start_row: row.to_vec(),
            end_row: upper_bound_of(row),
            ..Default::default()
        };
        let snapshots = self.resolve_snapshot(snapshot_id)?;
        let page = self.scan_with_snapshots(&options, snapshots)?;

        self.counters.read_rows.fetch_add(1, Ordering::Relaxed);
        self.counters
            .read_cells
            .fetch_add(page.cells.len() as u64, Ordering::Relaxed);
        let bytes: u64 = page.cells.iter().map(|c| c.value.len() as u64).sum();
        self.counters.read_bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(page.cells)
    }

    fn resolve_snapshot(&self, snapshot_id: Option<u64>) -> Result<Option<Vec<Sequence>>> {
        match snapshot_id {
            None => Ok(None),
            Some(id) => {
                let ids = self.snapshot_ids.lock().unwrap();
                let seqs = ids
                    .get(&id)
                    .ok_or_else(|| errinput!("unknown snapshot id {}", id))?;
                self.counters.low_read_cells.fetch_add(1, Ordering::Relaxed);
                Ok(Some(seqs.clone()))
            }
        }
    }

    /// One page of a range scan at the latest state.
    pub fn scan(&self, options: &ScanOptions) -> Result<ScanPage> {
        self.scan_at(options, None)
    }

    /// One page of a range scan, pinned to a tablet snapshot id when given.
    pub fn scan_at(&self, options: &ScanOptions, snapshot_id: Option<u64>) -> Result<ScanPage> {
        self.ensure_ready()?;
        let snapshots = self.resolve_snapshot(snapshot_id)?;
        let page = self.scan_with_snapshots(options, snapshots)?;
        self.counters
            .scan_cells
            .fetch_add(page.cells.len() as u64, Ordering::Relaxed);
        let bytes: u64 = page.cells.iter().map(|c| c.value.len() as u64).sum();
        self.counters.scan_bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(page)
    }

    /// Build the merged per-engine iterator for a scan. Exposed to the scan
    /// session pool so resumable scans share this path.
    pub fn scan_iter(
        &self,
        start_row: &[u8],
        snapshots: Option<&[Sequence]>,
    ) -> Result<MergeIter> {
        let start = if start_row.is_empty() && self.id.key_start.is_empty() {
            None
        } else if start_row.is_empty() {
            Some(row_scan_start(&self.id.key_start))
        } else {
            Some(row_scan_start(start_row))
        };

        let mut sources: Vec<EngineIter> = Vec::new();
        for (lg_no, engine) in self.engines.iter().enumerate() {
            let engine = match engine {
                Some(engine) => engine,
                None => continue,
            };
            let snapshot = snapshots.map(|s| s[lg_no]);
            let handle = engine.iter_at(snapshot, start.as_deref())?;
            sources.push(Box::new(handle));
        }
        Ok(MergeIter::new(sources))
    }

    fn scan_with_snapshots(
        &self,
        options: &ScanOptions,
        snapshots: Option<Vec<Sequence>>,
    ) -> Result<ScanPage> {
        let byte_budget = if options.byte_budget == 0 {
            1 << 20
        } else {
            options.byte_budget
        };

        let merged = self.scan_iter(&options.start_row, snapshots.as_deref())?;
        let mut filter = CellFilter::new(self.schema());
        let mut page = ScanPage::default();
        let mut bytes = 0usize;
        let mut rows_done = 0usize;
        let mut current_row: Option<Vec<u8>> = None;
        let mut last_cell_key: Option<Vec<u8>> = None;
        let mut versions_of_cell = 0u32;

        for entry in merged {
            let (key, value) = entry?;
            let cell = CellKey::decode(&key.raw_key)?;

            // Cells of rows before the requested start can leak in through
            // the flattened key encoding; skip them.
            if !options.start_row.is_empty() && cell.row.as_slice() < options.start_row.as_slice()
            {
                continue;
            }
            if !self.id.contains_row(&cell.row) {
                if self.id.key_end.is_empty() || cell.row.as_slice() < self.id.key_end.as_slice()
                {
                    continue;
                }
                page.complete = true;
                break;
            }
            if !options.end_row.is_empty() && cell.row.as_slice() >= options.end_row.as_slice() {
                page.complete = true;
                break;
            }

            // Row boundary: enforce budgets between rows only, so a row is
            // never torn across pages.
            if current_row.as_deref() != Some(cell.row.as_slice()) {
                if current_row.is_some() {
                    rows_done += 1;
                    self.counters.scan_rows.fetch_add(1, Ordering::Relaxed);
                    if (options.row_budget > 0 && rows_done >= options.row_budget)
                        || bytes >= byte_budget
                    {
                        page.next_row = cell.row.clone();
                        return Ok(page);
                    }
                }
                current_row = Some(cell.row.clone());
            }

            // Sequence-level duplicates of one cell version: newest wins.
            let cell_version_key = key.raw_key.clone();
            if last_cell_key.as_ref() == Some(&cell_version_key) {
                continue;
            }

            // A fresh (family, qualifier) resets the per-request version
            // count; the key order guarantees grouping.
            let same_column = last_cell_key
                .as_ref()
                .map(|last| {
                    CellKey::decode(last)
                        .map(|c| {
                            c.row == cell.row
                                && c.family == cell.family
                                && c.qualifier == cell.qualifier
                        })
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if !same_column {
                versions_of_cell = 0;
            }
            last_cell_key = Some(cell_version_key);

            if key.kind == ValueKind::Deletion {
                // Tombstone shadows this exact cell version; later entries
                // for the same cell key are older sequence versions.
                continue;
            }
            if filter.is_dead(&key.raw_key) {
                continue;
            }
            if !options.families.is_empty() && !options.families.contains(&cell.family) {
                continue;
            }
            versions_of_cell += 1;
            if options.max_versions > 0 && versions_of_cell > options.max_versions {
                continue;
            }

            bytes += value.len();
            page.cells.push(Cell {
                row: cell.row,
                family: cell.family,
                qualifier: cell.qualifier,
                timestamp: cell.timestamp,
                value,
            });
        }

        if current_row.is_some() {
            self.counters.scan_rows.fetch_add(1, Ordering::Relaxed);
        }
        page.complete = true;
        Ok(page)
    }

    /// Pin a coordinator snapshot id across every engine.
    pub fn create_snapshot(&self, snapshot_id: u64) -> Result<()> {
        let mut ids = self.snapshot_ids.lock().unwrap();
        if ids.contains_key(&snapshot_id) {
            return Err(errinput!("snapshot id {} exists", snapshot_id));
        }
        let seqs: Vec<Sequence> = self
            .engines
            .iter()
            .map(|engine| match engine {
                Some(engine) => engine.get_snapshot(0),
                None => 0,
            })
            .collect();
        ids.insert(snapshot_id, seqs);
        Ok(())
    }

    pub fn release_snapshot(&self, snapshot_id: u64) -> Result<()> {
        let mut ids = self.snapshot_ids.lock().unwrap();
        let seqs = ids
            .remove(&snapshot_id)
            .ok_or_else(|| errinput!("unknown snapshot id {}", snapshot_id))?;
        for (engine, seq) in self.engines.iter().zip(seqs) {
            if let Some(engine) = engine {
                engine.release_snapshot(seq);
            }
        }
        Ok(())
    }

    /// Erase everything written after `snapshot_id`, up to now.
    pub fn rollback_to_snapshot(&self, snapshot_id: u64) -> Result<()> {
        let ids = self.snapshot_ids.lock().unwrap();
        let seqs = ids
            .get(&snapshot_id)
            .ok_or_else(|| errinput!("unknown snapshot id {}", snapshot_id))?;
        for (engine, snapshot) in self.engines.iter().zip(seqs) {
            if let Some(engine) = engine {
                engine.rollback(*snapshot, engine.last_sequence());
            }
        }
        Ok(())
    }

    /// Manual compaction of one locality group, or all of them.
    pub fn compact(&self, lg_no: Option<usize>) -> Result<u64> {
        self.ensure_ready()?;
        *self.compact_status.lock().unwrap() = CompactStatus::OnCompact;
        let result = (|| {
            for (no, engine) in self.engines.iter().enumerate() {
                if lg_no.map(|want| want != no).unwrap_or(false) {
                    continue;
                }
                if let Some(engine) = engine {
                    engine.compact_range(&self.range_begin(), &self.range_end())?;
                }
            }
            Ok(self.data_size().0)
        })();
        *self.compact_status.lock().unwrap() = match &result {
            Ok(_) => CompactStatus::CompactDone,
            Err(_) => CompactStatus::NotCompact,
        };
        result
    }

    fn range_begin(&self) -> Vec<u8> {
        if self.id.key_start.is_empty() {
            Vec::new()
        } else {
            row_scan_start(&self.id.key_start)
        }
    }

    fn range_end(&self) -> Vec<u8> {
        if self.id.key_end.is_empty() {
            vec![0xff; 24]
        } else {
            row_scan_start(&self.id.key_end)
        }
    }

    /// Row key splitting the tablet's data roughly in half. Falls back to
    /// the byte midpoint of the range when no engine can offer one.
    pub fn find_split_key(&self) -> Result<Vec<u8>> {
        self.ensure_ready()?;
        let biggest = self
            .engines
            .iter()
            .flatten()
            .max_by_key(|engine| engine.info().total_bytes());
        if let Some(engine) = biggest {
            if let Some(raw) = engine.find_split_key(0.5) {
                if let Ok(row) = CellKey::row_of(&raw) {
                    if self.id.contains_row(row)
                        && row != self.id.key_start.as_slice()
                        && !row.is_empty()
                    {
                        return Ok(row.to_vec());
                    }
                }
            }
        }
        find_average_key(&self.id.key_start, &self.id.key_end)
            .ok_or_else(|| errinput!("range admits no split key"))
    }

    /// Total data size, and the per-locality-group breakdown.
    pub fn data_size(&self) -> (u64, Vec<u64>) {
        let per_lg: Vec<u64> = self
            .engines
            .iter()
            .map(|engine| {
                engine
                    .as_ref()
                    .map(|e| e.info().total_bytes())
                    .unwrap_or(0)
            })
            .collect();
        (per_lg.iter().sum(), per_lg)
    }

    pub fn engine_infos(&self) -> Vec<Option<EngineInfo>> {
        self.engines
            .iter()
            .map(|engine| engine.as_ref().map(|e| e.info()))
            .collect()
    }

    /// File numbers live in this tablet but physically owned by ancestors.
    pub fn inherited_files(&self) -> Vec<Vec<u64>> {
        self.engines
            .iter()
            .map(|engine| {
                engine
                    .as_ref()
                    .map(|e| e.inherited_files())
                    .unwrap_or_default()
            })
            .collect()
    }

    /// One background tick across the tablet's engines.
    pub fn background_work(&self) -> Result<bool> {
        let mut did = false;
        for engine in self.engines.iter().flatten() {
            did |= engine.background_work()?;
        }
        Ok(did)
    }

    pub fn needs_background_work(&self) -> bool {
        self.engines
            .iter()
            .flatten()
            .any(|engine| engine.needs_background_work())
    }

    /// First background error across locality groups, if any.
    pub fn bg_error(&self) -> Option<Error> {
        self.engines.iter().flatten().find_map(|e| e.bg_error())
    }

    pub fn should_force_unload(&self) -> bool {
        self.engines
            .iter()
            .flatten()
            .any(|engine| engine.should_force_unload())
    }

    /// Apply an updated schema in place; engines pick the new retention and
    /// storage settings up at their next iteration boundary.
    pub fn apply_schema(&self, schema: TableSchema) -> Result<()> {
        schema.validate()?;
        if schema.locality_groups.len() != self.engines.len() {
            return Err(errinput!(
                "schema update cannot change locality group count ({} != {})",
                schema.locality_groups.len(),
                self.engines.len()
            ));
        }
        self.strategy.update_schema(schema.clone());
        for (lg, engine) in schema.locality_groups.iter().zip(&self.engines) {
            if let Some(engine) = engine {
                engine.update_options(EngineOptions {
                    bloom_filter: lg.bloom_filter,
                    memtable_shards: lg.memtable_shards,
                    strategy_factory: self.strategy.clone(),
                    ..Default::default()
                });
            }
        }
        Ok(())
    }

    /// Two-phase unload: stop admitting work, drain references, then shut
    /// the engines down.
    pub fn unload(&self) -> Result<()> {
        self.set_status(TabletStatus::Unloading);
        // Second phase: wait out in-flight operations holding references.
        self.set_status(TabletStatus::Unloading2);
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while self.ref_count() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if self.ref_count() > 0 {
            tracing::warn!(
                table = %self.id.table_name,
                refs = self.ref_count(),
                "unloading with live references"
            );
        }
        for engine in self.engines.iter().flatten() {
            engine.shutdown()?;
        }
        self.set_status(TabletStatus::NotInit);
        tracing::info!(table = %self.id.table_name, path = %self.path.display(), "tablet unloaded");
        Ok(())
    }

    /// Last acknowledged sequence across engines, for split children.
    pub fn last_sequence(&self) -> Sequence {
        self.engines
            .iter()
            .flatten()
            .map(|e| e.last_sequence())
            .max()
            .unwrap_or(0)
    }
}

/// RAII slot of a tablet's read quota.
struct ReadQuotaGuard<'a> {
    tablet: &'a Tablet,
}

impl Drop for ReadQuotaGuard<'_> {
    fn drop(&mut self) {
        self.tablet.inflight_reads.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Smallest row key strictly greater than `row`: `row` plus a zero byte.
fn upper_bound_of(row: &[u8]) -> Vec<u8> {
    let mut bound = row.to_vec();
    bound.push(0);
    bound
}

/// Byte-wise midpoint of `[start, end)`, used when no data-driven split key
/// exists. Empty `end` is treated as the all-0xff key.
pub fn find_average_key(start: &[u8], end: &[u8]) -> Option<Vec<u8>> {
    let width = start.len().max(end.len()).max(1) + 1;
    let pad = |key: &[u8], fill: u8| -> Vec<u8> {
        let mut padded = key.to_vec();
        padded.resize(width, fill);
        padded
    };
    let low = pad(start, 0x00);
    let high = if end.is_empty() {
        vec![0xff; width]
    } else {
        pad(end, 0x00)
    };
    if low >= high {
        return None;
    }

    // Average two big-endian numbers byte by byte.
    let mut mid = Vec::with_capacity(width);
    let mut carry = 0u16;
    for i in 0..width {
        let sum = low[i] as u16 + high[i] as u16 + (carry << 8);
        mid.push((sum / 2) as u8);
        carry = sum % 2;
    }
    // Trim trailing zero bytes that add nothing to the ordering.
    while mid.last() == Some(&0) && mid.len() > 1 {
        mid.pop();
    }
    (mid.as_slice() > start && (end.is_empty() || mid.as_slice() < end)).then_some(mid)
}
