//! Tablet server core: the orchestration layer over the tablet manager.
//!
//! Owns the coordinator session, the server-wide caches, the scan session
//! pool and the background maintenance tasks. Every control operation
//! validates the caller's session id first, so a master that restarted this
//! server cannot act on it with a stale grant.

pub mod ops;
pub mod tasks;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::blockcache::{CacheOptions, CachedDfs, PersistentCache};
use crate::cache::ShardedLru;
use crate::config::Flags;
use crate::dfs::{Dfs, ReadLimiter};
use crate::engine::sstable::{BlockCache, TableCache};
use crate::error::{Error, Result, StatusCode};
use crate::flash::{FlashDfs, FlashMirror};
use crate::tablet::manager::TabletManager;
use crate::tablet::scanner::ScanContextManager;
use crate::tablet::{ScanOptions, Tablet, TabletId};

use ops::*;

/// Total bytes of background-error text retained for `Query`.
const BG_ERROR_BYTE_CAP: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    NotInited,
    IsIniting,
    IsRunning,
    IsReadonly,
}

/// Which SSD cache layer sits between the engines and the DFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLayer {
    None,
    PersistentBlockCache,
    FlashMirror,
}

pub struct TabletServer {
    flags: RwLock<Flags>,
    session_id: RwLock<String>,
    status: RwLock<ServerStatus>,
    dfs: Arc<dyn Dfs>,
    root_path: PathBuf,
    block_cache: Arc<BlockCache>,
    table_cache: Arc<TableCache>,
    persistent_cache: Option<Arc<PersistentCache>>,
    manager: TabletManager,
    scans: ScanContextManager,
    read_limiter: ReadLimiter,
    bg_errors: Mutex<VecDeque<String>>,
    metrics: Mutex<Vec<TabletMetrics>>,
}

impl TabletServer {
    /// Wire the cache stack and bring the server to `IsRunning`. A cache
    /// initialisation failure is fatal: the caller exits non-zero.
    pub fn open(
        flags: Flags,
        base_dfs: Arc<dyn Dfs>,
        root_path: &Path,
        cache_dir: &Path,
        cache_layer: CacheLayer,
    ) -> Result<Arc<Self>> {
        let mut persistent_cache = None;
        let dfs: Arc<dyn Dfs> = match cache_layer {
            CacheLayer::None => base_dfs,
            CacheLayer::PersistentBlockCache => {
                let cache = PersistentCache::open(
                    cache_dir,
                    CacheOptions {
                        capacity: flags.persistent_cache_size,
                        dataset_size: flags.dataset_size,
                        block_size: flags.cache_block_size,
                        clean_on_start: flags.clean_cache_paths_on_start,
                    },
                )?;
                persistent_cache = Some(cache.clone());
                CachedDfs::new(base_dfs, cache)
            }
            CacheLayer::FlashMirror => {
                let mirror = FlashMirror::open(base_dfs.clone(), cache_dir)?;
                FlashDfs::new(base_dfs, mirror)
            }
        };

        let block_cache: Arc<BlockCache> = Arc::new(ShardedLru::new(flags.block_cache_size));
        let table_cache = Arc::new(TableCache::new(
            dfs.clone(),
            flags.table_cache_size,
            Some(block_cache.clone()),
        ));

        let server = Arc::new(Self {
            read_limiter: ReadLimiter::new(flags.dfs_read_limit()),
            session_id: RwLock::new(String::new()),
            status: RwLock::new(ServerStatus::IsIniting),
            dfs,
            root_path: root_path.to_path_buf(),
            block_cache,
            table_cache,
            persistent_cache,
            manager: TabletManager::new(),
            scans: ScanContextManager::default(),
            bg_errors: Mutex::new(VecDeque::new()),
            metrics: Mutex::new(Vec::new()),
            flags: RwLock::new(flags),
        });
        *server.status.write().unwrap() = ServerStatus::IsRunning;
        tracing::info!(root = %root_path.display(), "tablet server running");
        Ok(server)
    }

    /// Adopt the session id the coordinator granted this instance.
    pub fn grant_session(&self, session_id: &str) {
        *self.session_id.write().unwrap() = session_id.to_string();
        tracing::info!(session = session_id, "coordinator session granted");
    }

    pub fn session_id(&self) -> String {
        self.session_id.read().unwrap().clone()
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.read().unwrap()
    }

    pub fn set_readonly(&self, readonly: bool) {
        *self.status.write().unwrap() = if readonly {
            ServerStatus::IsReadonly
        } else {
            ServerStatus::IsRunning
        };
    }

    fn check_session(&self, session: &str) -> std::result::Result<(), StatusCode> {
        if *self.session_id.read().unwrap() == session {
            Ok(())
        } else {
            Err(StatusCode::IllegalAccess)
        }
    }

    pub fn load_tablet(&self, req: &LoadTabletRequest) -> LoadTabletResponse {
        if let Err(status) = self.check_session(&req.session_id) {
            return LoadTabletResponse {
                status,
                corrupt: None,
            };
        }
        if req.schema.validate().is_err() {
            return LoadTabletResponse {
                status: StatusCode::IllegalAccess,
                corrupt: None,
            };
        }
        // Re-delivered load for a tablet already here: answer success.
        if self.manager.get_exact(&req.table_name, &req.key_start).is_ok() {
            return LoadTabletResponse {
                status: StatusCode::Ok,
                corrupt: None,
            };
        }

        let path = self.root_path.join(&req.path);
        let parent_paths: Vec<PathBuf> = req
            .parent_paths
            .iter()
            .map(|p| self.root_path.join(p))
            .collect();
        let flags = self.flags.read().unwrap().clone();

        let loaded = Tablet::load(
            self.dfs.clone(),
            self.table_cache.clone(),
            TabletId {
                table_name: req.table_name.clone(),
                key_start: req.key_start.clone(),
                key_end: req.key_end.clone(),
                create_time: req.create_time,
                version: req.version,
                parents: req.parent_paths.clone(),
            },
            path.clone(),
            req.schema.clone(),
            parent_paths,
            &req.ignore_err_lgs,
            req.snapshots.clone(),
            req.rollbacks.clone(),
            flags.ignore_corruption_in_open,
            flags.ignore_corruption_in_compaction,
        );

        match loaded.and_then(|tablet| self.manager.add(tablet.clone()).map(|_| tablet)) {
            Ok(tablet) => {
                tablet.set_read_quota(flags.tablet_read_quota);
                LoadTabletResponse {
                    status: StatusCode::Ok,
                    corrupt: None,
                }
            }
            Err(err) => {
                tracing::error!(
                    table = %req.table_name,
                    path = %path.display(),
                    error = %err,
                    "tablet load failed"
                );
                LoadTabletResponse {
                    status: StatusCode::from(&err),
                    corrupt: Some(CorruptMessage {
                        phase: "loading",
                        path: path.to_string_lossy().into_owned(),
                        parents: req.parent_paths.clone(),
                        detail: err.to_string(),
                    }),
                }
            }
        }
    }

    pub fn unload_tablet(&self, req: &UnloadTabletRequest) -> StatusCode {
        if let Err(status) = self.check_session(&req.session_id) {
            return status;
        }
        let tablet = match self.manager.remove(&req.table_name, &req.key_start) {
            Some(tablet) => tablet,
            None => return StatusCode::KeyNotInRange,
        };
        match tablet.unload() {
            Ok(()) => StatusCode::Ok,
            Err(err) => StatusCode::from(&err),
        }
    }

    pub fn write_tablet(&self, req: &WriteTabletRequest) -> WriteTabletResponse {
        if self.status() == ServerStatus::IsReadonly {
            return WriteTabletResponse {
                status: StatusCode::NodeBusy,
                row_status: vec![StatusCode::NodeBusy; req.rows.len()],
            };
        }
        let mut row_status = Vec::with_capacity(req.rows.len());
        for row in &req.rows {
            let status = match self.manager.get_tablet(&req.table_name, &row.row) {
                Ok(handle) => handle
                    .write(std::slice::from_ref(row), req.is_instant)
                    .pop()
                    .unwrap_or(StatusCode::Ok),
                Err(err) => StatusCode::from(&err),
            };
            row_status.push(status);
        }
        WriteTabletResponse {
            status: StatusCode::Ok,
            row_status,
        }
    }

    /// Batch read, fanned out in shards of `rows_per_task`. Earlier shards
    /// run on worker threads; the last one runs on the caller. Rows not
    /// finished by the client deadline answer `RpcTimeout`.
    pub fn read_tablet(&self, req: &ReadTabletRequest) -> ReadTabletResponse {
        let deadline = if req.client_timeout_ms == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(req.client_timeout_ms))
        };
        let rows_per_task = self.flags.read().unwrap().rows_per_task.max(1);

        let read_one = |info: &RowReadInfo| -> RowResult {
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    return RowResult {
                        status: StatusCode::RpcTimeout,
                        cells: Vec::new(),
                    };
                }
            }
            let _permit = self.read_limiter.acquire();
            match self.manager.get_tablet(&req.table_name, &info.row) {
                Ok(handle) => match handle.read_row(&info.row, req.snapshot_id) {
                    Ok(cells) => {
                        let cells = if info.families.is_empty() {
                            cells
                        } else {
                            cells
                                .into_iter()
                                .filter(|c| info.families.contains(&c.family))
                                .collect()
                        };
                        if cells.is_empty() {
                            RowResult {
                                status: StatusCode::KeyNotExist,
                                cells,
                            }
                        } else {
                            RowResult {
                                status: StatusCode::Ok,
                                cells,
                            }
                        }
                    }
                    Err(err) => RowResult {
                        status: StatusCode::from(&err),
                        cells: Vec::new(),
                    },
                },
                Err(err) => RowResult {
                    status: StatusCode::from(&err),
                    cells: Vec::new(),
                },
            }
        };

        let shards: Vec<&[RowReadInfo]> = req.rows.chunks(rows_per_task).collect();
        let mut results: Vec<RowResult> = Vec::with_capacity(req.rows.len());
        if shards.len() <= 1 {
            for info in &req.rows {
                results.push(read_one(info));
            }
        } else {
            let (earlier, last) = shards.split_at(shards.len() - 1);
            let mut shard_results: Vec<Vec<RowResult>> = std::thread::scope(|scope| {
                let handles: Vec<_> = earlier
                    .iter()
                    .map(|shard| {
                        let shard: &[RowReadInfo] = shard;
                        scope.spawn(move || {
                            shard.iter().map(read_one).collect::<Vec<RowResult>>()
                        })
                    })
                    .collect();
                // The final shard executes on the calling thread.
                let mut collected: Vec<Vec<RowResult>> =
                    vec![last[0].iter().map(read_one).collect()];
                for handle in handles {
                    collected.push(handle.join().unwrap());
                }
                collected
            });
            let caller_shard = shard_results.remove(0);
            for shard in shard_results {
                results.extend(shard);
            }
            results.extend(caller_shard);
        }

        let success_count = results
            .iter()
            .filter(|r| r.status == StatusCode::Ok)
            .count();
        ReadTabletResponse {
            status: StatusCode::Ok,
            rows: results,
            success_count,
        }
    }

    pub fn scan_tablet(&self, req: &ScanTabletRequest) -> ScanTabletResponse {
        if let Some(session) = req.scan_session {
            if req.finish {
                self.scans.finish(session);
                return ScanTabletResponse {
                    status: StatusCode::Ok,
                    cells: Vec::new(),
                    complete: true,
                    scan_session: 0,
                };
            }
            return match self.scans.resume(session) {
                Ok(page) => ScanTabletResponse {
                    status: StatusCode::Ok,
                    complete: page.complete,
                    scan_session: if page.complete { 0 } else { session },
                    cells: page.cells,
                },
                Err(err) => ScanTabletResponse {
                    status: StatusCode::from(&err),
                    cells: Vec::new(),
                    complete: false,
                    scan_session: 0,
                },
            };
        }

        let flags = self.flags.read().unwrap();
        let options = ScanOptions {
            start_row: req.start_row.clone(),
            end_row: req.end_row.clone(),
            families: req.families.clone(),
            max_versions: req.max_versions,
            byte_budget: if req.buffer_limit == 0 {
                flags.scan_pack_size
            } else {
                req.buffer_limit.min(flags.scan_pack_size)
            },
            row_budget: 0,
        };
        drop(flags);

        let tablet = match self.manager.get_tablet(&req.table_name, &req.start_row) {
            Ok(handle) => handle.tablet().clone(),
            Err(err) => {
                return ScanTabletResponse {
                    status: StatusCode::from(&err),
                    cells: Vec::new(),
                    complete: false,
                    scan_session: 0,
                }
            }
        };
        match self.scans.start(tablet, options) {
            Ok((session, page)) => ScanTabletResponse {
                status: StatusCode::Ok,
                complete: page.complete,
                scan_session: session,
                cells: page.cells,
            },
            Err(err) => ScanTabletResponse {
                status: StatusCode::from(&err),
                cells: Vec::new(),
                complete: false,
                scan_session: 0,
            },
        }
    }

    pub fn compact_tablet(&self, req: &CompactTabletRequest) -> CompactTabletResponse {
        let handle = match self.manager.get_exact(&req.table_name, &req.key_start) {
            Ok(handle) => handle,
            Err(err) => {
                return CompactTabletResponse {
                    status: StatusCode::from(&err),
                    compact_status: crate::tablet::CompactStatus::NotCompact,
                    size_after: 0,
                }
            }
        };
        match handle.compact(req.lg_no) {
            Ok(size_after) => CompactTabletResponse {
                status: StatusCode::Ok,
                compact_status: handle.compact_status(),
                size_after,
            },
            Err(err) => CompactTabletResponse {
                status: StatusCode::from(&err),
                compact_status: handle.compact_status(),
                size_after: 0,
            },
        }
    }

    pub fn compute_split_key(&self, req: &SplitKeyRequest) -> SplitKeyResponse {
        let handle = match self.manager.get_exact(&req.table_name, &req.key_start) {
            Ok(handle) => handle,
            Err(err) => {
                return SplitKeyResponse {
                    status: StatusCode::from(&err),
                    split_key: Vec::new(),
                }
            }
        };
        match handle.find_split_key() {
            Ok(split_key) => SplitKeyResponse {
                status: StatusCode::Ok,
                split_key,
            },
            Err(_) => SplitKeyResponse {
                status: StatusCode::TableNotSupport,
                split_key: Vec::new(),
            },
        }
    }

    /// Apply an updated schema to every loaded tablet of the table.
    pub fn update_schema(&self, req: &UpdateSchemaRequest) -> StatusCode {
        if let Err(status) = self.check_session(&req.session_id) {
            return status;
        }
        if req.schema.validate().is_err() {
            return StatusCode::InvalidArgument;
        }
        let mut applied = 0;
        for tablet in self.manager.list() {
            if tablet.id().table_name != req.schema.table_name {
                continue;
            }
            if let Err(err) = tablet.apply_schema(req.schema.clone()) {
                tracing::error!(table = %req.schema.table_name, error = %err, "schema update failed");
                return StatusCode::InvalidArgument;
            }
            applied += 1;
        }
        tracing::info!(table = %req.schema.table_name, tablets = applied, "schema updated");
        StatusCode::Ok
    }

    pub fn query(&self, req: &QueryRequest) -> QueryResponse {
        let mut tablets = self.metrics.lock().unwrap().clone();
        if tablets.is_empty() || req.include_inherited_files {
            tablets = self
                .manager
                .list()
                .iter()
                .map(|t| TabletMetrics::collect(t, req.include_inherited_files))
                .collect();
        }
        QueryResponse {
            status: StatusCode::Ok,
            session_id: self.session_id(),
            server_status: self.status(),
            tablets,
            block_cache_bytes: self.block_cache.total_charge(),
            table_cache_handles: self.table_cache.open_handles(),
            persistent_cache: self.persistent_cache.as_ref().map(|c| c.stats()),
            background_errors: self.bg_errors.lock().unwrap().iter().cloned().collect(),
        }
    }

    /// Runtime control: `reload config`, `readonly on|off`.
    pub fn cmd_ctrl(&self, req: &CmdCtrlRequest) -> StatusCode {
        if let Err(status) = self.check_session(&req.session_id) {
            return status;
        }
        match req.command.as_str() {
            "reload config" => match self.flags.write().unwrap().reload() {
                Ok(()) => {
                    tracing::info!("flags reloaded");
                    StatusCode::Ok
                }
                Err(err) => {
                    tracing::error!(error = %err, "flag reload failed");
                    StatusCode::InvalidArgument
                }
            },
            "readonly on" => {
                self.set_readonly(true);
                StatusCode::Ok
            }
            "readonly off" => {
                self.set_readonly(false);
                StatusCode::Ok
            }
            _ => StatusCode::InvalidArgument,
        }
    }

    pub fn flags(&self) -> Flags {
        self.flags.read().unwrap().clone()
    }

    pub(crate) fn manager(&self) -> &TabletManager {
        &self.manager
    }

    /// Every loaded tablet, for shutdown and external inspection.
    pub fn tablets(&self) -> Vec<Arc<Tablet>> {
        self.manager.list()
    }

    pub(crate) fn scans(&self) -> &ScanContextManager {
        &self.scans
    }

    pub(crate) fn persistent_cache(&self) -> Option<&Arc<PersistentCache>> {
        self.persistent_cache.as_ref()
    }

    /// Record a background error, keeping the total retained text bounded.
    pub(crate) fn record_bg_error(&self, message: String) {
        let mut errors = self.bg_errors.lock().unwrap();
        errors.push_back(message);
        let mut total: usize = errors.iter().map(|m| m.len()).sum();
        while total > BG_ERROR_BYTE_CAP {
            if let Some(dropped) = errors.pop_front() {
                total -= dropped.len();
            } else {
                break;
            }
        }
    }

    /// Refresh the per-tablet metrics served by `Query`.
    pub(crate) fn refresh_metrics(&self) {
        let snapshot: Vec<TabletMetrics> = self
            .manager
            .list()
            .iter()
            .map(|t| TabletMetrics::collect(t, false))
            .collect();
        *self.metrics.lock().unwrap() = snapshot;
    }

    /// Force-unload tablets whose engines declared themselves
    /// unrecoverable, reporting their stored errors.
    pub(crate) fn reap_dead_tablets(&self) {
        for tablet in self.manager.list() {
            if !tablet.should_force_unload() {
                continue;
            }
            let id = tablet.id().clone();
            let detail = tablet
                .bg_error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown background error".into());
            self.record_bg_error(format!(
                "force unload {} [{:?}..{:?}): {}",
                id.table_name, id.key_start, id.key_end, detail
            ));
            tracing::error!(table = %id.table_name, error = %detail, "force-unloading tablet");
            if let Some(tablet) = self.manager.remove(&id.table_name, &id.key_start) {
                if let Err(err) = tablet.unload() {
                    tracing::error!(error = %err, "force unload failed");
                }
            }
        }
    }

    /// One maintenance pass over every tablet's engines.
    pub(crate) fn tablet_maintenance(&self) -> Result<()> {
        for tablet in self.manager.list() {
            if !tablet.needs_background_work() {
                continue;
            }
            match tablet.background_work() {
                Ok(_) => {}
                Err(Error::Background(_)) => {
                    // Engine wants out; the reaper handles it.
                }
                Err(err) => {
                    self.record_bg_error(err.to_string());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfs::LocalDfs;
    use crate::schema::{ColumnFamily, LocalityGroup, TableSchema};
    use crate::tablet::{CellMutation, MutationOp, RowMutation};

    fn test_schema() -> TableSchema {
        TableSchema::new("webtable")
            .locality_group(LocalityGroup::new("lg").family(ColumnFamily::new("cf")))
    }

    fn open_server(dir: &Path) -> Arc<TabletServer> {
        let server = TabletServer::open(
            Flags::default(),
            LocalDfs::new(),
            &dir.join("dfs"),
            &dir.join("cache"),
            CacheLayer::None,
        )
        .unwrap();
        server.grant_session("session-1");
        server
    }

    fn load_request(session: &str) -> LoadTabletRequest {
        LoadTabletRequest {
            session_id: session.into(),
            table_name: "webtable".into(),
            key_start: vec![],
            key_end: vec![],
            path: "webtable/tablet00000001".into(),
            schema: test_schema(),
            parent_paths: vec![],
            ignore_err_lgs: HashSet::new(),
            snapshots: vec![],
            rollbacks: vec![],
            create_time: 1,
            version: 1,
        }
    }

    fn put_row(server: &TabletServer, row: &[u8], value: &[u8]) -> StatusCode {
        let resp = server.write_tablet(&WriteTabletRequest {
            table_name: "webtable".into(),
            rows: vec![RowMutation {
                row: row.to_vec(),
                cells: vec![CellMutation {
                    family: "cf".into(),
                    qualifier: b"q".to_vec(),
                    timestamp: 0,
                    op: MutationOp::Put(value.to_vec()),
                }],
            }],
            is_instant: false,
        });
        resp.row_status[0]
    }

    #[test]
    fn test_stale_session_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = open_server(dir.path());

        // A master still holding the pre-restart session id gets refused
        // and nothing is loaded.
        let resp = server.load_tablet(&load_request("stale-session"));
        assert_eq!(resp.status, StatusCode::IllegalAccess);
        assert!(server.manager().is_empty());

        let resp = server.load_tablet(&load_request("session-1"));
        assert_eq!(resp.status, StatusCode::Ok);
        assert_eq!(server.manager().len(), 1);
    }

    #[test]
    fn test_load_rejects_empty_schema() {
        let dir = tempfile::tempdir().unwrap();
        let server = open_server(dir.path());
        let mut req = load_request("session-1");
        req.schema = TableSchema::new("webtable");
        let resp = server.load_tablet(&req);
        assert_eq!(resp.status, StatusCode::IllegalAccess);
    }

    #[test]
    fn test_duplicate_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let server = open_server(dir.path());
        assert_eq!(server.load_tablet(&load_request("session-1")).status, StatusCode::Ok);
        assert_eq!(server.load_tablet(&load_request("session-1")).status, StatusCode::Ok);
        assert_eq!(server.manager().len(), 1);
    }

    #[test]
    fn test_write_read_scan_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let server = open_server(dir.path());
        server.load_tablet(&load_request("session-1"));

        for i in 0..5 {
            assert_eq!(
                put_row(&server, format!("row{}", i).as_bytes(), b"v"),
                StatusCode::Ok
            );
        }

        let resp = server.read_tablet(&ReadTabletRequest {
            table_name: "webtable".into(),
            rows: vec![
                RowReadInfo {
                    row: b"row0".to_vec(),
                    families: HashSet::new(),
                },
                RowReadInfo {
                    row: b"missing".to_vec(),
                    families: HashSet::new(),
                },
            ],
            snapshot_id: None,
            client_timeout_ms: 0,
        });
        assert_eq!(resp.success_count, 1);
        assert_eq!(resp.rows[0].status, StatusCode::Ok);
        assert_eq!(resp.rows[1].status, StatusCode::KeyNotExist);

        let scan = server.scan_tablet(&ScanTabletRequest {
            table_name: "webtable".into(),
            start_row: vec![],
            end_row: vec![],
            families: HashSet::new(),
            max_versions: 0,
            buffer_limit: 0,
            scan_session: None,
            finish: false,
        });
        assert_eq!(scan.status, StatusCode::Ok);
        assert!(scan.complete);
        assert_eq!(scan.cells.len(), 5);
    }

    #[test]
    fn test_over_quota_reads_answer_busy() {
        let dir = tempfile::tempdir().unwrap();
        let mut flags = Flags::default();
        flags.set("tablet_read_quota", "0").unwrap();
        let server = TabletServer::open(
            flags,
            LocalDfs::new(),
            &dir.path().join("dfs"),
            &dir.path().join("cache"),
            CacheLayer::None,
        )
        .unwrap();
        server.grant_session("session-1");
        server.load_tablet(&load_request("session-1"));
        assert_eq!(put_row(&server, b"row0", b"v"), StatusCode::Ok);

        let resp = server.read_tablet(&ReadTabletRequest {
            table_name: "webtable".into(),
            rows: vec![RowReadInfo {
                row: b"row0".to_vec(),
                families: HashSet::new(),
            }],
            snapshot_id: None,
            client_timeout_ms: 0,
        });
        assert_eq!(resp.rows[0].status, StatusCode::NodeBusy);
        assert_eq!(resp.success_count, 0);
        // The quota guard is per tablet, not per server: writes still land.
        assert_eq!(put_row(&server, b"row1", b"v"), StatusCode::Ok);
    }

    #[test]
    fn test_read_deadline_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let server = open_server(dir.path());
        server.load_tablet(&load_request("session-1"));
        put_row(&server, b"row0", b"v");

        let resp = server.read_tablet(&ReadTabletRequest {
            table_name: "webtable".into(),
            rows: vec![RowReadInfo {
                row: b"row0".to_vec(),
                families: HashSet::new(),
            }],
            snapshot_id: None,
            client_timeout_ms: 1,
        });
        // With a 1ms budget the row either made it or timed out; both are
        // legal, but a timeout must be reported as RpcTimeout.
        assert!(matches!(
            resp.rows[0].status,
            StatusCode::Ok | StatusCode::RpcTimeout
        ));
    }

    #[test]
    fn test_compact_and_split() {
        let dir = tempfile::tempdir().unwrap();
        let server = open_server(dir.path());
        server.load_tablet(&load_request("session-1"));
        for i in 0..200 {
            put_row(&server, format!("row{:04}", i).as_bytes(), &[5u8; 64]);
        }

        let compacted = server.compact_tablet(&CompactTabletRequest {
            table_name: "webtable".into(),
            key_start: vec![],
            lg_no: None,
        });
        assert_eq!(compacted.status, StatusCode::Ok);
        assert_eq!(
            compacted.compact_status,
            crate::tablet::CompactStatus::CompactDone
        );
        assert!(compacted.size_after > 0);

        let split = server.compute_split_key(&SplitKeyRequest {
            table_name: "webtable".into(),
            key_start: vec![],
        });
        assert_eq!(split.status, StatusCode::Ok);
        assert!(!split.split_key.is_empty());
    }

    #[test]
    fn test_unload_requires_session_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let server = open_server(dir.path());
        server.load_tablet(&load_request("session-1"));

        let stale = server.unload_tablet(&UnloadTabletRequest {
            session_id: "old".into(),
            table_name: "webtable".into(),
            key_start: vec![],
        });
        assert_eq!(stale, StatusCode::IllegalAccess);
        assert_eq!(server.manager().len(), 1);

        let ok = server.unload_tablet(&UnloadTabletRequest {
            session_id: "session-1".into(),
            table_name: "webtable".into(),
            key_start: vec![],
        });
        assert_eq!(ok, StatusCode::Ok);
        assert!(server.manager().is_empty());
    }

    #[test]
    fn test_query_reports_tablets_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let server = open_server(dir.path());
        server.load_tablet(&load_request("session-1"));
        put_row(&server, b"r", b"v");
        server.refresh_metrics();

        let resp = server.query(&QueryRequest {
            include_inherited_files: false,
        });
        assert_eq!(resp.status, StatusCode::Ok);
        assert_eq!(resp.session_id, "session-1");
        assert_eq!(resp.tablets.len(), 1);
        assert_eq!(resp.tablets[0].write_rows, 1);
    }

    #[test]
    fn test_cmd_ctrl_readonly_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let server = open_server(dir.path());

        let resp = server.cmd_ctrl(&CmdCtrlRequest {
            session_id: "session-1".into(),
            command: "readonly on".into(),
        });
        assert_eq!(resp, StatusCode::Ok);
        assert_eq!(server.status(), ServerStatus::IsReadonly);

        // Writes bounce while readonly.
        server.load_tablet(&load_request("session-1"));
        let write = server.write_tablet(&WriteTabletRequest {
            table_name: "webtable".into(),
            rows: vec![],
            is_instant: false,
        });
        assert_eq!(write.status, StatusCode::NodeBusy);

        let resp = server.cmd_ctrl(&CmdCtrlRequest {
            session_id: "session-1".into(),
            command: "make me a sandwich".into(),
        });
        assert_eq!(resp, StatusCode::InvalidArgument);
    }

    #[test]
    fn test_bg_error_cap() {
        let dir = tempfile::tempdir().unwrap();
        let server = open_server(dir.path());
        for i in 0..100 {
            server.record_bg_error(format!("error {}: {}", i, "x".repeat(2048)));
        }
        let total: usize = server
            .bg_errors
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.len())
            .sum();
        assert!(total <= BG_ERROR_BYTE_CAP);
    }
}
