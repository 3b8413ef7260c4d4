//! Control and data operation payloads.
//!
//! The RPC transport is an external collaborator; these are the request and
//! response shapes the core consumes and produces. Every control request
//! carries the coordinator session id it believes this server holds, and is
//! rejected with `IllegalAccess` on mismatch.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use crate::engine::key::Sequence;
use crate::error::StatusCode;
use crate::schema::TableSchema;
use crate::tablet::{Cell, CompactStatus, RowMutation, Tablet, TabletStatus};

#[derive(Debug, Clone)]
pub struct LoadTabletRequest {
    pub session_id: String,
    pub table_name: String,
    pub key_start: Vec<u8>,
    pub key_end: Vec<u8>,
    /// Tablet directory, relative to the server's DFS root.
    pub path: String,
    pub schema: TableSchema,
    /// Parent tablet directories for split/merge children.
    pub parent_paths: Vec<String>,
    pub ignore_err_lgs: HashSet<String>,
    pub snapshots: Vec<Sequence>,
    pub rollbacks: Vec<(Sequence, Sequence)>,
    pub create_time: u64,
    pub version: u64,
}

/// Structured corruption report for a failed load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptMessage {
    pub phase: &'static str,
    pub path: String,
    pub parents: Vec<String>,
    pub detail: String,
}

#[derive(Debug)]
pub struct LoadTabletResponse {
    pub status: StatusCode,
    pub corrupt: Option<CorruptMessage>,
}

#[derive(Debug, Clone)]
pub struct UnloadTabletRequest {
    pub session_id: String,
    pub table_name: String,
    pub key_start: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CompactTabletRequest {
    pub table_name: String,
    pub key_start: Vec<u8>,
    /// Compact one locality group, or all when absent.
    pub lg_no: Option<usize>,
}

#[derive(Debug)]
pub struct CompactTabletResponse {
    pub status: StatusCode,
    pub compact_status: CompactStatus,
    pub size_after: u64,
}

#[derive(Debug, Clone)]
pub struct SplitKeyRequest {
    pub table_name: String,
    pub key_start: Vec<u8>,
}

#[derive(Debug)]
pub struct SplitKeyResponse {
    pub status: StatusCode,
    pub split_key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UpdateSchemaRequest {
    pub session_id: String,
    pub schema: TableSchema,
}

#[derive(Debug, Clone)]
pub struct WriteTabletRequest {
    pub table_name: String,
    pub rows: Vec<RowMutation>,
    /// Write through (fsync) instead of buffered WAL append.
    pub is_instant: bool,
}

#[derive(Debug)]
pub struct WriteTabletResponse {
    pub status: StatusCode,
    /// One status per row, in request order.
    pub row_status: Vec<StatusCode>,
}

#[derive(Debug, Clone)]
pub struct RowReadInfo {
    pub row: Vec<u8>,
    /// Families to return; empty means all.
    pub families: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct ReadTabletRequest {
    pub table_name: String,
    pub rows: Vec<RowReadInfo>,
    pub snapshot_id: Option<u64>,
    pub client_timeout_ms: u64,
}

#[derive(Debug)]
pub struct RowResult {
    pub status: StatusCode,
    pub cells: Vec<Cell>,
}

#[derive(Debug)]
pub struct ReadTabletResponse {
    pub status: StatusCode,
    pub rows: Vec<RowResult>,
    pub success_count: usize,
}

#[derive(Debug, Clone)]
pub struct ScanTabletRequest {
    pub table_name: String,
    pub start_row: Vec<u8>,
    pub end_row: Vec<u8>,
    pub families: HashSet<String>,
    pub max_versions: u32,
    pub buffer_limit: usize,
    /// Resume an earlier paged scan.
    pub scan_session: Option<u64>,
    /// Client is done with the session.
    pub finish: bool,
}

#[derive(Debug)]
pub struct ScanTabletResponse {
    pub status: StatusCode,
    pub cells: Vec<Cell>,
    pub complete: bool,
    /// Session to resume with; zero when the scan is complete.
    pub scan_session: u64,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Also collect inherited-file lists for the garbage collector.
    pub include_inherited_files: bool,
}

/// Per-tablet metrics snapshot, refreshed by the status task and returned
/// by `Query`.
#[derive(Debug, Clone)]
pub struct TabletMetrics {
    pub table_name: String,
    pub key_start: Vec<u8>,
    pub key_end: Vec<u8>,
    pub status: TabletStatus,
    pub compact_status: CompactStatus,
    pub data_size: u64,
    pub lg_sizes: Vec<u64>,
    pub read_rows: u64,
    pub write_rows: u64,
    pub scan_rows: u64,
    pub write_reject_rows: u64,
    pub busy_reads: u64,
    /// Whether the read path is currently at its in-flight quota.
    pub is_busy: bool,
    /// Write-buffer pressure, for the master's load balancer.
    pub write_workload: f64,
    /// Per locality group, the inherited file numbers (when requested).
    pub inherited_files: Vec<Vec<u64>>,
}

impl TabletMetrics {
    pub fn collect(tablet: &Tablet, include_inherited: bool) -> Self {
        let id = tablet.id();
        let (data_size, lg_sizes) = tablet.data_size();
        Self {
            table_name: id.table_name.clone(),
            key_start: id.key_start.clone(),
            key_end: id.key_end.clone(),
            status: tablet.status(),
            compact_status: tablet.compact_status(),
            data_size,
            lg_sizes,
            read_rows: tablet.counters.read_rows.load(Ordering::Relaxed),
            write_rows: tablet.counters.write_rows.load(Ordering::Relaxed),
            scan_rows: tablet.counters.scan_rows.load(Ordering::Relaxed),
            write_reject_rows: tablet.counters.write_reject_rows.load(Ordering::Relaxed),
            busy_reads: tablet.counters.busy_reads.load(Ordering::Relaxed),
            is_busy: tablet.is_busy(),
            write_workload: tablet.write_workload(),
            inherited_files: if include_inherited {
                tablet.inherited_files()
            } else {
                Vec::new()
            },
        }
    }
}

#[derive(Debug)]
pub struct QueryResponse {
    pub status: StatusCode,
    pub session_id: String,
    pub server_status: super::ServerStatus,
    pub tablets: Vec<TabletMetrics>,
    pub block_cache_bytes: usize,
    pub table_cache_handles: usize,
    pub persistent_cache: Option<crate::blockcache::CacheStats>,
    pub background_errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CmdCtrlRequest {
    pub session_id: String,
    pub command: String,
}
