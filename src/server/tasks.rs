//! The server's periodic background tasks.
//!
//! Registered on the scheduler at startup: engine maintenance
//! (flush/compaction ticks plus the dead-engine reaper), the tablet status
//! refresher that feeds heartbeats and `Query`, cache GC, and the periodic
//! free-heap release back to the OS.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::scheduler::{BackgroundTask, Scheduler, TaskContext};
use crate::server::TabletServer;

/// Register every periodic task for `server`.
pub fn register_all(server: &Arc<TabletServer>, scheduler: &Scheduler) {
    let flags = server.flags();
    scheduler
        .register(Arc::new(MaintenanceTask {
            server: server.clone(),
        }))
        .register(Arc::new(StatusRefreshTask {
            server: server.clone(),
            interval: flags.heartbeat_interval,
        }))
        .register(Arc::new(CacheGcTask {
            server: server.clone(),
        }))
        .register(Arc::new(HeapReleaseTask {
            interval: flags.heap_release_period,
        }));
}

/// Flush and compaction ticks across every loaded tablet, plus the
/// force-unload reaper.
struct MaintenanceTask {
    server: Arc<TabletServer>,
}

#[async_trait::async_trait]
impl BackgroundTask for MaintenanceTask {
    fn name(&self) -> &'static str {
        "tablet-maintenance"
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(500)
    }

    async fn execute(&self, _ctx: TaskContext) -> Result<()> {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || {
            server.tablet_maintenance()?;
            server.reap_dead_tablets();
            Ok(())
        })
        .await?
    }
}

/// Walks all tablets and refreshes the system info published to the
/// coordinator with each heartbeat.
struct StatusRefreshTask {
    server: Arc<TabletServer>,
    interval: Duration,
}

#[async_trait::async_trait]
impl BackgroundTask for StatusRefreshTask {
    fn name(&self) -> &'static str {
        "status-refresh"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: TaskContext) -> Result<()> {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || {
            server.refresh_metrics();
            tracing::debug!(
                session = %server.session_id(),
                tablets = server.manager().len(),
                "heartbeat"
            );
        })
        .await?;
        Ok(())
    }
}

/// One GC cycle of the persistent cache plus the idle scan-session sweep.
struct CacheGcTask {
    server: Arc<TabletServer>,
}

#[async_trait::async_trait]
impl BackgroundTask for CacheGcTask {
    fn name(&self) -> &'static str {
        "cache-gc"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn execute(&self, _ctx: TaskContext) -> Result<()> {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || {
            server.scans().sweep_idle();
            if let Some(cache) = server.persistent_cache() {
                cache.gc_tick()?;
            }
            Ok(())
        })
        .await?
    }
}

/// Hands free heap back to the OS, standing in for the original's
/// allocator-cache trimming knob.
struct HeapReleaseTask {
    interval: Duration,
}

#[async_trait::async_trait]
impl BackgroundTask for HeapReleaseTask {
    fn name(&self) -> &'static str {
        "heap-release"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: TaskContext) -> Result<()> {
        #[cfg(target_env = "gnu")]
        unsafe {
            libc::malloc_trim(0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Flags;
    use crate::dfs::LocalDfs;
    use crate::schema::{ColumnFamily, LocalityGroup, TableSchema};
    use crate::server::ops::{LoadTabletRequest, WriteTabletRequest};
    use crate::server::CacheLayer;
    use crate::tablet::{CellMutation, MutationOp, RowMutation};
    use std::collections::HashSet;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_maintenance_flushes_rotated_memtables() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let server = TabletServer::open(
            Flags::default(),
            LocalDfs::new(),
            &dir.path().join("dfs"),
            &dir.path().join("cache"),
            CacheLayer::None,
        )?;
        server.grant_session("s");

        let schema = TableSchema::new("t")
            .locality_group(LocalityGroup::new("lg").family(ColumnFamily::new("cf")));
        let resp = server.load_tablet(&LoadTabletRequest {
            session_id: "s".into(),
            table_name: "t".into(),
            key_start: vec![],
            key_end: vec![],
            path: "t/tablet1".into(),
            schema,
            parent_paths: vec![],
            ignore_err_lgs: HashSet::new(),
            snapshots: vec![],
            rollbacks: vec![],
            create_time: 0,
            version: 1,
        });
        assert_eq!(resp.status, crate::error::StatusCode::Ok);

        server.write_tablet(&WriteTabletRequest {
            table_name: "t".into(),
            rows: vec![RowMutation {
                row: b"r".to_vec(),
                cells: vec![CellMutation {
                    family: "cf".into(),
                    qualifier: b"q".to_vec(),
                    timestamp: 0,
                    op: MutationOp::Put(b"v".to_vec()),
                }],
            }],
            is_instant: false,
        });

        let scheduler = Scheduler::new();
        register_all(&server, &scheduler);
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown().await?;

        server.refresh_metrics();
        let query = server.query(&crate::server::ops::QueryRequest {
            include_inherited_files: false,
        });
        assert_eq!(query.tablets.len(), 1);
        Ok(())
    }
}
