//! Cache of open table handles.
//!
//! Opening a table reads its footer, index and filter blocks, so handles are
//! kept hot in an LRU keyed by file path. The cache is shared by every
//! engine on the server; capacity counts handles, not bytes. Evicting a
//! handle also drops that table's blocks from the block cache, keyed by the
//! handle's cache id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::ShardedLru;
use crate::dfs::Dfs;
use crate::engine::sstable::table::{BlockCache, Table};
use crate::error::Result;

pub struct TableCache {
    dfs: Arc<dyn Dfs>,
    handles: ShardedLru<PathBuf, Table>,
    block_cache: Option<Arc<BlockCache>>,
}

impl TableCache {
    pub fn new(dfs: Arc<dyn Dfs>, capacity: usize, block_cache: Option<Arc<BlockCache>>) -> Self {
        let evict_blocks = block_cache.clone();
        let handles = ShardedLru::with_evict_hook(
            capacity,
            Some(Box::new(move |_path: &PathBuf, table: &Arc<Table>| {
                if let Some(cache) = &evict_blocks {
                    let cache_id = table.cache_id();
                    cache.erase_if(|(id, _)| *id == cache_id);
                }
            })),
        );
        Self {
            dfs,
            handles,
            block_cache,
        }
    }

    /// Open or fetch the table at `path`. `file_number` is the engine-local
    /// number recorded in the version set.
    pub fn open(&self, path: &Path, file_number: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.handles.get(&path.to_path_buf()) {
            return Ok(table);
        }
        let file = self.dfs.open_random(path)?;
        let table = Table::open(file, file_number, self.block_cache.clone())?;
        self.handles.insert(path.to_path_buf(), table.clone(), 1);
        Ok(table)
    }

    /// Drop the handle and every cached block of a deleted table.
    pub fn evict(&self, path: &Path) {
        if let Some(table) = self.handles.erase(&path.to_path_buf()) {
            if let Some(cache) = &self.block_cache {
                let cache_id = table.cache_id();
                cache.erase_if(|(id, _)| *id == cache_id);
            }
        }
    }

    pub fn open_handles(&self) -> usize {
        self.handles.total_charge()
    }
}
