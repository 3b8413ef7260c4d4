//! Content-addressed persistent block cache over local SSD.
//!
//! SSD space is split into data sets, each one preallocated file with an
//! independent index (see [`dataset`]). A block's key `(file_id,
//! block_idx)` hashes to its data set. File ids and slot assignments
//! persist in an embedded metadata engine (see [`meta`]), so a restart
//! reloads the whole cache instead of recrawling the DFS.
//!
//! The cache presents itself as a [`Dfs`] layer: table reads go through
//! [`read_file`](PersistentCache::read_file), newly written tables are
//! cached through on their way to the DFS, and deletes purge the file's
//! blocks unless a delayed-GC marker defers them one cycle.

pub mod dataset;
pub mod lockmap;
pub mod meta;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};

use crate::dfs::{Dfs, RandomAccessFile, SequentialFile, WritableFile};
use crate::error::Result;

use dataset::{BlockDisposition, CacheBlock, DataSet, STATE_VALID};
use meta::{MetaStore, SlotRecord};

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub capacity: u64,
    pub dataset_size: u64,
    pub block_size: u64,
    pub clean_on_start: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: 8 << 30,
            dataset_size: 128 << 20,
            block_size: 4096,
            clean_on_start: false,
        }
    }
}

/// Observed I/O counters, primarily for admission verification and `Query`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub dfs_reads: u64,
    pub ssd_reads: u64,
    pub ssd_writes: u64,
}

struct FillTask {
    dataset: Arc<DataSet>,
    block: Arc<CacheBlock>,
    data: Vec<u8>,
}

pub struct PersistentCache {
    datasets: Vec<Arc<DataSet>>,
    meta: Arc<MetaStore>,
    _lock: crate::flock::FileLock,
    block_size: u64,
    fill_tx: Mutex<Option<mpsc::Sender<FillTask>>>,
    fill_inflight: Arc<(Mutex<usize>, Condvar)>,
    /// Files protected from eviction until the next GC cycle.
    delayed: Mutex<HashSet<PathBuf>>,
    pending_evict: Mutex<Vec<PathBuf>>,
    dfs_reads: AtomicU64,
    ssd_reads: AtomicU64,
    ssd_writes: AtomicU64,
}

impl PersistentCache {
    pub fn open(cache_dir: &Path, options: CacheOptions) -> Result<Arc<Self>> {
        if options.clean_on_start && cache_dir.exists() {
            std::fs::remove_dir_all(cache_dir)?;
        }
        std::fs::create_dir_all(cache_dir)?;
        let lock = crate::flock::FileLock::lock(cache_dir.join("cache.lock"))?;

        let local = crate::dfs::LocalDfs::new();
        let meta = Arc::new(MetaStore::open(local, &cache_dir.join("meta"))?);

        let count = (options.capacity / options.dataset_size).max(1) as u32;
        let mut datasets = Vec::with_capacity(count as usize);
        for sid in 0..count {
            let dataset = DataSet::open(
                &cache_dir.join(format!("data_{:04}", sid)),
                sid,
                options.dataset_size,
                options.block_size,
            )?;
            dataset.restore(&meta.load_dataset(sid)?);
            datasets.push(Arc::new(dataset));
        }
        tracing::info!(
            dir = %cache_dir.display(),
            datasets = count,
            block_size = options.block_size,
            "persistent cache loaded"
        );

        let cache = Arc::new(Self {
            datasets,
            meta,
            _lock: lock,
            block_size: options.block_size,
            fill_tx: Mutex::new(None),
            fill_inflight: Arc::new((Mutex::new(0), Condvar::new())),
            delayed: Mutex::new(HashSet::new()),
            pending_evict: Mutex::new(Vec::new()),
            dfs_reads: AtomicU64::new(0),
            ssd_reads: AtomicU64::new(0),
            ssd_writes: AtomicU64::new(0),
        });
        cache.start_fill_worker();
        Ok(cache)
    }

    fn start_fill_worker(self: &Arc<Self>) {
        let (tx, rx) = mpsc::channel::<FillTask>();
        *self.fill_tx.lock().unwrap() = Some(tx);
        let cache = Arc::downgrade(self);
        std::thread::Builder::new()
            .name("cache-fill".into())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    let cache = match cache.upgrade() {
                        Some(cache) => cache,
                        None => break,
                    };
                    cache.fill_one(task);
                }
            })
            .expect("spawn cache-fill worker");
    }

    /// Log the slot record, then write the bytes. Logging first means a
    /// crash can leave a slot mapped to stale bytes, which the SSTable
    /// layer's block checksums catch on read.
    fn fill_one(&self, task: FillTask) {
        let record = SlotRecord {
            sid: task.dataset.sid,
            slot: task.block.slot,
            fid: task.block.fid,
            block_idx: task.block.block_idx,
            len: task.data.len() as u32,
            state: STATE_VALID,
        };
        let ok = self
            .meta
            .log_slot(&record)
            .and_then(|_| task.dataset.write_slot(task.block.slot, &task.data))
            .is_ok();
        if ok {
            self.ssd_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::warn!(
                fid = task.block.fid,
                block_idx = task.block.block_idx,
                "cache fill failed"
            );
        }
        task.block.fill_done(ok);

        let (count, cv) = &*self.fill_inflight;
        *count.lock().unwrap() -= 1;
        cv.notify_all();
    }

    fn enqueue_fill(&self, dataset: Arc<DataSet>, block: Arc<CacheBlock>, data: Vec<u8>) {
        let tx = self.fill_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            let (count, _) = &*self.fill_inflight;
            *count.lock().unwrap() += 1;
            if tx
                .send(FillTask {
                    dataset,
                    block,
                    data,
                })
                .is_err()
            {
                *self.fill_inflight.0.lock().unwrap() -= 1;
            }
        }
    }

    /// Block until every queued fill has landed. Used by tests and by
    /// shutdown.
    pub fn drain_fills(&self) {
        let (count, cv) = &*self.fill_inflight;
        let mut count = count.lock().unwrap();
        while *count > 0 {
            count = cv.wait(count).unwrap();
        }
    }

    fn dataset_for(&self, fid: u64, block_idx: u64) -> &Arc<DataSet> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        (fid, block_idx).hash(&mut hasher);
        &self.datasets[(hasher.finish() as usize) % self.datasets.len()]
    }

    pub fn file_id(&self, path: &Path) -> Result<u64> {
        self.meta.file_id(path)
    }

    /// Cached positioned read. Returns the bytes read (short at EOF). Any
    /// per-block failure degrades the whole request to a direct DFS read.
    pub fn read_file(
        &self,
        base: &Arc<dyn RandomAccessFile>,
        fid: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        match self.read_blocks(base, fid, offset, buf) {
            Ok(read) => Ok(read),
            Err(err) => {
                tracing::warn!(fid, error = %err, "cache read degraded to direct DFS");
                self.dfs_reads.fetch_add(1, Ordering::Relaxed);
                base.read_at(offset, buf)
            }
        }
    }

    fn read_blocks(
        &self,
        base: &Arc<dyn RandomAccessFile>,
        fid: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let bs = self.block_size;
        let first = offset / bs;
        let last = (offset + buf.len() as u64 - 1) / bs;

        // Partition into resident, missing and in-flight blocks. A failed
        // admission releases every block this request already locked.
        let mut valid = Vec::new();
        let mut miss: Vec<(Arc<DataSet>, Arc<CacheBlock>)> = Vec::new();
        let mut locked = Vec::new();
        for idx in first..=last {
            let dataset = self.dataset_for(fid, idx).clone();
            let block = match dataset.lookup_or_alloc(fid, idx) {
                Ok((block, _evicted)) => block,
                Err(err) => {
                    for (_, block) in &miss {
                        block.abandon();
                    }
                    return Err(err);
                }
            };
            match block.classify_for_read() {
                BlockDisposition::Valid => valid.push((dataset, block)),
                BlockDisposition::Miss => miss.push((dataset, block)),
                BlockDisposition::InFlight => locked.push((dataset, block)),
            }
        }

        let mut parts: Vec<(u64, Vec<u8>)> = Vec::with_capacity((last - first + 1) as usize);

        // Missing blocks come from the DFS, in parallel, and are handed to
        // the fill queue.
        let miss_results: Vec<(u64, Result<Vec<u8>>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = miss
                .iter()
                .map(|(_, block)| {
                    let base = base.clone();
                    let idx = block.block_idx;
                    scope.spawn(move || {
                        let mut data = vec![0u8; bs as usize];
                        let read = base.read_at(idx * bs, &mut data)?;
                        data.truncate(read);
                        Ok((idx, data))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join().unwrap() {
                    Ok((idx, data)) => (idx, Ok(data)),
                    Err(e) => (u64::MAX, Err(e)),
                })
                .collect()
        });
        let mut first_err = None;
        for ((dataset, block), (_, result)) in miss.iter().zip(miss_results) {
            self.dfs_reads.fetch_add(1, Ordering::Relaxed);
            match result {
                Ok(data) if data.is_empty() => {
                    // Entirely past EOF; nothing worth caching.
                    block.abandon();
                }
                Ok(data) => {
                    block.publish(data.clone());
                    parts.push((block.block_idx, data.clone()));
                    self.enqueue_fill(dataset.clone(), block.clone(), data);
                }
                Err(err) => {
                    block.abandon();
                    first_err.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        // Resident blocks come from SSD (or the in-memory copy while their
        // fill is still queued).
        for (dataset, block) in &valid {
            let data = match block.in_memory() {
                Some(data) => data,
                None => {
                    self.ssd_reads.fetch_add(1, Ordering::Relaxed);
                    dataset.read_slot(block.slot, block.len())?
                }
            };
            parts.push((block.block_idx, data));
        }

        // In-flight blocks: wait for whoever holds them.
        for (dataset, block) in &locked {
            if !block.wait_readable() {
                return Err(crate::errcorrupt!(
                    "in-flight cache block abandoned (fid {}, idx {})",
                    fid,
                    block.block_idx
                ));
            }
            let data = match block.in_memory() {
                Some(data) => data,
                None => {
                    self.ssd_reads.fetch_add(1, Ordering::Relaxed);
                    dataset.read_slot(block.slot, block.len())?
                }
            };
            parts.push((block.block_idx, data));
        }

        // Assemble the caller's range from the block parts.
        let mut read_total = 0usize;
        for (idx, data) in parts {
            let block_start = idx * bs;
            let copy_from = offset.max(block_start);
            let data_offset = (copy_from - block_start) as usize;
            if data_offset >= data.len() {
                continue;
            }
            let buf_offset = (copy_from - offset) as usize;
            let available = data.len() - data_offset;
            let wanted = buf.len() - buf_offset;
            let take = available.min(wanted);
            buf[buf_offset..buf_offset + take]
                .copy_from_slice(&data[data_offset..data_offset + take]);
            read_total = read_total.max(buf_offset + take);
        }
        Ok(read_total)
    }

    /// Cache-through for a block of a table being written to the DFS.
    pub fn fill_on_write(&self, fid: u64, block_idx: u64, data: Vec<u8>) -> Result<()> {
        let dataset = self.dataset_for(fid, block_idx).clone();
        let (block, _evicted) = dataset.lookup_or_alloc(fid, block_idx)?;
        if let BlockDisposition::Miss = block.classify_for_read() {
            block.publish(data.clone());
            self.enqueue_fill(dataset, block, data);
        }
        Ok(())
    }

    /// Protect a file from eviction until the next GC cycle.
    pub fn mark_delayed(&self, path: &Path) {
        self.delayed.lock().unwrap().insert(path.to_path_buf());
    }

    /// Purge every block of a deleted file now, or defer to the next GC
    /// cycle when the file sits on the delayed list.
    pub fn delete_file(&self, path: &Path) -> Result<()> {
        if self.delayed.lock().unwrap().contains(path) {
            tracing::info!(path = %path.display(), "cache eviction deferred one gc cycle");
            self.pending_evict.lock().unwrap().push(path.to_path_buf());
            return Ok(());
        }
        self.evict_now(path)
    }

    fn evict_now(&self, path: &Path) -> Result<()> {
        let fid = match self.meta.drop_file(path)? {
            Some(fid) => fid,
            None => return Ok(()),
        };
        for dataset in &self.datasets {
            for slot in dataset.evict_file(fid) {
                self.meta.clear_slot(dataset.sid, slot)?;
            }
        }
        Ok(())
    }

    /// One GC cycle: run deferred evictions, forget the delay list and let
    /// the metadata engine catch up on background work.
    pub fn gc_tick(&self) -> Result<()> {
        let pending: Vec<PathBuf> = self.pending_evict.lock().unwrap().drain(..).collect();
        for path in &pending {
            self.evict_now(path)?;
        }
        self.delayed.lock().unwrap().clear();
        self.meta_maintain();
        Ok(())
    }

    fn meta_maintain(&self) {
        if let Err(err) = self.meta.engine().background_work() {
            tracing::warn!(error = %err, "cache metadata maintenance failed");
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            dfs_reads: self.dfs_reads.load(Ordering::Relaxed),
            ssd_reads: self.ssd_reads.load(Ordering::Relaxed),
            ssd_writes: self.ssd_writes.load(Ordering::Relaxed),
        }
    }

    /// File ids with resident blocks, across all data sets.
    pub fn resident_fids(&self) -> Vec<u64> {
        use itertools::Itertools;
        self.datasets
            .iter()
            .flat_map(|ds| ds.resident_fids())
            .sorted_unstable()
            .dedup()
            .collect()
    }
}

/// DFS layer routing SSTable traffic through the persistent cache.
pub struct CachedDfs {
    base: Arc<dyn Dfs>,
    cache: Arc<PersistentCache>,
}

impl CachedDfs {
    pub fn new(base: Arc<dyn Dfs>, cache: Arc<PersistentCache>) -> Arc<dyn Dfs> {
        Arc::new(Self { base, cache })
    }
}

fn is_table_file(path: &Path) -> bool {
    path.extension().map(|e| e == "sst").unwrap_or(false)
}

impl Dfs for CachedDfs {
    fn open_sequential(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        self.base.open_sequential(path)
    }

    fn open_random(&self, path: &Path) -> Result<Arc<dyn RandomAccessFile>> {
        let base = self.base.open_random(path)?;
        if !is_table_file(path) {
            return Ok(base);
        }
        let fid = self.cache.file_id(path)?;
        Ok(Arc::new(CachedRandomFile {
            base,
            cache: self.cache.clone(),
            fid,
        }))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let base = self.base.create(path)?;
        if !is_table_file(path) {
            return Ok(base);
        }
        let fid = self.cache.file_id(path)?;
        Ok(Box::new(CachedWritableFile {
            base,
            cache: self.cache.clone(),
            fid,
            block_idx: 0,
            buffer: Vec::new(),
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.base.exists(path)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        self.base.file_size(path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.base.list_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.base.create_dir_all(path)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        if is_table_file(path) {
            self.cache.delete_file(path)?;
        }
        self.base.delete(path)
    }

    fn delete_dir_all(&self, path: &Path) -> Result<()> {
        self.base.delete_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.base.rename(from, to)
    }
}

struct CachedRandomFile {
    base: Arc<dyn RandomAccessFile>,
    cache: Arc<PersistentCache>,
    fid: u64,
}

impl RandomAccessFile for CachedRandomFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.cache.read_file(&self.base, self.fid, offset, buf)
    }

    fn len(&self) -> Result<u64> {
        self.base.len()
    }
}

/// Double-buffered cache-through writer: bytes go to the DFS synchronously;
/// each completed cache block is queued for an asynchronous SSD fill.
struct CachedWritableFile {
    base: Box<dyn WritableFile>,
    cache: Arc<PersistentCache>,
    fid: u64,
    block_idx: u64,
    buffer: Vec<u8>,
}

impl CachedWritableFile {
    fn spill_full_blocks(&mut self) {
        let bs = self.cache.block_size as usize;
        while self.buffer.len() >= bs {
            let rest = self.buffer.split_off(bs);
            let full = std::mem::replace(&mut self.buffer, rest);
            if let Err(err) = self.cache.fill_on_write(self.fid, self.block_idx, full) {
                tracing::warn!(fid = self.fid, error = %err, "write-through fill skipped");
            }
            self.block_idx += 1;
        }
    }
}

impl WritableFile for CachedWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.base.append(data)?;
        self.buffer.extend_from_slice(data);
        self.spill_full_blocks();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.base.flush()
    }

    fn sync(&mut self) -> Result<()> {
        self.base.sync()
    }
}

impl Drop for CachedWritableFile {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            let _ = self.cache.fill_on_write(self.fid, self.block_idx, tail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfs::LocalDfs;

    fn small_cache(dir: &Path) -> Arc<PersistentCache> {
        PersistentCache::open(
            &dir.join("cache"),
            CacheOptions {
                capacity: 2 << 20,
                dataset_size: 1 << 20,
                block_size: 4096,
                clean_on_start: false,
            },
        )
        .unwrap()
    }

    fn write_remote(dfs: &dyn Dfs, path: &Path, len: usize) -> Vec<u8> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut file = dfs.create(path).unwrap();
        file.append(&data).unwrap();
        file.sync().unwrap();
        data
    }

    #[test]
    fn test_miss_then_hit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let remote = LocalDfs::new();
        let path = dir.path().join("000001.sst");
        let data = write_remote(remote.as_ref(), &path, 10_000);

        let cache = small_cache(dir.path());
        let base = remote.open_random(&path)?;
        let fid = cache.file_id(&path)?;

        // First read: DFS reads and SSD writes.
        let mut buf = vec![0u8; 5000];
        let read = cache.read_file(&base, fid, 2000, &mut buf)?;
        assert_eq!(read, 5000);
        assert_eq!(&buf[..], &data[2000..7000]);
        cache.drain_fills();
        let first = cache.stats();
        assert!(first.dfs_reads > 0);
        assert!(first.ssd_writes > 0);

        // Second read of the same range: SSD only.
        let mut buf2 = vec![0u8; 5000];
        cache.read_file(&base, fid, 2000, &mut buf2)?;
        let second = cache.stats();
        assert_eq!(second.dfs_reads, first.dfs_reads);
        assert!(second.ssd_reads > first.ssd_reads);
        assert_eq!(buf2, buf);
        Ok(())
    }

    #[test]
    fn test_survives_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let remote = LocalDfs::new();
        let path = dir.path().join("000002.sst");
        let data = write_remote(remote.as_ref(), &path, 8192);

        {
            let cache = small_cache(dir.path());
            let base = remote.open_random(&path)?;
            let fid = cache.file_id(&path)?;
            let mut buf = vec![0u8; 8192];
            cache.read_file(&base, fid, 0, &mut buf)?;
            cache.drain_fills();
        }

        let cache = small_cache(dir.path());
        let base = remote.open_random(&path)?;
        let fid = cache.file_id(&path)?;
        let mut buf = vec![0u8; 8192];
        cache.read_file(&base, fid, 0, &mut buf)?;
        assert_eq!(buf, data);
        // Everything came from SSD after reload.
        assert_eq!(cache.stats().dfs_reads, 0);
        assert!(cache.stats().ssd_reads > 0);
        Ok(())
    }

    #[test]
    fn test_delete_purges_fid() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let remote = LocalDfs::new();
        let path = dir.path().join("000003.sst");
        write_remote(remote.as_ref(), &path, 9000);

        let cache = small_cache(dir.path());
        let base = remote.open_random(&path)?;
        let fid = cache.file_id(&path)?;
        let mut buf = vec![0u8; 9000];
        cache.read_file(&base, fid, 0, &mut buf)?;
        cache.drain_fills();
        assert_eq!(cache.resident_fids(), vec![fid]);

        cache.delete_file(&path)?;
        assert!(cache.resident_fids().is_empty());
        Ok(())
    }

    #[test]
    fn test_delayed_gc_defers_one_cycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let remote = LocalDfs::new();
        let path = dir.path().join("000004.sst");
        write_remote(remote.as_ref(), &path, 4096);

        let cache = small_cache(dir.path());
        let base = remote.open_random(&path)?;
        let fid = cache.file_id(&path)?;
        let mut buf = vec![0u8; 4096];
        cache.read_file(&base, fid, 0, &mut buf)?;
        cache.drain_fills();

        cache.mark_delayed(&path);
        cache.delete_file(&path)?;
        // Still resident: the delete was deferred.
        assert_eq!(cache.resident_fids(), vec![fid]);

        cache.gc_tick()?;
        assert!(cache.resident_fids().is_empty());
        Ok(())
    }

    #[test]
    fn test_write_through_caches_new_table() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let remote: Arc<dyn Dfs> = LocalDfs::new();
        let cache = small_cache(dir.path());
        let layered = CachedDfs::new(remote.clone(), cache.clone());

        let path = dir.path().join("000005.sst");
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 199) as u8).collect();
        {
            let mut file = layered.create(&path)?;
            file.append(&data)?;
            file.sync()?;
        }
        cache.drain_fills();
        assert!(cache.stats().ssd_writes > 0);

        // The DFS copy is intact.
        assert_eq!(layered.file_size(&path)?, data.len() as u64);

        // And reads through the layer hit the cache for the cached prefix.
        let file = layered.open_random(&path)?;
        let mut buf = vec![0u8; 8192];
        file.read_at(0, &mut buf)?;
        assert_eq!(&buf[..], &data[..8192]);
        Ok(())
    }

    #[test]
    fn test_degrades_to_direct_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let remote = LocalDfs::new();
        let path = dir.path().join("000006.sst");
        let data = write_remote(remote.as_ref(), &path, 8192);

        // A single one-slot data set: the second block of the request
        // cannot be admitted while the first holds the slot, so the whole
        // request degrades to a direct DFS read.
        let cache = PersistentCache::open(
            &dir.path().join("cache"),
            CacheOptions {
                capacity: 4096,
                dataset_size: 4096,
                block_size: 4096,
                clean_on_start: false,
            },
        )?;
        let base = remote.open_random(&path)?;
        let fid = cache.file_id(&path)?;

        let mut buf = vec![0u8; 8192];
        let read = cache.read_file(&base, fid, 0, &mut buf)?;
        assert_eq!(read, 8192);
        assert_eq!(buf, data);

        // A later read of just the first block must not hang on a block
        // left locked by the degraded request.
        let mut one = vec![0u8; 4096];
        cache.read_file(&base, fid, 0, &mut one)?;
        assert_eq!(&one[..], &data[..4096]);
        Ok(())
    }
}
