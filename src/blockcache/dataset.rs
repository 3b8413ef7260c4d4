//! One persistent-cache data set: a preallocated backing file divided into
//! fixed-size slots, plus the in-memory index mapping `(fid, block_idx)` to
//! a slot.
//!
//! Slot eviction is LRU over unlocked blocks; a block mid-read or mid-fill
//! is never evicted. The index is rebuilt at startup from the metadata
//! store's `DS#` records, so the cache survives process restart.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};

use crate::errcorrupt;
use crate::error::{Error, Result};

pub const STATE_VALID: u32 = 0x1;
pub const STATE_LOCKED: u32 = 0x2;
pub const STATE_DFS_READ: u32 = 0x4;
pub const STATE_CACHE_READ: u32 = 0x8;
pub const STATE_CACHE_FILL: u32 = 0x10;

/// Tracking unit of the persistent cache: one fixed-size slice of one
/// SSTable, pinned to a slot of one data set.
pub struct CacheBlock {
    pub fid: u64,
    pub block_idx: u64,
    pub sid: u32,
    pub slot: u32,
    state: Mutex<BlockState>,
    changed: Condvar,
}

struct BlockState {
    bits: u32,
    /// Bytes held in memory while the block is in flight; dropped once the
    /// SSD copy is authoritative.
    data: Option<Vec<u8>>,
    len: u32,
}

impl CacheBlock {
    fn new(fid: u64, block_idx: u64, sid: u32, slot: u32, bits: u32, len: u32) -> Arc<Self> {
        Arc::new(Self {
            fid,
            block_idx,
            sid,
            slot,
            state: Mutex::new(BlockState {
                bits,
                data: None,
                len,
            }),
            changed: Condvar::new(),
        })
    }

    pub fn state_bits(&self) -> u32 {
        self.state.lock().unwrap().bits
    }

    /// Classify for the read path: lock a missing block for DFS fetch,
    /// pass a valid block through, report an in-flight one.
    pub fn classify_for_read(&self) -> BlockDisposition {
        let mut state = self.state.lock().unwrap();
        if state.bits & STATE_LOCKED != 0 {
            BlockDisposition::InFlight
        } else if state.bits & STATE_VALID != 0 {
            state.bits |= STATE_CACHE_READ;
            BlockDisposition::Valid
        } else {
            state.bits |= STATE_LOCKED | STATE_DFS_READ;
            BlockDisposition::Miss
        }
    }

    /// Publish DFS bytes and hand the block to the fill queue. Readers can
    /// use the in-memory copy immediately; the lock clears when the SSD
    /// write lands.
    pub fn publish(&self, data: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.len = data.len() as u32;
        state.data = Some(data);
        state.bits &= !STATE_DFS_READ;
        state.bits |= STATE_VALID | STATE_CACHE_FILL;
        drop(state);
        self.changed.notify_all();
    }

    /// The fill worker finished (or failed); unlock and drop the in-memory
    /// copy on success.
    pub fn fill_done(&self, ok: bool) {
        let mut state = self.state.lock().unwrap();
        state.bits &= !(STATE_CACHE_FILL | STATE_LOCKED);
        if ok {
            state.data = None;
        } else {
            // The SSD copy is not trustworthy; the in-memory bytes remain
            // usable until eviction.
            state.bits &= !STATE_VALID;
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Abandon a locked miss whose DFS read failed.
    pub fn abandon(&self) {
        let mut state = self.state.lock().unwrap();
        state.bits &= !(STATE_LOCKED | STATE_DFS_READ | STATE_CACHE_FILL);
        drop(state);
        self.changed.notify_all();
    }

    /// Wait until the block is readable or abandoned. Returns whether it
    /// ended up valid.
    pub fn wait_readable(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.bits & STATE_LOCKED != 0 && state.bits & STATE_VALID == 0 {
            state = self.changed.wait(state).unwrap();
        }
        state.bits & STATE_VALID != 0
    }

    pub fn in_memory(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().data.clone()
    }

    pub fn len(&self) -> u32 {
        self.state.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_evictable(&self) -> bool {
        self.state.lock().unwrap().bits & STATE_LOCKED == 0
    }

    fn invalidate(&self) {
        let mut state = self.state.lock().unwrap();
        state.bits &= !STATE_VALID;
        state.data = None;
    }
}

pub enum BlockDisposition {
    Valid,
    Miss,
    InFlight,
}

struct DataSetIndex {
    by_key: HashMap<(u64, u64), Arc<CacheBlock>>,
    /// Recency queue of slots; stale entries are skipped at eviction.
    recency: Vec<u32>,
    free: Vec<u32>,
}

pub struct DataSet {
    pub sid: u32,
    file: File,
    block_size: u64,
    slots: u32,
    index: Mutex<DataSetIndex>,
}

impl DataSet {
    /// Open or create the backing file with `capacity` bytes preallocated.
    pub fn open(path: &Path, sid: u32, capacity: u64, block_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let slots = (capacity / block_size) as u32;
        if slots == 0 {
            return Err(crate::errinput!("data set smaller than one block"));
        }
        // Reserve the full extent up front so fills never hit ENOSPC
        // mid-write.
        if file.metadata()?.len() < capacity {
            let rc = unsafe {
                libc::posix_fallocate(
                    std::os::unix::io::AsRawFd::as_raw_fd(&file),
                    0,
                    capacity as libc::off_t,
                )
            };
            if rc != 0 {
                file.set_len(capacity)?;
            }
        }
        Ok(Self {
            sid,
            file,
            block_size,
            slots,
            index: Mutex::new(DataSetIndex {
                by_key: HashMap::new(),
                recency: Vec::new(),
                free: (0..slots).rev().collect(),
            }),
        })
    }

    /// Re-seed the index from recovered slot records.
    pub fn restore(&self, records: &[super::meta::SlotRecord]) {
        let mut index = self.index.lock().unwrap();
        for record in records {
            if record.state & STATE_VALID == 0 || record.slot >= self.slots {
                continue;
            }
            let block = CacheBlock::new(
                record.fid,
                record.block_idx,
                self.sid,
                record.slot,
                STATE_VALID,
                record.len,
            );
            index.by_key.insert((record.fid, record.block_idx), block);
            index.free.retain(|s| *s != record.slot);
            index.recency.push(record.slot);
        }
    }

    /// Existing block for the key, or a fresh one bound to a slot. The
    /// second return is the evicted occupant whose `DS#` record must be
    /// superseded. Fails when every slot is locked.
    pub fn lookup_or_alloc(
        &self,
        fid: u64,
        block_idx: u64,
    ) -> Result<(Arc<CacheBlock>, Option<Arc<CacheBlock>>)> {
        let mut index = self.index.lock().unwrap();
        if let Some(block) = index.by_key.get(&(fid, block_idx)) {
            let slot = block.slot;
            let block = block.clone();
            index.recency.push(slot);
            return Ok((block, None));
        }

        let (slot, evicted) = match index.free.pop() {
            Some(slot) => (slot, None),
            None => {
                let slot = self.pick_victim(&mut index)?;
                let victim = index
                    .by_key
                    .iter()
                    .find(|(_, b)| b.slot == slot)
                    .map(|(k, b)| (*k, b.clone()));
                let (key, victim) =
                    victim.ok_or_else(|| errcorrupt!("victim slot {} unmapped", slot))?;
                index.by_key.remove(&key);
                victim.invalidate();
                (slot, Some(victim))
            }
        };

        let block = CacheBlock::new(fid, block_idx, self.sid, slot, 0, 0);
        index.by_key.insert((fid, block_idx), block.clone());
        index.recency.push(slot);
        Ok((block, evicted))
    }

    fn pick_victim(&self, index: &mut DataSetIndex) -> Result<u32> {
        let mut position = 0;
        while position < index.recency.len() {
            let slot = index.recency[position];
            // A slot is a victim only at its oldest queue entry, and only
            // when unlocked.
            let newer = index.recency[position + 1..].contains(&slot);
            if !newer {
                if let Some(block) = index.by_key.values().find(|b| b.slot == slot) {
                    if block.is_evictable() {
                        index.recency.remove(position);
                        return Ok(slot);
                    }
                } else {
                    // Stale entry for a freed slot.
                    index.recency.remove(position);
                    continue;
                }
            } else {
                index.recency.remove(position);
                continue;
            }
            position += 1;
        }
        Err(Error::Io("all cache slots locked".into()))
    }

    /// Drop every block of `fid`, except blocks pinned by an in-flight
    /// operation. Returns the slots released.
    pub fn evict_file(&self, fid: u64) -> Vec<u32> {
        let mut index = self.index.lock().unwrap();
        let doomed: Vec<(u64, u64)> = index
            .by_key
            .iter()
            .filter(|((f, _), block)| *f == fid && block.is_evictable())
            .map(|(key, _)| *key)
            .collect();
        let mut slots = Vec::new();
        for key in doomed {
            if let Some(block) = index.by_key.remove(&key) {
                block.invalidate();
                index.free.push(block.slot);
                slots.push(block.slot);
            }
        }
        slots
    }

    pub fn read_slot(&self, slot: u32, len: u32) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let mut buf = vec![0u8; len as usize];
        self.file
            .read_exact_at(&mut buf, slot as u64 * self.block_size)?;
        Ok(buf)
    }

    pub fn write_slot(&self, slot: u32, data: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        if data.len() as u64 > self.block_size {
            return Err(errcorrupt!("cache block larger than slot"));
        }
        self.file.write_all_at(data, slot as u64 * self.block_size)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn resident_blocks(&self) -> usize {
        self.index.lock().unwrap().by_key.len()
    }

    pub fn resident_fids(&self) -> Vec<u64> {
        let index = self.index.lock().unwrap();
        let mut fids: Vec<u64> = index.by_key.keys().map(|(fid, _)| *fid).collect();
        fids.sort_unstable();
        fids.dedup();
        fids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_dataset(dir: &Path, slots: u32) -> DataSet {
        DataSet::open(&dir.join("data_0"), 0, slots as u64 * 4096, 4096).unwrap()
    }

    #[test]
    fn test_slot_io_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ds = open_dataset(dir.path(), 4);
        ds.write_slot(2, b"hello block")?;
        assert_eq!(ds.read_slot(2, 11)?, b"hello block");
        Ok(())
    }

    #[test]
    fn test_alloc_then_hit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ds = open_dataset(dir.path(), 4);

        let (first, evicted) = ds.lookup_or_alloc(7, 0)?;
        assert!(evicted.is_none());
        let (again, _) = ds.lookup_or_alloc(7, 0)?;
        assert_eq!(first.slot, again.slot);
        assert_eq!(ds.resident_blocks(), 1);
        Ok(())
    }

    #[test]
    fn test_eviction_prefers_cold_unlocked() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ds = open_dataset(dir.path(), 2);

        let (a, _) = ds.lookup_or_alloc(1, 0)?;
        a.publish(vec![1]);
        a.fill_done(true);
        let (b, _) = ds.lookup_or_alloc(1, 1)?;
        b.publish(vec![2]);
        b.fill_done(true);

        // Touch A so B is the cold one.
        let (_, _) = ds.lookup_or_alloc(1, 0)?;

        let (_, evicted) = ds.lookup_or_alloc(2, 0)?;
        let evicted = evicted.unwrap();
        assert_eq!(evicted.block_idx, 1);
        assert_eq!(evicted.state_bits() & STATE_VALID, 0);
        Ok(())
    }

    #[test]
    fn test_locked_block_never_evicted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ds = open_dataset(dir.path(), 1);

        let (block, _) = ds.lookup_or_alloc(1, 0)?;
        // Simulate an in-flight DFS read.
        assert!(matches!(block.classify_for_read(), BlockDisposition::Miss));

        assert!(ds.lookup_or_alloc(2, 0).is_err());
        block.publish(vec![9]);
        block.fill_done(true);
        assert!(ds.lookup_or_alloc(2, 0).is_ok());
        Ok(())
    }

    #[test]
    fn test_evict_file_frees_all_blocks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ds = open_dataset(dir.path(), 8);
        for idx in 0..3 {
            let (block, _) = ds.lookup_or_alloc(5, idx)?;
            block.publish(vec![0]);
            block.fill_done(true);
        }
        let (other, _) = ds.lookup_or_alloc(6, 0)?;
        other.publish(vec![0]);
        other.fill_done(true);

        assert_eq!(ds.evict_file(5).len(), 3);
        assert_eq!(ds.resident_fids(), vec![6]);
        Ok(())
    }

    #[test]
    fn test_restore_reseeds_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ds = open_dataset(dir.path(), 4);
        ds.restore(&[
            super::super::meta::SlotRecord {
                sid: 0,
                slot: 1,
                fid: 42,
                block_idx: 3,
                len: 100,
                state: STATE_VALID,
            },
            // Non-valid records are ignored.
            super::super::meta::SlotRecord {
                sid: 0,
                slot: 2,
                fid: 43,
                block_idx: 0,
                len: 0,
                state: 0,
            },
        ]);
        assert_eq!(ds.resident_blocks(), 1);
        let (block, evicted) = ds.lookup_or_alloc(42, 3)?;
        assert!(evicted.is_none());
        assert_eq!(block.slot, 1);
        assert_eq!(block.len(), 100);
        assert!(matches!(block.classify_for_read(), BlockDisposition::Valid));
        Ok(())
    }

    #[test]
    fn test_wait_readable_follows_publish() {
        let dir = tempfile::tempdir().unwrap();
        let ds = open_dataset(dir.path(), 2);
        let (block, _) = ds.lookup_or_alloc(9, 0).unwrap();
        assert!(matches!(block.classify_for_read(), BlockDisposition::Miss));

        let waiter = block.clone();
        let handle = std::thread::spawn(move || waiter.wait_readable());
        std::thread::sleep(std::time::Duration::from_millis(10));
        block.publish(b"bytes".to_vec());
        assert!(handle.join().unwrap());
        assert_eq!(block.in_memory().unwrap(), b"bytes");
    }
}
