//! Persistent-cache metadata store.
//!
//! A small embedded [`Engine`] persists two key families so data-set
//! indexes survive restart:
//!
//! ```text
//! FID#                    -> next ungranted file id (u64 LE)
//! FNAME#<path>            -> file id (u64 LE)
//! DS#<sid:u32><slot:u32>  -> fid:u64 | block_idx:u64 | len:u32 | state:u32  (all LE)
//! ```
//!
//! File ids are granted in batches: the durable `FID#` counter is rounded
//! up a whole batch ahead of the ids actually handed out, so a crash can
//! skip ids but never reuse one. Data-set records are keyed by slot, so
//! re-filling a slot overwrites the previous occupant's record in place.

use std::path::Path;
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use crate::blockcache::lockmap::LockKeyMap;
use crate::dfs::Dfs;
use crate::engine::sstable::TableCache;
use crate::engine::writer::WriteBatch;
use crate::engine::{Engine, EngineOptions};
use crate::errcorrupt;
use crate::error::Result;

const FID_KEY: &[u8] = b"FID#";
const FNAME_PREFIX: &[u8] = b"FNAME#";
const DS_PREFIX: &[u8] = b"DS#";

/// Ids granted per durable counter bump.
pub const FID_BATCH: u64 = 10_000;

/// One recovered data-set index record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    pub sid: u32,
    pub slot: u32,
    pub fid: u64,
    pub block_idx: u64,
    pub len: u32,
    pub state: u32,
}

pub struct MetaStore {
    engine: Arc<Engine>,
    fid_lock: LockKeyMap<Vec<u8>, u64>,
    /// Next id to hand out; the durable counter stays a batch ahead.
    next_fid: Mutex<u64>,
}

impl MetaStore {
    pub fn open(dfs: Arc<dyn Dfs>, dir: &Path) -> Result<Self> {
        let table_cache = Arc::new(TableCache::new(dfs.clone(), 16, None));
        let options = EngineOptions {
            write_buffer_size: 1 << 20,
            bloom_filter: false,
            ..Default::default()
        };
        let engine = Engine::open(dfs, table_cache, dir, &[], vec![], vec![], options)?;

        let next_fid = match engine.get(FID_KEY, None)? {
            Some(value) if value.len() == 8 => LittleEndian::read_u64(&value),
            Some(_) => return Err(errcorrupt!("malformed FID# counter")),
            None => 0,
        };
        Ok(Self {
            engine,
            fid_lock: LockKeyMap::new(),
            next_fid: Mutex::new(next_fid),
        })
    }

    /// The embedded engine, for maintenance ticks.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// File id for `path`, allocating one on first sight.
    pub fn file_id(&self, path: &Path) -> Result<u64> {
        let key = fname_key(path);
        if let Some(value) = self.engine.get(&key, None)? {
            if value.len() != 8 {
                return Err(errcorrupt!("malformed FNAME# record"));
            }
            return Ok(LittleEndian::read_u64(&value));
        }
        self.fid_lock.get_or_create(key.clone(), || {
            // Re-check: a concurrent creator may have published it.
            if let Some(value) = self.engine.get(&key, None)? {
                return Ok(LittleEndian::read_u64(&value));
            }
            let fid = self.grant_fid()?;
            let mut value = [0u8; 8];
            LittleEndian::write_u64(&mut value, fid);
            let mut batch = WriteBatch::new();
            batch.put(&key, &value);
            self.engine.write(batch, true)?;
            Ok(fid)
        })
    }

    fn grant_fid(&self) -> Result<u64> {
        let mut next = self.next_fid.lock().unwrap();
        let fid = *next;
        if fid % FID_BATCH == 0 {
            // Round the durable counter a whole batch ahead.
            let mut value = [0u8; 8];
            LittleEndian::write_u64(&mut value, fid + FID_BATCH);
            let mut batch = WriteBatch::new();
            batch.put(FID_KEY, &value);
            self.engine.write(batch, true)?;
        }
        *next = fid + 1;
        Ok(fid)
    }

    /// Forget a deleted file's name binding, returning the id it had.
    pub fn drop_file(&self, path: &Path) -> Result<Option<u64>> {
        let key = fname_key(path);
        let fid = match self.engine.get(&key, None)? {
            Some(value) if value.len() == 8 => LittleEndian::read_u64(&value),
            Some(_) => return Err(errcorrupt!("malformed FNAME# record")),
            None => return Ok(None),
        };
        let mut batch = WriteBatch::new();
        batch.delete(&key);
        self.engine.write(batch, true)?;
        Ok(Some(fid))
    }

    /// Log a slot's occupant. Must be durable before the slot's bytes are
    /// written, so recovery never maps a slot to data it does not hold.
    pub fn log_slot(&self, record: &SlotRecord) -> Result<()> {
        let mut value = [0u8; 24];
        LittleEndian::write_u64(&mut value[..8], record.fid);
        LittleEndian::write_u64(&mut value[8..16], record.block_idx);
        LittleEndian::write_u32(&mut value[16..20], record.len);
        LittleEndian::write_u32(&mut value[20..], record.state);
        let mut batch = WriteBatch::new();
        batch.put(&ds_key(record.sid, record.slot), &value);
        self.engine.write(batch, true)
    }

    pub fn clear_slot(&self, sid: u32, slot: u32) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(&ds_key(sid, slot));
        self.engine.write(batch, true)
    }

    /// Replay every slot record of data-set `sid`.
    pub fn load_dataset(&self, sid: u32) -> Result<Vec<SlotRecord>> {
        let mut prefix = DS_PREFIX.to_vec();
        let mut sid_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut sid_bytes, sid);
        prefix.extend_from_slice(&sid_bytes);

        let mut records = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for entry in self.engine.iter_at(None, Some(&prefix))? {
            let (key, value) = entry?;
            if !key.raw_key.starts_with(&prefix) {
                break;
            }
            if key.raw_key.len() != prefix.len() + 4 {
                return Err(errcorrupt!("malformed DS# key"));
            }
            // Versions arrive newest first; only a slot's newest entry
            // counts, and a tombstone kills the slot outright.
            let slot = LittleEndian::read_u32(&key.raw_key[prefix.len()..]);
            if !seen.insert(slot) {
                continue;
            }
            if key.kind == crate::engine::key::ValueKind::Deletion {
                continue;
            }
            if value.len() != 24 {
                return Err(errcorrupt!("malformed DS# record"));
            }
            records.push(SlotRecord {
                sid,
                slot,
                fid: LittleEndian::read_u64(&value[..8]),
                block_idx: LittleEndian::read_u64(&value[8..16]),
                len: LittleEndian::read_u32(&value[16..20]),
                state: LittleEndian::read_u32(&value[20..]),
            });
        }
        Ok(records)
    }
}

fn fname_key(path: &Path) -> Vec<u8> {
    let mut key = FNAME_PREFIX.to_vec();
    key.extend_from_slice(path.to_string_lossy().as_bytes());
    key
}

fn ds_key(sid: u32, slot: u32) -> Vec<u8> {
    let mut key = DS_PREFIX.to_vec();
    let mut buf = [0u8; 8];
    LittleEndian::write_u32(&mut buf[..4], sid);
    LittleEndian::write_u32(&mut buf[4..], slot);
    key.extend_from_slice(&buf);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfs::LocalDfs;

    fn open_meta(dir: &Path) -> MetaStore {
        MetaStore::open(LocalDfs::new(), dir).unwrap()
    }

    #[test]
    fn test_fid_allocation_is_stable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let meta = open_meta(dir.path());

        let a = meta.file_id(Path::new("/dfs/t/tablet1/lg0/000003.sst"))?;
        let b = meta.file_id(Path::new("/dfs/t/tablet1/lg0/000004.sst"))?;
        assert_ne!(a, b);
        // Same path, same id.
        assert_eq!(meta.file_id(Path::new("/dfs/t/tablet1/lg0/000003.sst"))?, a);
        Ok(())
    }

    #[test]
    fn test_fid_counter_never_reuses_after_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let first = {
            let meta = open_meta(dir.path());
            meta.file_id(Path::new("/a"))?
        };
        // Restart: the durable counter was rounded a batch ahead, so new
        // grants land beyond every previously issued id.
        let meta = open_meta(dir.path());
        let second = meta.file_id(Path::new("/b"))?;
        assert!(second > first);
        assert_eq!(second % FID_BATCH, 0);
        Ok(())
    }

    #[test]
    fn test_drop_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let meta = open_meta(dir.path());
        let fid = meta.file_id(Path::new("/x"))?;
        assert_eq!(meta.drop_file(Path::new("/x"))?, Some(fid));
        assert_eq!(meta.drop_file(Path::new("/x"))?, None);
        Ok(())
    }

    #[test]
    fn test_slot_records_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let meta = open_meta(dir.path());

        for slot in 0..4u32 {
            meta.log_slot(&SlotRecord {
                sid: 2,
                slot,
                fid: 100 + slot as u64,
                block_idx: slot as u64 * 7,
                len: 4096,
                state: 1,
            })?;
        }
        // Overwrite one slot and clear another.
        meta.log_slot(&SlotRecord {
            sid: 2,
            slot: 1,
            fid: 555,
            block_idx: 9,
            len: 512,
            state: 1,
        })?;
        meta.clear_slot(2, 3)?;

        let mut records = meta.load_dataset(2)?;
        records.sort_by_key(|r| r.slot);
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].fid, 555);
        assert_eq!(records[1].len, 512);

        // Another data-set is invisible.
        assert!(meta.load_dataset(3)?.is_empty());
        Ok(())
    }
}
