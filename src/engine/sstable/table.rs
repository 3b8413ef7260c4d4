//! Immutable sorted table files.
//!
//! ```text
//! +--------------------+
//! | data block 1       |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | data block N       |
//! +--------------------+
//! | filter block       |  one Bloom filter per data block (optional)
//! +--------------------+
//! | index block        |  last key of each data block -> handle
//! +--------------------+
//! | footer (40 bytes)  |  index handle | filter handle | magic
//! +--------------------+
//! ```
//!
//! Every stored block carries a one-byte codec id and a CRC32 trailer. Data
//! blocks are the unit of caching: reads go through the server-wide block
//! cache keyed by `(file_number, offset)`.

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::cache::ShardedLru;
use crate::dfs::{RandomAccessFile, WritableFile};
use crate::engine::key::{InternalKey, Sequence, ValueKind};
use crate::engine::memtable::VersionEntry;
use crate::engine::snapshot::RollbackMap;
use crate::engine::sstable::block::{Block, BlockBuilder, BlockIterator};
use crate::engine::sstable::bloom::BloomFilter;
use crate::engine::sstable::index::{BlockHandle, Index};
use crate::errcorrupt;
use crate::error::Result;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const FOOTER_LEN: usize = 40;
const MAGIC: u64 = 0xEB7A_B1E5_57AB_1E00;
const BLOCK_TRAILER_LEN: usize = 5;
const CODEC_NONE: u8 = 0;

/// Target uncompressed size of one data block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Cache key for one data block: `(table cache id, block offset)`. The cache
/// id is allocated per open table rather than taken from the file number,
/// because the block cache is shared by every engine on the server and file
/// numbers are only unique within one engine.
pub type BlockCacheKey = (u64, u64);
pub type BlockCache = ShardedLru<BlockCacheKey, Block>;

static NEXT_CACHE_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Summary of a finished table, recorded in the version edit that adds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStats {
    pub file_size: u64,
    pub entries: u64,
    pub delete_tag_percent: u8,
    /// 99th-percentile cell expiry among TTL-carrying entries, microseconds
    /// since epoch. Zero when nothing expires.
    pub ttl_percentile_expiry: u64,
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
}

pub struct TableBuilder {
    file: Box<dyn WritableFile>,
    offset: u64,
    block: BlockBuilder,
    block_keys: Vec<Vec<u8>>,
    index: Index,
    filters: Vec<Vec<u8>>,
    bloom_enabled: bool,
    block_size: usize,
    last_key: Vec<u8>,
    smallest: Option<Vec<u8>>,
    entries: u64,
    delete_tags: u64,
    expiries: Vec<u64>,
}

impl TableBuilder {
    pub fn new(file: Box<dyn WritableFile>, block_size: usize, bloom_enabled: bool) -> Self {
        Self {
            file,
            offset: 0,
            block: BlockBuilder::new(),
            block_keys: Vec::new(),
            index: Index::new(),
            filters: Vec::new(),
            bloom_enabled,
            block_size,
            last_key: Vec::new(),
            smallest: None,
            entries: 0,
            delete_tags: 0,
            expiries: Vec::new(),
        }
    }

    /// Entries must arrive in internal-key order.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        let encoded = key.encode();
        if self.smallest.is_none() {
            self.smallest = Some(encoded.clone());
        }
        self.block.add(&encoded, value);
        self.block_keys.push(key.raw_key.clone());
        self.last_key = encoded;
        self.entries += 1;
        if key.kind == ValueKind::Deletion {
            self.delete_tags += 1;
        }
        if self.block.size_estimate() >= self.block_size {
            self.finish_data_block()?;
        }
        Ok(())
    }

    /// Expiry hint from the compaction strategy for a TTL-carrying cell.
    pub fn observe_expiry(&mut self, expiry_micros: u64) {
        self.expiries.push(expiry_micros);
    }

    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.size_estimate() as u64
    }

    fn finish_data_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(&mut self.block, BlockBuilder::new());
        let handle = self.write_block(&block.finish())?;
        self.index.push(self.last_key.clone(), handle);

        let keys: Vec<&[u8]> = self.block_keys.iter().map(|k| k.as_slice()).collect();
        if self.bloom_enabled {
            self.filters.push(BloomFilter::build(&keys).encode());
        }
        self.block_keys.clear();
        Ok(())
    }

    fn write_block(&mut self, payload: &[u8]) -> Result<BlockHandle> {
        let mut digest = CRC32.digest();
        digest.update(payload);
        digest.update(&[CODEC_NONE]);
        let mut trailer = [0u8; BLOCK_TRAILER_LEN];
        trailer[0] = CODEC_NONE;
        BigEndian::write_u32(&mut trailer[1..], digest.finalize());

        self.file.append(payload)?;
        self.file.append(&trailer)?;
        let handle = BlockHandle {
            offset: self.offset,
            size: (payload.len() + BLOCK_TRAILER_LEN) as u64,
        };
        self.offset += handle.size;
        Ok(handle)
    }

    /// Write the filter, index and footer, sync, and return the stats that
    /// go into the version edit.
    pub fn finish(mut self) -> Result<TableStats> {
        self.finish_data_block()?;

        let filter_handle = if self.filters.is_empty() {
            BlockHandle { offset: 0, size: 0 }
        } else {
            let mut buf = Vec::new();
            buf.write_u32::<BigEndian>(self.filters.len() as u32).unwrap();
            for filter in &self.filters {
                buf.write_u32::<BigEndian>(filter.len() as u32).unwrap();
            }
            for filter in &self.filters {
                buf.extend_from_slice(filter);
            }
            self.write_block(&buf)?
        };

        let index_bytes = self.index.encode();
        let index_handle = self.write_block(&index_bytes)?;

        let mut footer = Vec::with_capacity(FOOTER_LEN);
        index_handle.encode_into(&mut footer);
        filter_handle.encode_into(&mut footer);
        footer.write_u64::<BigEndian>(MAGIC).unwrap();
        self.file.append(&footer)?;
        self.offset += FOOTER_LEN as u64;
        self.file.sync()?;

        let delete_tag_percent = if self.entries == 0 {
            0
        } else {
            (self.delete_tags * 100 / self.entries) as u8
        };
        let ttl_percentile_expiry = percentile99(&mut self.expiries);

        Ok(TableStats {
            file_size: self.offset,
            entries: self.entries,
            delete_tag_percent,
            ttl_percentile_expiry,
            smallest: self.smallest.unwrap_or_default(),
            largest: self.last_key.clone(),
        })
    }
}

fn percentile99(values: &mut [u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    values[(values.len() - 1) * 99 / 100]
}

/// An open table: resident index and filters, block reads on demand.
pub struct Table {
    file: Arc<dyn RandomAccessFile>,
    file_number: u64,
    cache_id: u64,
    index: Index,
    filters: Vec<BloomFilter>,
    block_cache: Option<Arc<BlockCache>>,
}

impl Table {
    pub fn open(
        file: Arc<dyn RandomAccessFile>,
        file_number: u64,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Result<Arc<Self>> {
        let file_len = file.len()?;
        if file_len < FOOTER_LEN as u64 {
            return Err(errcorrupt!("table {} shorter than footer", file_number));
        }
        let mut footer = [0u8; FOOTER_LEN];
        file.read_at(file_len - FOOTER_LEN as u64, &mut footer)?;
        let mut cursor = Cursor::new(&footer[..]);
        let index_handle = BlockHandle::decode_from(&mut cursor)?;
        let filter_handle = BlockHandle::decode_from(&mut cursor)?;
        let magic = cursor.read_u64::<BigEndian>()?;
        if magic != MAGIC {
            return Err(errcorrupt!("table {} bad magic {:#x}", file_number, magic));
        }

        let index = Index::decode(&read_raw_block(file.as_ref(), index_handle)?)?;

        let filters = if filter_handle.size == 0 {
            Vec::new()
        } else {
            decode_filters(&read_raw_block(file.as_ref(), filter_handle)?)?
        };
        if !filters.is_empty() && filters.len() != index.len() {
            return Err(errcorrupt!(
                "table {}: {} filters for {} blocks",
                file_number,
                filters.len(),
                index.len()
            ));
        }

        Ok(Arc::new(Self {
            file,
            file_number,
            cache_id: NEXT_CACHE_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            index,
            filters,
            block_cache,
        }))
    }

    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Block-cache namespace of this open table.
    pub fn cache_id(&self) -> u64 {
        self.cache_id
    }

    fn read_block(&self, handle: BlockHandle) -> Result<Arc<Block>> {
        let cache_key = (self.cache_id, handle.offset);
        if let Some(cache) = &self.block_cache {
            if let Some(block) = cache.get(&cache_key) {
                return Ok(block);
            }
        }
        let block = Arc::new(Block::new(read_raw_block(self.file.as_ref(), handle)?)?);
        if let Some(cache) = &self.block_cache {
            cache.insert(cache_key, block.clone(), block.size());
        }
        Ok(block)
    }

    /// Append every version of `raw_key` visible at `snapshot`, newest
    /// first, stopping at the first base entry. Mirrors
    /// `MemTable::collect_visible` so the engine can fold sources together.
    /// Returns whether the probe actually touched a data block (a Bloom
    /// negative does not), which feeds seek charging.
    pub fn collect_visible(
        &self,
        raw_key: &[u8],
        snapshot: Sequence,
        rollbacks: &RollbackMap,
        out: &mut Vec<VersionEntry>,
    ) -> Result<bool> {
        let lookup = InternalKey::for_lookup(raw_key, snapshot).encode();
        let (ordinal, handle) = match self.index.find(&lookup) {
            Some(found) => found,
            None => return Ok(false),
        };
        if let Some(filter) = self.filters.get(ordinal) {
            if !filter.may_contain(raw_key) {
                return Ok(false);
            }
        }

        let mut ordinal = ordinal;
        let mut handle = handle;
        let mut iter = {
            let block = self.read_block(handle)?;
            let mut iter = block.iter();
            iter.seek(&lookup)?;
            iter
        };
        loop {
            let entry = match iter.next() {
                Some(entry) => entry?,
                None => {
                    // The run of versions can spill into the next block.
                    ordinal += 1;
                    handle = match self.index.handle(ordinal) {
                        Some(h) => h,
                        None => break,
                    };
                    let block = self.read_block(handle)?;
                    iter = block.iter();
                    continue;
                }
            };
            let key = InternalKey::decode(&entry.0)?;
            if key.raw_key != raw_key {
                break;
            }
            if key.sequence > snapshot || rollbacks.hides(key.sequence) {
                continue;
            }
            let base = key.kind != ValueKind::AtomicAdd;
            out.push((key.sequence, key.kind, entry.1));
            if base {
                break;
            }
        }
        Ok(true)
    }

    /// Raw key roughly `fraction` of the way through the table, at block
    /// granularity: the last key of the proportional data block.
    pub fn split_key_hint(&self, fraction: f64) -> Option<Vec<u8>> {
        if self.index.is_empty() {
            return None;
        }
        let ordinal =
            ((self.index.len() - 1) as f64 * fraction.clamp(0.0, 1.0)).round() as usize;
        self.index
            .last_key(ordinal)
            .map(|key| InternalKey::raw_of(key).to_vec())
    }

    /// Iterator over the whole table, optionally positioned at the first
    /// entry >= `start` (an encoded internal key).
    pub fn iter(self: &Arc<Self>, start: Option<&[u8]>) -> Result<TableIterator> {
        let mut iter = TableIterator {
            table: self.clone(),
            next_ordinal: 0,
            block_iter: None,
        };
        if let Some(start) = start {
            if let Some((ordinal, handle)) = self.index.find(start) {
                let block = self.read_block(handle)?;
                let mut block_iter = block.iter();
                block_iter.seek(start)?;
                iter.next_ordinal = ordinal + 1;
                iter.block_iter = Some(block_iter);
            } else {
                iter.next_ordinal = self.index.len();
            }
        }
        Ok(iter)
    }
}

fn read_raw_block(file: &dyn RandomAccessFile, handle: BlockHandle) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; handle.size as usize];
    let read = file.read_at(handle.offset, &mut buf)?;
    if read != buf.len() {
        return Err(errcorrupt!("short block read: {} of {}", read, buf.len()));
    }
    if buf.len() < BLOCK_TRAILER_LEN {
        return Err(errcorrupt!("block shorter than trailer"));
    }
    let payload_len = buf.len() - BLOCK_TRAILER_LEN;
    let codec = buf[payload_len];
    let stored_crc = BigEndian::read_u32(&buf[payload_len + 1..]);
    let mut digest = CRC32.digest();
    digest.update(&buf[..payload_len]);
    digest.update(&[codec]);
    if digest.finalize() != stored_crc {
        return Err(errcorrupt!("block checksum mismatch"));
    }
    if codec != CODEC_NONE {
        return Err(errcorrupt!("unknown block codec {}", codec));
    }
    buf.truncate(payload_len);
    Ok(buf)
}

fn decode_filters(data: &[u8]) -> Result<Vec<BloomFilter>> {
    let mut cursor = Cursor::new(data);
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let mut lens = Vec::with_capacity(count);
    for _ in 0..count {
        lens.push(cursor.read_u32::<BigEndian>()? as usize);
    }
    let mut pos = cursor.position() as usize;
    let mut filters = Vec::with_capacity(count);
    for len in lens {
        if pos + len > data.len() {
            return Err(errcorrupt!("filter block out of bounds"));
        }
        let filter = BloomFilter::decode(&data[pos..pos + len])
            .ok_or_else(|| errcorrupt!("undecodable bloom filter"))?;
        filters.push(filter);
        pos += len;
    }
    Ok(filters)
}

pub struct TableIterator {
    table: Arc<Table>,
    next_ordinal: usize,
    block_iter: Option<BlockIterator>,
}

impl Iterator for TableIterator {
    type Item = Result<(InternalKey, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.block_iter {
                match iter.next() {
                    Some(Ok((key, value))) => {
                        return Some(InternalKey::decode(&key).map(|k| (k, value)))
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => self.block_iter = None,
                }
            }
            let handle = self.table.index.handle(self.next_ordinal)?;
            self.next_ordinal += 1;
            match self.table.read_block(handle) {
                Ok(block) => self.block_iter = Some(block.iter()),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
