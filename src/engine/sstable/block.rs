//! SSTable data block format.
//!
//! A block is a run of prefix-compressed entries followed by a restart
//! array. Keys are encoded internal keys; every `RESTART_INTERVAL`-th entry
//! stores its key in full so the restart array supports binary search with
//! the internal-key comparator.
//!
//! ```text
//! entry:
//! +------------+--------------+--------------+-----------+-------+
//! | shared:u16 | unshared:u16 | value_len:u32| key delta | value |
//! +------------+--------------+--------------+-----------+-------+
//! block:
//! | entry* | restart_offset:u32 * | restart_count:u32 |
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::engine::key::InternalKey;
use crate::errcorrupt;
use crate::error::Result;

const RESTART_INTERVAL: usize = 16;

pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restarts: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Keys must arrive in internal-key order.
    pub fn add(&mut self, encoded_key: &[u8], value: &[u8]) {
        let shared = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restarts.push(self.buffer.len() as u32);
            0
        } else {
            self.last_key
                .iter()
                .zip(encoded_key.iter())
                .take_while(|(a, b)| a == b)
                .count()
        };
        let unshared = encoded_key.len() - shared;

        self.buffer.write_u16::<BigEndian>(shared as u16).unwrap();
        self.buffer.write_u16::<BigEndian>(unshared as u16).unwrap();
        self.buffer.write_u32::<BigEndian>(value.len() as u32).unwrap();
        self.buffer.extend_from_slice(&encoded_key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(encoded_key);
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for restart in &self.restarts {
            self.buffer.write_u32::<BigEndian>(*restart).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restarts.len() as u32)
            .unwrap();
        self.buffer
    }

    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

#[derive(Clone)]
pub struct Block {
    data: Vec<u8>,
    restarts: Vec<u32>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(errcorrupt!("block shorter than restart count"));
        }
        let count_offset = data.len() - 4;
        let restart_count = BigEndian::read_u32(&data[count_offset..]) as usize;
        let array_len = restart_count
            .checked_mul(4)
            .ok_or_else(|| errcorrupt!("restart count overflow"))?;
        if count_offset < array_len {
            return Err(errcorrupt!("block shorter than restart array"));
        }
        let array_offset = count_offset - array_len;
        let restarts = data[array_offset..count_offset]
            .chunks_exact(4)
            .map(BigEndian::read_u32)
            .collect();
        Ok(Self {
            data: data[..array_offset].to_vec(),
            restarts,
        })
    }

    pub fn iter(self: &Arc<Self>) -> BlockIterator {
        BlockIterator::new(self.clone())
    }

    pub fn size(&self) -> usize {
        self.data.len() + self.restarts.len() * 4
    }
}

pub struct BlockIterator {
    block: Arc<Block>,
    offset: usize,
    last_key: Vec<u8>,
    peeked: Option<(Vec<u8>, Vec<u8>)>,
}

impl BlockIterator {
    fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            offset: 0,
            last_key: Vec::new(),
            peeked: None,
        }
    }

    /// Position so the next entry returned is the first with encoded
    /// internal key >= `target`.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        // Binary search restarts for the last restart key < target.
        let mut left = 0;
        let mut right = self.block.restarts.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let key = self.restart_key(mid)?;
            match InternalKey::compare_encoded(&key, target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        let restart = left.saturating_sub(1);
        self.offset = self.block.restarts.get(restart).copied().unwrap_or(0) as usize;
        self.last_key.clear();
        self.peeked = None;

        while let Some(entry) = self.read_entry()? {
            if InternalKey::compare_encoded(&entry.0, target) != Ordering::Less {
                self.peeked = Some(entry);
                break;
            }
        }
        Ok(())
    }

    fn restart_key(&self, index: usize) -> Result<Vec<u8>> {
        let offset = self.block.restarts[index] as usize;
        let data = &self.block.data;
        let mut cursor = &data[offset..];
        let shared = cursor.read_u16::<BigEndian>()? as usize;
        let unshared = cursor.read_u16::<BigEndian>()? as usize;
        let _value_len = cursor.read_u32::<BigEndian>()?;
        if shared != 0 {
            return Err(errcorrupt!("restart entry has shared prefix"));
        }
        if unshared > cursor.len() {
            return Err(errcorrupt!("restart entry out of bounds"));
        }
        Ok(cursor[..unshared].to_vec())
    }

    fn read_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let data = &self.block.data;
        if self.offset >= data.len() {
            return Ok(None);
        }
        let mut cursor = &data[self.offset..];
        let shared = cursor.read_u16::<BigEndian>()? as usize;
        let unshared = cursor.read_u16::<BigEndian>()? as usize;
        let value_len = cursor.read_u32::<BigEndian>()? as usize;
        if shared > self.last_key.len() || unshared + value_len > cursor.len() {
            return Err(errcorrupt!("block entry out of bounds"));
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&cursor[..unshared]);
        let value = cursor[unshared..unshared + value_len].to_vec();

        self.offset += 8 + unshared + value_len;
        self.last_key = key.clone();
        Ok(Some((key, value)))
    }
}

impl Iterator for BlockIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.peeked.take() {
            return Some(Ok(entry));
        }
        self.read_entry().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::key::ValueKind;

    fn build_block(entries: &[(InternalKey, &[u8])]) -> Arc<Block> {
        let mut builder = BlockBuilder::new();
        for (key, value) in entries {
            builder.add(&key.encode(), value);
        }
        Arc::new(Block::new(builder.finish()).unwrap())
    }

    fn keys(count: usize) -> Vec<(InternalKey, Vec<u8>)> {
        (0..count)
            .map(|i| {
                (
                    InternalKey::new(
                        format!("row{:04}", i).into_bytes(),
                        (count - i) as u64,
                        ValueKind::Value,
                    ),
                    format!("value{}", i).into_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn test_round_trip_across_restarts() -> Result<()> {
        let entries = keys(50);
        let refs: Vec<(InternalKey, &[u8])> =
            entries.iter().map(|(k, v)| (k.clone(), v.as_slice())).collect();
        let block = build_block(&refs);

        let read: Vec<(Vec<u8>, Vec<u8>)> =
            block.iter().collect::<Result<Vec<_>>>()?;
        assert_eq!(read.len(), 50);
        for (i, (key, value)) in read.iter().enumerate() {
            assert_eq!(InternalKey::decode(key)?, entries[i].0);
            assert_eq!(value, &entries[i].1);
        }
        Ok(())
    }

    #[test]
    fn test_seek_exact_and_between() -> Result<()> {
        let entries = keys(40);
        let refs: Vec<(InternalKey, &[u8])> =
            entries.iter().map(|(k, v)| (k.clone(), v.as_slice())).collect();
        let block = build_block(&refs);

        // Exact hit.
        let mut iter = block.iter();
        iter.seek(&entries[17].0.encode())?;
        let (key, _) = iter.next().unwrap()?;
        assert_eq!(InternalKey::decode(&key)?, entries[17].0);

        // Between two keys lands on the next one.
        let mut iter = block.iter();
        let between = InternalKey::new(b"row0017zzz".to_vec(), 99, ValueKind::Value);
        iter.seek(&between.encode())?;
        let (key, _) = iter.next().unwrap()?;
        assert_eq!(InternalKey::decode(&key)?, entries[18].0);

        // Past the end leaves the iterator exhausted.
        let mut iter = block.iter();
        let past = InternalKey::new(b"zzz".to_vec(), 1, ValueKind::Value);
        iter.seek(&past.encode())?;
        assert!(iter.next().is_none());
        Ok(())
    }

    #[test]
    fn test_seek_respects_sequence_ordering() -> Result<()> {
        // Same raw key, multiple versions: newest (highest seq) first.
        let versions = [
            (InternalKey::new(b"row".to_vec(), 30, ValueKind::Value), b"v30".as_slice()),
            (InternalKey::new(b"row".to_vec(), 20, ValueKind::Value), b"v20".as_slice()),
            (InternalKey::new(b"row".to_vec(), 10, ValueKind::Value), b"v10".as_slice()),
        ];
        let block = build_block(&versions);

        // Looking up at snapshot 25 must land on seq=20.
        let mut iter = block.iter();
        iter.seek(&InternalKey::for_lookup(b"row", 25).encode())?;
        let (key, value) = iter.next().unwrap()?;
        assert_eq!(InternalKey::decode(&key)?.sequence, 20);
        assert_eq!(value, b"v20");
        Ok(())
    }

    #[test]
    fn test_corrupt_block_rejected() {
        assert!(Block::new(vec![1, 2]).is_err());
        // Restart count claiming more entries than the block holds.
        let mut data = vec![0u8; 8];
        BigEndian::write_u32(&mut data[4..], 100);
        assert!(Block::new(data).is_err());
    }
}
