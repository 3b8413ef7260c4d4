//! Sparse block index: the last internal key of every data block, with the
//! block's file handle. Binary search on the last keys locates the single
//! block that may contain a lookup key.

use std::cmp::Ordering;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::engine::key::InternalKey;
use crate::errcorrupt;
use crate::error::Result;

/// Offset and length of one stored block within the table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.offset).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            offset: cursor.read_u64::<BigEndian>()?,
            size: cursor.read_u64::<BigEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Index {
    /// `(last encoded internal key in block, handle)`, in file order.
    entries: Vec<(Vec<u8>, BlockHandle)>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, last_key: Vec<u8>, handle: BlockHandle) {
        self.entries.push((last_key, handle));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordinal and handle of the first block whose last key is >= `target`:
    /// the only block that can contain `target`.
    pub fn find(&self, target: &[u8]) -> Option<(usize, BlockHandle)> {
        let mut left = 0;
        let mut right = self.entries.len();
        while left < right {
            let mid = left + (right - left) / 2;
            match InternalKey::compare_encoded(&self.entries[mid].0, target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        self.entries.get(left).map(|(_, handle)| (left, *handle))
    }

    /// Handle of block `ordinal` in file order.
    pub fn handle(&self, ordinal: usize) -> Option<BlockHandle> {
        self.entries.get(ordinal).map(|(_, h)| *h)
    }

    /// Last encoded internal key of block `ordinal`.
    pub fn last_key(&self, ordinal: usize) -> Option<&[u8]> {
        self.entries.get(ordinal).map(|(key, _)| key.as_slice())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(self.entries.len() as u32).unwrap();
        for (key, handle) in &self.entries {
            buf.write_u32::<BigEndian>(key.len() as u32).unwrap();
            buf.extend_from_slice(key);
            handle.encode_into(&mut buf);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = cursor.read_u32::<BigEndian>()? as usize;
            let pos = cursor.position() as usize;
            if pos + key_len > data.len() {
                return Err(errcorrupt!("index entry out of bounds"));
            }
            let key = data[pos..pos + key_len].to_vec();
            cursor.set_position((pos + key_len) as u64);
            let handle = BlockHandle::decode_from(&mut cursor)?;
            entries.push((key, handle));
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::key::ValueKind;

    fn key(raw: &[u8], seq: u64) -> Vec<u8> {
        InternalKey::new(raw.to_vec(), seq, ValueKind::Value).encode()
    }

    fn sample() -> Index {
        let mut index = Index::new();
        index.push(key(b"dog", 5), BlockHandle { offset: 0, size: 100 });
        index.push(key(b"lion", 9), BlockHandle { offset: 100, size: 80 });
        index.push(key(b"zebra", 2), BlockHandle { offset: 180, size: 60 });
        index
    }

    #[test]
    fn test_find_routes_to_covering_block() {
        let index = sample();

        let (ordinal, _) = index.find(&key(b"cat", 1)).unwrap();
        assert_eq!(ordinal, 0);

        let (ordinal, handle) = index.find(&key(b"eel", 1)).unwrap();
        assert_eq!(ordinal, 1);
        assert_eq!(handle.offset, 100);

        // Exactly the last key of a block stays in that block.
        let (ordinal, _) = index.find(&key(b"dog", 5)).unwrap();
        assert_eq!(ordinal, 0);

        // Beyond every block.
        assert!(index.find(&key(b"zzz", 1)).is_none());
    }

    #[test]
    fn test_encode_decode() -> Result<()> {
        let index = sample();
        let decoded = Index::decode(&index.encode())?;
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.handle(2), Some(BlockHandle { offset: 180, size: 60 }));
        Ok(())
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let encoded = sample().encode();
        assert!(Index::decode(&encoded[..encoded.len() - 4]).is_err());
    }
}
