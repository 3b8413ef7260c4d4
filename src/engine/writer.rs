//! Write batches: the unit of WAL logging and group commit.
//!
//! A batch carries one or more mutations that commit atomically. Its WAL
//! payload is the batch's base sequence followed by the mutations; entry
//! `i` commits at `base_sequence + i`. Replay is idempotent because a
//! batch whose last sequence is at or below the engine's recovered
//! `last_sequence` re-inserts byte-identical entries.
//!
//! ```text
//! +---------------+-----------+ +---------+-------------+-------+--------------+-------+
//! | sequence: u64 | count:u32 | | kind:u8 | key_len:u32 | key   | value_len:u32| value |
//! +---------------+-----------+ +---------+-------------+-------+--------------+-------+
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::engine::key::{Sequence, ValueKind};
use crate::engine::memtable::MemTable;
use crate::errcorrupt;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    entries: Vec<(ValueKind, Vec<u8>, Vec<u8>)>,
    /// Caller-supplied base sequence; the engine assigns one when absent.
    sequence: Option<Sequence>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, raw_key: &[u8], value: &[u8]) {
        self.entries
            .push((ValueKind::Value, raw_key.to_vec(), value.to_vec()));
    }

    pub fn delete(&mut self, raw_key: &[u8]) {
        self.entries
            .push((ValueKind::Deletion, raw_key.to_vec(), Vec::new()));
    }

    pub fn atomic_add(&mut self, raw_key: &[u8], delta: i64) {
        self.entries.push((
            ValueKind::AtomicAdd,
            raw_key.to_vec(),
            delta.to_le_bytes().to_vec(),
        ));
    }

    /// Pin the batch to a caller-chosen base sequence instead of the
    /// engine-assigned one.
    pub fn set_sequence(&mut self, sequence: Sequence) {
        self.sequence = Some(sequence);
    }

    pub fn sequence(&self) -> Option<Sequence> {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, k, v)| k.len() + v.len() + 9)
            .sum()
    }

    /// WAL payload with `base` stamped in.
    pub fn encode(&self, base: Sequence) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.byte_size() + 12);
        buf.write_u64::<BigEndian>(base).unwrap();
        buf.write_u32::<BigEndian>(self.entries.len() as u32).unwrap();
        for (kind, key, value) in &self.entries {
            buf.write_u8(*kind as u8).unwrap();
            buf.write_u32::<BigEndian>(key.len() as u32).unwrap();
            buf.extend_from_slice(key);
            buf.write_u32::<BigEndian>(value.len() as u32).unwrap();
            buf.extend_from_slice(value);
        }
        buf
    }

    /// Decode a WAL payload; returns the batch and its base sequence.
    pub fn decode(data: &[u8]) -> Result<(Self, Sequence)> {
        let mut cursor = std::io::Cursor::new(data);
        let base = cursor.read_u64::<BigEndian>()?;
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = ValueKind::from_u8(cursor.read_u8()?)?;
            let key = read_chunk(&mut cursor, data)?;
            let value = read_chunk(&mut cursor, data)?;
            entries.push((kind, key, value));
        }
        if cursor.position() as usize != data.len() {
            return Err(errcorrupt!("trailing bytes after write batch"));
        }
        Ok((
            Self {
                entries,
                sequence: Some(base),
            },
            base,
        ))
    }

    /// Apply every entry to the memtable; entry `i` commits at `base + i`.
    pub fn insert_into(&self, mem: &MemTable, base: Sequence) -> Result<()> {
        for (i, (kind, key, value)) in self.entries.iter().enumerate() {
            mem.add(base + i as Sequence, *kind, key, value)?;
        }
        Ok(())
    }

    pub fn last_sequence(&self, base: Sequence) -> Sequence {
        base + self.entries.len().saturating_sub(1) as Sequence
    }
}

fn read_chunk(cursor: &mut std::io::Cursor<&[u8]>, data: &[u8]) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let pos = cursor.position() as usize;
    if pos + len > data.len() {
        return Err(errcorrupt!("write batch chunk out of bounds"));
    }
    cursor.set_position((pos + len) as u64);
    Ok(data[pos..pos + len].to_vec())
}
