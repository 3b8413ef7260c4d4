//! Internal key format shared by the memtable and SSTables.
//!
//! An internal key is the caller's raw key plus a sequence number and a kind
//! tag:
//!
//! ```text
//! +----------+--------------+---------+
//! | raw_key  | sequence: u64| kind: u8|
//! +----------+--------------+---------+
//! | var len  |  8 bytes BE  | 1 byte  |
//! +----------+--------------+---------+
//! ```
//!
//! Ordering: raw key ascending, then sequence descending (newer first), then
//! kind descending. Sequence numbers increase monotonically per engine, so
//! the first entry reached for a key at or below a snapshot is the winning
//! version.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};

use crate::errcorrupt;
use crate::error::Result;

/// Per-engine monotonic write counter.
pub type Sequence = u64;

/// Sequence used when a read should see every committed write.
pub const MAX_SEQUENCE: Sequence = u64::MAX;

const TRAILER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueKind {
    /// Tombstone shadowing all older versions of the key.
    Deletion = 0,
    /// A plain value.
    Value = 1,
    /// A little-endian i64 delta, coalesced by the counter-merge compaction
    /// strategy and summed at read time.
    AtomicAdd = 2,
}

impl ValueKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ValueKind::Deletion),
            1 => Ok(ValueKind::Value),
            2 => Ok(ValueKind::AtomicAdd),
            _ => Err(errcorrupt!("unknown value kind {}", v)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub raw_key: Vec<u8>,
    pub sequence: Sequence,
    pub kind: ValueKind,
}

impl InternalKey {
    pub fn new(raw_key: Vec<u8>, sequence: Sequence, kind: ValueKind) -> Self {
        Self {
            raw_key,
            sequence,
            kind,
        }
    }

    /// Key positioned at the newest entry visible at `snapshot` for lookups:
    /// every entry for `raw_key` with `sequence <= snapshot` orders at or
    /// after this key.
    pub fn for_lookup(raw_key: &[u8], snapshot: Sequence) -> Self {
        Self::new(raw_key.to_vec(), snapshot, ValueKind::AtomicAdd)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.raw_key.len() + TRAILER_LEN);
        buf.extend_from_slice(&self.raw_key);
        let mut trailer = [0u8; TRAILER_LEN];
        BigEndian::write_u64(&mut trailer[..8], self.sequence);
        trailer[8] = self.kind as u8;
        buf.extend_from_slice(&trailer);
        buf
    }

    pub fn decode(encoded: &[u8]) -> Result<Self> {
        if encoded.len() < TRAILER_LEN {
            return Err(errcorrupt!("internal key too short: {}", encoded.len()));
        }
        let split = encoded.len() - TRAILER_LEN;
        let sequence = BigEndian::read_u64(&encoded[split..split + 8]);
        let kind = ValueKind::from_u8(encoded[split + 8])?;
        Ok(Self::new(encoded[..split].to_vec(), sequence, kind))
    }

    /// Compare two encoded internal keys without allocating.
    pub fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        let (ka, ta) = a.split_at(a.len().saturating_sub(TRAILER_LEN));
        let (kb, tb) = b.split_at(b.len().saturating_sub(TRAILER_LEN));
        ka.cmp(kb)
            .then_with(|| tb.cmp(ta)) // trailer reversed: higher seq first
    }

    /// Raw key portion of an encoded internal key.
    pub fn raw_of(encoded: &[u8]) -> &[u8] {
        &encoded[..encoded.len().saturating_sub(TRAILER_LEN)]
    }

    /// Sequence portion of an encoded internal key.
    pub fn sequence_of(encoded: &[u8]) -> Sequence {
        let split = encoded.len().saturating_sub(TRAILER_LEN);
        BigEndian::read_u64(&encoded[split..split + 8])
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw_key
            .cmp(&other.raw_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.kind.cmp(&self.kind))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_newer_first() {
        let old = InternalKey::new(b"row".to_vec(), 5, ValueKind::Value);
        let new = InternalKey::new(b"row".to_vec(), 9, ValueKind::Deletion);
        assert!(new < old);

        let other = InternalKey::new(b"rox".to_vec(), 100, ValueKind::Value);
        assert!(old < other);
    }

    #[test]
    fn test_lookup_key_bounds_snapshot() {
        let lookup = InternalKey::for_lookup(b"k", 10);
        let at = InternalKey::new(b"k".to_vec(), 10, ValueKind::Value);
        let above = InternalKey::new(b"k".to_vec(), 11, ValueKind::Value);
        let below = InternalKey::new(b"k".to_vec(), 9, ValueKind::Value);

        assert!(lookup <= at);
        assert!(above < lookup);
        assert!(lookup < below);
    }

    #[test]
    fn test_encode_decode_round_trip() -> Result<()> {
        let key = InternalKey::new(b"row1/cf/q".to_vec(), 42, ValueKind::AtomicAdd);
        let decoded = InternalKey::decode(&key.encode())?;
        assert_eq!(decoded, key);
        Ok(())
    }

    #[test]
    fn test_encoded_comparison_matches_struct() {
        let keys = [
            InternalKey::new(b"a".to_vec(), 7, ValueKind::Value),
            InternalKey::new(b"a".to_vec(), 3, ValueKind::Deletion),
            InternalKey::new(b"b".to_vec(), 9, ValueKind::Value),
        ];
        for x in &keys {
            for y in &keys {
                assert_eq!(
                    InternalKey::compare_encoded(&x.encode(), &y.encode()),
                    x.cmp(y),
                );
            }
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(InternalKey::decode(b"tiny").is_err());
        let mut bad = InternalKey::new(b"k".to_vec(), 1, ValueKind::Value).encode();
        *bad.last_mut().unwrap() = 0xEE;
        assert!(InternalKey::decode(&bad).is_err());
    }
}
