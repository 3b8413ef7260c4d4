//! Cell key codec.
//!
//! The wide-column data model addresses a cell by `(row, family, qualifier,
//! timestamp)`. The engine only sees opaque raw keys, so the tablet layer
//! packs cells as:
//!
//! ```text
//! +-----+--------+-----------+--------+------------+-----------+-------------+
//! | row | family | qualifier | !ts:u64| row_len:u16| fam_len:u8| qual_len:u16|
//! +-----+--------+-----------+--------+------------+-----------+-------------+
//! |          variable        | 8 bytes|          5-byte trailer             |
//! ```
//!
//! The timestamp is stored bit-inverted so newer cells sort first within a
//! qualifier, and the variable parts lead so encoded keys sort by row, then
//! family, then qualifier under plain byte comparison.

use byteorder::{BigEndian, ByteOrder};

use crate::errcorrupt;
use crate::error::Result;

const TRAILER: usize = 13; // !ts (8) + row_len (2) + fam_len (1) + qual_len (2)

/// Microsecond wall clock used when the writer did not supply a timestamp.
pub fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellKey {
    pub row: Vec<u8>,
    pub family: String,
    pub qualifier: Vec<u8>,
    pub timestamp: u64,
}

impl CellKey {
    pub fn new(row: &[u8], family: &str, qualifier: &[u8], timestamp: u64) -> Self {
        Self {
            row: row.to_vec(),
            family: family.to_string(),
            qualifier: qualifier.to_vec(),
            timestamp,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            self.row.len() + self.family.len() + self.qualifier.len() + TRAILER,
        );
        buf.extend_from_slice(&self.row);
        buf.extend_from_slice(self.family.as_bytes());
        buf.extend_from_slice(&self.qualifier);
        let mut tail = [0u8; TRAILER];
        BigEndian::write_u64(&mut tail[..8], !self.timestamp);
        BigEndian::write_u16(&mut tail[8..10], self.row.len() as u16);
        tail[10] = self.family.len() as u8;
        BigEndian::write_u16(&mut tail[11..13], self.qualifier.len() as u16);
        buf.extend_from_slice(&tail);
        buf
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < TRAILER {
            return Err(errcorrupt!("cell key too short: {}", raw.len()));
        }
        let tail = &raw[raw.len() - TRAILER..];
        let timestamp = !BigEndian::read_u64(&tail[..8]);
        let row_len = BigEndian::read_u16(&tail[8..10]) as usize;
        let fam_len = tail[10] as usize;
        let qual_len = BigEndian::read_u16(&tail[11..13]) as usize;
        if row_len + fam_len + qual_len + TRAILER != raw.len() {
            return Err(errcorrupt!("cell key length mismatch"));
        }
        let family = String::from_utf8_lossy(&raw[row_len..row_len + fam_len]).into_owned();
        Ok(Self {
            row: raw[..row_len].to_vec(),
            family,
            qualifier: raw[row_len + fam_len..row_len + fam_len + qual_len].to_vec(),
            timestamp,
        })
    }

    /// Row portion of an encoded cell key, without a full decode.
    pub fn row_of(raw: &[u8]) -> Result<&[u8]> {
        if raw.len() < TRAILER {
            return Err(errcorrupt!("cell key too short: {}", raw.len()));
        }
        let tail = &raw[raw.len() - TRAILER..];
        let row_len = BigEndian::read_u16(&tail[8..10]) as usize;
        if row_len + TRAILER > raw.len() {
            return Err(errcorrupt!("cell key length mismatch"));
        }
        Ok(&raw[..row_len])
    }
}

/// Raw-key lower bound for scanning a row: the row bytes followed by the
/// highest-sorting timestamp of the empty family/qualifier, which orders at
/// or before every real cell of that row.
pub fn row_scan_start(row: &[u8]) -> Vec<u8> {
    CellKey::new(row, "", b"", u64::MAX).encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() -> Result<()> {
        let cell = CellKey::new(b"row1", "cf", b"qual", 123_456_789);
        let decoded = CellKey::decode(&cell.encode())?;
        assert_eq!(decoded, cell);
        assert_eq!(CellKey::row_of(&cell.encode())?, b"row1");
        Ok(())
    }

    #[test]
    fn test_ordering_within_row() {
        // Same row: family, then qualifier, then timestamp descending.
        let a = CellKey::new(b"r", "cf1", b"q", 10).encode();
        let b = CellKey::new(b"r", "cf2", b"q", 10).encode();
        assert!(a < b);

        let q1 = CellKey::new(b"r", "cf", b"qa", 10).encode();
        let q2 = CellKey::new(b"r", "cf", b"qb", 10).encode();
        assert!(q1 < q2);

        let newer = CellKey::new(b"r", "cf", b"q", 20).encode();
        let older = CellKey::new(b"r", "cf", b"q", 10).encode();
        assert!(newer < older);
    }

    #[test]
    fn test_rows_sort_before_later_rows() {
        let row_a = CellKey::new(b"aaa", "zz", b"zz", 0).encode();
        let row_b = CellKey::new(b"bbb", "aa", b"aa", u64::MAX).encode();
        assert!(row_a < row_b);

        // The scan start for a row sorts before all of its cells and after
        // every cell of earlier rows.
        let start = row_scan_start(b"bbb");
        assert!(row_a < start);
        assert!(start <= row_b);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(CellKey::decode(b"short").is_err());
        let mut raw = CellKey::new(b"row", "cf", b"q", 5).encode();
        raw.truncate(raw.len() - 1);
        assert!(CellKey::decode(&raw).is_err());
    }
}
