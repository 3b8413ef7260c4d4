//! Write-ahead log framing.
//!
//! Records are framed into fixed 32 KiB physical blocks so a torn tail
//! record left by a crash is detectable and truncatable: a fragment never
//! spans a block boundary, and a block tail too small for a fragment header
//! is zero-padded.
//!
//! ```text
//! block := fragment* padding?
//! fragment:
//! +-----------+------------+---------+---------------+
//! | crc32:u32 | length:u16 | kind:u8 | payload       |
//! +-----------+------------+---------+---------------+
//! |  4 bytes  |  2 bytes   | 1 byte  | length bytes  |
//! +-----------+------------+---------+---------------+
//! ```
//!
//! `kind` marks whether the fragment carries a full record or the
//! first/middle/last piece of one. The CRC covers kind and payload. Replay
//! stops cleanly at the first corrupt or truncated fragment: everything
//! before it is returned, everything after is discarded.

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};

use crate::dfs::{SequentialFile, WritableFile};
use crate::errcorrupt;
use crate::error::Result;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const BLOCK_SIZE: usize = 32 * 1024;
const HEADER_LEN: usize = 7;

const KIND_FULL: u8 = 1;
const KIND_FIRST: u8 = 2;
const KIND_MIDDLE: u8 = 3;
const KIND_LAST: u8 = 4;

/// Default byte threshold between implicit writer flushes.
pub const DEFAULT_FLUSH_BYTES: usize = 64 * 1024;

pub struct LogWriter {
    file: Box<dyn WritableFile>,
    block_offset: usize,
    unflushed: usize,
    flush_threshold: usize,
}

impl LogWriter {
    pub fn new(file: Box<dyn WritableFile>) -> Self {
        Self {
            file,
            block_offset: 0,
            unflushed: 0,
            flush_threshold: DEFAULT_FLUSH_BYTES,
        }
    }

    /// Append one record, fragmenting across block boundaries as needed.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let mut remaining = payload;
        let mut first = true;
        loop {
            let space = BLOCK_SIZE - self.block_offset;
            if space < HEADER_LEN {
                // Zero-fill the unusable tail and start a fresh block.
                self.file.append(&[0u8; HEADER_LEN][..space])?;
                self.block_offset = 0;
                continue;
            }

            let take = remaining.len().min(space - HEADER_LEN);
            let last = take == remaining.len();
            let kind = match (first, last) {
                (true, true) => KIND_FULL,
                (true, false) => KIND_FIRST,
                (false, false) => KIND_MIDDLE,
                (false, true) => KIND_LAST,
            };
            self.emit_fragment(kind, &remaining[..take])?;
            remaining = &remaining[take..];
            first = false;
            if last {
                break;
            }
        }

        self.unflushed += payload.len();
        if self.unflushed >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    fn emit_fragment(&mut self, kind: u8, payload: &[u8]) -> Result<()> {
        let mut header = [0u8; HEADER_LEN];
        let mut digest = CRC32.digest();
        digest.update(&[kind]);
        digest.update(payload);
        BigEndian::write_u32(&mut header[..4], digest.finalize());
        BigEndian::write_u16(&mut header[4..6], payload.len() as u16);
        header[6] = kind;
        self.file.append(&header)?;
        self.file.append(payload)?;
        self.block_offset += HEADER_LEN + payload.len();
        if self.block_offset == BLOCK_SIZE {
            self.block_offset = 0;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.unflushed = 0;
        self.file.flush()
    }

    /// Write through to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.unflushed = 0;
        self.file.sync()
    }
}

pub struct LogReader {
    file: Box<dyn SequentialFile>,
    block: Vec<u8>,
    block_len: usize,
    block_pos: usize,
    eof: bool,
}

impl LogReader {
    pub fn new(file: Box<dyn SequentialFile>) -> Self {
        Self {
            file,
            block: vec![0u8; BLOCK_SIZE],
            block_len: 0,
            block_pos: 0,
            eof: false,
        }
    }

    /// Next complete record, or `None` at the clean end of the log. A torn
    /// or corrupt tail also ends iteration: it is indistinguishable from a
    /// crash mid-append and its bytes are not surfaced.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut assembled: Option<Vec<u8>> = None;
        loop {
            let fragment = match self.next_fragment()? {
                Some(f) => f,
                None => {
                    if assembled.is_some() {
                        tracing::warn!("log ends inside a fragmented record, dropping tail");
                    }
                    return Ok(None);
                }
            };
            match (fragment.kind, assembled.as_mut()) {
                (KIND_FULL, None) => return Ok(Some(fragment.payload)),
                (KIND_FIRST, None) => assembled = Some(fragment.payload),
                (KIND_MIDDLE, Some(buf)) => buf.extend_from_slice(&fragment.payload),
                (KIND_LAST, Some(buf)) => {
                    buf.extend_from_slice(&fragment.payload);
                    return Ok(Some(assembled.take().unwrap()));
                }
                (kind, _) => {
                    return Err(errcorrupt!("unexpected log fragment kind {}", kind));
                }
            }
        }
    }

    fn next_fragment(&mut self) -> Result<Option<Fragment>> {
        loop {
            if self.block_len - self.block_pos < HEADER_LEN {
                if self.eof {
                    return Ok(None);
                }
                self.refill()?;
                if self.block_len < HEADER_LEN {
                    return Ok(None);
                }
                continue;
            }

            let header = &self.block[self.block_pos..self.block_pos + HEADER_LEN];
            let stored_crc = BigEndian::read_u32(&header[..4]);
            let length = BigEndian::read_u16(&header[4..6]) as usize;
            let kind = header[6];

            if kind == 0 && length == 0 {
                // Zero padding at a block tail.
                self.block_pos = self.block_len;
                continue;
            }
            let start = self.block_pos + HEADER_LEN;
            if start + length > self.block_len {
                // Torn write at crash.
                return Ok(None);
            }
            let payload = &self.block[start..start + length];
            let mut digest = CRC32.digest();
            digest.update(&[kind]);
            digest.update(payload);
            if digest.finalize() != stored_crc {
                return Ok(None);
            }
            let fragment = Fragment {
                kind,
                payload: payload.to_vec(),
            };
            self.block_pos = start + length;
            return Ok(Some(fragment));
        }
    }

    fn refill(&mut self) -> Result<()> {
        self.block_pos = 0;
        self.block_len = 0;
        while self.block_len < BLOCK_SIZE {
            let n = self.file.read(&mut self.block[self.block_len..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            self.block_len += n;
        }
        Ok(())
    }
}

struct Fragment {
    kind: u8,
    payload: Vec<u8>,
}
