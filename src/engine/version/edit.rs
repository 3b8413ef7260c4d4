//! Version edits: the deltas logged to the MANIFEST.
//!
//! An edit is a stream of tagged fields. Every field is framed as
//! `tag:u8 | len:u32 | payload`, so a reader can skip tags it does not
//! understand: tags at or above [`TAG_FUTURE_WATERMARK`] are ignored rather
//! than rejected, which lets an old server replay a MANIFEST written by a
//! newer one.

use std::io::Cursor;
use std::path::PathBuf;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errcorrupt;
use crate::error::Result;

const TAG_COMPARATOR: u8 = 1;
const TAG_LOG_NUMBER: u8 = 2;
const TAG_NEXT_FILE: u8 = 3;
const TAG_LAST_SEQUENCE: u8 = 4;
const TAG_COMPACT_POINTER: u8 = 5;
const TAG_DELETE_FILE: u8 = 6;
const TAG_ADD_FILE: u8 = 7;

/// Tags at or above this are future extensions and are skipped on read.
pub const TAG_FUTURE_WATERMARK: u8 = 100;

/// On-disk metadata of one SSTable.
///
/// `dir` is the directory the file physically lives in. It differs from the
/// engine's own directory for inherited files, which stay in the parent
/// tablet's path after a split or merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub number: u64,
    pub size: u64,
    pub entries: u64,
    pub delete_tag_percent: u8,
    /// 99th-percentile expiry among TTL cells, microseconds. Zero when
    /// nothing expires; the picker uses it to favour garbage-heavy files.
    pub ttl_percentile_expiry: u64,
    /// Smallest and largest encoded internal keys in the file.
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
    pub dir: PathBuf,
}

impl FileMeta {
    pub fn sst_path(&self) -> PathBuf {
        self.dir.join(format!("{:06}.sst", self.number))
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.number).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
        buf.write_u64::<BigEndian>(self.entries).unwrap();
        buf.write_u8(self.delete_tag_percent).unwrap();
        buf.write_u64::<BigEndian>(self.ttl_percentile_expiry).unwrap();
        write_bytes(buf, &self.smallest);
        write_bytes(buf, &self.largest);
        write_bytes(buf, self.dir.to_string_lossy().as_bytes());
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            number: cursor.read_u64::<BigEndian>()?,
            size: cursor.read_u64::<BigEndian>()?,
            entries: cursor.read_u64::<BigEndian>()?,
            delete_tag_percent: cursor.read_u8()?,
            ttl_percentile_expiry: cursor.read_u64::<BigEndian>()?,
            smallest: read_bytes(cursor)?,
            largest: read_bytes(cursor)?,
            dir: PathBuf::from(String::from_utf8_lossy(&read_bytes(cursor)?).into_owned()),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compact_pointers: Vec<(usize, Vec<u8>)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub added_files: Vec<(usize, FileMeta)>,
}

impl VersionEdit {
    pub fn add_file(&mut self, level: usize, meta: FileMeta) {
        self.added_files.push((level, meta));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(name) = &self.comparator {
            write_field(&mut buf, TAG_COMPARATOR, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            write_field(&mut buf, TAG_LOG_NUMBER, &n.to_be_bytes());
        }
        if let Some(n) = self.next_file_number {
            write_field(&mut buf, TAG_NEXT_FILE, &n.to_be_bytes());
        }
        if let Some(n) = self.last_sequence {
            write_field(&mut buf, TAG_LAST_SEQUENCE, &n.to_be_bytes());
        }
        for (level, key) in &self.compact_pointers {
            let mut payload = Vec::new();
            payload.write_u32::<BigEndian>(*level as u32).unwrap();
            payload.extend_from_slice(key);
            write_field(&mut buf, TAG_COMPACT_POINTER, &payload);
        }
        for (level, number) in &self.deleted_files {
            let mut payload = Vec::new();
            payload.write_u32::<BigEndian>(*level as u32).unwrap();
            payload.write_u64::<BigEndian>(*number).unwrap();
            write_field(&mut buf, TAG_DELETE_FILE, &payload);
        }
        for (level, meta) in &self.added_files {
            let mut payload = Vec::new();
            payload.write_u32::<BigEndian>(*level as u32).unwrap();
            meta.encode_into(&mut payload);
            write_field(&mut buf, TAG_ADD_FILE, &payload);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut edit = Self::default();
        let mut pos = 0usize;
        while pos < data.len() {
            if pos + 5 > data.len() {
                return Err(errcorrupt!("truncated edit field header"));
            }
            let tag = data[pos];
            let len = u32::from_be_bytes(data[pos + 1..pos + 5].try_into().unwrap()) as usize;
            pos += 5;
            if pos + len > data.len() {
                return Err(errcorrupt!("truncated edit field payload"));
            }
            let payload = &data[pos..pos + len];
            pos += len;

            let mut cursor = Cursor::new(payload);
            match tag {
                TAG_COMPARATOR => {
                    edit.comparator = Some(String::from_utf8_lossy(payload).into_owned());
                }
                TAG_LOG_NUMBER => edit.log_number = Some(cursor.read_u64::<BigEndian>()?),
                TAG_NEXT_FILE => edit.next_file_number = Some(cursor.read_u64::<BigEndian>()?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(cursor.read_u64::<BigEndian>()?),
                TAG_COMPACT_POINTER => {
                    let level = cursor.read_u32::<BigEndian>()? as usize;
                    let key = payload[cursor.position() as usize..].to_vec();
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETE_FILE => {
                    let level = cursor.read_u32::<BigEndian>()? as usize;
                    let number = cursor.read_u64::<BigEndian>()?;
                    edit.deleted_files.push((level, number));
                }
                TAG_ADD_FILE => {
                    let level = cursor.read_u32::<BigEndian>()? as usize;
                    let meta = FileMeta::decode_from(&mut cursor)?;
                    edit.added_files.push((level, meta));
                }
                tag if tag >= TAG_FUTURE_WATERMARK => continue,
                tag => return Err(errcorrupt!("unknown edit tag {}", tag)),
            }
        }
        Ok(edit)
    }
}

fn write_field(buf: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    buf.write_u8(tag).unwrap();
    buf.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    buf.extend_from_slice(payload);
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.write_u32::<BigEndian>(bytes.len() as u32).unwrap();
    buf.extend_from_slice(bytes);
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let pos = cursor.position() as usize;
    let data = *cursor.get_ref();
    if pos + len > data.len() {
        return Err(errcorrupt!("byte field out of bounds"));
    }
    cursor.set_position((pos + len) as u64);
    Ok(data[pos..pos + len].to_vec())
}
