//! The version set: current version, MANIFEST log and CURRENT pointer.
//!
//! The MANIFEST is an append-only record log of encoded [`VersionEdit`]s,
//! using the same 32 KiB block framing as the WAL. `CURRENT` is a one-line
//! text file naming the live MANIFEST; it is republished with an atomic
//! rename, so a crash between writing a new MANIFEST and pointing CURRENT
//! at it leaves the previous coherent state in force.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::dfs::Dfs;
use crate::engine::key::Sequence;
use crate::engine::sstable::TableCache;
use crate::engine::version::edit::{FileMeta, VersionEdit};
use crate::engine::version::{Version, VersionBuilder, NUM_LEVELS};
use crate::engine::wal::{LogReader, LogWriter};
use crate::errcorrupt;
use crate::error::{Error, Result};

pub fn sst_name(number: u64) -> String {
    format!("{:06}.sst", number)
}

pub fn log_name(number: u64) -> String {
    format!("{:06}.log", number)
}

pub fn manifest_name(number: u64) -> String {
    format!("MANIFEST-{:06}", number)
}

/// What a directory entry is, by name.
#[derive(Debug, PartialEq, Eq)]
pub enum FileKind {
    Sst(u64),
    Log(u64),
    Manifest(u64),
    Current,
    Other,
}

pub fn parse_file_name(name: &str) -> FileKind {
    if name == "CURRENT" {
        return FileKind::Current;
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        if let Ok(number) = rest.parse() {
            return FileKind::Manifest(number);
        }
    }
    if let Some(stem) = name.strip_suffix(".sst") {
        if let Ok(number) = stem.parse() {
            return FileKind::Sst(number);
        }
    }
    if let Some(stem) = name.strip_suffix(".log") {
        if let Ok(number) = stem.parse() {
            return FileKind::Log(number);
        }
    }
    FileKind::Other
}

pub struct VersionSet {
    dir: PathBuf,
    dfs: Arc<dyn Dfs>,
    table_cache: Arc<TableCache>,
    current: Arc<Version>,
    manifest: Option<LogWriter>,
    manifest_number: u64,
    next_file_number: u64,
    log_number: u64,
    last_sequence: Sequence,
    compact_pointers: Vec<Vec<u8>>,
}

/// State replayed from one MANIFEST.
struct ReplayedState {
    files: Vec<(usize, FileMeta)>,
    log_number: u64,
    next_file_number: u64,
    last_sequence: Sequence,
    compact_pointers: Vec<Vec<u8>>,
}

impl VersionSet {
    /// Open the version set in `dir`. Missing `CURRENT` falls back to
    /// inheriting from `parents` (split/merge children), then to creating
    /// an empty database.
    pub fn open(
        dfs: Arc<dyn Dfs>,
        table_cache: Arc<TableCache>,
        dir: &Path,
        parents: &[PathBuf],
        ignore_corruption: bool,
    ) -> Result<Self> {
        dfs.create_dir_all(dir)?;

        let mut set = Self {
            dir: dir.to_path_buf(),
            dfs: dfs.clone(),
            table_cache,
            current: Version::empty(),
            manifest: None,
            manifest_number: 0,
            next_file_number: 1,
            log_number: 0,
            last_sequence: 0,
            compact_pointers: vec![Vec::new(); NUM_LEVELS],
        };

        let current_path = dir.join("CURRENT");
        if dfs.exists(&current_path) {
            let state = set.replay_own_manifest()?;
            set.install_state(state, ignore_corruption)?;
        } else if !parents.is_empty() {
            let mut inherited: Vec<(usize, FileMeta)> = Vec::new();
            for parent in parents {
                let state = replay_manifest_in(dfs.as_ref(), parent)?;
                set.last_sequence = set.last_sequence.max(state.last_sequence);
                set.next_file_number = set.next_file_number.max(state.next_file_number);
                inherited.extend(state.files);
            }
            tracing::info!(
                dir = %dir.display(),
                parents = parents.len(),
                inherited_files = inherited.len(),
                "inheriting version state from parents"
            );
            set.install_state(
                ReplayedState {
                    files: inherited,
                    log_number: 0,
                    next_file_number: set.next_file_number,
                    last_sequence: set.last_sequence,
                    compact_pointers: vec![Vec::new(); NUM_LEVELS],
                },
                ignore_corruption,
            )?;
        }
        // Otherwise: a fresh, empty database.

        set.publish_new_manifest()?;
        Ok(set)
    }

    fn replay_own_manifest(&self) -> Result<ReplayedState> {
        replay_manifest_in(self.dfs.as_ref(), &self.dir)
    }

    /// Build the in-memory version from replayed state, verifying that every
    /// referenced file exists. Missing files are fatal unless corruption is
    /// being tolerated, in which case they are edited out.
    fn install_state(&mut self, state: ReplayedState, ignore_corruption: bool) -> Result<()> {
        let mut edit = VersionEdit::default();
        for (level, meta) in state.files {
            if !self.dfs.exists(&meta.sst_path()) {
                if ignore_corruption {
                    tracing::warn!(
                        path = %meta.sst_path().display(),
                        "live table missing on DFS, edited out"
                    );
                    continue;
                }
                return Err(errcorrupt!(
                    "live table missing: {}",
                    meta.sst_path().display()
                ));
            }
            edit.add_file(level, meta);
        }

        let mut builder = VersionBuilder::from(&Version::default_base());
        builder.apply(&edit);
        self.current = builder.finish();
        self.log_number = state.log_number;
        self.next_file_number = state.next_file_number.max(1);
        self.last_sequence = state.last_sequence;
        self.compact_pointers = state.compact_pointers;
        Ok(())
    }

    /// Start a fresh MANIFEST containing a full snapshot of the state and
    /// atomically repoint CURRENT at it.
    fn publish_new_manifest(&mut self) -> Result<()> {
        let number = self.next_file_number;
        self.next_file_number += 1;

        let path = self.dir.join(manifest_name(number));
        let mut writer = LogWriter::new(self.dfs.create(&path)?);

        let mut snapshot = VersionEdit {
            comparator: Some("emberdb.InternalKeyComparator".to_string()),
            log_number: Some(self.log_number),
            next_file_number: Some(self.next_file_number),
            last_sequence: Some(self.last_sequence),
            ..Default::default()
        };
        for (level, key) in self.compact_pointers.iter().enumerate() {
            if !key.is_empty() {
                snapshot.compact_pointers.push((level, key.clone()));
            }
        }
        for (level, files) in self.current.files.iter().enumerate() {
            for file in files {
                snapshot.add_file(level, file.meta.clone());
            }
        }
        writer.add_record(&snapshot.encode())?;
        writer.sync()?;

        self.set_current_file(number)?;
        self.manifest = Some(writer);
        self.manifest_number = number;
        Ok(())
    }

    fn set_current_file(&self, manifest_number: u64) -> Result<()> {
        let tmp = self.dir.join(format!("CURRENT.{:06}.tmp", manifest_number));
        let mut file = self.dfs.create(&tmp)?;
        file.append(format!("{}\n", manifest_name(manifest_number)).as_bytes())?;
        file.sync()?;
        drop(file);
        self.dfs.rename(&tmp, &self.dir.join("CURRENT"))
    }

    /// Log `edit` to the MANIFEST and install the resulting version as
    /// current. The edit's counters are stamped here; an edit never becomes
    /// visible without first being durable in the MANIFEST.
    pub fn log_and_apply(&mut self, mut edit: VersionEdit) -> Result<Arc<Version>> {
        if edit.log_number.is_none() {
            edit.log_number = Some(self.log_number);
        }
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);

        let writer = self
            .manifest
            .as_mut()
            .ok_or_else(|| Error::Background("version set has no manifest".into()))?;
        writer.add_record(&edit.encode())?;
        writer.sync()?;

        for (level, key) in &edit.compact_pointers {
            self.compact_pointers[*level] = key.clone();
        }
        if let Some(n) = edit.log_number {
            self.log_number = n;
        }

        let mut builder = VersionBuilder::from(&self.current);
        builder.apply(&edit);
        self.current = builder.finish();
        Ok(self.current.clone())
    }

    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    pub fn table_cache(&self) -> &Arc<TableCache> {
        &self.table_cache
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    pub fn last_sequence(&self) -> Sequence {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, sequence: Sequence) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn compact_pointer(&self, level: usize) -> &[u8] {
        &self.compact_pointers[level]
    }

    /// Paths of every file the current version references, plus the live
    /// MANIFEST. Anything else in the directory is garbage.
    pub fn live_paths(&self) -> HashSet<PathBuf> {
        let mut live: HashSet<PathBuf> = self
            .current
            .files
            .iter()
            .flatten()
            .map(|f| f.meta.sst_path())
            .collect();
        live.insert(self.dir.join(manifest_name(self.manifest_number)));
        live.insert(self.dir.join("CURRENT"));
        live
    }
}

impl Version {
    fn default_base() -> Version {
        Version {
            files: vec![Vec::new(); NUM_LEVELS],
        }
    }
}

/// Replay the MANIFEST that `dir/CURRENT` points at.
fn replay_manifest_in(dfs: &dyn Dfs, dir: &Path) -> Result<ReplayedState> {
    let current_path = dir.join("CURRENT");
    let mut current = String::new();
    {
        let mut file = dfs.open_sequential(&current_path)?;
        let mut buf = [0u8; 256];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            current.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }
    let manifest_file = current.trim();
    if manifest_file.is_empty() {
        return Err(errcorrupt!("CURRENT is empty in {}", dir.display()));
    }

    let mut reader = LogReader::new(dfs.open_sequential(&dir.join(manifest_file))?);
    let mut files: Vec<(usize, FileMeta)> = Vec::new();
    let mut state = ReplayedState {
        files: Vec::new(),
        log_number: 0,
        next_file_number: 1,
        last_sequence: 0,
        compact_pointers: vec![Vec::new(); NUM_LEVELS],
    };

    while let Some(record) = reader.read_record()? {
        let mut edit = VersionEdit::decode(&record)?;
        if let Some(n) = edit.log_number {
            state.log_number = n;
        }
        if let Some(n) = edit.next_file_number {
            state.next_file_number = n;
        }
        if let Some(n) = edit.last_sequence {
            state.last_sequence = n;
        }
        for (level, key) in edit.compact_pointers.drain(..) {
            state.compact_pointers[level] = key;
        }
        for (level, number) in &edit.deleted_files {
            files.retain(|(l, m)| !(l == level && m.number == *number));
        }
        for (level, mut meta) in edit.added_files.drain(..) {
            // Files recorded before the engine knew its final directory
            // resolve against the replaying directory.
            if meta.dir.as_os_str().is_empty() {
                meta.dir = dir.to_path_buf();
            }
            files.push((level, meta));
        }
    }
    state.files = files;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfs::LocalDfs;
    use crate::engine::key::{InternalKey, ValueKind};
    use crate::engine::sstable::TableBuilder;

    fn new_set(dfs: &Arc<dyn Dfs>, dir: &Path) -> Result<VersionSet> {
        let cache = Arc::new(TableCache::new(dfs.clone(), 100, None));
        VersionSet::open(dfs.clone(), cache, dir, &[], false)
    }

    fn write_sst(dfs: &dyn Dfs, dir: &Path, number: u64, rows: &[&[u8]]) -> Result<FileMeta> {
        let path = dir.join(sst_name(number));
        let mut builder = TableBuilder::new(dfs.create(&path)?, 4096, false);
        for (i, row) in rows.iter().enumerate() {
            builder.add(
                &InternalKey::new(row.to_vec(), (i + 1) as u64, ValueKind::Value),
                b"v",
            )?;
        }
        let stats = builder.finish()?;
        Ok(FileMeta {
            number,
            size: stats.file_size,
            entries: stats.entries,
            delete_tag_percent: stats.delete_tag_percent,
            ttl_percentile_expiry: stats.ttl_percentile_expiry,
            smallest: stats.smallest,
            largest: stats.largest,
            dir: dir.to_path_buf(),
        })
    }

    #[test]
    fn test_fresh_then_reopen() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dfs: Arc<dyn Dfs> = LocalDfs::new();
        let dir = tmp.path().join("lg0");

        {
            let mut set = new_set(&dfs, &dir)?;
            assert_eq!(set.current().total_bytes(), 0);

            let meta = write_sst(dfs.as_ref(), &dir, set.new_file_number(), &[b"a", b"b"])?;
            set.set_last_sequence(2);
            let mut edit = VersionEdit::default();
            edit.add_file(0, meta);
            set.log_and_apply(edit)?;
            assert_eq!(set.current().num_files(0), 1);
        }

        let set = new_set(&dfs, &dir)?;
        assert_eq!(set.current().num_files(0), 1);
        assert_eq!(set.last_sequence(), 2);
        assert!(set.next_file_number > 1);
        Ok(())
    }

    #[test]
    fn test_missing_file_fatal_unless_tolerated() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dfs: Arc<dyn Dfs> = LocalDfs::new();
        let dir = tmp.path().join("lg0");

        let sst_path;
        {
            let mut set = new_set(&dfs, &dir)?;
            let number = set.new_file_number();
            let meta = write_sst(dfs.as_ref(), &dir, number, &[b"k"])?;
            sst_path = meta.sst_path();
            let mut edit = VersionEdit::default();
            edit.add_file(0, meta);
            set.log_and_apply(edit)?;
        }
        dfs.delete(&sst_path)?;

        assert!(new_set(&dfs, &dir).is_err());

        let cache = Arc::new(TableCache::new(dfs.clone(), 100, None));
        let set = VersionSet::open(dfs.clone(), cache, &dir, &[], true)?;
        assert_eq!(set.current().num_files(0), 0);
        Ok(())
    }

    #[test]
    fn test_inherit_from_parent() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dfs: Arc<dyn Dfs> = LocalDfs::new();
        let parent_dir = tmp.path().join("parent");
        let child_dir = tmp.path().join("child");

        {
            let mut parent = new_set(&dfs, &parent_dir)?;
            let number = parent.new_file_number();
            let meta = write_sst(dfs.as_ref(), &parent_dir, number, &[b"a", b"m", b"z"])?;
            parent.set_last_sequence(33);
            let mut edit = VersionEdit::default();
            edit.add_file(1, meta);
            parent.log_and_apply(edit)?;
        }

        let cache = Arc::new(TableCache::new(dfs.clone(), 100, None));
        let child = VersionSet::open(
            dfs.clone(),
            cache,
            &child_dir,
            &[parent_dir.clone()],
            false,
        )?;
        assert_eq!(child.current().num_files(1), 1);
        assert_eq!(child.last_sequence(), 33);
        // The inherited file still lives in the parent's directory.
        let inherited = &child.current().files[1][0];
        assert!(inherited.meta.sst_path().starts_with(&parent_dir));
        Ok(())
    }

    #[test]
    fn test_live_paths_and_file_names() {
        assert_eq!(parse_file_name("000042.sst"), FileKind::Sst(42));
        assert_eq!(parse_file_name("000007.log"), FileKind::Log(7));
        assert_eq!(parse_file_name("MANIFEST-000003"), FileKind::Manifest(3));
        assert_eq!(parse_file_name("CURRENT"), FileKind::Current);
        assert_eq!(parse_file_name("junk.tmp"), FileKind::Other);
    }
}
