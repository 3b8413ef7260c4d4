use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::errinput;

/// Server-wide flags, read from a flag file at startup and re-read at runtime
/// by `CmdCtrl("reload config")`. Unknown keys are rejected so that a typo in
/// the flag file surfaces at load rather than silently using a default.
#[derive(Debug, Clone)]
pub struct Flags {
    /// Listen port published to the coordinator along with the session id.
    pub port: u16,

    /// How often the status refresher pushes tablet info to the coordinator.
    pub heartbeat_interval: Duration,

    /// Server-wide in-memory block cache capacity in bytes.
    pub block_cache_size: usize,

    /// Server-wide table cache capacity (open table handles).
    pub table_cache_size: usize,

    /// Persistent SSD cache: enabled, total capacity, per-data-set size and
    /// logical block size.
    pub persistent_cache_enabled: bool,
    pub persistent_cache_size: u64,
    pub dataset_size: u64,
    pub cache_block_size: u64,

    /// Wipe persistent cache paths on startup instead of reloading them.
    pub clean_cache_paths_on_start: bool,

    /// Worker counts per pool.
    pub read_threads: usize,
    pub write_threads: usize,
    pub scan_threads: usize,
    pub compact_threads: usize,

    /// Fraction of the read pool allowed to block on remote DFS reads, so
    /// local SSD reads cannot be starved.
    pub dfs_read_thread_ratio: f64,

    /// Periodic free-heap release back to the OS.
    pub heap_release_period: Duration,
    pub heap_release_bytes: usize,

    /// Rows per shard when a batch read is fanned out.
    pub rows_per_task: usize,

    /// Concurrent reads allowed per tablet before new ones answer busy.
    pub tablet_read_quota: u32,

    /// Scan result page budget in bytes.
    pub scan_pack_size: usize,

    /// Corruption tolerance.
    pub ignore_corruption_in_open: bool,
    pub ignore_corruption_in_compaction: bool,

    /// Path the flags were loaded from, kept for `reload`.
    flag_file: Option<PathBuf>,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            port: 7722,
            heartbeat_interval: Duration::from_secs(5),
            block_cache_size: 256 << 20,
            table_cache_size: 1000,
            persistent_cache_enabled: false,
            persistent_cache_size: 8 << 30,
            dataset_size: 128 << 20,
            cache_block_size: 4096,
            clean_cache_paths_on_start: false,
            read_threads: 16,
            write_threads: 8,
            scan_threads: 8,
            compact_threads: 4,
            dfs_read_thread_ratio: 0.75,
            heap_release_period: Duration::from_secs(60),
            heap_release_bytes: 64 << 20,
            rows_per_task: 64,
            tablet_read_quota: 512,
            scan_pack_size: 1 << 20,
            ignore_corruption_in_open: false,
            ignore_corruption_in_compaction: false,
            flag_file: None,
        }
    }
}

impl Flags {
    /// Load flags from a `key = value` flag file. Lines starting with `#`
    /// and blank lines are ignored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut flags = Self {
            flag_file: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        };
        flags.apply_file(path.as_ref())?;
        Ok(flags)
    }

    /// Re-read the flag file this instance was loaded from. A `Flags` built
    /// without a file is a no-op here.
    pub fn reload(&mut self) -> Result<()> {
        if let Some(path) = self.flag_file.clone() {
            self.apply_file(&path)?;
        }
        Ok(())
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)?;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| errinput!("flag file line {}: missing '='", lineno + 1))?;
            self.set(key.trim(), value.trim())
                .map_err(|e| errinput!("flag file line {}: {}", lineno + 1, e))?;
        }
        Ok(())
    }

    /// Set a single flag by name. Used by the file loader and by `CmdCtrl`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        fn int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse()
                .map_err(|_| errinput!("flag {}: bad value {:?}", key, value))
        }
        fn boolean(key: &str, value: &str) -> Result<bool> {
            match value {
                "true" | "1" | "on" => Ok(true),
                "false" | "0" | "off" => Ok(false),
                _ => Err(errinput!("flag {}: bad bool {:?}", key, value)),
            }
        }

        match key {
            "port" => self.port = int(key, value)?,
            "heartbeat_interval_secs" => {
                self.heartbeat_interval = Duration::from_secs(int(key, value)?)
            }
            "block_cache_size" => self.block_cache_size = int(key, value)?,
            "table_cache_size" => self.table_cache_size = int(key, value)?,
            "persistent_cache_enabled" => self.persistent_cache_enabled = boolean(key, value)?,
            "persistent_cache_size" => self.persistent_cache_size = int(key, value)?,
            "dataset_size" => self.dataset_size = int(key, value)?,
            "cache_block_size" => self.cache_block_size = int(key, value)?,
            "clean_cache_paths_on_start" => {
                self.clean_cache_paths_on_start = boolean(key, value)?
            }
            "read_threads" => self.read_threads = int(key, value)?,
            "write_threads" => self.write_threads = int(key, value)?,
            "scan_threads" => self.scan_threads = int(key, value)?,
            "compact_threads" => self.compact_threads = int(key, value)?,
            "dfs_read_thread_ratio" => self.dfs_read_thread_ratio = int(key, value)?,
            "heap_release_period_secs" => {
                self.heap_release_period = Duration::from_secs(int(key, value)?)
            }
            "heap_release_bytes" => self.heap_release_bytes = int(key, value)?,
            "rows_per_task" => self.rows_per_task = int(key, value)?,
            "tablet_read_quota" => self.tablet_read_quota = int(key, value)?,
            "scan_pack_size" => self.scan_pack_size = int(key, value)?,
            "ignore_corruption_in_open" => {
                self.ignore_corruption_in_open = boolean(key, value)?
            }
            "ignore_corruption_in_compaction" => {
                self.ignore_corruption_in_compaction = boolean(key, value)?
            }
            _ => return Err(errinput!("unknown flag {:?}", key)),
        }
        Ok(())
    }

    /// Cap on concurrent remote DFS reads, derived from the read pool size.
    pub fn dfs_read_limit(&self) -> usize {
        ((self.read_threads as f64 * self.dfs_read_thread_ratio) as usize).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let flags = Flags::default();
        assert_eq!(flags.cache_block_size, 4096);
        assert!(!flags.persistent_cache_enabled);
        assert_eq!(flags.dfs_read_limit(), 12);
    }

    #[test]
    fn test_load_and_reload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tabletserver.flag");
        let mut f = std::fs::File::create(&path)?;
        writeln!(f, "# tablet server flags")?;
        writeln!(f, "port = 9200")?;
        writeln!(f, "persistent_cache_enabled = on")?;
        writeln!(f, "dataset_size = 1048576")?;
        drop(f);

        let mut flags = Flags::load(&path)?;
        assert_eq!(flags.port, 9200);
        assert!(flags.persistent_cache_enabled);
        assert_eq!(flags.dataset_size, 1 << 20);

        let mut f = std::fs::File::create(&path)?;
        writeln!(f, "port = 9300")?;
        drop(f);
        flags.reload()?;
        assert_eq!(flags.port, 9300);
        Ok(())
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let mut flags = Flags::default();
        assert!(flags.set("no_such_flag", "1").is_err());
        assert!(flags.set("port", "not-a-number").is_err());
    }
}
