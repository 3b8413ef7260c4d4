//! Exclusive directory lock.
//!
//! The persistent cache's data sets and metadata engine assume a single
//! owning process; a second server pointed at the same cache directory
//! would corrupt both. The lock file holds the owner's pid for operators
//! chasing a stale lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn lock(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn unlock(self) -> io::Result<()> {
        // The fd closes with the file; removing the lock file is cosmetic.
        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }
}
