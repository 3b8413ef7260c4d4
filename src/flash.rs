//! Flash mirror cache: whole-file SSD mirroring of remote SSTables.
//!
//! The simpler alternative to the persistent block cache, selectable per
//! server. Opening a remote table schedules a prioritised background copy
//! to a local mirror path; until the mirror exists with exactly the remote
//! size, reads keep going to the DFS. Failed copies are rescheduled with
//! exponentially decaying priority until the priority runs out. Deleting
//! the remote file deletes the mirror.

use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::dfs::{Dfs, RandomAccessFile, SequentialFile, WritableFile};
use crate::error::Result;

const INITIAL_PRIORITY: u32 = 64;

#[derive(Debug, PartialEq, Eq)]
struct CopyTask {
    priority: u32,
    remote: PathBuf,
}

impl Ord for CopyTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.remote.cmp(&self.remote))
    }
}

impl PartialOrd for CopyTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct CopyQueue {
    heap: Mutex<BinaryHeap<CopyTask>>,
    nonempty: Condvar,
}

pub struct FlashMirror {
    base: Arc<dyn Dfs>,
    mirror_root: PathBuf,
    queue: Arc<CopyQueue>,
    stopping: Arc<AtomicBool>,
}

impl FlashMirror {
    pub fn open(base: Arc<dyn Dfs>, mirror_root: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(mirror_root)?;
        let mirror = Arc::new(Self {
            base,
            mirror_root: mirror_root.to_path_buf(),
            queue: Arc::new(CopyQueue {
                heap: Mutex::new(BinaryHeap::new()),
                nonempty: Condvar::new(),
            }),
            stopping: Arc::new(AtomicBool::new(false)),
        });
        mirror.start_copier();
        Ok(mirror)
    }

    /// Local mirror path of a remote file: the remote path flattened under
    /// the mirror root.
    fn mirror_path(&self, remote: &Path) -> PathBuf {
        let flat: String = remote
            .to_string_lossy()
            .trim_start_matches('/')
            .replace('/', "#");
        self.mirror_root.join(flat)
    }

    /// True when the mirror exists and its size matches the remote file
    /// exactly; anything else is treated as absent.
    fn mirror_ready(&self, remote: &Path) -> Option<PathBuf> {
        let local = self.mirror_path(remote);
        let local_len = std::fs::metadata(&local).ok()?.len();
        let remote_len = self.base.file_size(remote).ok()?;
        (local_len == remote_len).then_some(local)
    }

    pub fn schedule_copy(&self, remote: &Path) {
        if self.mirror_ready(remote).is_some() {
            return;
        }
        self.enqueue(CopyTask {
            priority: INITIAL_PRIORITY,
            remote: remote.to_path_buf(),
        });
    }

    fn enqueue(&self, task: CopyTask) {
        let mut heap = self.queue.heap.lock().unwrap();
        if heap.iter().any(|t| t.remote == task.remote) {
            return;
        }
        heap.push(task);
        drop(heap);
        self.queue.nonempty.notify_one();
    }

    fn start_copier(self: &Arc<Self>) {
        let mirror = Arc::downgrade(self);
        let queue = self.queue.clone();
        let stopping = self.stopping.clone();
        std::thread::Builder::new()
            .name("flash-copier".into())
            .spawn(move || loop {
                let task = {
                    let mut heap = queue.heap.lock().unwrap();
                    loop {
                        if stopping.load(Ordering::SeqCst) {
                            return;
                        }
                        match heap.pop() {
                            Some(task) => break task,
                            None => heap = queue.nonempty.wait(heap).unwrap(),
                        }
                    }
                };
                let mirror = match mirror.upgrade() {
                    Some(mirror) => mirror,
                    None => return,
                };
                if let Err(err) = mirror.copy_once(&task.remote) {
                    let priority = task.priority / 2;
                    tracing::warn!(
                        remote = %task.remote.display(),
                        error = %err,
                        retry_priority = priority,
                        "mirror copy failed"
                    );
                    if priority > 0 {
                        mirror.enqueue(CopyTask {
                            priority,
                            remote: task.remote,
                        });
                    }
                }
            })
            .expect("spawn flash-copier");
    }

    fn copy_once(&self, remote: &Path) -> Result<()> {
        if self.mirror_ready(remote).is_some() {
            return Ok(());
        }
        let local = self.mirror_path(remote);
        let tmp = local.with_extension("copying");

        let mut reader = self.base.open_sequential(remote)?;
        let mut out = std::fs::File::create(&tmp)?;
        let mut buf = vec![0u8; 256 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            std::io::Write::write_all(&mut out, &buf[..n])?;
        }
        out.sync_all()?;
        drop(out);
        std::fs::rename(&tmp, &local)?;
        tracing::info!(remote = %remote.display(), "mirrored to flash");
        Ok(())
    }

    pub fn drop_mirror(&self, remote: &Path) {
        let local = self.mirror_path(remote);
        if local.exists() {
            let _ = std::fs::remove_file(local);
        }
        let mut heap = self.queue.heap.lock().unwrap();
        let keep: Vec<CopyTask> = heap.drain().filter(|t| t.remote != remote).collect();
        heap.extend(keep);
    }

    /// Wait for the copy queue to drain. Test and shutdown aid.
    pub fn drain(&self) {
        loop {
            {
                let heap = self.queue.heap.lock().unwrap();
                if heap.is_empty() {
                    // The in-flight task, if any, re-enqueues before this
                    // observes an empty queue twice in a row.
                    break;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
}

impl Drop for FlashMirror {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.queue.nonempty.notify_all();
    }
}

/// DFS layer serving table reads from the flash mirror when it is complete.
pub struct FlashDfs {
    base: Arc<dyn Dfs>,
    mirror: Arc<FlashMirror>,
    local: Arc<dyn Dfs>,
}

impl FlashDfs {
    pub fn new(base: Arc<dyn Dfs>, mirror: Arc<FlashMirror>) -> Arc<dyn Dfs> {
        Arc::new(Self {
            base,
            mirror,
            local: crate::dfs::LocalDfs::new(),
        })
    }
}

fn is_table_file(path: &Path) -> bool {
    path.extension().map(|e| e == "sst").unwrap_or(false)
}

impl Dfs for FlashDfs {
    fn open_sequential(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        self.base.open_sequential(path)
    }

    fn open_random(&self, path: &Path) -> Result<Arc<dyn RandomAccessFile>> {
        if is_table_file(path) {
            if let Some(local) = self.mirror.mirror_ready(path) {
                return self.local.open_random(&local);
            }
            self.mirror.schedule_copy(path);
        }
        self.base.open_random(path)
    }

    fn create(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        self.base.create(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.base.exists(path)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        self.base.file_size(path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.base.list_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.base.create_dir_all(path)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        if is_table_file(path) {
            self.mirror.drop_mirror(path);
        }
        self.base.delete(path)
    }

    fn delete_dir_all(&self, path: &Path) -> Result<()> {
        self.base.delete_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if is_table_file(from) {
            self.mirror.drop_mirror(from);
        }
        self.base.rename(from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfs::LocalDfs;

    fn write_remote(dfs: &dyn Dfs, path: &Path, data: &[u8]) {
        let mut file = dfs.create(path).unwrap();
        file.append(data).unwrap();
        file.sync().unwrap();
    }

    #[test]
    fn test_copy_then_serve_local() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let remote: Arc<dyn Dfs> = LocalDfs::new();
        let remote_path = dir.path().join("000001.sst");
        write_remote(remote.as_ref(), &remote_path, b"table-bytes");

        let mirror = FlashMirror::open(remote.clone(), &dir.path().join("flash"))?;
        let layered = FlashDfs::new(remote.clone(), mirror.clone());

        // First open schedules the copy and serves remote.
        let file = layered.open_random(&remote_path)?;
        let mut buf = [0u8; 11];
        file.read_at(0, &mut buf)?;
        assert_eq!(&buf, b"table-bytes");

        mirror.drain();
        assert!(mirror.mirror_ready(&remote_path).is_some());

        // Second open serves the mirror.
        let file = layered.open_random(&remote_path)?;
        let mut buf = [0u8; 5];
        file.read_at(6, &mut buf)?;
        assert_eq!(&buf, b"bytes");
        Ok(())
    }

    #[test]
    fn test_size_mismatch_not_served() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let remote: Arc<dyn Dfs> = LocalDfs::new();
        let remote_path = dir.path().join("000002.sst");
        write_remote(remote.as_ref(), &remote_path, b"0123456789");

        let mirror = FlashMirror::open(remote.clone(), &dir.path().join("flash"))?;
        mirror.schedule_copy(&remote_path);
        mirror.drain();
        assert!(mirror.mirror_ready(&remote_path).is_some());

        // The remote grows (stand-in for a torn mirror): size mismatch
        // invalidates the mirror.
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&remote_path)?;
        std::io::Write::write_all(&mut file, b"xx")?;
        assert!(mirror.mirror_ready(&remote_path).is_none());
        Ok(())
    }

    #[test]
    fn test_delete_removes_mirror() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let remote: Arc<dyn Dfs> = LocalDfs::new();
        let remote_path = dir.path().join("000003.sst");
        write_remote(remote.as_ref(), &remote_path, b"doomed");

        let mirror = FlashMirror::open(remote.clone(), &dir.path().join("flash"))?;
        let layered = FlashDfs::new(remote.clone(), mirror.clone());
        mirror.schedule_copy(&remote_path);
        mirror.drain();
        let local = mirror.mirror_path(&remote_path);
        assert!(local.exists());

        layered.delete(&remote_path)?;
        assert!(!local.exists());
        assert!(!layered.exists(&remote_path));
        Ok(())
    }

    #[test]
    fn test_failed_copy_decays_and_gives_up() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let remote: Arc<dyn Dfs> = LocalDfs::new();
        let mirror = FlashMirror::open(remote.clone(), &dir.path().join("flash"))?;

        // Nonexistent remote: every attempt fails, priority decays to zero
        // and the task disappears instead of spinning forever.
        mirror.schedule_copy(&dir.path().join("missing.sst"));
        mirror.drain();
        assert!(mirror.queue.heap.lock().unwrap().is_empty());
        Ok(())
    }
}
