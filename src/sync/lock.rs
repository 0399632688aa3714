use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fs2::FileExt;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::errors::{ArchiveError, ArchiveResult};
use crate::storage::sha256_hex;

const LOCK_DIR: &str = "locks";

// Lock paths held by this process. flock alone doesn't reliably exclude a
// second handle opened by the same process on every platform.
static HELD: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive right to run a sync pass for one folder of one archive root.
/// Released on drop.
#[derive(Debug)]
pub struct FolderLock {
    file: File,
    path: PathBuf,
}

impl FolderLock {
    pub fn acquire(root: &Path, folder: &str) -> ArchiveResult<Self> {
        let dir = root.join(LOCK_DIR);
        fs::create_dir_all(&dir)
            .map_err(|e| ArchiveError::store(format!("creating {}: {}", dir.display(), e)))?;
        let path = dir.join(format!("{}.lock", &sha256_hex(folder.as_bytes())[..16]));

        if !held().insert(path.clone()) {
            return Err(ArchiveError::AlreadySyncing(folder.to_string()));
        }

        match Self::lock_file(&path, folder) {
            Ok(file) => {
                debug!(folder = %folder, path = %path.display(), "Folder lock acquired");
                Ok(Self { file, path })
            }
            Err(e) => {
                release_in_process(&path);
                Err(e)
            }
        }
    }

    fn lock_file(path: &Path, folder: &str) -> ArchiveResult<File> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ArchiveError::store(format!("opening {}: {}", path.display(), e)))?;

        if file.try_lock_exclusive().is_err() {
            return Err(ArchiveError::AlreadySyncing(folder.to_string()));
        }

        // Owner metadata, for humans inspecting a stuck lock.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}\npid={}", folder, std::process::id());
        Ok(file)
    }
}

impl Drop for FolderLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        release_in_process(&self.path);
    }
}

// The set is only ever inserted into or removed from, so a panic elsewhere
// while it was locked can't leave it inconsistent.
fn held() -> MutexGuard<'static, HashSet<PathBuf>> {
    HELD.lock().unwrap_or_else(PoisonError::into_inner)
}

fn release_in_process(path: &Path) {
    held().remove(path);
}
