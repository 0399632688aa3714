//! Message store: one file per storage key, committed by temp-file + rename.
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::errors::{ArchiveError, ArchiveResult};
use crate::types::MessageIdentity;

const BLOB_DIR: &str = "blobs";
const TMP_DIR: &str = "tmp";
const BLOB_EXT: &str = "eml";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug)]
pub struct MessageStore {
    root: PathBuf,
}

impl MessageStore {
    pub async fn open(root: impl Into<PathBuf>) -> ArchiveResult<Self> {
        let root = root.into();
        for dir in [root.join(BLOB_DIR), root.join(TMP_DIR)] {
            fs::create_dir_all(&dir).await.map_err(|e| {
                ArchiveError::store(format!("creating {}: {}", dir.display(), e))
            })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic key for `(folder, identity)`. The NUL separator keeps
    /// `("a", "b:c")` and `("a:b", "c")` apart.
    pub fn storage_key(folder: &str, identity: &MessageIdentity) -> String {
        let mut hasher = Sha256::new();
        hasher.update(folder.as_bytes());
        hasher.update([0u8]);
        hasher.update(identity.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, key: &str) -> ArchiveResult<PathBuf> {
        validate_key(key)?;
        Ok(self
            .root
            .join(BLOB_DIR)
            .join(&key[..2])
            .join(format!("{}.{}", key, BLOB_EXT)))
    }

    /// All-or-nothing write. Whatever was at `key` before (an orphan from an
    /// interrupted pass, say) is replaced in one rename.
    pub async fn write(&self, key: &str, bytes: &[u8]) -> ArchiveResult<()> {
        let final_path = self.path_for(key)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ArchiveError::store(format!("creating {}: {}", parent.display(), e))
            })?;
        }

        let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.{}.{}.part", key, std::process::id(), seq));

        if let Err(e) = write_synced(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ArchiveError::store(format!(
                "writing {}: {}",
                tmp_path.display(),
                e
            )));
        }

        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ArchiveError::store(format!(
                "committing {}: {}",
                final_path.display(),
                e
            )));
        }

        debug!(key = %key, size = bytes.len(), "Blob committed");
        Ok(())
    }

    pub async fn read(&self, key: &str) -> ArchiveResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                Err(ArchiveError::NotFound(key.to_string()))
            }
            Err(e) => Err(ArchiveError::store(format!(
                "reading {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub async fn exists(&self, key: &str) -> ArchiveResult<bool> {
        let path = self.path_for(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| ArchiveError::store(format!("probing {}: {}", path.display(), e)))
    }

    /// Removing a blob that is already gone is fine.
    pub async fn delete(&self, key: &str) -> ArchiveResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArchiveError::store(format!(
                "deleting {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

fn validate_key(key: &str) -> ArchiveResult<()> {
    if key.len() < 2 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ArchiveError::store(format!("invalid storage key {:?}", key)));
    }
    Ok(())
}
