use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use futures::stream::{BoxStream, StreamExt};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::errors::{ArchiveError, ArchiveResult};
use crate::types::{ArchiveRecord, MessageIdentity};

pub const INDEX_FILE_NAME: &str = "index.db";

const KEY_LOCK_STRIPES: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FolderStats {
    pub folder: String,
    pub records: u64,
    pub total_bytes: u64,
    pub first_archived_at: Option<i64>,
    pub last_archived_at: Option<i64>,
}

/// Durable `(folder, identity) -> ArchiveRecord` table backed by SQLite.
pub struct Index {
    pool: SqlitePool,
    path: PathBuf,
    key_locks: Vec<Mutex<()>>,
}

impl Index {
    pub async fn open_in(data_dir: &Path) -> ArchiveResult<Self> {
        Self::open(data_dir.join(INDEX_FILE_NAME)).await
    }

    pub async fn open(path: impl Into<PathBuf>) -> ArchiveResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ArchiveError::index(format!("creating {}: {}", parent.display(), e))
            })?;
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url).await.map_err(|e| {
            ArchiveError::index(format!("connecting to sqlite at {}: {}", path.display(), e))
        })?;

        let index = Index {
            pool,
            path,
            key_locks: (0..KEY_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        };
        index.migrate().await?;
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn migrate(&self) -> ArchiveResult<()> {
        sqlx::query("PRAGMA journal_mode = WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| ArchiveError::index(format!("enabling WAL: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS archive_records (
                folder TEXT NOT NULL,
                identity TEXT NOT NULL,
                archived_at INTEGER NOT NULL,
                storage_key TEXT NOT NULL,
                size INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                PRIMARY KEY (folder, identity)
            );
            CREATE INDEX IF NOT EXISTS idx_archive_records_folder_time
                ON archive_records(folder, archived_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ArchiveError::index(format!("running migrations: {}", e)))?;

        Ok(())
    }

    /// Serializes work on one `(folder, identity)` key. Keys share a fixed set
    /// of stripes, so unrelated keys may occasionally wait on each other.
    pub async fn lock_key(&self, folder: &str, identity: &MessageIdentity) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        folder.hash(&mut hasher);
        identity.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.key_locks.len();
        self.key_locks[stripe].lock().await
    }

    pub async fn contains(&self, folder: &str, identity: &MessageIdentity) -> ArchiveResult<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM archive_records WHERE folder = ?1 AND identity = ?2 LIMIT 1",
        )
        .bind(folder)
        .bind(identity.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ArchiveError::index(format!("checking {}/{}: {}", folder, identity, e)))?;
        Ok(row.is_some())
    }

    pub async fn get(
        &self,
        folder: &str,
        identity: &MessageIdentity,
    ) -> ArchiveResult<Option<ArchiveRecord>> {
        let row = sqlx::query(
            r#"
            SELECT folder, identity, archived_at, storage_key, size, checksum
            FROM archive_records
            WHERE folder = ?1 AND identity = ?2
            "#,
        )
        .bind(folder)
        .bind(identity.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ArchiveError::index(format!("loading {}/{}: {}", folder, identity, e)))?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Inserts or replaces the record for its `(folder, identity)` in a single
    /// statement, so readers see either the old row or the new one.
    pub async fn put(&self, record: &ArchiveRecord) -> ArchiveResult<()> {
        sqlx::query(
            r#"
            INSERT INTO archive_records (folder, identity, archived_at, storage_key, size, checksum)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(folder, identity) DO UPDATE SET
                archived_at = excluded.archived_at,
                storage_key = excluded.storage_key,
                size = excluded.size,
                checksum = excluded.checksum;
            "#,
        )
        .bind(&record.folder)
        .bind(record.identity.as_str())
        .bind(record.archived_at)
        .bind(&record.storage_key)
        .bind(record.size as i64)
        .bind(&record.checksum)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            ArchiveError::index(format!(
                "upserting {}/{}: {}",
                record.folder, record.identity, e
            ))
        })?;

        debug!(folder = %record.folder, identity = %record.identity, "Index record stored");
        Ok(())
    }

    pub async fn remove(&self, folder: &str, identity: &MessageIdentity) -> ArchiveResult<bool> {
        let res = sqlx::query("DELETE FROM archive_records WHERE folder = ?1 AND identity = ?2")
            .bind(folder)
            .bind(identity.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                ArchiveError::index(format!("deleting {}/{}: {}", folder, identity, e))
            })?;
        Ok(res.rows_affected() > 0)
    }

    /// Lazily streams a folder's records, oldest first. Each call starts a
    /// fresh query over the current table contents.
    pub fn list<'a>(&'a self, folder: &'a str) -> BoxStream<'a, ArchiveResult<ArchiveRecord>> {
        sqlx::query(
            r#"
            SELECT folder, identity, archived_at, storage_key, size, checksum
            FROM archive_records
            WHERE folder = ?1
            ORDER BY archived_at ASC, rowid ASC
            "#,
        )
        .bind(folder)
        .fetch(&self.pool)
        .map(|row| {
            row.map_err(|e| ArchiveError::index(format!("listing records: {}", e)))
                .and_then(|row| record_from_row(&row))
        })
        .boxed()
    }

    pub async fn folders(&self) -> ArchiveResult<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT folder FROM archive_records ORDER BY folder ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ArchiveError::index(format!("listing folders: {}", e)))?;

        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(ArchiveError::index))
            .collect()
    }

    /// Per-folder totals; `None` covers every folder in the index.
    pub async fn stats(&self, folder: Option<&str>) -> ArchiveResult<Vec<FolderStats>> {
        let rows = sqlx::query(
            r#"
            SELECT folder, COUNT(*), COALESCE(SUM(size), 0), MIN(archived_at), MAX(archived_at)
            FROM archive_records
            WHERE ?1 IS NULL OR folder = ?1
            GROUP BY folder
            ORDER BY folder ASC
            "#,
        )
        .bind(folder)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ArchiveError::index(format!("computing stats: {}", e)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(FolderStats {
                folder: row.try_get(0).map_err(ArchiveError::index)?,
                records: row.try_get::<i64, _>(1).map_err(ArchiveError::index)? as u64,
                total_bytes: row.try_get::<i64, _>(2).map_err(ArchiveError::index)? as u64,
                first_archived_at: row.try_get(3).map_err(ArchiveError::index)?,
                last_archived_at: row.try_get(4).map_err(ArchiveError::index)?,
            });
        }
        Ok(out)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_from_row(row: &SqliteRow) -> ArchiveResult<ArchiveRecord> {
    Ok(ArchiveRecord {
        folder: row.try_get("folder").map_err(ArchiveError::index)?,
        identity: MessageIdentity::new(
            row.try_get::<String, _>("identity")
                .map_err(ArchiveError::index)?,
        ),
        archived_at: row.try_get("archived_at").map_err(ArchiveError::index)?,
        storage_key: row.try_get("storage_key").map_err(ArchiveError::index)?,
        size: row.try_get::<i64, _>("size").map_err(ArchiveError::index)? as u64,
        checksum: row.try_get("checksum").map_err(ArchiveError::index)?,
    })
}
