//! Incremental sync: archive every remote message the index doesn't know yet.
//!
//! Each identity moves `missing -> fetched -> verified -> indexed`. The index
//! row is written last, so an interrupted pass leaves at worst an orphan blob,
//! which the next pass overwrites at the same storage key.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, FuturesUnordered, StreamExt};
use tracing::{debug, error, info, warn};

use crate::errors::{ArchiveError, ArchiveResult};
use crate::source::{IdentityStream, MailSource};
use crate::storage::{sha256_hex, Index, MessageStore};
use crate::types::{now_millis, ArchiveRecord, FetchedMessage, MessageIdentity, SyncSummary};

mod lock;
mod screen;

pub use lock::FolderLock;
pub use screen::{ScreeningRules, DEFAULT_SUSPICIOUS_PATTERNS};

#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// Upper bound on identities being fetched/stored at once.
    pub concurrency: usize,
    /// Re-read each committed blob and compare checksums before indexing it.
    pub verify_checksum: bool,
    /// Only consider the latest `n` identities the source lists.
    pub limit: Option<usize>,
    pub screening: ScreeningRules,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            verify_checksum: true,
            limit: None,
            screening: ScreeningRules::default(),
        }
    }
}

#[derive(Debug)]
enum Outcome {
    AlreadyArchived,
    Archived,
}

pub struct SyncEngine {
    source: Arc<dyn MailSource>,
    index: Arc<Index>,
    store: Arc<MessageStore>,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn MailSource>,
        index: Arc<Index>,
        store: Arc<MessageStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            index,
            store,
            options,
        }
    }

    /// Runs one pass over `folder`. Per-message failures are counted in the
    /// summary; source, index, and store outages end the pass with an error.
    pub async fn sync_folder(&self, folder: &str) -> ArchiveResult<SyncSummary> {
        let started = Instant::now();
        let _lock = FolderLock::acquire(self.store.root(), folder)?;
        info!(
            folder = %folder,
            concurrency = self.options.concurrency,
            limit = ?self.options.limit,
            "Starting sync pass"
        );

        let mut summary = SyncSummary::new(folder);
        let listing = self.source.list_identities(folder).await?;
        let mut identities = match self.options.limit {
            Some(n) => latest(listing, n, folder, &mut summary).await,
            None => listing,
        };

        let mut in_flight = FuturesUnordered::new();
        let mut listing_done = false;
        let limit = self.options.concurrency.max(1);

        // Listing and workers are polled together so a slow listing never
        // starves fetches already in flight.
        loop {
            tokio::select! {
                next = identities.next(), if !listing_done && in_flight.len() < limit => match next {
                    Some(Ok(identity)) => in_flight.push(self.archive_one(folder, identity)),
                    Some(Err(e)) => {
                        warn!(folder = %folder, error = %e, "Remote listing stopped early");
                        summary.enumeration_error = Some(e.to_string());
                        listing_done = true;
                    }
                    None => listing_done = true,
                },
                Some(result) = in_flight.next(), if !in_flight.is_empty() => match result {
                    Ok(Outcome::AlreadyArchived) => summary.already_archived += 1,
                    Ok(Outcome::Archived) => summary.archived += 1,
                    Err(e) if e.is_per_identity() => summary.record_error(e.kind()),
                    Err(e) => {
                        error!(folder = %folder, error = %e, "Sync pass aborted");
                        return Err(e);
                    }
                },
                else => break,
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            folder = %folder,
            archived = summary.archived,
            skipped = summary.skipped,
            blocked = summary.blocked,
            already_archived = summary.already_archived,
            elapsed_ms = ?summary.elapsed.as_millis(),
            "Sync pass completed"
        );
        Ok(summary)
    }

    async fn archive_one(
        &self,
        folder: &str,
        identity: MessageIdentity,
    ) -> ArchiveResult<Outcome> {
        let _guard = self.index.lock_key(folder, &identity).await;
        if self.index.contains(folder, &identity).await? {
            return Ok(Outcome::AlreadyArchived);
        }

        if self.options.screening.is_active() {
            let envelope = self.source.envelope(folder, &identity).await?;
            let reasons = self.options.screening.check(&envelope);
            if !reasons.is_empty() {
                return Err(blocked(folder, &identity, reasons.join("; ")));
            }
        }

        let started = Instant::now();
        let fetched = self
            .source
            .fetch(folder, &identity)
            .await
            .inspect_err(|e| {
                if e.is_per_identity() {
                    warn!(folder = %folder, identity = %identity, error = %e, "Fetch failed; retrying next pass");
                }
            })?;

        // Sources that can't announce a size are held to the limit here.
        if let Some(reason) = self.options.screening.check_size(fetched.bytes.len() as u64) {
            return Err(blocked(folder, &identity, reason));
        }

        let storage_key = MessageStore::storage_key(folder, &identity);
        self.store.write(&storage_key, &fetched.bytes).await?;

        let checksum = match self.verify(&storage_key, &identity, &fetched).await {
            Ok(checksum) => checksum,
            Err(e) => {
                self.store.delete(&storage_key).await?;
                warn!(folder = %folder, identity = %identity, error = %e, "Rolled back corrupt download");
                return Err(e);
            }
        };

        let record = ArchiveRecord {
            identity,
            folder: folder.to_string(),
            archived_at: now_millis(),
            storage_key,
            size: fetched.bytes.len() as u64,
            checksum,
        };
        self.index.put(&record).await?;

        debug!(
            folder = %folder,
            identity = %record.identity,
            size = record.size,
            elapsed_ms = ?started.elapsed().as_millis(),
            "Message archived"
        );
        Ok(Outcome::Archived)
    }

    /// Returns the checksum to record. With verification on, the committed
    /// blob is read back and must hash to the source's checksum, or to the
    /// fetched bytes' checksum when the source gave none.
    async fn verify(
        &self,
        storage_key: &str,
        identity: &MessageIdentity,
        fetched: &FetchedMessage,
    ) -> ArchiveResult<String> {
        let fetched_checksum = sha256_hex(&fetched.bytes);
        if !self.options.verify_checksum {
            return Ok(fetched_checksum);
        }

        let written = match self.store.read(storage_key).await {
            Ok(bytes) => bytes,
            Err(ArchiveError::NotFound(key)) => {
                return Err(ArchiveError::store(format!(
                    "blob {} vanished right after commit",
                    key
                )))
            }
            Err(e) => return Err(e),
        };
        let actual = sha256_hex(&written);
        let expected = fetched
            .checksum
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or(fetched_checksum);

        if actual != expected {
            return Err(ArchiveError::CorruptDownload {
                identity: identity.to_string(),
                expected,
                actual,
            });
        }
        Ok(actual)
    }
}

fn blocked(folder: &str, identity: &MessageIdentity, reason: String) -> ArchiveError {
    info!(folder = %folder, identity = %identity, reason = %reason, "Message blocked by screening");
    ArchiveError::Blocked {
        identity: identity.to_string(),
        reason,
    }
}

/// Drains the listing and keeps only its last `n` identities, in source
/// order. A listing error ends the window early and is noted in `summary`.
async fn latest(
    mut listing: IdentityStream,
    n: usize,
    folder: &str,
    summary: &mut SyncSummary,
) -> IdentityStream {
    let mut window = VecDeque::with_capacity(n);
    while let Some(item) = listing.next().await {
        match item {
            Ok(identity) => {
                if n == 0 {
                    continue;
                }
                if window.len() == n {
                    window.pop_front();
                }
                window.push_back(identity);
            }
            Err(e) => {
                warn!(folder = %folder, error = %e, "Remote listing stopped early");
                summary.enumeration_error = Some(e.to_string());
                break;
            }
        }
    }
    debug!(folder = %folder, window = window.len(), "Limited pass to the latest identities");
    stream::iter(window.into_iter().map(Ok)).boxed()
}
