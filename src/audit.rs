//! Read-only consistency check: every index record must point at a blob that
//! exists and still hashes to the recorded checksum.
use futures::StreamExt;
use tracing::{info, warn};

use crate::errors::{ArchiveError, ArchiveResult};
use crate::sanitize::extract_fields;
use crate::storage::{sha256_hex, Index, MessageStore};
use crate::types::MessageIdentity;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub folder: String,
    pub checked: u64,
    pub missing: Vec<MessageIdentity>,
    pub mismatched: Vec<MessageIdentity>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

pub async fn verify_folder(
    index: &Index,
    store: &MessageStore,
    folder: &str,
) -> ArchiveResult<VerifyReport> {
    let mut report = VerifyReport {
        folder: folder.to_string(),
        ..VerifyReport::default()
    };

    let mut records = index.list(folder);
    while let Some(record) = records.next().await {
        let record = record?;
        report.checked += 1;
        match store.read(&record.storage_key).await {
            Ok(bytes) => {
                if sha256_hex(&bytes) != record.checksum {
                    warn!(folder = %folder, identity = %record.identity, "Checksum mismatch");
                    report.mismatched.push(record.identity);
                }
            }
            Err(ArchiveError::NotFound(_)) => {
                warn!(folder = %folder, identity = %record.identity, "Blob missing");
                report.missing.push(record.identity);
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        folder = %folder,
        checked = report.checked,
        missing = report.missing.len(),
        mismatched = report.mismatched.len(),
        "Verification finished"
    );
    Ok(report)
}

/// Number of archived messages in `folder` whose body carries at least one
/// link. Blobs that can't be read or parsed are left out of the count.
pub async fn count_with_links(
    index: &Index,
    store: &MessageStore,
    folder: &str,
) -> ArchiveResult<u64> {
    let mut with_links = 0;
    let mut records = index.list(folder);
    while let Some(record) = records.next().await {
        let record = record?;
        let bytes = match store.read(&record.storage_key).await {
            Ok(bytes) => bytes,
            Err(ArchiveError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        match extract_fields(&bytes) {
            Ok(fields) if !fields.links.is_empty() => with_links += 1,
            Ok(_) => {}
            Err(e) => warn!(folder = %folder, identity = %record.identity, error = %e, "Unparseable blob"),
        }
    }
    Ok(with_links)
}
