use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;

/// Source-assigned identifier of a message within one folder.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageIdentity(String);

impl MessageIdentity {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageIdentity {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for MessageIdentity {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub identity: MessageIdentity,
    pub folder: String,
    pub archived_at: i64, // epoch millis, UTC
    pub storage_key: String,
    pub size: u64,
    pub checksum: String, // lowercase hex sha256
}

impl ArchiveRecord {
    pub fn archived_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.archived_at)
    }
}

/// Raw message as handed back by a mail source.
#[derive(Clone, Debug)]
pub struct FetchedMessage {
    pub bytes: Vec<u8>,
    /// Hex sha256 announced by the source, when it has one.
    pub checksum: Option<String>,
}

/// What a source can tell about a message without downloading it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Announced size in bytes (RFC822.SIZE for IMAP).
    pub size: Option<u64>,
    pub sender: String,
    pub subject: String,
}

/// Result of one sync pass over one folder.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncSummary {
    pub folder: String,
    pub already_archived: u64,
    pub archived: u64,
    /// Failed this pass and will be retried on the next one.
    pub skipped: u64,
    /// Refused by screening rules; re-screened on every pass.
    pub blocked: u64,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    /// Set when the source stopped enumerating early.
    pub enumeration_error: Option<String>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl SyncSummary {
    pub fn new(folder: &str) -> Self {
        Self {
            folder: folder.to_string(),
            ..Self::default()
        }
    }

    pub fn record_error(&mut self, kind: ErrorKind) {
        if kind == ErrorKind::Blocked {
            self.blocked += 1;
        } else {
            self.skipped += 1;
        }
        *self.errors_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn errors(&self, kind: ErrorKind) -> u64 {
        self.errors_by_kind.get(&kind).copied().unwrap_or(0)
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: archived={} skipped={} blocked={} already_archived={}",
            self.folder, self.archived, self.skipped, self.blocked, self.already_archived
        )?;
        for (kind, count) in &self.errors_by_kind {
            write!(f, " {}={}", kind, count)?;
        }
        if let Some(err) = &self.enumeration_error {
            write!(f, " (listing stopped early: {})", err)?;
        }
        Ok(())
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
