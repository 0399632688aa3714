use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub type ArchiveResult<T> = Result<T, ArchiveError>;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Mail source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("Authentication failed: {0}")]
    AuthFailure(String),
    #[error("Fetch failed for {identity}: {reason}")]
    FetchFailed { identity: String, reason: String },
    #[error("Corrupt download for {identity}: expected {expected}, got {actual}")]
    CorruptDownload {
        identity: String,
        expected: String,
        actual: String,
    },
    #[error("Blocked {identity}: {reason}")]
    Blocked { identity: String, reason: String },
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("Message store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("No committed blob for storage key {0}")]
    NotFound(String),
    #[error("Folder {0} is already being synced")]
    AlreadySyncing(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Export error: {0}")]
    Export(String),
}

/// Discriminant used to count errors in a sync summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ErrorKind {
    SourceUnavailable,
    AuthFailure,
    FetchFailed,
    CorruptDownload,
    Blocked,
    IndexUnavailable,
    StoreUnavailable,
    NotFound,
    AlreadySyncing,
    Config,
    Export,
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            ArchiveError::AuthFailure(_) => ErrorKind::AuthFailure,
            ArchiveError::FetchFailed { .. } => ErrorKind::FetchFailed,
            ArchiveError::CorruptDownload { .. } => ErrorKind::CorruptDownload,
            ArchiveError::Blocked { .. } => ErrorKind::Blocked,
            ArchiveError::IndexUnavailable(_) => ErrorKind::IndexUnavailable,
            ArchiveError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            ArchiveError::NotFound(_) => ErrorKind::NotFound,
            ArchiveError::AlreadySyncing(_) => ErrorKind::AlreadySyncing,
            ArchiveError::Config(_) => ErrorKind::Config,
            ArchiveError::Export(_) => ErrorKind::Export,
        }
    }

    /// Per-identity failures are counted and skipped; everything else ends the pass.
    pub fn is_per_identity(&self) -> bool {
        matches!(
            self,
            ArchiveError::FetchFailed { .. }
                | ArchiveError::CorruptDownload { .. }
                | ArchiveError::Blocked { .. }
        )
    }

    pub(crate) fn index(err: impl fmt::Display) -> Self {
        ArchiveError::IndexUnavailable(err.to_string())
    }

    pub(crate) fn store(err: impl fmt::Display) -> Self {
        ArchiveError::StoreUnavailable(err.to_string())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::FetchFailed => "fetch_failed",
            ErrorKind::CorruptDownload => "corrupt_download",
            ErrorKind::Blocked => "blocked",
            ErrorKind::IndexUnavailable => "index_unavailable",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadySyncing => "already_syncing",
            ErrorKind::Config => "config",
            ErrorKind::Export => "export",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_message_level_failures_are_per_identity() {
        let fetch = ArchiveError::FetchFailed {
            identity: "1:7".into(),
            reason: "timeout".into(),
        };
        let corrupt = ArchiveError::CorruptDownload {
            identity: "1:7".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        let blocked = ArchiveError::Blocked {
            identity: "1:7".into(),
            reason: "sender is blacklisted".into(),
        };
        assert!(fetch.is_per_identity());
        assert!(corrupt.is_per_identity());
        assert!(blocked.is_per_identity());
        assert!(!ArchiveError::SourceUnavailable("down".into()).is_per_identity());
        assert!(!ArchiveError::AuthFailure("bad password".into()).is_per_identity());
        assert!(!ArchiveError::IndexUnavailable("locked".into()).is_per_identity());
    }

    #[test]
    fn kind_display_is_snake_case() {
        assert_eq!(ErrorKind::CorruptDownload.to_string(), "corrupt_download");
        assert_eq!(
            ArchiveError::AlreadySyncing("INBOX".into()).kind(),
            ErrorKind::AlreadySyncing
        );
    }
}
