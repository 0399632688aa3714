//! Read-only export of the archive into rows, one per index record.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::{ArchiveError, ArchiveResult};
use crate::sanitize::{extract_fields, MessageFields};
use crate::storage::{Index, MessageStore};
use crate::types::{ArchiveRecord, MessageIdentity};

mod writer;

pub use writer::{open_writer, DelimitedWriter, TabularWriter, WorkbookWriter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportField {
    Identity,
    Folder,
    ArchivedAt,
    StorageKey,
    Size,
    Checksum,
    Sender,
    To,
    Cc,
    Subject,
    Date,
    Body,
    HasAttachments,
    AttachmentCount,
    Links,
    Error,
}

impl ExportField {
    pub const ALL: [ExportField; 16] = [
        ExportField::Identity,
        ExportField::Folder,
        ExportField::ArchivedAt,
        ExportField::StorageKey,
        ExportField::Size,
        ExportField::Checksum,
        ExportField::Sender,
        ExportField::To,
        ExportField::Cc,
        ExportField::Subject,
        ExportField::Date,
        ExportField::Body,
        ExportField::HasAttachments,
        ExportField::AttachmentCount,
        ExportField::Links,
        ExportField::Error,
    ];

    pub fn defaults() -> Vec<ExportField> {
        vec![
            ExportField::Date,
            ExportField::Sender,
            ExportField::Subject,
            ExportField::Size,
            ExportField::Identity,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            ExportField::Identity => "identity",
            ExportField::Folder => "folder",
            ExportField::ArchivedAt => "archived_at",
            ExportField::StorageKey => "storage_key",
            ExportField::Size => "size",
            ExportField::Checksum => "checksum",
            ExportField::Sender => "sender",
            ExportField::To => "to",
            ExportField::Cc => "cc",
            ExportField::Subject => "subject",
            ExportField::Date => "date",
            ExportField::Body => "body",
            ExportField::HasAttachments => "has_attachments",
            ExportField::AttachmentCount => "attachment_count",
            ExportField::Links => "links",
            ExportField::Error => "error",
        }
    }

    /// Whether the value comes from the message bytes rather than the record.
    pub fn needs_blob(self) -> bool {
        matches!(
            self,
            ExportField::Sender
                | ExportField::To
                | ExportField::Cc
                | ExportField::Subject
                | ExportField::Date
                | ExportField::Body
                | ExportField::HasAttachments
                | ExportField::AttachmentCount
                | ExportField::Links
        )
    }

    /// Parses a comma-separated list such as `"date, sender,subject"`.
    pub fn parse_list(raw: &str) -> ArchiveResult<Vec<ExportField>> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for ExportField {
    type Err = ArchiveError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().to_ascii_lowercase();
        if wanted == "from" {
            return Ok(ExportField::Sender);
        }
        ExportField::ALL
            .into_iter()
            .find(|field| field.name() == wanted)
            .ok_or_else(|| ArchiveError::Config(format!("unknown export field {:?}", raw)))
    }
}

impl fmt::Display for ExportField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Tsv,
    Xlsx,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Tsv => "tsv",
            ExportFormat::Xlsx => "xlsx",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ArchiveError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "tsv" => Ok(ExportFormat::Tsv),
            "xlsx" | "excel" => Ok(ExportFormat::Xlsx),
            other => Err(ArchiveError::Config(format!(
                "unknown export format {:?} (expected csv, tsv or xlsx)",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowError {
    pub identity: MessageIdentity,
    pub error: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExportReport {
    pub rows: u64,
    pub row_errors: Vec<RowError>,
}

pub struct Exporter {
    index: Arc<Index>,
    store: Arc<MessageStore>,
    fields: Vec<ExportField>,
}

impl Exporter {
    pub fn new(index: Arc<Index>, store: Arc<MessageStore>, fields: Vec<ExportField>) -> Self {
        Self {
            index,
            store,
            fields,
        }
    }

    /// Writes a header plus one row per record of `folder`, in index order.
    /// A record whose blob can't be read or parsed still gets a row; the
    /// failure is reported in the `error` column and in the returned report.
    pub async fn export(
        &self,
        folder: &str,
        writer: &mut dyn TabularWriter,
    ) -> ArchiveResult<ExportReport> {
        let header: Vec<&str> = self.fields.iter().map(|f| f.name()).collect();
        writer.write_header(&header)?;

        let wants_blob = self.fields.iter().any(|f| f.needs_blob());
        let mut report = ExportReport::default();
        let mut records = self.index.list(folder);

        while let Some(record) = records.next().await {
            let record = record?;
            let extracted = if wants_blob {
                self.load_fields(&record).await
            } else {
                Ok(MessageFields::default())
            };

            let (fields, error) = match extracted {
                Ok(fields) => (fields, None),
                Err(e) => {
                    warn!(folder = %folder, identity = %record.identity, error = %e, "Export row incomplete");
                    report.row_errors.push(RowError {
                        identity: record.identity.clone(),
                        error: e.to_string(),
                    });
                    (MessageFields::default(), Some(e.to_string()))
                }
            };

            let row: Vec<String> = self
                .fields
                .iter()
                .map(|field| cell(*field, &record, &fields, error.as_deref()))
                .collect();
            writer.write_row(&row)?;
            report.rows += 1;
        }

        writer.finish()?;
        info!(
            folder = %folder,
            rows = report.rows,
            row_errors = report.row_errors.len(),
            "Export completed"
        );
        Ok(report)
    }

    async fn load_fields(&self, record: &ArchiveRecord) -> ArchiveResult<MessageFields> {
        let raw = self.store.read(&record.storage_key).await?;
        extract_fields(&raw)
    }
}

fn cell(
    field: ExportField,
    record: &ArchiveRecord,
    fields: &MessageFields,
    error: Option<&str>,
) -> String {
    match field {
        ExportField::Identity => record.identity.to_string(),
        ExportField::Folder => record.folder.clone(),
        ExportField::ArchivedAt => record
            .archived_at_utc()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default(),
        ExportField::StorageKey => record.storage_key.clone(),
        ExportField::Size => record.size.to_string(),
        ExportField::Checksum => record.checksum.clone(),
        ExportField::Sender => fields.sender.clone(),
        ExportField::To => fields.to.clone(),
        ExportField::Cc => fields.cc.clone(),
        ExportField::Subject => fields.subject.clone(),
        ExportField::Date => fields.date.clone(),
        ExportField::Body => fields.body.clone(),
        ExportField::HasAttachments => {
            if error.is_some() {
                String::new()
            } else {
                fields.has_attachments.to_string()
            }
        }
        ExportField::AttachmentCount => {
            if error.is_some() {
                String::new()
            } else {
                fields.attachment_count.to_string()
            }
        }
        // One URL per line within the cell.
        ExportField::Links => fields.links.join("\n"),
        ExportField::Error => error.unwrap_or_default().to_string(),
    }
}
