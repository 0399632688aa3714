use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use rust_xlsxwriter::{Format, Workbook, XlsxError};

use crate::errors::{ArchiveError, ArchiveResult};
use crate::export::ExportFormat;
use crate::sanitize::clip_to_cell;

const SHEET_NAME: &str = "Emails";

/// Row/column sink for exported records.
pub trait TabularWriter {
    fn write_header(&mut self, columns: &[&str]) -> ArchiveResult<()>;
    fn write_row(&mut self, values: &[String]) -> ArchiveResult<()>;
    /// Flushes everything to its destination. Nothing is guaranteed on disk
    /// before this returns.
    fn finish(&mut self) -> ArchiveResult<()>;
}

pub fn open_writer(format: ExportFormat, path: &Path) -> ArchiveResult<Box<dyn TabularWriter>> {
    match format {
        ExportFormat::Csv => Ok(Box::new(DelimitedWriter::create(path, b',')?)),
        ExportFormat::Tsv => Ok(Box::new(DelimitedWriter::create(path, b'\t')?)),
        ExportFormat::Xlsx => Ok(Box::new(WorkbookWriter::new(path))),
    }
}

/// CSV/TSV output via the `csv` crate.
pub struct DelimitedWriter<W: Write> {
    inner: csv::Writer<W>,
}

impl DelimitedWriter<File> {
    pub fn create(path: &Path, delimiter: u8) -> ArchiveResult<Self> {
        let inner = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(path)
            .map_err(|e| ArchiveError::Export(format!("creating {}: {}", path.display(), e)))?;
        Ok(Self { inner })
    }
}

impl<W: Write> DelimitedWriter<W> {
    pub fn from_writer(writer: W, delimiter: u8) -> Self {
        Self {
            inner: csv::WriterBuilder::new()
                .delimiter(delimiter)
                .from_writer(writer),
        }
    }

    pub fn into_inner(self) -> ArchiveResult<W> {
        self.inner
            .into_inner()
            .map_err(|e| ArchiveError::Export(format!("flushing output: {}", e.error())))
    }
}

impl<W: Write> TabularWriter for DelimitedWriter<W> {
    fn write_header(&mut self, columns: &[&str]) -> ArchiveResult<()> {
        self.inner.write_record(columns).map_err(csv_error)
    }

    fn write_row(&mut self, values: &[String]) -> ArchiveResult<()> {
        self.inner.write_record(values).map_err(csv_error)
    }

    fn finish(&mut self) -> ArchiveResult<()> {
        self.inner
            .flush()
            .map_err(|e| ArchiveError::Export(format!("flushing output: {}", e)))
    }
}

fn csv_error(err: csv::Error) -> ArchiveError {
    ArchiveError::Export(format!("writing row: {}", err))
}

/// XLSX workbook with a single `Emails` sheet and a frozen header row.
pub struct WorkbookWriter {
    workbook: Workbook,
    path: PathBuf,
    next_row: u32,
}

impl WorkbookWriter {
    pub fn new(path: &Path) -> Self {
        let mut workbook = Workbook::new();
        workbook.add_worksheet();
        Self {
            workbook,
            path: path.to_path_buf(),
            next_row: 0,
        }
    }

    fn write_cells(&mut self, values: &[&str], format: Option<&Format>) -> Result<(), XlsxError> {
        let row = self.next_row;
        let sheet = self.workbook.worksheet_from_index(0)?;
        for (col, value) in values.iter().enumerate() {
            let text = clip_to_cell(value);
            match format {
                Some(format) => sheet.write_string_with_format(row, col as u16, text, format)?,
                None => sheet.write_string(row, col as u16, text)?,
            };
        }
        self.next_row += 1;
        Ok(())
    }
}

impl TabularWriter for WorkbookWriter {
    fn write_header(&mut self, columns: &[&str]) -> ArchiveResult<()> {
        let bold = Format::new().set_bold();
        self.write_cells(columns, Some(&bold)).map_err(xlsx_error)?;
        let sheet = self.workbook.worksheet_from_index(0).map_err(xlsx_error)?;
        sheet.set_name(SHEET_NAME).map_err(xlsx_error)?;
        sheet.set_freeze_panes(1, 0).map_err(xlsx_error)?;
        Ok(())
    }

    fn write_row(&mut self, values: &[String]) -> ArchiveResult<()> {
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        self.write_cells(&refs, None).map_err(xlsx_error)
    }

    fn finish(&mut self) -> ArchiveResult<()> {
        let sheet = self.workbook.worksheet_from_index(0).map_err(xlsx_error)?;
        sheet.autofit();
        self.workbook
            .save(&self.path)
            .map_err(|e| ArchiveError::Export(format!("saving {}: {}", self.path.display(), e)))
    }
}

fn xlsx_error(err: XlsxError) -> ArchiveError {
    ArchiveError::Export(format!("writing workbook: {}", err))
}
