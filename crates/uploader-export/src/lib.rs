//! Parser for the fixed-layout time-tracking CSV export.
//!
//! Layout: six metadata lines, one header row (`<label>, <label>, DD-MM-YY, ...`),
//! then one row per activity/group pair with a duration per date column.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};
use thiserror::Error;
use uploader_core::{ActivityEntry, ParsedExport};

pub const CRATE_NAME: &str = "uploader-export";

/// Leading lines skipped before the header row.
pub const METADATA_LINES: usize = 6;
pub const EXPORT_EXTENSION: &str = "csv";
pub const HEADER_DATE_FORMAT: &str = "%d-%m-%y";
pub const HEADER_LABELS: [&str; 2] = ["Activity", "Group"];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(
        "export has {found} line(s) before the header; expected {} metadata lines and a header row",
        METADATA_LINES
    )]
    TruncatedPreamble { found: usize },
    #[error("header row has {found} column(s); expected at least the activity and group columns")]
    MissingLabelColumns { found: usize },
    #[error("header column {column} has date {value:?} not in DD-MM-YY format")]
    InvalidHeaderDate { column: usize, value: String },
    #[error("line {line} has {found} column(s) but the header declares {expected}")]
    ShortRow {
        line: u64,
        found: usize,
        expected: usize,
    },
    #[error("line {line} column {column} has invalid duration {value:?}")]
    InvalidDuration {
        line: u64,
        column: usize,
        value: String,
    },
    #[error("reading csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// True for paths carrying the export extension.
pub fn is_export_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext == EXPORT_EXTENSION)
        .unwrap_or(false)
}

pub fn parse_export_file(path: impl AsRef<Path>) -> Result<ParsedExport, ExportError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_export(&content)
}

pub fn parse_export(content: &str) -> Result<ParsedExport, ExportError> {
    let table = skip_metadata(content)?;

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(table.as_bytes());
    let mut records = reader.records();

    let header = match records.next() {
        Some(record) => record?,
        None => {
            return Err(ExportError::TruncatedPreamble {
                found: METADATA_LINES,
            })
        }
    };
    let dates = header_dates(&header)?;
    let expected = header.len();

    let mut export = ParsedExport::new();
    for record in records {
        let record = record?;
        if is_blank(&record) {
            continue;
        }
        // Reported lines count the skipped preamble so they match the file.
        let line = record
            .position()
            .map(|p| p.line() + METADATA_LINES as u64)
            .unwrap_or_default();
        if record.len() < expected {
            return Err(ExportError::ShortRow {
                line,
                found: record.len(),
                expected,
            });
        }

        let activity = &record[0];
        let group = &record[1];
        for (offset, date) in dates.iter().enumerate() {
            let column = offset + HEADER_LABELS.len();
            let Some(duration) = parse_duration(&record[column], line, column)? else {
                continue;
            };
            export.record(
                *date,
                group,
                ActivityEntry {
                    activity: activity.to_string(),
                    duration,
                },
            );
        }
    }

    Ok(export)
}

fn skip_metadata(content: &str) -> Result<&str, ExportError> {
    let mut rest = content;
    for skipped in 0..METADATA_LINES {
        match rest.find('\n') {
            Some(idx) => rest = &rest[idx + 1..],
            None => {
                return Err(ExportError::TruncatedPreamble {
                    found: skipped + usize::from(!rest.is_empty()),
                })
            }
        }
    }
    Ok(rest)
}

/// The first two header cells are labels whatever they contain; the rest are dates.
fn header_dates(header: &StringRecord) -> Result<Vec<NaiveDate>, ExportError> {
    if header.len() < HEADER_LABELS.len() {
        return Err(ExportError::MissingLabelColumns {
            found: header.len(),
        });
    }
    header
        .iter()
        .enumerate()
        .skip(HEADER_LABELS.len())
        .map(|(column, value)| {
            NaiveDate::parse_from_str(value, HEADER_DATE_FORMAT).map_err(|_| {
                ExportError::InvalidHeaderDate {
                    column,
                    value: value.to_string(),
                }
            })
        })
        .collect()
}

/// `Ok(None)` for blank and non-positive cells; those never become entries.
fn parse_duration(value: &str, line: u64, column: usize) -> Result<Option<u32>, ExportError> {
    if value.is_empty() {
        return Ok(None);
    }
    let invalid = || ExportError::InvalidDuration {
        line,
        column,
        value: value.to_string(),
    };
    let minutes: i64 = value.parse().map_err(|_| invalid())?;
    if minutes <= 0 {
        return Ok(None);
    }
    u32::try_from(minutes).map(Some).map_err(|_| invalid())
}

fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(str::is_empty)
}
