//! Daily CSV files, one per device.
//!
//! Files are named `<prefix>_<key>_<YYYYMMDD>.csv` (UTC date), with any key
//! byte outside `[A-Za-z0-9_-]` written as `%XX`. The header is
//! the device's column list and is written once, when the file is created.
//! If a file for the same device and day already exists with a different
//! header, the next free generation `<prefix>_<key>_<YYYYMMDD>.<n>.csv` is
//! used instead, so a file never mixes schemas.

use super::{RecordSink, SinkError};
use crate::mapper::OutputRecord;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default file name prefix.
pub const DEFAULT_PREFIX: &str = "ble_data";

struct OpenFile {
    path: PathBuf,
    day: NaiveDate,
    columns: Vec<String>,
    writer: csv::Writer<File>,
}

/// CSV sink keeping one open writer per device key.
pub struct CsvSink {
    dir: PathBuf,
    prefix: String,
    open: HashMap<String, OpenFile>,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_prefix(dir, DEFAULT_PREFIX)
    }

    pub fn with_prefix(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            open: HashMap::new(),
        }
    }

    /// Path of generation `generation` of the file for `key` on `day`.
    pub fn file_path(&self, key: &str, day: NaiveDate, generation: u32) -> PathBuf {
        let stem = format!(
            "{}_{}_{}",
            self.prefix,
            encode_key(key),
            day.format("%Y%m%d")
        );
        let name = match generation {
            0 => format!("{stem}.csv"),
            n => format!("{stem}.{n}.csv"),
        };
        self.dir.join(name)
    }

    /// Path currently used for `key`, if a file is open for it.
    pub fn current_path(&self, key: &str) -> Option<&Path> {
        self.open.get(key).map(|f| f.path.as_path())
    }

    fn open_file(
        &self,
        key: &str,
        day: NaiveDate,
        columns: &[String],
    ) -> Result<OpenFile, SinkError> {
        let mut generation = 0;
        let path = loop {
            let path = self.file_path(key, day, generation);
            match read_header(&path)? {
                None => break path,
                Some(header) if header == columns => break path,
                Some(header) => {
                    debug!(
                        path = %path.display(),
                        existing = ?header,
                        "existing file has a different header, trying next generation"
                    );
                    generation += 1;
                }
            }
        };

        let needs_header = read_header(&path)?.is_none();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SinkError::Io {
                path: path.clone(),
                source,
            })?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if needs_header {
            writer
                .write_record(columns)
                .map_err(|source| SinkError::Csv {
                    path: path.clone(),
                    source,
                })?;
            writer.flush().map_err(|source| SinkError::Io {
                path: path.clone(),
                source,
            })?;
            info!(path = %path.display(), "created data file");
        }

        Ok(OpenFile {
            path,
            day,
            columns: columns.to_vec(),
            writer,
        })
    }
}

impl RecordSink for CsvSink {
    fn write(
        &mut self,
        at: DateTime<Utc>,
        columns: &[String],
        record: &OutputRecord,
    ) -> Result<(), SinkError> {
        let day = at.date_naive();
        let file = match self.open.remove(&record.key) {
            Some(file) if file.day == day && file.columns == columns => file,
            _ => self.open_file(&record.key, day, columns)?,
        };
        let file = self.open.entry(record.key.clone()).or_insert(file);

        let row = columns
            .iter()
            .map(|column| record.cell(column).unwrap_or_default());
        file.writer
            .write_record(row)
            .map_err(|source| SinkError::Csv {
                path: file.path.clone(),
                source,
            })?;
        file.writer.flush().map_err(|source| SinkError::Io {
            path: file.path.clone(),
            source,
        })
    }
}

/// First row of an existing, non-empty file.
fn read_header(path: &Path) -> Result<Option<Vec<String>>, SinkError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|source| SinkError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
    match reader.records().next() {
        None => Ok(None),
        Some(Ok(row)) => Ok(Some(row.iter().map(str::to_string).collect())),
        Some(Err(source)) => Err(SinkError::Csv {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Percent-encode `key` so distinct keys never share a file stem.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}
