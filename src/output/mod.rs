//! Output destinations for mapped records.
//!
//! A [`RecordSink`] persists rows; an [`OutputFormatter`] renders the
//! human-readable echo printed to the console. CSV files are the only
//! persistent sink today.

pub mod console;
pub mod csv;

use crate::mapper::OutputRecord;
use chrono::{DateTime, Utc};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while persisting a record.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: ::csv::Error,
    },
}

/// Append-only destination for output records.
///
/// Implementations own their writers; the monitor is the only caller, so
/// there is never more than one writer per destination.
pub trait RecordSink: Send {
    /// Persist `record` under the schema `columns`.
    ///
    /// `at` is the wall-clock time the record was accepted; sinks that
    /// partition by day use it to pick the file. A row is either fully
    /// written and flushed or not written at all.
    fn write(
        &mut self,
        at: DateTime<Utc>,
        columns: &[String],
        record: &OutputRecord,
    ) -> Result<(), SinkError>;
}

/// Trait for rendering records for a human reader.
pub trait OutputFormatter: Send + Sync {
    fn format(&self, record: &OutputRecord) -> String;
}
