//! Projection of decoded readings onto a device's configured output fields.

use crate::decoder::{Reading, Value};
use crate::registry::DeviceEntry;
use chrono::NaiveDateTime;
use indexmap::IndexMap;

/// Timestamp layout used in output records.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Columns every output record starts with.
pub const FIXED_COLUMNS: [&str; 2] = ["key", "timestamp"];

/// A mapped record ready for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub key: String,
    pub timestamp: String,
    /// Output field name to value, in configuration order.
    pub fields: IndexMap<String, Value>,
}

impl OutputRecord {
    /// Cell text for `column`, or `None` when the record has no such value.
    pub fn cell(&self, column: &str) -> Option<String> {
        match column {
            "key" => Some(self.key.clone()),
            "timestamp" => Some(self.timestamp.clone()),
            other => self.fields.get(other).map(Value::to_string),
        }
    }
}

/// Why a configured field did not make it into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    SourceMissing { source_field: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingSkipped {
    pub field: String,
    pub reason: SkipReason,
}

/// Mapping result together with the fields that were left out.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub record: OutputRecord,
    pub skipped: Vec<MappingSkipped>,
}

/// Map `reading` through the field table of `entry`.
///
/// Enabled fields whose source is present are copied under their output
/// name. Disabled and unresolved fields are omitted and reported in
/// [`MappedRecord::skipped`]; they never appear with a placeholder value.
pub fn map_reading(entry: &DeviceEntry, reading: &Reading, at: NaiveDateTime) -> MappedRecord {
    let mut fields = IndexMap::with_capacity(entry.fields.len());
    let mut skipped = Vec::new();

    for (name, spec) in &entry.fields {
        if !spec.enabled {
            skipped.push(MappingSkipped {
                field: name.clone(),
                reason: SkipReason::Disabled,
            });
            continue;
        }
        match reading.get(&spec.source_field) {
            Some(value) => {
                fields.insert(name.clone(), value.clone());
            }
            None => skipped.push(MappingSkipped {
                field: name.clone(),
                reason: SkipReason::SourceMissing {
                    source_field: spec.source_field.clone(),
                },
            }),
        }
    }

    MappedRecord {
        record: OutputRecord {
            key: entry.key.clone(),
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            fields,
        },
        skipped,
    }
}

/// Output columns for `entry`: the fixed columns followed by every enabled field.
///
/// This is the schema of the device's output file, fixed by configuration
/// rather than by whatever the first record happened to contain.
pub fn columns(entry: &DeviceEntry) -> Vec<String> {
    FIXED_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(
            entry
                .fields
                .iter()
                .filter(|(_, spec)| spec.enabled)
                .map(|(name, _)| name.clone()),
        )
        .collect()
}
