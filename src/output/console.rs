//! Console echo of logged records.

use crate::mapper::OutputRecord;
use crate::output::OutputFormatter;

/// Renders a record as a header line followed by one `name: value` line per field:
///
/// ```text
/// 2024-03-01 12:30:05 - porch
/// temp_c: 31.42
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleFormatter;

impl OutputFormatter for ConsoleFormatter {
    fn format(&self, record: &OutputRecord) -> String {
        let mut out = format!("{} - {}", record.timestamp, record.key);
        for (name, value) in &record.fields {
            out.push('\n');
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&value.to_string());
        }
        out
    }
}
