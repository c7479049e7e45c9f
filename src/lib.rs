//! `ble-field-logger` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup
//! and process exit codes. The pipeline (registry lookup, decode, field
//! mapping, rate control and CSV output) lives here, driven by
//! [`crate::monitor`], where it can be tested deterministically with an
//! injected scanner and injected output streams.

pub mod advertisement;
pub mod app;
pub mod configure;
pub mod decoder;
pub mod logging;
pub mod mac_address;
pub mod mapper;
pub mod monitor;
pub mod output;
pub mod rate_gate;
pub mod registry;
pub mod scanner;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::{Advertisement, ManufacturerData};
pub use decoder::{DecodeError, DeviceType, Reading, Value, decode};
pub use mac_address::MacAddress;
pub use mapper::{MappedRecord, OutputRecord, map_reading};
pub use monitor::{EventOutcome, IgnoreReason, Monitor, RealScanner, Scanner};
pub use output::RecordSink;
pub use output::csv::CsvSink;
pub use rate_gate::{RateGate, parse_duration};
pub use registry::{DeviceEntry, DeviceRegistry, FieldSpec, RegistryError, ScanFilter};
pub use scanner::{AdvertisementResult, Backend, ScanError};
