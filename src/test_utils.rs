use crate::advertisement::{Advertisement, ManufacturerData};
use crate::decoder::GOVEE_H5074_COMPANY_ID;
use crate::mac_address::MacAddress;
use crate::mapper::OutputRecord;
use crate::monitor::Scanner;
use crate::output::{RecordSink, SinkError};
use crate::registry::{DeviceEntry, FieldSpec, ScanFilter};
use crate::scanner::{AdvertisementResult, Backend, ScanError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xA4, 0xC1, 0x38, 0xAA, 0xBB, 0xCC]);

/// Captured H5074 payload: 31.42 °C, 37.20 %RH, battery 69 %.
pub const H5074_PAYLOAD: [u8; 6] = [0x00, 0x46, 0x0C, 0x88, 0x0E, 0x45];

/// Manufacturer data holding `payload` under the H5074 company id.
pub fn h5074_data(payload: &[u8]) -> ManufacturerData {
    let mut data = ManufacturerData::new();
    data.insert(GOVEE_H5074_COMPANY_ID, payload.to_vec());
    data
}

/// An advertisement from `mac`; an empty `payload` means no manufacturer data.
pub fn advertisement(mac: MacAddress, name: Option<&str>, payload: &[u8]) -> Advertisement {
    Advertisement {
        address: mac,
        name: name.map(str::to_string),
        rssi: -70,
        manufacturer_data: if payload.is_empty() {
            ManufacturerData::new()
        } else {
            h5074_data(payload)
        },
    }
}

/// An H5074 entry on [`TEST_MAC`] with a `Govee_.*` name filter and no fields.
pub fn h5074_entry(key: &str) -> DeviceEntry {
    DeviceEntry::new(
        key,
        format!("Govee H5074 {key}"),
        TEST_MAC,
        "govee_h5074",
        ScanFilter::name_pattern("Govee_.*"),
    )
    .with_decoder("govee_h5074")
}

/// [`h5074_entry`] with `temp_c <- temperature` enabled and `hum <- humidity` disabled.
pub fn mapped_entry(key: &str) -> DeviceEntry {
    h5074_entry(key)
        .with_field("temp_c", FieldSpec::new("temperature", true))
        .with_field("hum", FieldSpec::new("humidity", false))
}

pub fn test_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .and_then(|d| d.and_hms_opt(12, 30, 5))
        .unwrap()
}

/// One row captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRow {
    pub columns: Vec<String>,
    pub record: OutputRecord,
}

/// Sink that keeps rows in memory, optionally failing every write.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub rows: Arc<Mutex<Vec<SinkRow>>>,
    pub fail: bool,
}

impl MemorySink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn rows(&self) -> Vec<SinkRow> {
        self.rows.lock().unwrap().clone()
    }
}

impl RecordSink for MemorySink {
    fn write(
        &mut self,
        _at: DateTime<Utc>,
        columns: &[String],
        record: &OutputRecord,
    ) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Io {
                path: "memory".into(),
                source: io::Error::other("disk full"),
            });
        }
        self.rows.lock().unwrap().push(SinkRow {
            columns: columns.to_vec(),
            record: record.clone(),
        });
        Ok(())
    }
}

/// Scanner replaying a fixed list of advertisement results.
#[derive(Debug)]
pub struct FakeScanner {
    results: Mutex<Vec<AdvertisementResult>>,
    hold_open: bool,
}

impl FakeScanner {
    /// Closes the channel once every result has been delivered.
    pub fn new(results: Vec<AdvertisementResult>) -> Self {
        Self {
            results: Mutex::new(results),
            hold_open: false,
        }
    }

    /// Keeps the channel open after the scripted items, like a live radio.
    pub fn held_open(results: Vec<AdvertisementResult>) -> Self {
        Self {
            hold_open: true,
            ..Self::new(results)
        }
    }
}

impl Scanner for FakeScanner {
    fn start_scan(
        &self,
        _backend: Backend,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<AdvertisementResult>, ScanError>> + Send + '_>,
    > {
        let results = std::mem::take(&mut *self.results.lock().unwrap());
        let hold_open = self.hold_open;
        Box::pin(async move {
            let (tx, rx) = mpsc::channel::<AdvertisementResult>(results.len().max(1));
            tokio::spawn(async move {
                for r in results {
                    let _ = tx.send(r).await;
                }
                if hold_open {
                    tx.closed().await;
                }
            });
            Ok(rx)
        })
    }
}
