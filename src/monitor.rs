//! The monitoring session: advertisements in, CSV rows and console echo out.
//!
//! [`Monitor::handle`] runs one advertisement through the pipeline and
//! reports what happened as an [`EventOutcome`]. [`run_with_io`] drives it
//! from a [`Scanner`] until the source ends, fails, or `shutdown` resolves.

use crate::advertisement::Advertisement;
use crate::decoder::{self, DecodeError};
use crate::mac_address::MacAddress;
use crate::mapper::{self, MappedRecord};
use crate::output::console::ConsoleFormatter;
use crate::output::{OutputFormatter, RecordSink, SinkError};
use crate::rate_gate::RateGate;
use crate::registry::{DeviceEntry, RegistryError};
use crate::scanner::{AdvertisementResult, Backend, ScanError};
use chrono::{DateTime, Local, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Errors that end a monitoring session.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("failed to write console output: {0}")]
    Io(#[from] io::Error),
}

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(
        &self,
        backend: Backend,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<AdvertisementResult>, ScanError>> + Send + '_>,
    >;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(
        &self,
        backend: Backend,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<AdvertisementResult>, ScanError>> + Send + '_>,
    > {
        Box::pin(crate::scanner::start_scan(backend))
    }
}

/// Why an advertisement produced no record.
#[derive(Debug)]
pub enum IgnoreReason {
    /// The address is not in the registry.
    UnknownDevice,
    /// The advertised name is missing or does not match the device's pattern.
    NameMismatch,
    NoManufacturerData,
    /// A record for this device was accepted less than one interval ago.
    RateLimited,
    Decode(DecodeError),
    /// The record was mapped but could not be persisted.
    Sink(SinkError),
}

/// Result of handling one advertisement.
#[derive(Debug)]
pub enum EventOutcome {
    Logged(MappedRecord),
    Ignored(IgnoreReason),
}

/// Counters reported when a session ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub received: u64,
    pub logged: u64,
}

#[derive(Debug)]
struct WatchedDevice {
    entry: DeviceEntry,
    name_filter: Option<Regex>,
    columns: Vec<String>,
}

/// Per-session pipeline state: the watched devices, the rate gate and the sink.
pub struct Monitor {
    devices: HashMap<MacAddress, WatchedDevice>,
    gate: RateGate,
    sink: Box<dyn RecordSink>,
}

impl Monitor {
    /// Prepare a session for `devices`, compiling every name pattern up front.
    ///
    /// Like [`DeviceRegistry::find_by_mac`](crate::registry::DeviceRegistry::find_by_mac),
    /// the first entry for an address wins; later ones are skipped with a warning.
    pub fn new(
        devices: &[DeviceEntry],
        interval: Duration,
        sink: Box<dyn RecordSink>,
    ) -> Result<Self, RegistryError> {
        let mut watched: HashMap<MacAddress, WatchedDevice> = HashMap::with_capacity(devices.len());
        for entry in devices {
            let name_filter =
                entry
                    .scan_filter
                    .compile()
                    .map_err(|source| RegistryError::InvalidPattern {
                        key: entry.key.clone(),
                        source,
                    })?;
            match watched.entry(entry.mac_address) {
                Entry::Occupied(kept) => {
                    warn!(
                        key = %entry.key,
                        mac = %entry.mac_address,
                        kept = %kept.get().entry.key,
                        "address already watched, ignoring device"
                    );
                }
                Entry::Vacant(slot) => {
                    slot.insert(WatchedDevice {
                        entry: entry.clone(),
                        name_filter,
                        columns: mapper::columns(entry),
                    });
                }
            }
        }

        Ok(Self {
            devices: watched,
            gate: RateGate::new(interval),
            sink,
        })
    }

    /// Number of distinct addresses being watched.
    pub fn watched(&self) -> usize {
        self.devices.len()
    }

    /// Run one advertisement through lookup, filter, rate gate, decode, map and sink.
    ///
    /// `now` drives the rate gate; `at` is the wall-clock time stamped on the record.
    pub fn handle(
        &mut self,
        advertisement: &Advertisement,
        now: Instant,
        at: DateTime<Utc>,
    ) -> EventOutcome {
        let Some(device) = self.devices.get(&advertisement.address) else {
            return EventOutcome::Ignored(IgnoreReason::UnknownDevice);
        };
        let key = device.entry.key.as_str();

        if let Some(filter) = &device.name_filter {
            let matched = advertisement
                .name
                .as_deref()
                .is_some_and(|name| filter.is_match(name));
            if !matched {
                trace!(key, name = ?advertisement.name, "name does not match pattern");
                return EventOutcome::Ignored(IgnoreReason::NameMismatch);
            }
        }

        if !advertisement.has_manufacturer_data() {
            return EventOutcome::Ignored(IgnoreReason::NoManufacturerData);
        }

        if !self.gate.should_log_at(key, now) {
            return EventOutcome::Ignored(IgnoreReason::RateLimited);
        }

        let reading = match decoder::decode(
            device.entry.decoder_type(),
            &advertisement.manufacturer_data,
        ) {
            Ok(reading) => reading,
            Err(e) => {
                debug!(key, error = %e, "no reading from advertisement");
                return EventOutcome::Ignored(IgnoreReason::Decode(e));
            }
        };

        let mapped = mapper::map_reading(
            &device.entry,
            &reading,
            at.with_timezone(&Local).naive_local(),
        );
        for skipped in &mapped.skipped {
            debug!(key, field = %skipped.field, reason = ?skipped.reason, "field skipped");
        }

        if let Err(e) = self.sink.write(at, &device.columns, &mapped.record) {
            error!(key, error = %e, "failed to persist record");
            return EventOutcome::Ignored(IgnoreReason::Sink(e));
        }

        info!(key, fields = mapped.record.fields.len(), "record logged");
        EventOutcome::Logged(mapped)
    }
}

/// Drive `monitor` from `scanner` until the source closes or `shutdown` resolves.
///
/// Every logged record is echoed to `out`. Each advertisement is handled to
/// completion before shutdown is checked again, so cancellation never
/// interrupts a row write. The advertisement receiver is dropped on return,
/// which stops the backend. A source failure ends the session with
/// [`MonitorError::Scan`].
pub async fn run_with_io(
    monitor: &mut Monitor,
    scanner: &dyn Scanner,
    backend: Backend,
    shutdown: impl Future<Output = ()>,
    out: &mut dyn Write,
) -> Result<SessionSummary, MonitorError> {
    let formatter = ConsoleFormatter;
    let mut summary = SessionSummary::default();
    let mut advertisements = scanner.start_scan(backend).await?;
    info!(devices = monitor.watched(), "monitoring started");

    tokio::pin!(shutdown);
    loop {
        let result = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            result = advertisements.recv() => match result {
                Some(result) => result,
                None => {
                    info!("advertisement source closed");
                    break;
                }
            },
        };

        let advertisement =
            result.inspect_err(|e| error!(error = %e, "advertisement source failed"))?;
        summary.received += 1;

        if let EventOutcome::Logged(mapped) =
            monitor.handle(&advertisement, Instant::now(), Utc::now())
        {
            summary.logged += 1;
            writeln!(out, "\n{}", formatter.format(&mapped.record))?;
            out.flush()?;
        }
    }

    info!(
        received = summary.received,
        logged = summary.logged,
        "monitoring stopped"
    );
    Ok(summary)
}
