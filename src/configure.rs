//! Interactive `--scan` and `--configure` commands.
//!
//! Both run a discovery window first; `--configure` then walks the operator
//! through creating a [`DeviceEntry`] and its field mappings, persisting each
//! step as it goes. Prompts read from any [`BufRead`] so the flow is testable.

use crate::monitor::Scanner;
use crate::registry::{DeviceEntry, DeviceRegistry, FieldSpec, RegistryError, ScanFilter};
use crate::scanner::{Backend, DiscoveredDevice, ScanError, collect_devices};
use std::io::{self, BufRead, Write};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that abort a scan or configure command.
#[derive(Error, Debug)]
pub enum ConfigureError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid name pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("invalid selection: {0}")]
    InvalidSelection(String),
    #[error("device key is required")]
    MissingKey,
    #[error("input ended before configuration was complete")]
    InputClosed,
}

/// How to run the discovery window.
#[derive(Debug, Clone, Copy)]
pub struct Discovery<'a> {
    pub backend: Backend,
    pub window: Duration,
    /// Only list devices whose name matches from the start.
    pub name_pattern: Option<&'a str>,
}

/// Listen for `discovery.window` and return the named devices heard.
pub async fn discover(
    scanner: &dyn Scanner,
    discovery: Discovery<'_>,
) -> Result<Vec<DiscoveredDevice>, ConfigureError> {
    let filter = match discovery.name_pattern {
        Some(pattern) => ScanFilter::name_pattern(pattern).compile()?,
        None => None,
    };

    info!(window = ?discovery.window, pattern = ?discovery.name_pattern, "scanning for devices");
    // The receiver is dropped on return, ending discovery before any prompt.
    let mut advertisements = scanner.start_scan(discovery.backend).await?;
    let devices = collect_devices(&mut advertisements, discovery.window, filter.as_ref()).await?;
    info!(found = devices.len(), "scan finished");
    Ok(devices)
}

fn print_devices(
    heading: &str,
    devices: &[DiscoveredDevice],
    out: &mut dyn Write,
) -> io::Result<()> {
    writeln!(out, "\n{heading}")?;
    for (i, device) in devices.iter().enumerate() {
        writeln!(
            out,
            "{}. {} (MAC: {}, RSSI: {})",
            i + 1,
            device.name,
            device.address,
            device.rssi
        )?;
    }
    Ok(())
}

/// `--scan`: discover and list matching devices.
pub async fn run_scan(
    scanner: &dyn Scanner,
    discovery: Discovery<'_>,
    out: &mut dyn Write,
) -> Result<Vec<DiscoveredDevice>, ConfigureError> {
    let devices = discover(scanner, discovery).await?;
    if devices.is_empty() {
        writeln!(out, "No matching devices found")?;
    } else {
        print_devices("Found devices:", &devices, out)?;
    }
    Ok(devices)
}

/// Print `text` and read one trimmed line; `None` at end of input.
fn prompt(
    input: &mut dyn BufRead,
    out: &mut dyn Write,
    text: &str,
) -> io::Result<Option<String>> {
    write!(out, "{text}")?;
    out.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn require(
    input: &mut dyn BufRead,
    out: &mut dyn Write,
    text: &str,
) -> Result<String, ConfigureError> {
    prompt(input, out, text)?.ok_or(ConfigureError::InputClosed)
}

/// `--configure`: discover, pick a device, describe it and its fields.
///
/// The entry is saved as soon as its identity is complete, and again after
/// every field. Returns `None` when nothing was found to configure.
pub async fn run_configure(
    registry: &mut DeviceRegistry,
    scanner: &dyn Scanner,
    discovery: Discovery<'_>,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> Result<Option<DeviceEntry>, ConfigureError> {
    let devices = discover(scanner, discovery).await?;
    if devices.is_empty() {
        writeln!(out, "No matching devices found")?;
        return Ok(None);
    }
    print_devices("Available devices:", &devices, out)?;

    let selection = require(input, out, "\nSelect device number: ")?;
    let device = selection
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| devices.get(i))
        .ok_or_else(|| ConfigureError::InvalidSelection(selection.clone()))?;

    writeln!(out, "\nDevice Configuration:")?;
    let key = require(input, out, "Enter unique device key (required): ")?;
    if key.is_empty() {
        return Err(ConfigureError::MissingKey);
    }
    let description = require(input, out, "Enter device description: ")?;
    let device_type = require(input, out, "Enter device type: ")?;
    let name_pattern = require(input, out, "Enter device name pattern (e.g., Govee_.*): ")?;
    let decoder_type = require(input, out, "Enter decoder type (Enter to use device type): ")?;

    let scan_filter = if name_pattern.is_empty() {
        ScanFilter::default()
    } else {
        ScanFilter::name_pattern(name_pattern)
    };
    let mut entry = DeviceEntry::new(&key, description, device.address, device_type, scan_filter);
    if !decoder_type.is_empty() {
        entry = entry.with_decoder(decoder_type);
    }
    let decoder = entry.resolved_decoder();
    if decoder.is_none() {
        warn!(key = %entry.key, decoder = entry.decoder_type(), "no decoder for this device type");
        writeln!(
            out,
            "Warning: no decoder for '{}', this device will not be logged",
            entry.decoder_type()
        )?;
    }
    registry.add_device(entry)?;

    writeln!(out, "\nField Configuration:")?;
    loop {
        let field_name = prompt(input, out, "\nEnter field name (or press Enter to finish): ")?
            .unwrap_or_default();
        if field_name.is_empty() {
            break;
        }
        let source_field = require(input, out, "Enter source field name: ")?;
        if source_field.is_empty() {
            writeln!(out, "Error: Source field is required")?;
            continue;
        }
        if let Some(decoder) =
            decoder.filter(|d| !d.source_fields().contains(&source_field.as_str()))
        {
            warn!(key = %key, source_field = %source_field, "decoder never produces this field");
            writeln!(
                out,
                "Warning: decoder '{decoder}' does not produce '{source_field}' (available: {}), \
                 this column will stay empty",
                decoder.source_fields().join(", ")
            )?;
        }
        let description = require(input, out, "Enter field description: ")?;
        let enabled = require(input, out, "Enable field? (y/n): ")?.eq_ignore_ascii_case("y");

        let spec = FieldSpec::new(source_field, enabled).with_description(description);
        registry.add_field(&key, field_name, spec)?;
    }

    writeln!(out, "\nDevice configuration complete!")?;
    Ok(registry.find_by_key(&key).cloned())
}
