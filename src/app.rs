//! Command-line options and command dispatch for `ble-field-logger`.
//!
//! This module is decoupled from process exit codes, signal handling and the
//! logging setup so every command can be run deterministically in tests with
//! an injected scanner, input and output.

use crate::configure::{self, ConfigureError, Discovery};
use crate::monitor::{self, Monitor, MonitorError, Scanner};
use crate::output::csv::CsvSink;
use crate::registry::{DeviceRegistry, RegistryError};
use crate::scanner::Backend;
use clap::{ArgGroup, Parser};
use std::future::Future;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Command-line options.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
#[command(group(
    ArgGroup::new("command")
        .required(true)
        .args(["scan", "configure", "monitor"]),
))]
pub struct Options {
    /// Discover nearby devices and list them
    #[arg(long)]
    pub scan: bool,

    /// Discover devices and interactively add one to the device config
    #[arg(long)]
    pub configure: bool,

    /// Log readings of configured devices until interrupted
    #[arg(long)]
    pub monitor: bool,

    /// Only list devices whose advertised name matches this regex (from the start)
    #[arg(long, value_name = "REGEX")]
    pub name_pattern: Option<String>,

    /// Minimum time between logged records per device.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "60", value_parser = crate::rate_gate::parse_duration)]
    pub interval: Duration,

    /// How long --scan and --configure listen for devices
    #[arg(long, default_value = "10s", value_parser = crate::rate_gate::parse_duration)]
    pub scan_timeout: Duration,

    /// Device configuration file
    #[arg(long, env = "BLE_LOGGER_CONFIG", default_value = "device_config.json")]
    pub config: PathBuf,

    /// Directory for the daily CSV files
    #[arg(long, env = "BLE_LOGGER_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    /// Diagnostic log file, rotated by size
    #[arg(long, env = "BLE_LOGGER_LOG", default_value = "ble_logger.log")]
    pub log_file: PathBuf,

    /// Verbose diagnostic log (debug level)
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,
}

/// The command selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Scan,
    Configure,
    Monitor,
}

impl Options {
    pub fn command(&self) -> Command {
        if self.scan {
            Command::Scan
        } else if self.configure {
            Command::Configure
        } else {
            Command::Monitor
        }
    }

    fn discovery(&self) -> Discovery<'_> {
        Discovery {
            backend: self.backend,
            window: self.scan_timeout,
            name_pattern: self.name_pattern.as_deref(),
        }
    }
}

/// Errors returned by a command.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Configure(#[from] ConfigureError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error("no devices configured in {0}, run --configure first")]
    NoDevices(PathBuf),
    #[error("failed to prepare data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Run the selected command.
///
/// `shutdown` ends a monitoring session; the other commands finish on their own.
/// Prompts read from `input` and all operator-facing text goes to `out`.
pub async fn run(
    options: Options,
    scanner: &dyn Scanner,
    shutdown: impl Future<Output = ()>,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> Result<(), RunError> {
    match options.command() {
        Command::Scan => {
            configure::run_scan(scanner, options.discovery(), out).await?;
        }
        Command::Configure => {
            let mut registry = DeviceRegistry::load(&options.config)?;
            configure::run_configure(&mut registry, scanner, options.discovery(), input, out)
                .await?;
        }
        Command::Monitor => run_monitor(&options, scanner, shutdown, out).await?,
    }
    Ok(())
}

async fn run_monitor(
    options: &Options,
    scanner: &dyn Scanner,
    shutdown: impl Future<Output = ()>,
    out: &mut dyn Write,
) -> Result<(), RunError> {
    let registry = DeviceRegistry::load(&options.config)?;
    if registry.devices().is_empty() {
        return Err(RunError::NoDevices(options.config.clone()));
    }

    std::fs::create_dir_all(&options.data_dir).map_err(|source| RunError::DataDir {
        path: options.data_dir.clone(),
        source,
    })?;
    let sink = CsvSink::new(&options.data_dir);
    let mut monitor = Monitor::new(registry.devices(), options.interval, Box::new(sink))?;

    info!(
        config = %options.config.display(),
        data_dir = %options.data_dir.display(),
        interval = ?options.interval,
        "starting monitor"
    );
    writeln!(
        out,
        "\nStarting BLE device monitoring (logging interval: {:?})",
        options.interval
    )?;
    writeln!(out, "Press Ctrl+C to stop")?;

    monitor::run_with_io(&mut monitor, scanner, options.backend, shutdown, out).await?;

    writeln!(out, "\nMonitoring stopped")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::test_utils::{FakeScanner, H5074_PAYLOAD, TEST_MAC, advertisement, mapped_entry};
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn options(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("ble-field-logger").chain(args.iter().copied()))
            .unwrap()
    }

    fn options_in(dir: &TempDir, args: &[&str]) -> Options {
        let mut options = options(args);
        options.config = dir.path().join("device_config.json");
        options.data_dir = dir.path().join("data");
        options
    }

    fn write_registry(dir: &TempDir) {
        let registry = Registry {
            devices: vec![mapped_entry("porch")],
        };
        fs::write(
            dir.path().join("device_config.json"),
            serde_json::to_vec(&registry).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_options_defaults() {
        let options = options(&["--monitor"]);
        assert_eq!(options.command(), Command::Monitor);
        assert_eq!(options.interval, Duration::from_secs(60));
        assert_eq!(options.scan_timeout, Duration::from_secs(10));
        assert_eq!(options.backend, Backend::default());
        assert!(options.name_pattern.is_none());
    }

    #[test]
    fn test_options_parse_durations() {
        let options = options(&["--monitor", "--interval", "5m", "--scan-timeout", "500ms"]);
        assert_eq!(options.interval, Duration::from_secs(300));
        assert_eq!(options.scan_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_options_require_exactly_one_command() {
        let parse = |args: &[&str]| {
            Options::try_parse_from(std::iter::once("ble-field-logger").chain(args.iter().copied()))
        };
        assert!(parse(&[]).is_err());
        assert!(parse(&["--scan", "--monitor"]).is_err());
        assert_eq!(
            parse(&["--configure", "--name-pattern", "Govee_.*"])
                .unwrap()
                .command(),
            Command::Configure
        );
    }

    #[tokio::test]
    async fn test_monitor_without_devices() {
        let dir = TempDir::new().unwrap();
        let options = options_in(&dir, &["--monitor"]);

        let result = run(
            options,
            &FakeScanner::new(vec![]),
            std::future::pending(),
            &mut Cursor::new(""),
            &mut Vec::new(),
        )
        .await;

        assert!(matches!(result, Err(RunError::NoDevices(_))));
    }

    #[tokio::test]
    async fn test_monitor_malformed_config() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("device_config.json"), "{\"devices\": [").unwrap();
        let options = options_in(&dir, &["--monitor"]);

        let result = run(
            options,
            &FakeScanner::new(vec![]),
            std::future::pending(),
            &mut Cursor::new(""),
            &mut Vec::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(RunError::Registry(RegistryError::Malformed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_monitor_writes_daily_csv() {
        let dir = TempDir::new().unwrap();
        write_registry(&dir);
        let options = options_in(&dir, &["--monitor"]);
        let scanner = FakeScanner::new(vec![
            Ok(advertisement(TEST_MAC, Some("Govee_H5074_ABCD"), &H5074_PAYLOAD)),
            Ok(advertisement(TEST_MAC, Some("Govee_H5074_ABCD"), &H5074_PAYLOAD)),
        ]);

        let mut out = Vec::<u8>::new();
        run(
            options,
            &scanner,
            std::future::pending(),
            &mut Cursor::new(""),
            &mut out,
        )
        .await
        .unwrap();

        let files: Vec<_> = fs::read_dir(dir.path().join("data"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("ble_data_porch_"));
        assert!(name.ends_with(".csv"));

        let contents = fs::read_to_string(&files[0]).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "key,timestamp,temp_c");
        assert!(lines[1].starts_with("porch,"));
        assert!(lines[1].ends_with(",31.42"));

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("logging interval: 60s"));
        assert!(out.contains(" - porch\ntemp_c: 31.42\n"));
        assert!(out.ends_with("\nMonitoring stopped\n"));
    }

    #[tokio::test]
    async fn test_scan_command() {
        let dir = TempDir::new().unwrap();
        let options = options_in(&dir, &["--scan"]);
        let scanner = FakeScanner::new(vec![Ok(advertisement(
            TEST_MAC,
            Some("Govee_H5074_ABCD"),
            &[],
        ))]);

        let mut out = Vec::<u8>::new();
        run(
            options,
            &scanner,
            std::future::pending(),
            &mut Cursor::new(""),
            &mut out,
        )
        .await
        .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("1. Govee_H5074_ABCD (MAC: A4:C1:38:AA:BB:CC, RSSI: -70)"));
        assert!(!dir.path().join("device_config.json").exists());
    }

    #[tokio::test]
    async fn test_configure_command_persists_entry() {
        let dir = TempDir::new().unwrap();
        let options = options_in(&dir, &["--configure"]);
        let scanner = FakeScanner::new(vec![Ok(advertisement(
            TEST_MAC,
            Some("Govee_H5074_ABCD"),
            &[],
        ))]);

        run(
            options,
            &scanner,
            std::future::pending(),
            &mut Cursor::new("1\nporch\nBack porch\ngovee_h5074\nGovee_.*\n\n\n"),
            &mut Vec::new(),
        )
        .await
        .unwrap();

        let registry = DeviceRegistry::load(dir.path().join("device_config.json")).unwrap();
        let entry = registry.find_by_mac(&TEST_MAC).unwrap();
        assert_eq!(entry.key, "porch");
        assert_eq!(entry.description, "Back porch");
    }
}
