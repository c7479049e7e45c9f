//! BLE advertisement sources.
//!
//! Backends turn whatever the radio stack reports into a stream of
//! [`Advertisement`] values for every nearby device. They do no filtering of
//! their own; deciding which advertisements matter happens downstream.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::advertisement::Advertisement;
use crate::mac_address::MacAddress;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::info;

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// An advertisement, or the failure that ended the stream.
pub type AdvertisementResult = Result<Advertisement, ScanError>;

/// Channel buffer size for advertisements.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Start receiving advertisements using the specified backend.
///
/// The backend keeps scanning until the returned receiver is dropped, which
/// releases the adapter subscription.
pub async fn start_scan(backend: Backend) -> Result<mpsc::Receiver<AdvertisementResult>, ScanError> {
    info!(%backend, "starting BLE scan");
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan().await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan().await,
    }
}

/// A device seen during a discovery window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: MacAddress,
    pub name: String,
    pub rssi: i16,
}

/// Collect named devices from `advertisements` for `window`.
///
/// Devices are listed in the order they were first heard; repeated
/// advertisements refresh name and RSSI. With a `name_filter`, only names the
/// regex matches are kept. Stops early if the stream ends or fails.
pub async fn collect_devices(
    advertisements: &mut mpsc::Receiver<AdvertisementResult>,
    window: Duration,
    name_filter: Option<&Regex>,
) -> Result<Vec<DiscoveredDevice>, ScanError> {
    let deadline = Instant::now() + window;
    let mut devices: Vec<DiscoveredDevice> = Vec::new();

    while let Ok(Some(result)) = timeout_at(deadline, advertisements.recv()).await {
        let advertisement = result?;
        let Some(name) = advertisement.name else {
            continue;
        };
        if name_filter.is_some_and(|re| !re.is_match(&name)) {
            continue;
        }

        match devices
            .iter_mut()
            .find(|d| d.address == advertisement.address)
        {
            Some(known) => {
                known.name = name;
                known.rssi = advertisement.rssi;
            }
            None => {
                info!(address = %advertisement.address, %name, rssi = advertisement.rssi, "found device");
                devices.push(DiscoveredDevice {
                    address: advertisement.address,
                    name,
                    rssi: advertisement.rssi,
                });
            }
        }
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_MAC, advertisement};
    use std::str::FromStr;

    async fn collect(
        items: Vec<AdvertisementResult>,
        filter: Option<&Regex>,
    ) -> Result<Vec<DiscoveredDevice>, ScanError> {
        let (tx, mut rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.send(item).await.unwrap();
        }
        drop(tx);
        collect_devices(&mut rx, Duration::from_secs(5), filter).await
    }

    #[tokio::test]
    async fn test_collect_dedupes_and_keeps_latest_rssi() {
        let other = MacAddress([1, 2, 3, 4, 5, 6]);
        let mut first = advertisement(TEST_MAC, Some("Govee_H5074_ABCD"), &[]);
        first.rssi = -80;
        let mut again = first.clone();
        again.rssi = -60;

        let devices = collect(
            vec![
                Ok(first),
                Ok(advertisement(other, Some("Thermo"), &[])),
                Ok(again),
            ],
            None,
        )
        .await
        .unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].address, TEST_MAC);
        assert_eq!(devices[0].rssi, -60);
        assert_eq!(devices[1].name, "Thermo");
    }

    #[tokio::test]
    async fn test_collect_skips_unnamed_and_filtered() {
        let re = Regex::new("^(?:Govee_.*)").unwrap();
        let devices = collect(
            vec![
                Ok(advertisement(TEST_MAC, None, &[])),
                Ok(advertisement(MacAddress([1; 6]), Some("Thermo"), &[])),
                Ok(advertisement(MacAddress([2; 6]), Some("Govee_H5074_0001"), &[])),
            ],
            Some(&re),
        )
        .await
        .unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Govee_H5074_0001");
    }

    #[tokio::test]
    async fn test_collect_surfaces_source_error() {
        let result = collect(
            vec![Err(ScanError::Bluetooth("adapter gone".into()))],
            None,
        )
        .await;
        assert!(matches!(result, Err(ScanError::Bluetooth(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_stops_at_deadline() {
        let (_tx, mut rx) = mpsc::channel::<AdvertisementResult>(1);
        let devices = collect_devices(&mut rx, Duration::from_secs(10), None)
            .await
            .unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_scan_error_display() {
        let err = ScanError::Bluetooth("no adapter".to_string());
        assert_eq!(format!("{}", err), "Bluetooth error: no adapter");
    }

    #[test]
    #[cfg(all(feature = "bluer", feature = "hci"))]
    fn test_backend_from_str() {
        assert_eq!(Backend::from_str("bluer").unwrap(), Backend::Bluer);
        assert_eq!(Backend::from_str("bluez").unwrap(), Backend::Bluer);
        assert_eq!(Backend::from_str("hci").unwrap(), Backend::Hci);
        assert_eq!(Backend::from_str("raw").unwrap(), Backend::Hci);
        assert!(Backend::from_str("invalid").is_err());
    }

    #[test]
    #[cfg(all(feature = "bluer", feature = "hci"))]
    fn test_backend_display() {
        assert_eq!(format!("{}", Backend::Bluer), "bluer");
        assert_eq!(format!("{}", Backend::Hci), "hci");
    }
}
