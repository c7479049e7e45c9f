//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, AdvertisementResult, ScanError};
use crate::advertisement::Advertisement;
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn};

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Start LE discovery and forward every advertisement as it arrives.
///
/// Duplicate reporting is enabled so a device that keeps advertising keeps
/// producing events. Discovery stops as soon as the returned receiver is
/// dropped, without waiting for another device event.
pub async fn start_scan() -> Result<mpsc::Receiver<AdvertisementResult>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let mut filter = DiscoveryFilter::default();
    filter.transport = DiscoveryTransport::Le;
    filter.duplicate_data = true;
    adapter.set_discovery_filter(filter).await?;

    let events = adapter.discover_devices_with_changes().await?;
    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    // The task owns the session and the discovery stream; dropping them ends discovery.
    tokio::spawn(
        async move {
            let _session = session;
            let mut events = std::pin::pin!(events);

            loop {
                let event = tokio::select! {
                    _ = tx.closed() => {
                        debug!("advertisement receiver closed, stopping discovery");
                        return;
                    }
                    event = events.next() => event,
                };
                let Some(event) = event else {
                    break;
                };
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                match read_advertisement(&adapter, address).await {
                    Ok(advertisement) => {
                        if tx.send(Ok(advertisement)).await.is_err() {
                            debug!("advertisement receiver closed, stopping discovery");
                            return;
                        }
                    }
                    // Devices can vanish between the event and the property read.
                    Err(e) => debug!(%address, error = %e, "failed to read device properties"),
                }
            }

            warn!("BlueZ discovery stream ended");
            let _ = tx
                .send(Err(ScanError::Bluetooth("discovery stream ended".into())))
                .await;
        }
        .with_current_subscriber(),
    );

    Ok(rx)
}

/// Snapshot the advertised properties of a device.
async fn read_advertisement(
    adapter: &Adapter,
    address: Address,
) -> Result<Advertisement, ScanError> {
    let device = adapter.device(address)?;
    let name = device.name().await?;
    let rssi = device.rssi().await?.unwrap_or_default();
    let manufacturer_data = device
        .manufacturer_data()
        .await?
        .unwrap_or_default()
        .into_iter()
        .collect();

    Ok(Advertisement {
        address: address.into(),
        name,
        rssi,
        manufacturer_data,
    })
}
