//! Advertisement events delivered by a scanner backend.

use crate::mac_address::MacAddress;
use std::collections::BTreeMap;

/// Manufacturer-specific data keyed by 16-bit company identifier.
pub type ManufacturerData = BTreeMap<u16, Vec<u8>>;

/// One received advertisement from any nearby device.
///
/// Scanners emit these for every device they hear; deciding which ones
/// matter is the monitor's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Address of the advertising device
    pub address: MacAddress,
    /// Advertised local name, if the frame carried one
    pub name: Option<String>,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Vendor payloads, possibly empty
    pub manufacturer_data: ManufacturerData,
}

impl Advertisement {
    pub fn has_manufacturer_data(&self) -> bool {
        !self.manufacturer_data.is_empty()
    }
}
