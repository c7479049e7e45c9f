//! Vendor payload decoders.
//!
//! Each supported sensor model is a [`DeviceType`] variant. Decoding turns the
//! manufacturer data of one advertisement into a [`Reading`]: a flat, ordered
//! set of named values that field mappings can refer to by name.

use crate::advertisement::ManufacturerData;
use indexmap::IndexMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Company identifier under which Govee H5074 sensors publish readings.
pub const GOVEE_H5074_COMPANY_ID: u16 = 0xEC88;

/// Minimum H5074 payload length: prefix byte, temperature, humidity, battery.
pub const GOVEE_H5074_MIN_LEN: usize = 6;

/// Reasons an advertisement produced no reading.
///
/// None of these are fatal: the monitor treats every variant as
/// "nothing to log for this event".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported device type: {0}")]
    UnsupportedDeviceType(String),
    #[error("no manufacturer data for company id {0:#06x}")]
    MissingCompanyId(u16),
    #[error("payload too short: expected at least {expected} bytes, got {actual}")]
    PayloadTooShort { expected: usize, actual: usize },
}

/// A single decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f64),
    Integer(i64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

/// Decoder output: source field name to value, in decoder order.
pub type Reading = IndexMap<String, Value>;

/// Supported sensor models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Govee H5074 thermo-hygrometer
    GoveeH5074,
}

impl DeviceType {
    /// Configuration tag for this device type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::GoveeH5074 => "govee_h5074",
        }
    }

    /// Source field names this decoder produces.
    pub fn source_fields(&self) -> &'static [&'static str] {
        match self {
            DeviceType::GoveeH5074 => &["temperature", "humidity", "battery", "raw_hex"],
        }
    }

    pub fn decode(&self, data: &ManufacturerData) -> Result<Reading, DecodeError> {
        match self {
            DeviceType::GoveeH5074 => decode_govee_h5074(data),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "govee_h5074" => Ok(DeviceType::GoveeH5074),
            _ => Err(DecodeError::UnsupportedDeviceType(s.to_string())),
        }
    }
}

/// Decode manufacturer data using the decoder registered under `device_type`.
///
/// Unknown tags yield [`DecodeError::UnsupportedDeviceType`].
pub fn decode(device_type: &str, data: &ManufacturerData) -> Result<Reading, DecodeError> {
    device_type.parse::<DeviceType>()?.decode(data)
}

/// Govee H5074 layout (company id 0xEC88):
///
/// | offset | size | meaning                            |
/// |--------|------|------------------------------------|
/// | 0      | 1    | unused                             |
/// | 1      | 2    | temperature, LE u16, 0.01 °C       |
/// | 3      | 2    | relative humidity, LE u16, 0.01 %  |
/// | 5      | 1    | battery, percent                   |
///
/// Trailing bytes past offset 5 are ignored.
fn decode_govee_h5074(data: &ManufacturerData) -> Result<Reading, DecodeError> {
    let payload = data
        .get(&GOVEE_H5074_COMPANY_ID)
        .ok_or(DecodeError::MissingCompanyId(GOVEE_H5074_COMPANY_ID))?;

    if payload.len() < GOVEE_H5074_MIN_LEN {
        return Err(DecodeError::PayloadTooShort {
            expected: GOVEE_H5074_MIN_LEN,
            actual: payload.len(),
        });
    }

    let temperature = u16::from_le_bytes([payload[1], payload[2]]);
    let humidity = u16::from_le_bytes([payload[3], payload[4]]);

    let mut reading = Reading::with_capacity(4);
    reading.insert(
        "temperature".into(),
        Value::Float(f64::from(temperature) / 100.0),
    );
    reading.insert("humidity".into(), Value::Float(f64::from(humidity) / 100.0));
    reading.insert("battery".into(), Value::Integer(i64::from(payload[5])));
    reading.insert("raw_hex".into(), Value::Text(to_hex(payload)));
    Ok(reading)
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
