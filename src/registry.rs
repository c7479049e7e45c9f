//! Device registry: which devices to listen to and how to map their readings.
//!
//! The registry is a JSON document `{"devices": [...]}`. [`DeviceRegistry`]
//! owns the in-memory copy together with the path it was loaded from, and
//! every mutating operation persists the full document before returning.

use crate::decoder::DeviceType;
use crate::mac_address::MacAddress;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while loading, validating or persisting the registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to access device config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed device config {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("device with key '{0}' already exists")]
    DuplicateKey(String),
    #[error("address {mac} is already configured as '{key}'")]
    DuplicateMac { mac: MacAddress, key: String },
    #[error("no device with key '{0}'")]
    UnknownDevice(String),
    #[error("invalid name pattern for device '{key}': {source}")]
    InvalidPattern {
        key: String,
        #[source]
        source: regex::Error,
    },
}

/// Advertisement filter applied before decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Regex the advertised name must match from its first character.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_pattern: Option<String>,
}

impl ScanFilter {
    pub fn name_pattern(pattern: impl Into<String>) -> Self {
        Self {
            name_pattern: Some(pattern.into()),
        }
    }

    /// Compile the name pattern, anchored at the start of the name.
    ///
    /// An absent or empty pattern means "no filter".
    pub fn compile(&self) -> Result<Option<Regex>, regex::Error> {
        match self.name_pattern.as_deref() {
            None | Some("") => Ok(None),
            Some(pattern) => Regex::new(&format!("^(?:{pattern})")).map(Some),
        }
    }
}

/// Which decoder handles a device's payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// One output column and the decoded value feeding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub source_field: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

fn default_enabled() -> bool {
    true
}

impl FieldSpec {
    pub fn new(source_field: impl Into<String>, enabled: bool) -> Self {
        Self {
            source_field: source_field.into(),
            enabled,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A configured device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub key: String,
    #[serde(default)]
    pub description: String,
    pub mac_address: MacAddress,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub scan_filter: ScanFilter,
    #[serde(default)]
    pub decoder: DecoderConfig,
    /// Output field name to spec, in configuration order.
    #[serde(default)]
    pub fields: IndexMap<String, FieldSpec>,
}

impl DeviceEntry {
    pub fn new(
        key: impl Into<String>,
        description: impl Into<String>,
        mac_address: MacAddress,
        device_type: impl Into<String>,
        scan_filter: ScanFilter,
    ) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            mac_address,
            device_type: device_type.into(),
            scan_filter,
            decoder: DecoderConfig::default(),
            fields: IndexMap::new(),
        }
    }

    pub fn with_decoder(mut self, decoder_type: impl Into<String>) -> Self {
        self.decoder.kind = Some(decoder_type.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Decoder tag for this device: `decoder.type`, or `device_type` when unset.
    pub fn decoder_type(&self) -> &str {
        match self.decoder.kind.as_deref() {
            Some(kind) if !kind.is_empty() => kind,
            _ => &self.device_type,
        }
    }

    /// The decoder variant, if the tag names a supported one.
    pub fn resolved_decoder(&self) -> Option<DeviceType> {
        self.decoder_type().parse().ok()
    }
}

/// The persisted registry document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl Registry {
    pub fn find_by_key(&self, key: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.key == key)
    }

    pub fn find_by_mac(&self, mac: &MacAddress) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.mac_address == *mac)
    }

    fn position(&self, key: &str) -> Result<usize, RegistryError> {
        self.devices
            .iter()
            .position(|d| d.key == key)
            .ok_or_else(|| RegistryError::UnknownDevice(key.to_string()))
    }

    /// Fail if another entry than `key` already uses `mac`.
    fn check_mac_free(&self, mac: &MacAddress, key: &str) -> Result<(), RegistryError> {
        match self.devices.iter().find(|d| d.mac_address == *mac && d.key != key) {
            Some(other) => Err(RegistryError::DuplicateMac {
                mac: *mac,
                key: other.key.clone(),
            }),
            None => Ok(()),
        }
    }

    fn check_unique(&self) -> Result<(), RegistryError> {
        for (i, device) in self.devices.iter().enumerate() {
            let earlier = &self.devices[..i];
            if earlier.iter().any(|d| d.key == device.key) {
                return Err(RegistryError::DuplicateKey(device.key.clone()));
            }
            if let Some(other) = earlier.iter().find(|d| d.mac_address == device.mac_address) {
                return Err(RegistryError::DuplicateMac {
                    mac: device.mac_address,
                    key: other.key.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A registry bound to the file it persists to.
#[derive(Debug)]
pub struct DeviceRegistry {
    path: PathBuf,
    registry: Registry,
}

impl DeviceRegistry {
    /// Load the registry at `path`; a missing file yields an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let registry = match fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice::<Registry>(&bytes).map_err(|source| {
                    RegistryError::Malformed {
                        path: path.clone(),
                        source,
                    }
                })?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no device config yet, starting empty");
                Registry::default()
            }
            Err(source) => return Err(RegistryError::Io { path, source }),
        };
        registry.check_unique()?;

        Ok(Self { path, registry })
    }

    /// Persist the full device list, pretty-printed, replacing the file atomically.
    pub fn save(&self) -> Result<(), RegistryError> {
        write_atomic(&self.path, &self.registry).map_err(|source| RegistryError::Io {
            path: self.path.clone(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn devices(&self) -> &[DeviceEntry] {
        &self.registry.devices
    }

    pub fn find_by_key(&self, key: &str) -> Option<&DeviceEntry> {
        self.registry.find_by_key(key)
    }

    pub fn find_by_mac(&self, mac: &MacAddress) -> Option<&DeviceEntry> {
        self.registry.find_by_mac(mac)
    }

    /// Append a new device and persist.
    ///
    /// Fails with [`RegistryError::DuplicateKey`] if the key is taken and
    /// [`RegistryError::DuplicateMac`] if another device has the address; the
    /// registry is left unchanged on any error.
    pub fn add_device(&mut self, entry: DeviceEntry) -> Result<&DeviceEntry, RegistryError> {
        if self.registry.find_by_key(&entry.key).is_some() {
            return Err(RegistryError::DuplicateKey(entry.key));
        }
        self.registry.check_mac_free(&entry.mac_address, &entry.key)?;
        validate_pattern(&entry)?;

        let previous = self.registry.clone();
        self.registry.devices.push(entry);
        self.commit(previous)?;

        let added = &self.registry.devices[self.registry.devices.len() - 1];
        info!(key = %added.key, mac = %added.mac_address, "device added");
        Ok(added)
    }

    /// Add (or overwrite) a field mapping on an existing device and persist.
    ///
    /// Unknown keys are reported as [`RegistryError::UnknownDevice`].
    pub fn add_field(
        &mut self,
        key: &str,
        field_name: impl Into<String>,
        spec: FieldSpec,
    ) -> Result<(), RegistryError> {
        let index = self.registry.position(key)?;
        let previous = self.registry.clone();
        self.registry.devices[index]
            .fields
            .insert(field_name.into(), spec);
        self.commit(previous)
    }

    /// Replace the entry sharing `entry.key`, keeping its position. Returns the old entry.
    pub fn replace_device(&mut self, entry: DeviceEntry) -> Result<DeviceEntry, RegistryError> {
        let index = self.registry.position(&entry.key)?;
        self.registry.check_mac_free(&entry.mac_address, &entry.key)?;
        validate_pattern(&entry)?;

        let previous = self.registry.clone();
        let old = std::mem::replace(&mut self.registry.devices[index], entry);
        self.commit(previous)?;
        Ok(old)
    }

    pub fn remove_device(&mut self, key: &str) -> Result<DeviceEntry, RegistryError> {
        let index = self.registry.position(key)?;
        let previous = self.registry.clone();
        let removed = self.registry.devices.remove(index);
        self.commit(previous)?;
        info!(key = %removed.key, "device removed");
        Ok(removed)
    }

    /// Save, rolling back the in-memory change if the write fails.
    fn commit(&mut self, previous: Registry) -> Result<(), RegistryError> {
        if let Err(e) = self.save() {
            self.registry = previous;
            return Err(e);
        }
        Ok(())
    }
}

fn validate_pattern(entry: &DeviceEntry) -> Result<(), RegistryError> {
    entry
        .scan_filter
        .compile()
        .map(|_| ())
        .map_err(|source| RegistryError::InvalidPattern {
            key: entry.key.clone(),
            source,
        })
}

fn write_atomic(path: &Path, registry: &Registry) -> io::Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    registry
        .serialize(&mut serializer)
        .map_err(io::Error::other)?;
    buf.push(b'\n');

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
