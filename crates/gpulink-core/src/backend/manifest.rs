//! Fixed device lists.
//!
//! [`StaticEnumerator`] replays a known set of devices. It backs headless
//! tools and tests, and can be loaded from a JSON device manifest:
//!
//! ```json
//! {
//!   "api": "vulkan",
//!   "devices": [
//!     { "name": "GPU A", "vendorId": 4318, "kind": "discrete",
//!       "driverUuid": [0, 1, ...], "deviceUuid": [0, 1, ...], "default": true }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::identity::{DeviceIdentity, Luid, RenderApi, Uuid};
use crate::registry::{DeviceEnumerator, DeviceKind, PhysicalDevice};
use crate::{DeviceError, DeviceResult};

/// One device entry of a manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDevice {
    /// Display name.
    pub name: String,
    /// PCI vendor ID.
    #[serde(default)]
    pub vendor_id: u32,
    /// Device class.
    #[serde(default)]
    pub kind: DeviceKind,
    /// Vulkan driver UUID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_uuid: Option<Uuid>,
    /// Vulkan device UUID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_uuid: Option<Uuid>,
    /// D3D12 adapter LUID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_luid: Option<Luid>,
    /// Marks the device the windowing layer picks by default.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
}

/// JSON description of a device set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceManifest {
    /// Rendering API of every entry.
    pub api: RenderApi,
    /// Devices in enumeration order.
    pub devices: Vec<ManifestDevice>,
}

impl DeviceManifest {
    /// Parse a manifest from a JSON string.
    pub fn from_json(json: &str) -> DeviceResult<Self> {
        serde_json::from_str(json).map_err(|e| DeviceError::Manifest(e.to_string()))
    }

    /// Read a manifest file.
    pub fn load<P: AsRef<Path>>(path: P) -> DeviceResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    fn identity(&self, index: usize, d: &ManifestDevice) -> DeviceResult<Option<DeviceIdentity>> {
        match self.api {
            RenderApi::Vulkan => {
                if d.adapter_luid.is_some() {
                    return Err(DeviceError::Manifest(format!(
                        "device {index} ({}): adapterLuid is not valid for vulkan", d.name
                    )));
                }
                Ok(match (d.driver_uuid, d.device_uuid) {
                    (Some(driver_uuid), Some(device_uuid)) => {
                        Some(DeviceIdentity::Vulkan { driver_uuid, device_uuid })
                    }
                    (None, None) => None,
                    _ => {
                        return Err(DeviceError::Manifest(format!(
                            "device {index} ({}): driverUuid and deviceUuid must be given together",
                            d.name
                        )));
                    }
                })
            }
            RenderApi::D3d12 => {
                if d.driver_uuid.is_some() || d.device_uuid.is_some() {
                    return Err(DeviceError::Manifest(format!(
                        "device {index} ({}): UUIDs are not valid for d3d12", d.name
                    )));
                }
                Ok(d.adapter_luid.map(|adapter_luid| DeviceIdentity::D3d12 { adapter_luid }))
            }
        }
    }
}

/// Enumerator over a fixed device list.
#[derive(Debug, Clone)]
pub struct StaticEnumerator {
    api: RenderApi,
    devices: Vec<PhysicalDevice>,
    default_device: Option<usize>,
}

impl StaticEnumerator {
    /// Enumerator returning `devices` in the given order.
    pub fn new(api: RenderApi, devices: Vec<PhysicalDevice>) -> Self {
        Self { api, devices, default_device: None }
    }

    /// Override the default-device hint.
    pub fn with_default(mut self, index: usize) -> Self {
        self.default_device = Some(index);
        self
    }

    /// Build from a parsed manifest.
    pub fn from_manifest(manifest: &DeviceManifest) -> DeviceResult<Self> {
        let mut devices = Vec::with_capacity(manifest.devices.len());
        let mut default_device = None;
        for (i, d) in manifest.devices.iter().enumerate() {
            if d.name.is_empty() {
                return Err(DeviceError::Manifest(format!("device {i} has an empty name")));
            }
            if d.default {
                if default_device.is_some() {
                    return Err(DeviceError::Manifest("more than one default device".into()));
                }
                default_device = Some(i);
            }
            devices.push(PhysicalDevice {
                raw: i as u64,
                name: d.name.clone(),
                vendor_id: d.vendor_id,
                kind: d.kind,
                identity: manifest.identity(i, d)?,
            });
        }
        Ok(Self { api: manifest.api, devices, default_device })
    }

    /// Load a manifest file.
    pub fn from_manifest_file<P: AsRef<Path>>(path: P) -> DeviceResult<Self> {
        Self::from_manifest(&DeviceManifest::load(path)?)
    }
}

impl DeviceEnumerator for StaticEnumerator {
    fn api(&self) -> RenderApi {
        self.api
    }

    fn enumerate(&self) -> DeviceResult<Vec<PhysicalDevice>> {
        Ok(self.devices.clone())
    }

    fn default_device(&self, devices: &[PhysicalDevice]) -> Option<usize> {
        match self.default_device {
            Some(i) if i < devices.len() => Some(i),
            _ => devices
                .iter()
                .position(|d| d.kind == DeviceKind::Discrete)
                .or_else(|| (!devices.is_empty()).then_some(0)),
        }
    }
}
