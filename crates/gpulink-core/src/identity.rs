//! Stable physical device identities.
//!
//! A [`DeviceIdentity`] is the raw byte tuple a driver reports for a GPU:
//! driver + device UUID on Vulkan, the adapter LUID on Direct3D 12. Two
//! handles from the same driver in the same boot refer to the same physical
//! GPU iff their identities are bitwise equal. Display names are advisory and
//! never take part in matching.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 16-byte UUID as returned by the driver. Byte order is opaque.
pub type Uuid = [u8; 16];

/// 8-byte locally unique adapter identifier.
pub type Luid = [u8; 8];

/// PCI vendor IDs used for compute-API vendor checks.
pub mod vendor {
    /// NVIDIA.
    pub const NVIDIA: u32 = 0x10DE;
    /// AMD / ATI.
    pub const AMD: u32 = 0x1002;
    /// Intel.
    pub const INTEL: u32 = 0x8086;

    /// Short vendor name for display.
    pub fn name(vendor_id: u32) -> &'static str {
        match vendor_id {
            NVIDIA => "NVIDIA",
            AMD => "AMD",
            INTEL => "Intel",
            0x13B5 => "ARM",
            0x5143 => "Qualcomm",
            0x106B => "Apple",
            0x1414 => "Microsoft",
            0x10005 => "Mesa",
            _ => "unknown",
        }
    }
}

/// Host rendering API whose devices are being enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderApi {
    /// Vulkan (identities: driver UUID + device UUID).
    Vulkan,
    /// Direct3D 12 (identity: adapter LUID).
    D3d12,
}

impl RenderApi {
    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Vulkan => "Vulkan",
            Self::D3d12 => "Direct3D 12",
        }
    }
}

impl std::str::FromStr for RenderApi {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vulkan" | "vk" => Ok(Self::Vulkan),
            "d3d12" | "dx12" | "direct3d12" => Ok(Self::D3d12),
            other => Err(format!("unknown render API '{other}' (expected vulkan or d3d12)")),
        }
    }
}

/// Identity of a physical device as reported by the rendering API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceIdentity {
    /// `VkPhysicalDeviceIDProperties`.
    Vulkan {
        /// `driverUUID`: identifies the driver/implementation.
        driver_uuid: Uuid,
        /// `deviceUUID`: identifies the physical adapter.
        device_uuid: Uuid,
    },
    /// `DXGI_ADAPTER_DESC1::AdapterLuid`.
    D3d12 {
        /// Adapter LUID, `LowPart` little-endian followed by `HighPart`.
        adapter_luid: Luid,
    },
}

impl DeviceIdentity {
    /// API this identity belongs to.
    pub fn api(&self) -> RenderApi {
        match self {
            Self::Vulkan { .. } => RenderApi::Vulkan,
            Self::D3d12 { .. } => RenderApi::D3d12,
        }
    }

    /// Key a compute API compares against when looking for the same GPU.
    pub fn peer_key(&self) -> PeerKey {
        match *self {
            Self::Vulkan { device_uuid, .. } => PeerKey::Uuid(device_uuid),
            Self::D3d12 { adapter_luid } => PeerKey::Luid(adapter_luid),
        }
    }

    /// Build a D3D12 identity from the two halves of a Win32 `LUID`.
    pub fn from_luid_parts(low: u32, high: i32) -> Self {
        let mut adapter_luid = [0u8; 8];
        adapter_luid[..4].copy_from_slice(&low.to_le_bytes());
        adapter_luid[4..].copy_from_slice(&high.to_le_bytes());
        Self::D3d12 { adapter_luid }
    }

    /// Build a Vulkan identity from `VkPhysicalDeviceIDProperties`.
    ///
    /// An all-zero device UUID means the driver did not fill the structure;
    /// such a device has no identity.
    pub fn from_vulkan_uuids(driver_uuid: [u8; 16], device_uuid: [u8; 16]) -> Option<Self> {
        (device_uuid != [0; 16]).then_some(Self::Vulkan { driver_uuid, device_uuid })
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vulkan { driver_uuid, device_uuid } => {
                write!(f, "device {} driver {}", format_uuid(device_uuid), format_uuid(driver_uuid))
            }
            Self::D3d12 { adapter_luid } => write!(f, "luid {}", format_luid(adapter_luid)),
        }
    }
}

/// Identity bytes a compute device is matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKey {
    /// Device UUID (Vulkan side).
    Uuid(Uuid),
    /// Adapter LUID (D3D12 side).
    Luid(Luid),
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(u) => f.write_str(&format_uuid(u)),
            Self::Luid(l) => f.write_str(&format_luid(l)),
        }
    }
}

/// Format a UUID as `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` in driver byte order.
pub fn format_uuid(uuid: &Uuid) -> String {
    let hex: Vec<String> = uuid.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        hex[0..4].concat(),
        hex[4..6].concat(),
        hex[6..8].concat(),
        hex[8..10].concat(),
        hex[10..16].concat()
    )
}

/// Format a LUID as 16 hex digits in stored byte order.
pub fn format_luid(luid: &Luid) -> String {
    luid.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_key_vulkan_uses_device_uuid() {
        let id = DeviceIdentity::Vulkan { driver_uuid: [1; 16], device_uuid: [2; 16] };
        assert_eq!(id.peer_key(), PeerKey::Uuid([2; 16]));
        assert_eq!(id.api(), RenderApi::Vulkan);
    }

    #[test]
    fn test_luid_parts_layout() {
        let id = DeviceIdentity::from_luid_parts(0x0403_0201, 0x0807_0605);
        assert_eq!(
            id,
            DeviceIdentity::D3d12 { adapter_luid: [1, 2, 3, 4, 5, 6, 7, 8] }
        );
        assert_eq!(id.peer_key(), PeerKey::Luid([1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn test_zero_device_uuid_has_no_identity() {
        assert_eq!(DeviceIdentity::from_vulkan_uuids([7; 16], [0; 16]), None);
        let mut device_uuid = [0; 16];
        device_uuid[15] = 1;
        assert_eq!(
            DeviceIdentity::from_vulkan_uuids([0; 16], device_uuid),
            Some(DeviceIdentity::Vulkan { driver_uuid: [0; 16], device_uuid })
        );
    }

    #[test]
    fn test_format_uuid() {
        let mut uuid = [0u8; 16];
        for (i, b) in uuid.iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(format_uuid(&uuid), "00010203-0405-0607-0809-0a0b0c0d0e0f");
    }

    #[test]
    fn test_render_api_parse() {
        assert_eq!("Vulkan".parse::<RenderApi>().unwrap(), RenderApi::Vulkan);
        assert_eq!("dx12".parse::<RenderApi>().unwrap(), RenderApi::D3d12);
        assert!("metal".parse::<RenderApi>().is_err());
    }

    #[test]
    fn test_vendor_names() {
        assert_eq!(vendor::name(vendor::NVIDIA), "NVIDIA");
        assert_eq!(vendor::name(0xFFFF), "unknown");
    }
}
