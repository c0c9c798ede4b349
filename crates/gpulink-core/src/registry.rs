//! Device identity registry.
//!
//! # Architecture
//!
//! ```text
//! DeviceRegistry
//!     └── DeviceEnumerator trait
//!             ├── StaticEnumerator  (fixed list / JSON manifest)
//!             ├── VulkanEnumerator  (ash, `vulkan` feature)
//!             └── DxgiEnumerator    (windows)
//! ```
//!
//! Enumeration order is whatever the driver returns and is never relied
//! upon: lookups go through [`DeviceRegistry::find_by_identity`] and the
//! configuration hash is computed over sorted names.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hash::config_hash;
use crate::identity::{DeviceIdentity, RenderApi, vendor};
use crate::{DeviceError, DeviceResult};

/// Broad class of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Dedicated GPU.
    Discrete,
    /// GPU sharing memory with the CPU.
    Integrated,
    /// Virtualized GPU.
    Virtual,
    /// Software rasterizer.
    Cpu,
    /// Anything else the driver reports.
    #[default]
    Other,
}

impl DeviceKind {
    /// Short label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Discrete => "discrete",
            Self::Integrated => "integrated",
            Self::Virtual => "virtual",
            Self::Cpu => "cpu",
            Self::Other => "other",
        }
    }
}

/// A physical device returned by enumeration.
///
/// Never mutated after creation. `raw` is the API-specific handle
/// (`VkPhysicalDevice` as integer, DXGI adapter ordinal, or a manifest index)
/// and is only meaningful to the enumerator that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    /// Opaque API handle.
    pub raw: u64,
    /// Driver-reported display name.
    pub name: String,
    /// PCI vendor ID.
    pub vendor_id: u32,
    /// Device class.
    pub kind: DeviceKind,
    /// Identity bytes, `None` when the identity query failed.
    pub identity: Option<DeviceIdentity>,
}

impl PhysicalDevice {
    /// Vendor display name.
    pub fn vendor_name(&self) -> &'static str {
        vendor::name(self.vendor_id)
    }
}

/// Read the identity of an enumerated device (`identityOf`).
///
/// Returns `None` when the driver could not report one; such devices are
/// excluded from identity-based matching.
pub fn identity_of(device: &PhysicalDevice) -> Option<&DeviceIdentity> {
    device.identity.as_ref()
}

/// Source of physical devices for one rendering API.
pub trait DeviceEnumerator {
    /// API the devices belong to.
    fn api(&self) -> RenderApi;

    /// All suitable devices in driver order. Driver failure is fatal;
    /// an empty list is allowed.
    fn enumerate(&self) -> DeviceResult<Vec<PhysicalDevice>>;

    /// Device the windowing/surface layer picks when no override applies.
    ///
    /// Default: the first discrete GPU, else the first device.
    fn default_device(&self, devices: &[PhysicalDevice]) -> Option<usize> {
        devices
            .iter()
            .position(|d| d.kind == DeviceKind::Discrete)
            .or_else(|| (!devices.is_empty()).then_some(0))
    }
}

impl<E: DeviceEnumerator + ?Sized> DeviceEnumerator for Box<E> {
    fn api(&self) -> RenderApi {
        (**self).api()
    }

    fn enumerate(&self) -> DeviceResult<Vec<PhysicalDevice>> {
        (**self).enumerate()
    }

    fn default_device(&self, devices: &[PhysicalDevice]) -> Option<usize> {
        (**self).default_device(devices)
    }
}

/// Result of an identity lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityLookup {
    /// No enumerated device carries this identity.
    NotFound,
    /// Exactly one device matches.
    Unique(usize),
    /// Several devices report byte-identical identities; the lowest index
    /// is chosen and the rest are reported for diagnostics.
    Collision {
        /// Lowest matching index.
        chosen: usize,
        /// Every matching index, ascending.
        all: Vec<usize>,
    },
}

impl IdentityLookup {
    /// Index to use, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::NotFound => None,
            Self::Unique(i) => Some(*i),
            Self::Collision { chosen, .. } => Some(*chosen),
        }
    }
}

/// Snapshot of the enumerated devices of one API plus their config hash.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    api: RenderApi,
    devices: Vec<PhysicalDevice>,
    config_hash: u64,
    default_device: Option<usize>,
}

impl DeviceRegistry {
    /// Enumerate through `enumerator` and compute the configuration hash.
    pub fn new(enumerator: &dyn DeviceEnumerator) -> DeviceResult<Self> {
        let devices = enumerator.enumerate()?;
        let default_device = enumerator.default_device(&devices);
        let registry = Self::from_devices(enumerator.api(), devices, default_device);
        debug!(
            api = registry.api.name(),
            count = registry.devices.len(),
            hash = %format!("{:016x}", registry.config_hash),
            "Enumerated devices"
        );
        Ok(registry)
    }

    /// Build a registry from an already enumerated list.
    pub fn from_devices(
        api: RenderApi,
        devices: Vec<PhysicalDevice>,
        default_device: Option<usize>,
    ) -> Self {
        for (i, d) in devices.iter().enumerate() {
            match &d.identity {
                Some(id) if id.api() != api => {
                    warn!(index = i, name = %d.name, "Identity belongs to a different API");
                }
                None => {
                    debug!(
                        index = i,
                        name = %d.name,
                        "Device has no identity; excluded from matching"
                    )
                }
                _ => {}
            }
        }
        let config_hash = config_hash(devices.iter().map(|d| d.name.as_str()));
        let default_device = default_device.filter(|&i| i < devices.len());
        Self { api, devices, config_hash, default_device }
    }

    /// Rendering API.
    pub fn api(&self) -> RenderApi {
        self.api
    }

    /// Enumerated devices in driver order.
    pub fn devices(&self) -> &[PhysicalDevice] {
        &self.devices
    }

    /// Device at `index`.
    pub fn get(&self, index: usize) -> Option<&PhysicalDevice> {
        self.devices.get(index)
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when enumeration found nothing.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// System configuration hash of the enumerated set.
    pub fn config_hash(&self) -> u64 {
        self.config_hash
    }

    /// Index the windowing layer would pick without an override.
    pub fn default_device(&self) -> Option<usize> {
        self.default_device
    }

    /// Fail with [`DeviceError::NoSuitableDevice`] when empty.
    pub fn require_any(&self) -> DeviceResult<&[PhysicalDevice]> {
        if self.devices.is_empty() {
            Err(DeviceError::NoSuitableDevice)
        } else {
            Ok(&self.devices)
        }
    }

    /// Bytewise identity search. Devices without identity never match.
    pub fn find_by_identity(&self, identity: &DeviceIdentity) -> IdentityLookup {
        lookup_identity(self.devices.iter().map(identity_of), identity)
    }
}

/// Search `identities` (one entry per device, in enumeration order) for
/// `identity`. `None` entries never match; on collision the lowest index
/// wins.
pub fn lookup_identity<'a, I>(identities: I, identity: &DeviceIdentity) -> IdentityLookup
where
    I: IntoIterator<Item = Option<&'a DeviceIdentity>>,
{
    let all: Vec<usize> = identities
        .into_iter()
        .enumerate()
        .filter(|(_, id)| *id == Some(identity))
        .map(|(i, _)| i)
        .collect();

    match all.as_slice() {
        [] => IdentityLookup::NotFound,
        [only] => IdentityLookup::Unique(*only),
        _ => {
            warn!(indices = ?all, identity = %identity, "Multiple devices share one identity");
            IdentityLookup::Collision { chosen: all[0], all }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticEnumerator;

    fn vk(name: &str, dev: u8, kind: DeviceKind) -> PhysicalDevice {
        PhysicalDevice {
            raw: dev as u64,
            name: name.into(),
            vendor_id: vendor::NVIDIA,
            kind,
            identity: Some(DeviceIdentity::Vulkan {
                driver_uuid: [0xAA; 16],
                device_uuid: [dev; 16],
            }),
        }
    }

    #[test]
    fn test_registry_hash_matches_names() {
        let devices = vec![vk("A", 1, DeviceKind::Discrete), vk("B", 2, DeviceKind::Integrated)];
        let reg = DeviceRegistry::from_devices(RenderApi::Vulkan, devices, Some(0));
        assert_eq!(reg.config_hash(), config_hash(["B", "A"]));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_default_prefers_discrete() {
        let e = StaticEnumerator::new(
            RenderApi::Vulkan,
            vec![vk("iGPU", 1, DeviceKind::Integrated), vk("dGPU", 2, DeviceKind::Discrete)],
        );
        let reg = DeviceRegistry::new(&e).unwrap();
        assert_eq!(reg.default_device(), Some(1));
    }

    #[test]
    fn test_default_falls_back_to_first() {
        let e = StaticEnumerator::new(
            RenderApi::Vulkan,
            vec![vk("a", 1, DeviceKind::Integrated), vk("b", 2, DeviceKind::Cpu)],
        );
        assert_eq!(DeviceRegistry::new(&e).unwrap().default_device(), Some(0));
    }

    #[test]
    fn test_empty_is_allowed_but_require_any_fails() {
        let e = StaticEnumerator::new(RenderApi::Vulkan, vec![]);
        let reg = DeviceRegistry::new(&e).unwrap();
        assert!(reg.is_empty());
        assert_eq!(reg.default_device(), None);
        assert!(matches!(reg.require_any(), Err(DeviceError::NoSuitableDevice)));
    }

    #[test]
    fn test_find_by_identity_collision_lowest_index() {
        let devices = vec![
            vk("x", 9, DeviceKind::Other),
            vk("A", 1, DeviceKind::Discrete),
            vk("A", 1, DeviceKind::Discrete),
        ];
        let reg = DeviceRegistry::from_devices(RenderApi::Vulkan, devices, None);
        let id = DeviceIdentity::Vulkan { driver_uuid: [0xAA; 16], device_uuid: [1; 16] };
        assert_eq!(
            reg.find_by_identity(&id),
            IdentityLookup::Collision { chosen: 1, all: vec![1, 2] }
        );
        assert_eq!(reg.find_by_identity(&id).index(), Some(1));
    }

    #[test]
    fn test_find_requires_full_match() {
        let devices = vec![vk("A", 1, DeviceKind::Discrete)];
        let reg = DeviceRegistry::from_devices(RenderApi::Vulkan, devices, None);
        // Same device UUID, different driver UUID.
        let partial = DeviceIdentity::Vulkan { driver_uuid: [0xAB; 16], device_uuid: [1; 16] };
        assert_eq!(reg.find_by_identity(&partial), IdentityLookup::NotFound);
        let mut near = [1u8; 16];
        near[15] = 2;
        let near = DeviceIdentity::Vulkan { driver_uuid: [0xAA; 16], device_uuid: near };
        assert_eq!(reg.find_by_identity(&near), IdentityLookup::NotFound);
    }

    #[test]
    fn test_device_without_identity_never_matches() {
        let mut d = vk("A", 1, DeviceKind::Discrete);
        let id = d.identity.take().unwrap();
        let reg = DeviceRegistry::from_devices(RenderApi::Vulkan, vec![d], None);
        assert_eq!(reg.find_by_identity(&id), IdentityLookup::NotFound);
        assert!(identity_of(&reg.devices()[0]).is_none());
    }

    #[test]
    fn test_lookup_identity_skips_missing() {
        let a = DeviceIdentity::Vulkan { driver_uuid: [0xAA; 16], device_uuid: [1; 16] };
        let b = DeviceIdentity::Vulkan { driver_uuid: [0xAA; 16], device_uuid: [2; 16] };
        let ids = [None, Some(&b), Some(&a), None, Some(&a)];
        assert_eq!(lookup_identity(ids, &b), IdentityLookup::Unique(1));
        assert_eq!(
            lookup_identity(ids, &a),
            IdentityLookup::Collision { chosen: 2, all: vec![2, 4] }
        );
        assert_eq!(lookup_identity([None, None], &a), IdentityLookup::NotFound);
    }

    #[test]
    fn test_out_of_range_default_dropped() {
        let devices = vec![vk("A", 1, DeviceKind::Discrete)];
        let reg = DeviceRegistry::from_devices(RenderApi::Vulkan, devices, Some(5));
        assert_eq!(reg.default_device(), None);
    }
}
