//! Device enumeration backends.
//!
//! Provides a fixed-list enumerator plus native Vulkan and DXGI enumerators,
//! with [`system_enumerator`] picking the native one for a rendering API.

mod manifest;

#[cfg(feature = "vulkan")]
mod vulkan;

#[cfg(target_os = "windows")]
mod dxgi;

pub use manifest::{DeviceManifest, ManifestDevice, StaticEnumerator};

#[cfg(feature = "vulkan")]
pub use vulkan::{VulkanEnumerator, VulkanEnumeratorConfig};

#[cfg(target_os = "windows")]
pub use dxgi::DxgiEnumerator;

use crate::{DeviceEnumerator, DeviceResult, RenderApi};
#[cfg(not(all(feature = "vulkan", target_os = "windows")))]
use crate::DeviceError;

/// Native enumerator for `api`, if compiled in for this platform.
pub fn system_enumerator(api: RenderApi) -> DeviceResult<Box<dyn DeviceEnumerator>> {
    match api {
        RenderApi::Vulkan => {
            #[cfg(feature = "vulkan")]
            {
                Ok(Box::new(VulkanEnumerator::new(VulkanEnumeratorConfig::default())?))
            }
            #[cfg(not(feature = "vulkan"))]
            {
                Err(DeviceError::BackendNotAvailable(
                    "vulkan feature not enabled".to_string(),
                ))
            }
        }
        RenderApi::D3d12 => {
            #[cfg(target_os = "windows")]
            {
                Ok(Box::new(DxgiEnumerator::new()))
            }
            #[cfg(not(target_os = "windows"))]
            {
                Err(DeviceError::BackendNotAvailable(
                    "Direct3D 12 adapters are only enumerable on Windows".to_string(),
                ))
            }
        }
    }
}

/// One line per backend, `[+]` available / `[-]` missing.
pub fn describe_backends() -> String {
    let mut desc = String::new();
    for api in [RenderApi::Vulkan, RenderApi::D3d12] {
        let status = match system_enumerator(api) {
            Ok(_) => "+".to_string(),
            Err(e) => format!("- ({e})"),
        };
        desc.push_str(&format!("[{}] {}\n", status, api.name()));
    }
    desc
}
