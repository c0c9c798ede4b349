//! Vulkan physical device enumeration.
//!
//! Requires the `vulkan` feature. A device is suitable when it exposes
//! Vulkan 1.1 (needed for `VkPhysicalDeviceIDProperties`), has a graphics
//! queue family and supports every required device extension.

use std::ffi::{CStr, CString};

use ash::vk;
use tracing::{debug, warn};

use crate::identity::{DeviceIdentity, RenderApi};
use crate::registry::{DeviceEnumerator, DeviceKind, PhysicalDevice};
use crate::{DeviceError, DeviceResult};

/// Enumeration settings.
#[derive(Debug, Clone)]
pub struct VulkanEnumeratorConfig {
    /// Device extensions a device must support to be listed.
    pub required_extensions: Vec<CString>,
    /// Minimum `apiVersion` (packed `VK_MAKE_API_VERSION`).
    pub min_api_version: u32,
}

impl Default for VulkanEnumeratorConfig {
    fn default() -> Self {
        Self {
            required_extensions: vec![ash::khr::swapchain::NAME.to_owned()],
            min_api_version: vk::API_VERSION_1_1,
        }
    }
}

/// Enumerator backed by a private `VkInstance`.
pub struct VulkanEnumerator {
    // Entry must outlive the instance.
    _entry: ash::Entry,
    instance: ash::Instance,
    config: VulkanEnumeratorConfig,
}

impl VulkanEnumerator {
    /// Load the Vulkan loader and create an instance for enumeration.
    pub fn new(config: VulkanEnumeratorConfig) -> DeviceResult<Self> {
        #[allow(unsafe_code)]
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| DeviceError::driver("vkGetInstanceProcAddr", e))?;

        let app_name = c"gpulink";
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name)
            .api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);

        #[allow(unsafe_code)]
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| DeviceError::driver("vkCreateInstance", e))?;

        Ok(Self { _entry: entry, instance, config })
    }

    /// Instance used for enumeration.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    #[allow(unsafe_code)]
    fn is_suitable(&self, pd: vk::PhysicalDevice, props: &vk::PhysicalDeviceProperties) -> bool {
        if props.api_version < self.config.min_api_version {
            return false;
        }

        let queues = unsafe { self.instance.get_physical_device_queue_family_properties(pd) };
        if !queues.iter().any(|q| q.queue_flags.contains(vk::QueueFlags::GRAPHICS)) {
            return false;
        }

        let available = match unsafe { self.instance.enumerate_device_extension_properties(pd) } {
            Ok(exts) => exts,
            Err(e) => {
                warn!(error = %e, "vkEnumerateDeviceExtensionProperties failed; skipping device");
                return false;
            }
        };
        self.config.required_extensions.iter().all(|required| {
            available.iter().any(|ext| {
                ext.extension_name_as_c_str()
                    .is_ok_and(|name| name == required.as_c_str())
            })
        })
    }

    #[allow(unsafe_code)]
    fn identity(&self, pd: vk::PhysicalDevice) -> Option<DeviceIdentity> {
        let mut id_props = vk::PhysicalDeviceIDProperties::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut id_props);
        unsafe { self.instance.get_physical_device_properties2(pd, &mut props2) };
        drop(props2);

        DeviceIdentity::from_vulkan_uuids(id_props.driver_uuid, id_props.device_uuid)
    }
}

impl DeviceEnumerator for VulkanEnumerator {
    fn api(&self) -> RenderApi {
        RenderApi::Vulkan
    }

    #[allow(unsafe_code)]
    fn enumerate(&self) -> DeviceResult<Vec<PhysicalDevice>> {
        let handles = unsafe { self.instance.enumerate_physical_devices() }
            .map_err(|e| DeviceError::driver("vkEnumeratePhysicalDevices", e))?;

        let mut devices = Vec::with_capacity(handles.len());
        for pd in handles {
            let props = unsafe { self.instance.get_physical_device_properties(pd) };
            let name = props
                .device_name_as_c_str()
                .map(CStr::to_string_lossy)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| "Unknown Vulkan device".to_string());

            if !self.is_suitable(pd, &props) {
                debug!(name = %name, "Skipping unsuitable Vulkan device");
                continue;
            }

            let identity = self.identity(pd);
            if identity.is_none() {
                warn!(name = %name, "Vulkan device reported no identity");
            }

            devices.push(PhysicalDevice {
                raw: vk::Handle::as_raw(pd),
                name,
                vendor_id: props.vendor_id,
                kind: kind_of(props.device_type),
                identity,
            });
        }
        Ok(devices)
    }
}

impl Drop for VulkanEnumerator {
    fn drop(&mut self) {
        #[allow(unsafe_code)]
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

fn kind_of(ty: vk::PhysicalDeviceType) -> DeviceKind {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => DeviceKind::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceKind::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceKind::Virtual,
        vk::PhysicalDeviceType::CPU => DeviceKind::Cpu,
        _ => DeviceKind::Other,
    }
}
