//! Vulkan render-side exporter.
//!
//! Allocations are created with `VkExternalMemory*CreateInfo` and
//! `VkExportMemoryAllocateInfo`, timeline semaphores with
//! `VkSemaphoreTypeCreateInfo(TIMELINE)` and `VkExportSemaphoreCreateInfo`.
//! Handles are opaque file descriptors from `VK_KHR_external_memory_fd` /
//! `VK_KHR_external_semaphore_fd`, so export is only available on unix.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use gpulink_core::DeviceIdentity;

use crate::api::RenderExporter;
use crate::fence::{TimelineEndpoint, WaitOutcome};
use crate::resource::{Export, ImageDesc, ImageFormat, MemoryRequest, Tiling};
use crate::{ExternalHandle, InteropError, InteropResult};

const MEMORY_HANDLE: vk::ExternalMemoryHandleTypeFlags =
    vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD;
const SEMAPHORE_HANDLE: vk::ExternalSemaphoreHandleTypeFlags =
    vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD;

#[cfg(unix)]
fn fd_handle(fd: i32) -> InteropResult<ExternalHandle> {
    use std::os::fd::{FromRawFd, OwnedFd};
    #[allow(unsafe_code)]
    // The driver hands out a new descriptor owned by the caller.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(ExternalHandle::OpaqueFd(owned))
}

#[cfg(not(unix))]
fn fd_handle(_fd: i32) -> InteropResult<ExternalHandle> {
    Err(InteropError::HandleExportUnavailable("opaque fd handles require a unix platform".into()))
}

fn require_fd_platform() -> InteropResult<()> {
    if cfg!(unix) {
        Ok(())
    } else {
        Err(InteropError::HandleExportUnavailable(
            "opaque fd handles require a unix platform".into(),
        ))
    }
}

fn vk_format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::Rgba8Uint => vk::Format::R8G8B8A8_UINT,
        ImageFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        ImageFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        ImageFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        ImageFormat::R32Float => vk::Format::R32_SFLOAT,
    }
}

fn image_usage(format: ImageFormat) -> vk::ImageUsageFlags {
    let usage = vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST
        | vk::ImageUsageFlags::SAMPLED;
    match format {
        ImageFormat::Bgra8Unorm => usage,
        _ => usage | vk::ImageUsageFlags::STORAGE,
    }
}

fn buffer_usage() -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::STORAGE_BUFFER
}

struct DeviceShared {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical: vk::PhysicalDevice,
    device: ash::Device,
    memory_fd: ash::khr::external_memory_fd::Device,
    semaphore_fd: ash::khr::external_semaphore_fd::Device,
    memory_props: vk::PhysicalDeviceMemoryProperties,
}

impl Drop for DeviceShared {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

struct Candidate {
    physical: vk::PhysicalDevice,
    name: String,
    vendor_id: u32,
    identity: Option<DeviceIdentity>,
    queue_family: u32,
}

#[allow(unsafe_code)]
fn candidates(instance: &ash::Instance) -> InteropResult<Vec<Candidate>> {
    let handles = unsafe { instance.enumerate_physical_devices() }
        .map_err(|e| InteropError::driver("vkEnumeratePhysicalDevices", e))?;

    let mut out = Vec::new();
    for physical in handles {
        let props = unsafe { instance.get_physical_device_properties(physical) };
        if props.api_version < vk::API_VERSION_1_2 {
            continue;
        }
        let queues = unsafe { instance.get_physical_device_queue_family_properties(physical) };
        let wanted = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let Some(queue_family) = queues.iter().position(|q| q.queue_flags.contains(wanted)) else {
            continue;
        };

        let mut id_props = vk::PhysicalDeviceIDProperties::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut id_props);
        unsafe { instance.get_physical_device_properties2(physical, &mut props2) };

        let name = props
            .device_name_as_c_str()
            .map(CStr::to_string_lossy)
            .map(|s| s.into_owned())
            .unwrap_or_default();
        let identity =
            DeviceIdentity::from_vulkan_uuids(id_props.driver_uuid, id_props.device_uuid);
        if identity.is_none() {
            debug!(name = %name, "Vulkan device reported no identity");
        }
        out.push(Candidate {
            physical,
            name,
            vendor_id: props.vendor_id,
            identity,
            queue_family: queue_family as u32,
        });
    }
    Ok(out)
}

/// First candidate carrying `identity`, or the first candidate when no
/// identity is requested. Devices without an identity never match one.
fn select_candidate(
    candidates: Vec<Candidate>,
    identity: Option<&DeviceIdentity>,
) -> Option<Candidate> {
    candidates
        .into_iter()
        .find(|c| identity.is_none_or(|id| c.identity.as_ref() == Some(id)))
}

/// Vulkan device that exports memory and timeline semaphores.
pub struct VulkanExporter {
    shared: Arc<DeviceShared>,
    identity: Option<DeviceIdentity>,
    vendor_id: u32,
    name: String,
}

impl VulkanExporter {
    /// Create a Vulkan 1.2 device on the GPU with `identity`, or on the
    /// first capable GPU when `identity` is `None`.
    #[allow(unsafe_code)]
    pub fn open(identity: Option<&DeviceIdentity>) -> InteropResult<Self> {
        require_fd_platform()?;

        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| InteropError::driver("vkGetInstanceProcAddr", e))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"gpulink-interop")
            .api_version(vk::API_VERSION_1_2);
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| InteropError::driver("vkCreateInstance", e))?;

        match Self::create_device(&instance, identity) {
            Ok((candidate, device)) => {
                let memory_fd = ash::khr::external_memory_fd::Device::new(&instance, &device);
                let semaphore_fd = ash::khr::external_semaphore_fd::Device::new(&instance, &device);
                let memory_props =
                    unsafe { instance.get_physical_device_memory_properties(candidate.physical) };
                info!(
                    name = %candidate.name,
                    identity = ?candidate.identity,
                    "Opened Vulkan export device"
                );
                Ok(Self {
                    shared: Arc::new(DeviceShared {
                        _entry: entry,
                        instance,
                        physical: candidate.physical,
                        device,
                        memory_fd,
                        semaphore_fd,
                        memory_props,
                    }),
                    identity: candidate.identity,
                    vendor_id: candidate.vendor_id,
                    name: candidate.name,
                })
            }
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    #[allow(unsafe_code)]
    fn create_device(
        instance: &ash::Instance,
        identity: Option<&DeviceIdentity>,
    ) -> InteropResult<(Candidate, ash::Device)> {
        let candidate = select_candidate(candidates(instance)?, identity)
            .ok_or(InteropError::Device(gpulink_core::DeviceError::NoSuitableDevice))?;

        let priorities = [1.0f32];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(candidate.queue_family)
            .queue_priorities(&priorities)];
        let extensions = [
            ash::khr::external_memory_fd::NAME.as_ptr(),
            ash::khr::external_semaphore_fd::NAME.as_ptr(),
        ];
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&extensions)
            .push_next(&mut features12);

        let device = unsafe { instance.create_device(candidate.physical, &create_info, None) }
            .map_err(|e| InteropError::driver("vkCreateDevice", e))?;
        Ok((candidate, device))
    }

    /// Driver-reported device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical device.
    pub fn device(&self) -> &ash::Device {
        &self.shared.device
    }

    fn memory_type(&self, type_bits: u32) -> InteropResult<u32> {
        let props = &self.shared.memory_props;
        (0..props.memory_type_count)
            .find(|&i| {
                type_bits & (1 << i) != 0
                    && props.memory_types[i as usize]
                        .property_flags
                        .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            })
            .ok_or_else(|| InteropError::driver("vkAllocateMemory", "no device-local memory type"))
    }

    #[allow(unsafe_code)]
    fn check_buffer_export(&self, usage: vk::BufferUsageFlags) -> InteropResult<()> {
        let info = vk::PhysicalDeviceExternalBufferInfo::default()
            .usage(usage)
            .handle_type(MEMORY_HANDLE);
        let mut props = vk::ExternalBufferProperties::default();
        unsafe {
            self.shared.instance.get_physical_device_external_buffer_properties(
                self.shared.physical,
                &info,
                &mut props,
            )
        };
        if props
            .external_memory_properties
            .external_memory_features
            .contains(vk::ExternalMemoryFeatureFlags::EXPORTABLE)
        {
            Ok(())
        } else {
            Err(InteropError::HandleExportUnavailable(
                "buffer memory is not exportable as opaque fd".into(),
            ))
        }
    }

    #[allow(unsafe_code)]
    fn check_image_export(&self, info: &vk::ImageCreateInfo<'_>) -> InteropResult<()> {
        let mut external_info =
            vk::PhysicalDeviceExternalImageFormatInfo::default().handle_type(MEMORY_HANDLE);
        let format_info = vk::PhysicalDeviceImageFormatInfo2::default()
            .format(info.format)
            .ty(info.image_type)
            .tiling(info.tiling)
            .usage(info.usage)
            .push_next(&mut external_info);
        let mut external_props = vk::ExternalImageFormatProperties::default();
        let mut props = vk::ImageFormatProperties2::default().push_next(&mut external_props);
        unsafe {
            self.shared.instance.get_physical_device_image_format_properties2(
                self.shared.physical,
                &format_info,
                &mut props,
            )
        }
        .map_err(|e| InteropError::HandleExportUnavailable(format!("{:?}: {e}", info.format)))?;

        if external_props
            .external_memory_properties
            .external_memory_features
            .contains(vk::ExternalMemoryFeatureFlags::EXPORTABLE)
        {
            Ok(())
        } else {
            Err(InteropError::HandleExportUnavailable(format!(
                "{:?} images are not exportable as opaque fd",
                info.format
            )))
        }
    }

    #[allow(unsafe_code)]
    fn export_fd(&self, memory: vk::DeviceMemory) -> InteropResult<ExternalHandle> {
        let info = vk::MemoryGetFdInfoKHR::default().memory(memory).handle_type(MEMORY_HANDLE);
        let fd = unsafe { self.shared.memory_fd.get_memory_fd(&info) }
            .map_err(|e| InteropError::driver("vkGetMemoryFdKHR", e))?;
        fd_handle(fd)
    }

    #[allow(unsafe_code)]
    fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        mut dedicated: vk::MemoryDedicatedAllocateInfo<'_>,
    ) -> InteropResult<vk::DeviceMemory> {
        let memory_type = self.memory_type(requirements.memory_type_bits)?;
        let mut export = vk::ExportMemoryAllocateInfo::default().handle_types(MEMORY_HANDLE);
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type)
            .push_next(&mut export)
            .push_next(&mut dedicated);
        unsafe { self.shared.device.allocate_memory(&info, None) }
            .map_err(|e| InteropError::driver("vkAllocateMemory", e))
    }

    #[allow(unsafe_code)]
    fn export_buffer(&self, size: u64) -> InteropResult<Export<VulkanMemory>> {
        let device = &self.shared.device;
        self.check_buffer_export(buffer_usage())?;

        let mut external =
            vk::ExternalMemoryBufferCreateInfo::default().handle_types(MEMORY_HANDLE);
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(buffer_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .push_next(&mut external);
        let buffer = unsafe { device.create_buffer(&info, None) }
            .map_err(|e| InteropError::driver("vkCreateBuffer", e))?;

        // From here on `memory` owns the buffer and cleans up on error.
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let mut memory = VulkanMemory {
            shared: Arc::clone(&self.shared),
            resource: VulkanResource::Buffer(buffer),
            memory: vk::DeviceMemory::null(),
            size: requirements.size,
        };
        let dedicated = vk::MemoryDedicatedAllocateInfo::default().buffer(buffer);
        memory.memory = self.allocate(requirements, dedicated)?;
        unsafe { device.bind_buffer_memory(buffer, memory.memory, 0) }
            .map_err(|e| InteropError::driver("vkBindBufferMemory", e))?;

        let handle = self.export_fd(memory.memory)?;
        debug!(size, allocation = memory.size, "Exported Vulkan buffer");
        Ok(Export { size: memory.size, object: memory, handle })
    }

    #[allow(unsafe_code)]
    fn export_image(&self, desc: &ImageDesc) -> InteropResult<Export<VulkanMemory>> {
        let device = &self.shared.device;
        let image_type =
            if desc.depth > 1 { vk::ImageType::TYPE_3D } else { vk::ImageType::TYPE_2D };
        let tiling = match desc.tiling {
            Tiling::Optimal => vk::ImageTiling::OPTIMAL,
            Tiling::Linear => vk::ImageTiling::LINEAR,
        };

        let mut external = vk::ExternalMemoryImageCreateInfo::default().handle_types(MEMORY_HANDLE);
        let info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(vk_format(desc.format))
            .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: desc.depth })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(image_usage(desc.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        self.check_image_export(&info)?;
        let info = info.push_next(&mut external);

        let image = unsafe { device.create_image(&info, None) }
            .map_err(|e| InteropError::driver("vkCreateImage", e))?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let mut memory = VulkanMemory {
            shared: Arc::clone(&self.shared),
            resource: VulkanResource::Image(image),
            memory: vk::DeviceMemory::null(),
            size: requirements.size,
        };
        let dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
        memory.memory = self.allocate(requirements, dedicated)?;
        unsafe { device.bind_image_memory(image, memory.memory, 0) }
            .map_err(|e| InteropError::driver("vkBindImageMemory", e))?;

        let handle = self.export_fd(memory.memory)?;
        debug!(
            width = desc.width,
            height = desc.height,
            allocation = memory.size,
            "Exported Vulkan image"
        );
        Ok(Export { size: memory.size, object: memory, handle })
    }

    #[allow(unsafe_code)]
    fn check_semaphore_export(&self) -> InteropResult<()> {
        let mut type_info =
            vk::SemaphoreTypeCreateInfo::default().semaphore_type(vk::SemaphoreType::TIMELINE);
        let info = vk::PhysicalDeviceExternalSemaphoreInfo::default()
            .handle_type(SEMAPHORE_HANDLE)
            .push_next(&mut type_info);
        let mut props = vk::ExternalSemaphoreProperties::default();
        unsafe {
            self.shared.instance.get_physical_device_external_semaphore_properties(
                self.shared.physical,
                &info,
                &mut props,
            )
        };
        if props
            .external_semaphore_features
            .contains(vk::ExternalSemaphoreFeatureFlags::EXPORTABLE)
        {
            Ok(())
        } else {
            Err(InteropError::HandleExportUnavailable(
                "timeline semaphores are not exportable as opaque fd".into(),
            ))
        }
    }
}

impl RenderExporter for VulkanExporter {
    type Memory = VulkanMemory;
    type Semaphore = VulkanTimeline;

    fn identity(&self) -> Option<DeviceIdentity> {
        self.identity
    }

    fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    fn export_memory(&self, request: &MemoryRequest) -> InteropResult<Export<VulkanMemory>> {
        require_fd_platform()?;
        match request {
            MemoryRequest::Buffer { size } => self.export_buffer(*size),
            MemoryRequest::Image(desc) => self.export_image(desc),
        }
    }

    #[allow(unsafe_code)]
    fn export_timeline(&self, initial: u64) -> InteropResult<Export<VulkanTimeline>> {
        require_fd_platform()?;
        self.check_semaphore_export()?;

        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial);
        let mut export = vk::ExportSemaphoreCreateInfo::default().handle_types(SEMAPHORE_HANDLE);
        let info = vk::SemaphoreCreateInfo::default()
            .push_next(&mut type_info)
            .push_next(&mut export);
        let semaphore = unsafe { self.shared.device.create_semaphore(&info, None) }
            .map_err(|e| InteropError::driver("vkCreateSemaphore", e))?;
        let timeline = VulkanTimeline { shared: Arc::clone(&self.shared), semaphore };

        let fd_info = vk::SemaphoreGetFdInfoKHR::default()
            .semaphore(semaphore)
            .handle_type(SEMAPHORE_HANDLE);
        let fd = unsafe { self.shared.semaphore_fd.get_semaphore_fd(&fd_info) }
            .map_err(|e| InteropError::driver("vkGetSemaphoreFdKHR", e))?;
        let handle = fd_handle(fd)?;
        Ok(Export { object: timeline, handle, size: 0 })
    }
}

/// Native object behind an exported allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VulkanResource {
    /// `VkBuffer`.
    Buffer(vk::Buffer),
    /// `VkImage`.
    Image(vk::Image),
}

/// Exportable allocation plus the buffer or image bound to it.
pub struct VulkanMemory {
    shared: Arc<DeviceShared>,
    resource: VulkanResource,
    memory: vk::DeviceMemory,
    size: u64,
}

impl VulkanMemory {
    /// Bound buffer or image.
    pub fn resource(&self) -> VulkanResource {
        self.resource
    }

    /// Device memory.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Allocation size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for VulkanMemory {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        let device = &self.shared.device;
        unsafe {
            match self.resource {
                VulkanResource::Buffer(b) => device.destroy_buffer(b, None),
                VulkanResource::Image(i) => device.destroy_image(i, None),
            }
            if self.memory != vk::DeviceMemory::null() {
                device.free_memory(self.memory, None);
            }
        }
    }
}

/// Exportable timeline semaphore.
pub struct VulkanTimeline {
    shared: Arc<DeviceShared>,
    semaphore: vk::Semaphore,
}

impl VulkanTimeline {
    /// Raw semaphore for queue submissions.
    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl TimelineEndpoint for VulkanTimeline {
    #[allow(unsafe_code)]
    fn signal(&self, value: u64) -> InteropResult<()> {
        let info = vk::SemaphoreSignalInfo::default().semaphore(self.semaphore).value(value);
        unsafe { self.shared.device.signal_semaphore(&info) }
            .map_err(|e| InteropError::driver("vkSignalSemaphore", e))
    }

    #[allow(unsafe_code)]
    fn wait(&self, value: u64) -> InteropResult<WaitOutcome> {
        let semaphores = [self.semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        unsafe { self.shared.device.wait_semaphores(&info, u64::MAX) }
            .map_err(|e| InteropError::driver("vkWaitSemaphores", e))?;
        let observed = unsafe { self.shared.device.get_semaphore_counter_value(self.semaphore) }
            .map_err(|e| InteropError::driver("vkGetSemaphoreCounterValue", e))?;
        Ok(WaitOutcome::Observed(observed))
    }

    #[allow(unsafe_code)]
    fn current_value(&self) -> Option<u64> {
        unsafe { self.shared.device.get_semaphore_counter_value(self.semaphore) }.ok()
    }
}

impl Drop for VulkanTimeline {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe { self.shared.device.destroy_semaphore(self.semaphore, None) };
    }
}
