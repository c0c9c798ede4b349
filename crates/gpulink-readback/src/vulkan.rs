//! Vulkan staging backend.
//!
//! Staging images are `LINEAR` tiled `R8G8B8A8_UINT` images with
//! `TRANSFER_DST` usage, bound to `HOST_VISIBLE | HOST_COHERENT` memory and
//! transitioned to `TRANSFER_DST_OPTIMAL` once at creation. Copies use
//! `vkCmdCopyImage` (linear destinations may lack blit support) on the
//! command buffer set with [`VulkanStaging::set_command_buffer`]. The row
//! pitch comes from `vkGetImageSubresourceLayout`.

use std::slice;

use ash::vk;
use tracing::debug;

use crate::staging::{ChannelOrder, Extent, MappedImage, StagingBackend};
use crate::{ReadbackError, ReadbackResult};

const STAGING_FORMAT: vk::Format = vk::Format::R8G8B8A8_UINT;

const COLOR_LAYER: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// Linear staging image and its memory.
#[derive(Debug)]
pub struct VulkanStagingImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    extent: Extent,
}

impl VulkanStagingImage {
    /// Image handle.
    pub fn image(&self) -> vk::Image {
        self.image
    }
}

/// Vulkan [`StagingBackend`]. Sources are swapchain images in
/// `TRANSFER_SRC_OPTIMAL` layout at the time the copy executes.
pub struct VulkanStaging {
    device: ash::Device,
    memory_props: vk::PhysicalDeviceMemoryProperties,
    queue: vk::Queue,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    order: ChannelOrder,
}

impl VulkanStaging {
    /// Backend on `device`. `queue` of `queue_family` runs the one-off layout
    /// transitions of new staging images. `source_format` is the swapchain
    /// format; BGRA formats are swizzled on readback.
    #[allow(unsafe_code)]
    pub fn new(
        instance: &ash::Instance,
        physical: vk::PhysicalDevice,
        device: ash::Device,
        queue: vk::Queue,
        queue_family: u32,
        source_format: vk::Format,
    ) -> ReadbackResult<Self> {
        let memory_props = unsafe { instance.get_physical_device_memory_properties(physical) };
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| ReadbackError::driver("vkCreateCommandPool", e))?;
        let order = match source_format {
            vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => ChannelOrder::Bgra,
            _ => ChannelOrder::Rgba,
        };
        Ok(Self {
            device,
            memory_props,
            queue,
            pool,
            command_buffer: vk::CommandBuffer::null(),
            order,
        })
    }

    /// Command buffer of the frame being recorded; copies go there.
    pub fn set_command_buffer(&mut self, command_buffer: vk::CommandBuffer) {
        self.command_buffer = command_buffer;
    }

    fn host_memory_type(&self, type_bits: u32) -> ReadbackResult<u32> {
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = &self.memory_props;
        (0..props.memory_type_count)
            .find(|&i| {
                type_bits & (1 << i) != 0
                    && props.memory_types[i as usize].property_flags.contains(wanted)
            })
            .ok_or_else(|| {
                ReadbackError::driver("vkAllocateMemory", "no host-visible coherent memory type")
            })
    }

    #[allow(unsafe_code)]
    fn transition_to_transfer_dst(&self, image: vk::Image) -> ReadbackResult<()> {
        let device = &self.device;
        let alloc = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cb = unsafe { device.allocate_command_buffers(&alloc) }
            .map_err(|e| ReadbackError::driver("vkAllocateCommandBuffers", e))?[0];

        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let result = unsafe {
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cb, &begin)
                .map_err(|e| ReadbackError::driver("vkBeginCommandBuffer", e))
                .and_then(|()| {
                    device.cmd_pipeline_barrier(
                        cb,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                    device
                        .end_command_buffer(cb)
                        .map_err(|e| ReadbackError::driver("vkEndCommandBuffer", e))
                })
                .and_then(|()| {
                    let buffers = [cb];
                    let submit = vk::SubmitInfo::default().command_buffers(&buffers);
                    device
                        .queue_submit(self.queue, &[submit], vk::Fence::null())
                        .map_err(|e| ReadbackError::driver("vkQueueSubmit", e))
                })
                .and_then(|()| {
                    device
                        .queue_wait_idle(self.queue)
                        .map_err(|e| ReadbackError::driver("vkQueueWaitIdle", e))
                })
        };
        unsafe { device.free_command_buffers(self.pool, &[cb]) };
        result
    }
}

impl StagingBackend for VulkanStaging {
    type Image = VulkanStagingImage;
    type Source = vk::Image;

    #[allow(unsafe_code)]
    fn create_staging(&mut self, extent: Extent) -> ReadbackResult<VulkanStagingImage> {
        extent.validate()?;
        let device = &self.device;
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(STAGING_FORMAT)
            .extent(vk::Extent3D { width: extent.width, height: extent.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&info, None) }
            .map_err(|e| ReadbackError::driver("vkCreateImage", e))?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = self.host_memory_type(requirements.memory_type_bits).and_then(|memory_type| {
            let alloc = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type);
            unsafe { device.allocate_memory(&alloc, None) }
                .map_err(|e| ReadbackError::driver("vkAllocateMemory", e))
        });
        let memory = match memory {
            Ok(m) => m,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let staging = VulkanStagingImage { image, memory, extent };
        let bound = unsafe { device.bind_image_memory(image, memory, 0) }
            .map_err(|e| ReadbackError::driver("vkBindImageMemory", e))
            .and_then(|()| self.transition_to_transfer_dst(image));
        if let Err(e) = bound {
            self.destroy_staging(staging);
            return Err(e);
        }
        debug!(%extent, "Created Vulkan staging image");
        Ok(staging)
    }

    #[allow(unsafe_code)]
    fn destroy_staging(&mut self, image: VulkanStagingImage) {
        unsafe {
            self.device.destroy_image(image.image, None);
            self.device.free_memory(image.memory, None);
        }
    }

    #[allow(unsafe_code)]
    fn record_copy(
        &mut self,
        source: &vk::Image,
        staging: &mut VulkanStagingImage,
    ) -> ReadbackResult<()> {
        if self.command_buffer == vk::CommandBuffer::null() {
            return Err(ReadbackError::driver("vkCmdCopyImage", "no command buffer set"));
        }
        let region = vk::ImageCopy {
            src_subresource: COLOR_LAYER,
            src_offset: vk::Offset3D::default(),
            dst_subresource: COLOR_LAYER,
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: staging.extent.width,
                height: staging.extent.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_image(
                self.command_buffer,
                *source,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                staging.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        Ok(())
    }

    #[allow(unsafe_code)]
    fn with_mapped<T, F>(&mut self, staging: &VulkanStagingImage, f: F) -> ReadbackResult<T>
    where
        F: FnOnce(MappedImage<'_>) -> T,
    {
        let subresource = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        let layout =
            unsafe { self.device.get_image_subresource_layout(staging.image, subresource) };
        let ptr = unsafe {
            self.device
                .map_memory(staging.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .map_err(|e| ReadbackError::Map(format!("vkMapMemory: {e}")))?;

        // The mapping covers the whole allocation; the subresource starts at
        // `layout.offset` and spans `layout.size` bytes.
        let bytes = unsafe {
            slice::from_raw_parts(
                (ptr as *const u8).add(layout.offset as usize),
                layout.size as usize,
            )
        };
        let result = f(MappedImage {
            bytes,
            row_pitch: layout.row_pitch as usize,
            extent: staging.extent,
            order: self.order,
        });
        unsafe { self.device.unmap_memory(staging.memory) };
        Ok(result)
    }
}

impl Drop for VulkanStaging {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe { self.device.destroy_command_pool(self.pool, None) };
    }
}
