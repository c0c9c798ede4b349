//! wgpu staging backend.
//!
//! Staging images are `COPY_DST | MAP_READ` buffers whose rows are padded to
//! [`wgpu::COPY_BYTES_PER_ROW_ALIGNMENT`]. Each copy is submitted on its own
//! small command encoder; mapping polls the device until the map completes.

use std::sync::Arc;

use tracing::debug;

use crate::staging::{ChannelOrder, Extent, MappedImage, StagingBackend};
use crate::{ReadbackError, ReadbackResult};

/// Staging buffer sized for one swapchain image.
#[derive(Debug)]
pub struct WgpuStagingImage {
    buffer: wgpu::Buffer,
    extent: Extent,
    row_pitch: u32,
}

/// wgpu [`StagingBackend`]; sources are swapchain (or offscreen) textures
/// created with `COPY_SRC` usage.
pub struct WgpuStaging {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    order: ChannelOrder,
}

impl WgpuStaging {
    /// Backend for textures of `format`.
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        format: wgpu::TextureFormat,
    ) -> Self {
        Self { device, queue, order: channel_order(format) }
    }

    /// Backend on a headless high-performance adapter, `None` without one.
    pub fn headless(format: wgpu::TextureFormat) -> Option<Self> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await?;
            let (device, queue) = adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some("gpulink_readback_device"),
                    ..Default::default()
                }, None)
                .await
                .ok()?;
            Some(Self::new(Arc::new(device), Arc::new(queue), format))
        })
    }

    /// Device the staging buffers live on.
    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    /// Queue copies are submitted to.
    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }
}

fn channel_order(format: wgpu::TextureFormat) -> ChannelOrder {
    match format {
        wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb => ChannelOrder::Bgra,
        _ => ChannelOrder::Rgba,
    }
}

fn padded_row(width: u32) -> u32 {
    (width * 4).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
}

impl StagingBackend for WgpuStaging {
    type Image = WgpuStagingImage;
    type Source = wgpu::Texture;

    fn create_staging(&mut self, extent: Extent) -> ReadbackResult<WgpuStagingImage> {
        extent.validate()?;
        let row_pitch = padded_row(extent.width);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size: row_pitch as u64 * extent.height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Ok(WgpuStagingImage { buffer, extent, row_pitch })
    }

    fn destroy_staging(&mut self, image: WgpuStagingImage) {
        image.buffer.destroy();
    }

    fn record_copy(
        &mut self,
        source: &wgpu::Texture,
        staging: &mut WgpuStagingImage,
    ) -> ReadbackResult<()> {
        let size = source.size();
        if size.width != staging.extent.width || size.height != staging.extent.height {
            return Err(ReadbackError::InvalidExtent { width: size.width, height: size.height });
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback_copy"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: source,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(staging.row_pitch),
                    rows_per_image: Some(staging.extent.height),
                },
            },
            wgpu::Extent3d {
                width: staging.extent.width,
                height: staging.extent.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));
        debug!(extent = %staging.extent, "Recorded readback copy");
        Ok(())
    }

    fn with_mapped<T, F>(&mut self, staging: &WgpuStagingImage, f: F) -> ReadbackResult<T>
    where
        F: FnOnce(MappedImage<'_>) -> T,
    {
        let slice = staging.buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| { let _ = tx.send(r); });
        self.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|_| ReadbackError::Map("map channel closed".into()))?
            .map_err(|e| ReadbackError::Map(e.to_string()))?;

        let data = slice.get_mapped_range();
        let result = f(MappedImage {
            bytes: &data,
            row_pitch: staging.row_pitch as usize,
            extent: staging.extent,
            order: self.order,
        });
        drop(data);
        staging.buffer.unmap();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::unpack_rows;

    #[test]
    fn test_padded_row() {
        assert_eq!(padded_row(1), 256);
        assert_eq!(padded_row(64), 256);
        assert_eq!(padded_row(65), 512);
    }

    #[test]
    fn test_bgra_formats() {
        assert_eq!(channel_order(wgpu::TextureFormat::Bgra8UnormSrgb), ChannelOrder::Bgra);
        assert_eq!(channel_order(wgpu::TextureFormat::Rgba8Unorm), ChannelOrder::Rgba);
    }

    #[test]
    fn test_texture_readback() {
        let format = wgpu::TextureFormat::Rgba8Unorm;
        let Some(mut backend) = WgpuStaging::headless(format) else {
            println!("No wgpu adapter, skipping");
            return;
        };
        let extent = Extent::new(5, 3);
        let texture = backend.device().create_texture(&wgpu::TextureDescriptor {
            label: Some("readback_test_source"),
            size: wgpu::Extent3d { width: 5, height: 3, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let pixels: Vec<u8> = (0..5 * 3 * 4).map(|i| i as u8).collect();
        backend.queue().write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(20),
                rows_per_image: Some(3),
            },
            texture.size(),
        );

        let mut staging = backend.create_staging(extent).unwrap();
        backend.record_copy(&texture, &mut staging).unwrap();
        let out = backend.with_mapped(&staging, |m| unpack_rows(&m, true)).unwrap().unwrap();
        assert_eq!(out, pixels);
        backend.destroy_staging(staging);
    }
}
