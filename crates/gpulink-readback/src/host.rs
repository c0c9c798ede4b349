//! In-process staging backend.
//!
//! Staging rows are padded to a configurable alignment and the padding is
//! filled with a marker byte, so pitch handling is exercised the same way a
//! driver with a wide `rowPitch` exercises it. Copies happen immediately at
//! record time.

use crate::staging::{ChannelOrder, Extent, MappedImage, StagingBackend};
use crate::{ReadbackError, ReadbackResult};

/// Byte written into row padding.
pub const PADDING_MARKER: u8 = 0xCD;

/// Default row alignment in bytes.
pub const DEFAULT_ROW_ALIGNMENT: usize = 256;

/// A rendered image in host memory (packed RGBA8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostImage {
    extent: Extent,
    pixels: Vec<u8>,
}

impl HostImage {
    /// Wrap packed RGBA8 pixels.
    pub fn new(extent: Extent, pixels: Vec<u8>) -> ReadbackResult<Self> {
        extent.validate()?;
        if pixels.len() != extent.packed_row() * extent.height as usize {
            return Err(ReadbackError::InvalidExtent { width: extent.width, height: extent.height });
        }
        Ok(Self { extent, pixels })
    }

    /// Image whose pixel at (x, y) is `f(x, y)`.
    pub fn from_fn(extent: Extent, f: impl Fn(u32, u32) -> [u8; 4]) -> Self {
        let mut pixels = Vec::with_capacity(extent.packed_row() * extent.height as usize);
        for y in 0..extent.height {
            for x in 0..extent.width {
                pixels.extend_from_slice(&f(x, y));
            }
        }
        Self { extent, pixels }
    }

    /// Size in pixels.
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Packed RGBA8 pixels.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Host staging image.
#[derive(Debug)]
pub struct HostStagingImage {
    extent: Extent,
    row_pitch: usize,
    bytes: Vec<u8>,
}

impl HostStagingImage {
    /// Distance between rows in bytes.
    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }
}

/// In-process [`StagingBackend`].
#[derive(Debug)]
pub struct HostStaging {
    row_alignment: usize,
    order: ChannelOrder,
    fail_maps: bool,
    live: usize,
    copies: usize,
}

impl Default for HostStaging {
    fn default() -> Self {
        Self::new()
    }
}

impl HostStaging {
    /// Backend with 256-byte row alignment and RGBA staging.
    pub fn new() -> Self {
        Self {
            row_alignment: DEFAULT_ROW_ALIGNMENT,
            order: ChannelOrder::Rgba,
            fail_maps: false,
            live: 0,
            copies: 0,
        }
    }

    /// Align rows to `bytes` (at least 1).
    pub fn with_row_alignment(mut self, bytes: usize) -> Self {
        self.row_alignment = bytes.max(1);
        self
    }

    /// Store texels in `order`, the way a BGRA swapchain lands in staging.
    pub fn with_channel_order(mut self, order: ChannelOrder) -> Self {
        self.order = order;
        self
    }

    /// Make every following map fail.
    pub fn set_map_failure(&mut self, fail: bool) {
        self.fail_maps = fail;
    }

    /// Staging images currently allocated.
    pub fn live_images(&self) -> usize {
        self.live
    }

    /// Copies recorded so far.
    pub fn copies(&self) -> usize {
        self.copies
    }
}

impl StagingBackend for HostStaging {
    type Image = HostStagingImage;
    type Source = HostImage;

    fn create_staging(&mut self, extent: Extent) -> ReadbackResult<HostStagingImage> {
        extent.validate()?;
        let row_pitch = extent.packed_row().next_multiple_of(self.row_alignment);
        self.live += 1;
        Ok(HostStagingImage {
            extent,
            row_pitch,
            bytes: vec![PADDING_MARKER; row_pitch * extent.height as usize],
        })
    }

    fn destroy_staging(&mut self, _image: HostStagingImage) {
        self.live -= 1;
    }

    fn record_copy(
        &mut self,
        source: &HostImage,
        staging: &mut HostStagingImage,
    ) -> ReadbackResult<()> {
        if source.extent != staging.extent {
            return Err(ReadbackError::InvalidExtent {
                width: source.extent.width,
                height: source.extent.height,
            });
        }
        let row = source.extent.packed_row();
        for (y, src) in source.pixels.chunks_exact(row).enumerate() {
            let dst = &mut staging.bytes[y * staging.row_pitch..y * staging.row_pitch + row];
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                match self.order {
                    ChannelOrder::Rgba => d.copy_from_slice(s),
                    ChannelOrder::Bgra => d.copy_from_slice(&[s[2], s[1], s[0], s[3]]),
                }
            }
        }
        self.copies += 1;
        Ok(())
    }

    fn with_mapped<T, F>(&mut self, staging: &HostStagingImage, f: F) -> ReadbackResult<T>
    where
        F: FnOnce(MappedImage<'_>) -> T,
    {
        if self.fail_maps {
            return Err(ReadbackError::Map("host map failure requested".into()));
        }
        Ok(f(MappedImage {
            bytes: &staging.bytes,
            row_pitch: staging.row_pitch,
            extent: staging.extent,
            order: self.order,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_padded() {
        let mut backend = HostStaging::new();
        let img = backend.create_staging(Extent::new(3, 2)).unwrap();
        assert_eq!(img.row_pitch(), 256);
        assert_eq!(img.bytes.len(), 512);
        assert_eq!(backend.live_images(), 1);
        backend.destroy_staging(img);
        assert_eq!(backend.live_images(), 0);
    }

    #[test]
    fn test_copy_keeps_padding() {
        let mut backend = HostStaging::new().with_row_alignment(16);
        let extent = Extent::new(2, 2);
        let mut img = backend.create_staging(extent).unwrap();
        let src = HostImage::from_fn(extent, |x, y| [x as u8, y as u8, 9, 1]);
        backend.record_copy(&src, &mut img).unwrap();
        assert_eq!(&img.bytes[0..8], &[0, 0, 9, 1, 1, 0, 9, 1]);
        assert!(img.bytes[8..16].iter().all(|&b| b == PADDING_MARKER));
        assert_eq!(&img.bytes[16..24], &[0, 1, 9, 1, 1, 1, 9, 1]);
    }

    #[test]
    fn test_copy_extent_mismatch() {
        let mut backend = HostStaging::new();
        let mut img = backend.create_staging(Extent::new(4, 4)).unwrap();
        let src = HostImage::from_fn(Extent::new(2, 2), |_, _| [0; 4]);
        assert!(backend.record_copy(&src, &mut img).is_err());
    }

    #[test]
    fn test_host_image_size_checked() {
        assert!(HostImage::new(Extent::new(2, 2), vec![0; 15]).is_err());
        assert!(HostImage::new(Extent::new(2, 2), vec![0; 16]).is_ok());
    }
}
