//! Staging backend seam.

use std::fmt;

use crate::{ReadbackError, ReadbackResult};

/// Image size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Extent {
    /// Extent of `width` x `height`.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Reject zero-sized extents.
    pub fn validate(&self) -> ReadbackResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ReadbackError::InvalidExtent { width: self.width, height: self.height });
        }
        Ok(())
    }

    /// Bytes in one tightly packed RGBA8 row.
    pub fn packed_row(&self) -> usize {
        self.width as usize * 4
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Byte order of the four channels in staging memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
    /// R, G, B, A.
    #[default]
    Rgba,
    /// B, G, R, A (common swapchain format).
    Bgra,
}

/// Mapped staging memory, valid for the duration of
/// [`StagingBackend::with_mapped`].
#[derive(Debug, Clone, Copy)]
pub struct MappedImage<'a> {
    /// Mapped bytes starting at row 0.
    pub bytes: &'a [u8],
    /// Distance between rows in bytes, at least `extent.width * 4`.
    pub row_pitch: usize,
    /// Image size.
    pub extent: Extent,
    /// Channel order of the texels.
    pub order: ChannelOrder,
}

/// GPU side of the readback pool.
///
/// Implementations allocate CPU-visible, linearly laid out images, record
/// copies into them on the current command stream and map them for reading
/// once the GPU is done.
pub trait StagingBackend {
    /// CPU-visible staging image.
    type Image;
    /// Image rendered into (usually a swapchain image).
    type Source;

    /// Allocate a staging image ready to be a copy destination.
    fn create_staging(&mut self, extent: Extent) -> ReadbackResult<Self::Image>;

    /// Free a staging image.
    fn destroy_staging(&mut self, image: Self::Image);

    /// Record a copy of `source` into `staging`.
    fn record_copy(
        &mut self,
        source: &Self::Source,
        staging: &mut Self::Image,
    ) -> ReadbackResult<()>;

    /// Map `staging`, run `f` on its bytes and unmap.
    fn with_mapped<T, F>(&mut self, staging: &Self::Image, f: F) -> ReadbackResult<T>
    where
        F: FnOnce(MappedImage<'_>) -> T;
}
