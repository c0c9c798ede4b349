//! Shareable resource descriptions and the export/import ownership ledger.
//!
//! The render side owns every allocation. An import on the compute side is a
//! weak reference into that allocation, so the native object has to outlive
//! all of its imports:
//!
//! ```text
//! Exported<T> ──lease()──> Imported<U>   (ledger +1)
//!      │                       │
//!      │                   drop/release  (ledger -1)
//!      └── release(): panics while the ledger is non-zero
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crate::{InteropError, InteropResult};

/// Texel format of an interop image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// 8-bit RGBA, normalized.
    Rgba8Unorm,
    /// 8-bit RGBA, unsigned integer.
    Rgba8Uint,
    /// 8-bit BGRA, normalized.
    Bgra8Unorm,
    /// 16-bit float RGBA.
    Rgba16Float,
    /// 32-bit float RGBA.
    Rgba32Float,
    /// 32-bit float single channel.
    R32Float,
}

impl ImageFormat {
    /// Bytes per texel.
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Rgba8Uint | Self::Bgra8Unorm | Self::R32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    /// Channel count.
    pub fn channels(&self) -> u32 {
        match self {
            Self::R32Float => 1,
            _ => 4,
        }
    }
}

/// Texel layout in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tiling {
    /// Driver-defined layout.
    #[default]
    Optimal,
    /// Row-major with a driver-defined row pitch.
    Linear,
}

/// Image descriptor shared by both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Depth in texels, 1 for 2D images.
    pub depth: u32,
    /// Texel format.
    pub format: ImageFormat,
    /// Mip level count.
    pub mip_levels: u32,
    /// Array layer count.
    pub array_layers: u32,
    /// Memory layout.
    pub tiling: Tiling,
}

impl ImageDesc {
    /// Single-level, single-layer 2D image with optimal tiling.
    pub fn new_2d(width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            width,
            height,
            depth: 1,
            format,
            mip_levels: 1,
            array_layers: 1,
            tiling: Tiling::Optimal,
        }
    }

    /// Reject zero-sized dimensions and impossible mip chains.
    pub fn validate(&self) -> InteropResult<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(InteropError::InvalidDescriptor(format!(
                "zero extent {}x{}x{}",
                self.width, self.height, self.depth
            )));
        }
        if self.mip_levels == 0 || self.array_layers == 0 {
            return Err(InteropError::InvalidDescriptor(
                "mip_levels and array_layers must be at least 1".into(),
            ));
        }
        let largest = self.width.max(self.height).max(self.depth);
        let max_mips = 32 - largest.leading_zeros();
        if self.mip_levels > max_mips {
            return Err(InteropError::InvalidDescriptor(format!(
                "{} mip levels exceed the {} possible for {}x{}x{}",
                self.mip_levels, max_mips, self.width, self.height, self.depth
            )));
        }
        if self.depth > 1 && self.array_layers > 1 {
            return Err(InteropError::InvalidDescriptor("3D images cannot be layered".into()));
        }
        Ok(())
    }

    /// Tightly packed size of every mip level and layer.
    pub fn packed_size(&self) -> u64 {
        let bpp = self.format.bytes_per_pixel() as u64;
        (0..self.mip_levels)
            .map(|level| {
                let w = (self.width >> level).max(1) as u64;
                let h = (self.height >> level).max(1) as u64;
                let d = (self.depth >> level).max(1) as u64;
                w * h * d * bpp
            })
            .sum::<u64>()
            * self.array_layers as u64
    }
}

/// What the render side should allocate for export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRequest {
    /// Linear buffer of `size` bytes.
    Buffer {
        /// Size in bytes.
        size: u64,
    },
    /// Image described by an [`ImageDesc`].
    Image(ImageDesc),
}

impl MemoryRequest {
    /// Reject empty buffers and invalid image descriptors.
    pub fn validate(&self) -> InteropResult<()> {
        match self {
            Self::Buffer { size: 0 } => {
                Err(InteropError::InvalidDescriptor("zero-sized buffer".into()))
            }
            Self::Buffer { .. } => Ok(()),
            Self::Image(desc) => desc.validate(),
        }
    }
}

/// Result of a render-side export.
#[derive(Debug)]
pub struct Export<T> {
    /// Native object.
    pub object: T,
    /// Handle for the compute side.
    pub handle: crate::ExternalHandle,
    /// Allocation size in bytes, as the compute side must import it.
    pub size: u64,
}

#[derive(Debug)]
struct ReleaseGuard {
    live: Arc<AtomicUsize>,
    what: &'static str,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let live = self.live.load(Ordering::Acquire);
        if live != 0 && !thread::panicking() {
            panic!("{} dropped while {} import(s) are still alive", self.what, live);
        }
    }
}

/// A natively owned object that may have been imported elsewhere.
#[derive(Debug)]
pub struct Exported<T> {
    inner: T,
    guard: ReleaseGuard,
}

impl<T> Exported<T> {
    /// Track `inner`. `what` names the object in contract-violation panics.
    pub fn new(inner: T, what: &'static str) -> Self {
        Self {
            inner,
            guard: ReleaseGuard { live: Arc::new(AtomicUsize::new(0)), what },
        }
    }

    /// Native object.
    pub fn get(&self) -> &T {
        &self.inner
    }

    /// Number of live imports.
    pub fn live_imports(&self) -> usize {
        self.guard.live.load(Ordering::Acquire)
    }

    /// Register an import of this object.
    pub fn lease<U>(&self, imported: U) -> Imported<U> {
        self.guard.live.fetch_add(1, Ordering::AcqRel);
        Imported {
            inner: imported,
            lease: Lease { live: Arc::clone(&self.guard.live) },
        }
    }

    /// Take the native object back for destruction.
    ///
    /// # Panics
    ///
    /// If any [`Imported`] lease is still alive.
    pub fn release(self) -> T {
        let live = self.live_imports();
        if live != 0 {
            panic!("{} released while {} import(s) are still alive", self.guard.what, live);
        }
        let Self { inner, guard } = self;
        drop(guard);
        inner
    }
}

#[derive(Debug)]
struct Lease {
    live: Arc<AtomicUsize>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Compute-side view of an exported object.
#[derive(Debug)]
pub struct Imported<T> {
    inner: T,
    lease: Lease,
}

impl<T> Imported<T> {
    /// Imported object.
    pub fn get(&self) -> &T {
        &self.inner
    }

    /// Destroy the import first, then drop the lease.
    pub fn release(self) {
        let Self { inner, lease } = self;
        drop(inner);
        drop(lease);
    }
}

impl<T> std::ops::Deref for Imported<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_after_imports_dropped() {
        let native = Exported::new(vec![1u8, 2, 3], "buffer");
        let a = native.lease("a");
        let b = native.lease("b");
        assert_eq!(native.live_imports(), 2);
        drop(a);
        b.release();
        assert_eq!(native.release(), vec![1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "still alive")]
    fn test_release_with_live_import_panics() {
        let native = Exported::new(0u32, "buffer");
        let _import = native.lease(());
        native.release();
    }

    #[test]
    #[should_panic(expected = "dropped while 1 import")]
    fn test_drop_with_live_import_panics() {
        let native = Exported::new(0u32, "image");
        let import = native.lease(());
        drop(native);
        drop(import);
    }

    #[test]
    fn test_image_desc_validate() {
        assert!(ImageDesc::new_2d(64, 64, ImageFormat::Rgba8Unorm).validate().is_ok());
        assert!(ImageDesc::new_2d(0, 64, ImageFormat::Rgba8Unorm).validate().is_err());

        let mut desc = ImageDesc::new_2d(64, 32, ImageFormat::Rgba8Unorm);
        desc.mip_levels = 7;
        assert!(desc.validate().is_ok());
        desc.mip_levels = 8;
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_packed_size_with_mips_and_layers() {
        let mut desc = ImageDesc::new_2d(4, 4, ImageFormat::Rgba32Float);
        desc.mip_levels = 3;
        desc.array_layers = 2;
        // (16 + 4 + 1) texels * 16 bytes * 2 layers
        assert_eq!(desc.packed_size(), 21 * 16 * 2);
    }

    #[test]
    fn test_zero_buffer_rejected() {
        assert!(MemoryRequest::Buffer { size: 0 }.validate().is_err());
        assert!(MemoryRequest::Buffer { size: 1 }.validate().is_ok());
    }
}
