//! Per-swapchain-image readback pool.
//!
//! One [`ReadbackFrame`] exists per swapchain image. A screenshot is taken in
//! two steps that are a full swapchain cycle apart:
//!
//! ```text
//! frame N   (slot i)  request(src, path)   record copy src -> staging[i]
//! frame N+k (slot i)  on_image_acquired(i) map staging[i], write PNG
//! ```
//!
//! Acquiring slot `i` again means the GPU finished the work submitted the
//! last time `i` was used, so the copy is complete by then and no extra
//! fence is needed.

use std::env;
use std::path::PathBuf;

use tracing::{debug, error, info};

use crate::output::write_png;
use crate::pack::unpack_rows;
use crate::staging::{Extent, StagingBackend};
use crate::{ReadbackError, ReadbackResult};

/// Env var holding the initial transparent-background setting.
pub const TRANSPARENT_ENV: &str = "GPULINK_TRANSPARENT_SCREENSHOTS";

/// Pool configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadbackConfig {
    /// Keep the rendered alpha channel instead of writing opaque pixels.
    pub transparent_background: bool,
}

impl ReadbackConfig {
    /// Configuration from `GPULINK_TRANSPARENT_SCREENSHOTS` (`1` / `true`).
    pub fn from_env() -> Self {
        Self {
            transparent_background: env::var(TRANSPARENT_ENV)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

/// Swapchain shape reported on (re)creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainInfo {
    /// Number of swapchain images.
    pub image_count: usize,
    /// Swapchain extent.
    pub extent: Extent,
}

/// Staging image plus the pending request for one swapchain slot.
#[derive(Debug)]
pub struct ReadbackFrame<I> {
    staging: I,
    destination: Option<PathBuf>,
}

impl<I> ReadbackFrame<I> {
    /// True between a request and its harvest.
    pub fn in_flight(&self) -> bool {
        self.destination.is_some()
    }

    /// Destination of the pending request.
    pub fn destination(&self) -> Option<&PathBuf> {
        self.destination.as_ref()
    }
}

/// Screenshot readback pool driven by swapchain callbacks.
pub struct ReadbackPool<B: StagingBackend> {
    backend: B,
    frames: Vec<ReadbackFrame<B::Image>>,
    extent: Extent,
    current_slot: Option<usize>,
    transparent_background: bool,
}

impl<B: StagingBackend> ReadbackPool<B> {
    /// Empty pool; frames appear on the first swapchain creation.
    pub fn new(backend: B, config: ReadbackConfig) -> Self {
        Self {
            backend,
            frames: Vec::new(),
            extent: Extent::default(),
            current_slot: None,
            transparent_background: config.transparent_background,
        }
    }

    /// Harvest every pending request, then reallocate one frame per
    /// swapchain image.
    ///
    /// On allocation failure the pool is left empty.
    pub fn on_swapchain_recreated(&mut self, info: SwapchainInfo) -> ReadbackResult<()> {
        self.drain();
        for frame in std::mem::take(&mut self.frames) {
            self.backend.destroy_staging(frame.staging);
        }
        self.current_slot = None;
        self.extent = info.extent;

        if info.image_count == 0 {
            return Ok(());
        }
        info.extent.validate()?;

        let mut frames = Vec::with_capacity(info.image_count);
        for _ in 0..info.image_count {
            match self.backend.create_staging(info.extent) {
                Ok(staging) => frames.push(ReadbackFrame { staging, destination: None }),
                Err(e) => {
                    for frame in frames {
                        self.backend.destroy_staging(frame.staging);
                    }
                    return Err(e);
                }
            }
        }
        self.frames = frames;
        debug!(images = info.image_count, extent = %info.extent, "Readback pool resized");
        Ok(())
    }

    /// Swapchain image `slot` was acquired: make it current and harvest its
    /// pending request. Returns the written file, if any.
    pub fn on_image_acquired(&mut self, slot: usize) -> Option<PathBuf> {
        self.current_slot = Some(slot);
        // Errors are logged by save_if_available.
        self.save_if_available(slot).ok().flatten()
    }

    /// Queue a screenshot of `source` to `path` on the current slot (0
    /// before the first acquire).
    ///
    /// # Panics
    ///
    /// If the slot already has a request in flight.
    pub fn request(&mut self, source: &B::Source, path: impl Into<PathBuf>) -> ReadbackResult<()> {
        let slot = self.current_slot.unwrap_or(0);
        let len = self.frames.len();
        let frame = self.frames.get_mut(slot).ok_or(ReadbackError::NoFrame { slot, len })?;
        if let Some(pending) = &frame.destination {
            panic!(
                "screenshot requested on swapchain slot {slot} while {} is still in flight",
                pending.display()
            );
        }
        self.backend.record_copy(source, &mut frame.staging)?;
        let path = path.into();
        debug!(slot, path = %path.display(), "Screenshot requested");
        frame.destination = Some(path);
        Ok(())
    }

    /// Finish the request on `slot` if there is one.
    ///
    /// The GPU must be done with the slot. A failed harvest still consumes
    /// the request.
    pub fn save_if_available(&mut self, slot: usize) -> ReadbackResult<Option<PathBuf>> {
        let Some(frame) = self.frames.get_mut(slot) else {
            return Ok(None);
        };
        let Some(path) = frame.destination.take() else {
            return Ok(None);
        };

        let transparent = self.transparent_background;
        let result = self
            .backend
            .with_mapped(&frame.staging, |mapped| {
                unpack_rows(&mapped, transparent).map(|rgba| (mapped.extent, rgba))
            })
            .and_then(|packed| packed)
            .and_then(|(extent, rgba)| write_png(&path, extent.width, extent.height, &rgba));

        match result {
            Ok(()) => {
                info!(slot, path = %path.display(), "Screenshot written");
                Ok(Some(path))
            }
            Err(e) => {
                error!(slot, path = %path.display(), error = %e, "Screenshot failed");
                Err(e)
            }
        }
    }

    fn drain(&mut self) {
        for slot in 0..self.frames.len() {
            let _ = self.save_if_available(slot);
        }
    }

    /// Number of frames (swapchain images).
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True before the first swapchain creation.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Extent of the staging images.
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Slot set by the last [`on_image_acquired`](Self::on_image_acquired).
    pub fn current_slot(&self) -> Option<usize> {
        self.current_slot
    }

    /// Frame for `slot`.
    pub fn frame(&self, slot: usize) -> Option<&ReadbackFrame<B::Image>> {
        self.frames.get(slot)
    }

    /// True when `slot` has a pending request.
    pub fn is_in_flight(&self, slot: usize) -> bool {
        self.frames.get(slot).is_some_and(ReadbackFrame::in_flight)
    }

    /// Keep rendered alpha instead of writing opaque pixels.
    pub fn set_transparent_background(&mut self, transparent: bool) {
        self.transparent_background = transparent;
    }

    /// Current transparent-background setting.
    pub fn transparent_background(&self) -> bool {
        self.transparent_background
    }

    /// Staging backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Staging backend, mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl<B: StagingBackend> Drop for ReadbackPool<B> {
    fn drop(&mut self) {
        self.drain();
        for frame in std::mem::take(&mut self.frames) {
            self.backend.destroy_staging(frame.staging);
        }
    }
}

impl<B: StagingBackend> std::fmt::Debug for ReadbackPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadbackPool")
            .field("frames", &self.frames.len())
            .field("in_flight", &(0..self.frames.len()).filter(|&s| self.is_in_flight(s)).count())
            .field("extent", &self.extent)
            .field("current_slot", &self.current_slot)
            .field("transparent_background", &self.transparent_background)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostImage, HostStaging};

    fn pool(images: usize) -> ReadbackPool<HostStaging> {
        let mut pool = ReadbackPool::new(HostStaging::new(), ReadbackConfig::default());
        let info = SwapchainInfo { image_count: images, extent: Extent::new(4, 3) };
        pool.on_swapchain_recreated(info).unwrap();
        pool
    }

    fn image(seed: u8) -> HostImage {
        HostImage::from_fn(Extent::new(4, 3), |x, y| [seed, x as u8, y as u8, 0])
    }

    #[test]
    fn test_pool_sized_to_swapchain() {
        let mut p = pool(3);
        assert_eq!(p.len(), 3);
        assert_eq!(p.backend().live_images(), 3);
        let info = SwapchainInfo { image_count: 2, extent: Extent::new(8, 8) };
        p.on_swapchain_recreated(info).unwrap();
        assert_eq!(p.len(), 2);
        assert_eq!(p.extent(), Extent::new(8, 8));
        assert_eq!(p.backend().live_images(), 2);
    }

    #[test]
    fn test_request_defaults_to_slot_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pool(2);
        p.request(&image(1), dir.path().join("a.png")).unwrap();
        assert!(p.is_in_flight(0));
        assert!(!p.is_in_flight(1));
    }

    #[test]
    fn test_request_without_swapchain() {
        let mut p = ReadbackPool::new(HostStaging::new(), ReadbackConfig::default());
        assert!(p.is_empty());
        let err = p.request(&image(0), "x.png").unwrap_err();
        assert!(matches!(err, ReadbackError::NoFrame { slot: 0, len: 0 }));
    }

    #[test]
    #[should_panic(expected = "still in flight")]
    fn test_double_request_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pool(2);
        p.on_image_acquired(1);
        p.request(&image(1), dir.path().join("a.png")).unwrap();
        let _ = p.request(&image(2), dir.path().join("b.png"));
    }

    #[test]
    fn test_idle_slot_saves_nothing() {
        let mut p = pool(2);
        assert!(p.save_if_available(0).unwrap().is_none());
        assert!(p.save_if_available(7).unwrap().is_none());
    }

    #[test]
    fn test_map_failure_consumes_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fail.png");
        let mut p = pool(1);
        p.request(&image(3), &path).unwrap();
        p.backend_mut().set_map_failure(true);

        assert!(matches!(p.save_if_available(0), Err(ReadbackError::Map(_))));
        assert!(!p.is_in_flight(0));
        assert!(!path.exists());

        // The slot accepts a new request afterwards.
        p.backend_mut().set_map_failure(false);
        p.request(&image(4), &path).unwrap();
        assert_eq!(p.on_image_acquired(0), Some(path.clone()));
        assert!(path.exists());
    }

    #[test]
    fn test_zero_images_leaves_pool_empty() {
        let mut p = pool(2);
        let info = SwapchainInfo { image_count: 0, extent: Extent::new(0, 0) };
        p.on_swapchain_recreated(info).unwrap();
        assert!(p.is_empty());
        assert_eq!(p.backend().live_images(), 0);
    }

    #[test]
    fn test_zero_extent_rejected() {
        let mut p = pool(2);
        let err = p
            .on_swapchain_recreated(SwapchainInfo { image_count: 2, extent: Extent::new(0, 10) })
            .unwrap_err();
        assert!(matches!(err, ReadbackError::InvalidExtent { .. }));
        assert!(p.is_empty());
    }

    #[test]
    fn test_drop_drains() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drop.png");
        {
            let mut p = pool(3);
            p.on_image_acquired(2);
            p.request(&image(5), &path).unwrap();
        }
        assert!(path.exists());
    }

    #[test]
    fn test_config_default_is_opaque() {
        assert!(!ReadbackConfig::default().transparent_background);
    }
}
