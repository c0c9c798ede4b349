//! Render/compute bridge for one physical device.

use tracing::{debug, info, warn};

use crate::api::{ComputeApi, ComputeDevice, ComputePeer, RenderExporter, find_peer};
use crate::fence::InteropFence;
use crate::resource::{Exported, ImageDesc, Imported, MemoryRequest};
use crate::{ExternalHandle, InteropError, InteropResult};

type PeerOf<C> = <C as ComputeApi>::Peer;

/// Fence type created by an [`InteropBridge`].
pub type BridgeFence<R, C> =
    InteropFence<<R as RenderExporter>::Semaphore, <PeerOf<C> as ComputePeer>::Semaphore>;

/// Exported linear memory.
#[derive(Debug)]
pub struct InteropBuffer<M> {
    native: Exported<M>,
    foreign: Option<ExternalHandle>,
    size: u64,
}

impl<M> InteropBuffer<M> {
    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Native allocation.
    pub fn native(&self) -> &M {
        self.native.get()
    }

    /// Live compute-side imports.
    pub fn live_imports(&self) -> usize {
        self.native.live_imports()
    }

    /// Release the native allocation.
    ///
    /// # Panics
    ///
    /// If an import is still alive.
    pub fn release(self) -> M {
        self.native.release()
    }
}

/// Exported image memory.
#[derive(Debug)]
pub struct InteropImage<M> {
    native: Exported<M>,
    foreign: Option<ExternalHandle>,
    desc: ImageDesc,
    allocation_size: u64,
}

impl<M> InteropImage<M> {
    /// Image descriptor.
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Size of the backing allocation in bytes.
    pub fn allocation_size(&self) -> u64 {
        self.allocation_size
    }

    /// Native allocation.
    pub fn native(&self) -> &M {
        self.native.get()
    }

    /// Live compute-side imports.
    pub fn live_imports(&self) -> usize {
        self.native.live_imports()
    }

    /// Release the native allocation.
    ///
    /// # Panics
    ///
    /// If an import is still alive.
    pub fn release(self) -> M {
        self.native.release()
    }
}

/// A render device paired with the compute device reporting the same identity.
pub struct InteropBridge<R: RenderExporter, C: ComputeApi> {
    render: R,
    peer: PeerOf<C>,
    peer_device: ComputeDevice,
    compute_name: String,
}

impl<R: RenderExporter, C: ComputeApi> InteropBridge<R, C> {
    /// Find and open the compute peer of `render`.
    ///
    /// Fails with [`InteropError::VendorUnsupported`] before enumerating
    /// when `compute` cannot run on the render device's vendor, and with
    /// [`InteropError::IdentityMismatch`] when no compute device reports the
    /// render device's identity.
    pub fn open(render: R, compute: &C) -> InteropResult<Self> {
        let compute_name = compute.name().to_string();
        let vendor_id = render.vendor_id();
        if !compute.supports_vendor(vendor_id) {
            return Err(InteropError::VendorUnsupported { compute: compute_name, vendor_id });
        }

        let Some(identity) = render.identity() else {
            warn!(compute = %compute_name, "Render device has no identity; interop disabled");
            return Err(InteropError::IdentityMismatch {
                compute: compute_name,
                key: "none".into(),
            });
        };
        let key = identity.peer_key();

        let devices = compute.devices()?;
        debug!(
            compute = %compute_name,
            count = devices.len(),
            key = %key,
            "Matching compute devices"
        );
        let Some(index) = find_peer(&key, &devices) else {
            return Err(InteropError::IdentityMismatch {
                compute: compute_name,
                key: key.to_string(),
            });
        };

        let peer_device = devices[index].clone();
        let peer = compute.open(peer_device.ordinal)?;
        info!(
            compute = %compute_name,
            ordinal = peer_device.ordinal,
            name = %peer_device.name,
            "Opened interop peer"
        );
        Ok(Self { render, peer, peer_device, compute_name })
    }

    /// Render side.
    pub fn render(&self) -> &R {
        &self.render
    }

    /// Compute side.
    pub fn peer(&self) -> &PeerOf<C> {
        &self.peer
    }

    /// Compute device that matched.
    pub fn peer_device(&self) -> &ComputeDevice {
        &self.peer_device
    }

    /// Compute API name.
    pub fn compute_name(&self) -> &str {
        &self.compute_name
    }

    /// Allocate and export `size` bytes of linear memory.
    pub fn create_buffer(&self, size: u64) -> InteropResult<InteropBuffer<R::Memory>> {
        let request = MemoryRequest::Buffer { size };
        request.validate()?;
        let export = self.render.export_memory(&request)?;
        debug!(size, handle = export.handle.kind(), "Exported buffer");
        Ok(InteropBuffer {
            native: Exported::new(export.object, "interop buffer"),
            foreign: Some(export.handle),
            size,
        })
    }

    /// Allocate and export an image.
    pub fn create_image(&self, desc: &ImageDesc) -> InteropResult<InteropImage<R::Memory>> {
        let request = MemoryRequest::Image(*desc);
        request.validate()?;
        let export = self.render.export_memory(&request)?;
        debug!(
            width = desc.width,
            height = desc.height,
            format = ?desc.format,
            allocation = export.size,
            "Exported image"
        );
        Ok(InteropImage {
            native: Exported::new(export.object, "interop image"),
            foreign: Some(export.handle),
            desc: *desc,
            allocation_size: export.size,
        })
    }

    /// Create and export a timeline fence starting at `initial`.
    pub fn create_fence(&self, initial: u64) -> InteropResult<BridgeFence<R, C>> {
        let export = self.render.export_timeline(initial)?;
        debug!(initial, handle = export.handle.kind(), "Exported timeline fence");
        Ok(InteropFence::new(export.object, export.handle, initial))
    }

    /// Import a buffer on the compute side.
    ///
    /// The returned lease must be dropped before the buffer is released.
    pub fn import_buffer(
        &self,
        buffer: &mut InteropBuffer<R::Memory>,
    ) -> InteropResult<Imported<<PeerOf<C> as ComputePeer>::Buffer>> {
        let handle = buffer.foreign.take().ok_or(InteropError::HandleConsumed)?;
        let imported = self.peer.import_buffer(handle, buffer.size)?;
        Ok(buffer.native.lease(imported))
    }

    /// Import an image on the compute side.
    pub fn import_image(
        &self,
        image: &mut InteropImage<R::Memory>,
    ) -> InteropResult<Imported<<PeerOf<C> as ComputePeer>::Image>> {
        let handle = image.foreign.take().ok_or(InteropError::HandleConsumed)?;
        let imported = self.peer.import_image(handle, image.allocation_size, &image.desc)?;
        Ok(image.native.lease(imported))
    }

    /// Import a fence on the compute side. Afterwards both sides can signal
    /// and wait through the fence.
    pub fn import_fence(&self, fence: &mut BridgeFence<R, C>) -> InteropResult<()> {
        let handle = fence.take_foreign()?;
        let imported = self.peer.import_timeline(handle)?;
        fence.attach_peer(imported);
        Ok(())
    }
}
