//! Render/compute API seams and peer matching.

use gpulink_core::identity::{format_luid, format_uuid};
use gpulink_core::{DeviceIdentity, Luid, PeerKey, Uuid};

use crate::fence::TimelineEndpoint;
use crate::resource::{Export, ImageDesc, MemoryRequest};
use crate::{ExternalHandle, InteropResult};

/// Render-side device able to allocate exportable resources.
pub trait RenderExporter {
    /// Native allocation (buffer or image plus its memory).
    type Memory: Send + Sync;
    /// Native timeline semaphore.
    type Semaphore: TimelineEndpoint;

    /// Identity of the render device, `None` when the driver did not report one.
    fn identity(&self) -> Option<DeviceIdentity>;

    /// PCI vendor ID of the render device.
    fn vendor_id(&self) -> u32;

    /// Allocate exportable memory and export its handle.
    fn export_memory(&self, request: &MemoryRequest) -> InteropResult<Export<Self::Memory>>;

    /// Create an exportable timeline semaphore at `initial`.
    fn export_timeline(&self, initial: u64) -> InteropResult<Export<Self::Semaphore>>;
}

/// One device as listed by a compute API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeDevice {
    /// Ordinal passed to [`ComputeApi::open`].
    pub ordinal: usize,
    /// Display name.
    pub name: String,
    /// Device UUID, when the API reports one.
    pub uuid: Option<Uuid>,
    /// Adapter LUID, Windows only.
    pub luid: Option<Luid>,
}

impl ComputeDevice {
    /// Identity bytes formatted for display.
    pub fn describe_identity(&self) -> String {
        match (&self.uuid, &self.luid) {
            (Some(u), Some(l)) => format!("uuid {} luid {}", format_uuid(u), format_luid(l)),
            (Some(u), None) => format!("uuid {}", format_uuid(u)),
            (None, Some(l)) => format!("luid {}", format_luid(l)),
            (None, None) => "no identity".to_string(),
        }
    }

    fn matches(&self, key: &PeerKey) -> bool {
        match key {
            PeerKey::Uuid(u) => self.uuid.as_ref() == Some(u),
            PeerKey::Luid(l) => self.luid.as_ref() == Some(l),
        }
    }
}

/// Compute API entry point (CUDA, HIP, SYCL).
pub trait ComputeApi {
    /// Opened device.
    type Peer: ComputePeer;

    /// API name for diagnostics.
    fn name(&self) -> &str;

    /// Whether the API can run on a render device from `vendor_id`.
    fn supports_vendor(&self, vendor_id: u32) -> bool;

    /// Devices in API order.
    fn devices(&self) -> InteropResult<Vec<ComputeDevice>>;

    /// Open the device with `ordinal`.
    fn open(&self, ordinal: usize) -> InteropResult<Self::Peer>;
}

/// Opened compute device that imports render-side exports.
pub trait ComputePeer {
    /// Imported linear memory (device pointer).
    type Buffer: Send + Sync;
    /// Imported image (array / texture object).
    type Image: Send + Sync;
    /// Imported timeline semaphore.
    type Semaphore: TimelineEndpoint;

    /// Import `size` bytes of linear memory. Consumes `handle`.
    fn import_buffer(&self, handle: ExternalHandle, size: u64) -> InteropResult<Self::Buffer>;

    /// Import an image whose backing allocation is `size` bytes. Consumes `handle`.
    fn import_image(
        &self,
        handle: ExternalHandle,
        size: u64,
        desc: &ImageDesc,
    ) -> InteropResult<Self::Image>;

    /// Import a timeline semaphore. Consumes `handle`.
    fn import_timeline(&self, handle: ExternalHandle) -> InteropResult<Self::Semaphore>;
}

/// Index of the first compute device whose identity bytes equal `key`.
pub fn find_peer(key: &PeerKey, devices: &[ComputeDevice]) -> Option<usize> {
    devices.iter().position(|d| d.matches(key))
}
