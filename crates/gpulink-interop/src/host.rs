//! In-process reference backend.
//!
//! [`HostExporter`] plays the render API and [`HostCompute`] the compute API.
//! Both talk through a [`HostHub`] that hands exported objects to the
//! importer by id, so the full export/import/fence protocol runs without a
//! GPU. Memory is a shared byte vector: writes on one side are visible on
//! the other, like a real shared allocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

use gpulink_core::DeviceIdentity;

use crate::api::{ComputeApi, ComputeDevice, ComputePeer, RenderExporter};
use crate::fence::{TimelineEndpoint, WaitOutcome};
use crate::resource::{Export, ImageDesc, MemoryRequest};
use crate::{ExternalHandle, InteropError, InteropResult};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

enum HubObject {
    Memory(HostMemory),
    Timeline(HostTimeline),
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, HubObject>>,
}

/// Exchange point between host exporter and host compute API.
#[derive(Clone, Default)]
pub struct HostHub {
    inner: Arc<HubInner>,
}

impl HostHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, object: HubObject) -> ExternalHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.inner.pending).insert(id, object);
        ExternalHandle::Host(HostHandle { id, hub: Arc::downgrade(&self.inner) })
    }

    fn claim(&self, handle: ExternalHandle) -> InteropResult<HubObject> {
        let handle = match handle {
            ExternalHandle::Host(handle) => handle,
            other => {
                return Err(InteropError::Import(format!(
                    "host backend cannot import {} handles",
                    other.kind()
                )));
            }
        };
        if !Weak::ptr_eq(&handle.hub, &Arc::downgrade(&self.inner)) {
            let id = handle.id;
            return Err(InteropError::Import(format!("host handle {id} belongs to another hub")));
        }
        lock(&self.inner.pending)
            .remove(&handle.id)
            .ok_or_else(|| InteropError::Import(format!("unknown host handle {}", handle.id)))
    }

    /// Exported objects not yet imported.
    pub fn pending(&self) -> usize {
        lock(&self.inner.pending).len()
    }
}

/// Owned id of an object published on a [`HostHub`].
///
/// Dropping an unclaimed handle withdraws the object from the hub, the way
/// closing an unimported fd releases the driver's export.
pub struct HostHandle {
    id: u64,
    hub: Weak<HubInner>,
}

impl HostHandle {
    /// Hub-assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Handle that belongs to no hub.
    #[cfg(test)]
    pub(crate) fn detached(id: u64) -> Self {
        Self { id, hub: Weak::new() }
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        if lock(&hub.pending).remove(&self.id).is_some() {
            debug!(id = self.id, "Withdrew unclaimed host export");
        }
    }
}

impl std::fmt::Debug for HostHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHub").field("pending", &self.pending()).finish()
    }
}

/// Shared host allocation.
#[derive(Debug, Clone)]
pub struct HostMemory {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostMemory {
    fn zeroed(size: u64) -> Self {
        Self { bytes: Arc::new(Mutex::new(vec![0; size as usize])) }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    /// True for a zero-length allocation.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` to `offset`.
    ///
    /// # Panics
    ///
    /// If the range is out of bounds.
    pub fn write(&self, offset: usize, data: &[u8]) {
        lock(&self.bytes)[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copy `len` bytes from `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        lock(&self.bytes)[offset..offset + len].to_vec()
    }

    /// True when both refer to the same allocation.
    pub fn shares_storage(&self, other: &HostMemory) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

#[derive(Debug)]
struct TimelineState {
    value: Mutex<u64>,
    advanced: Condvar,
}

/// Host timeline semaphore (`Mutex<u64>` + `Condvar`).
#[derive(Debug, Clone)]
pub struct HostTimeline {
    state: Arc<TimelineState>,
}

impl HostTimeline {
    /// Timeline at `initial`.
    pub fn new(initial: u64) -> Self {
        Self {
            state: Arc::new(TimelineState { value: Mutex::new(initial), advanced: Condvar::new() }),
        }
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        *lock(&self.state.value)
    }
}

impl TimelineEndpoint for HostTimeline {
    fn signal(&self, value: u64) -> InteropResult<()> {
        let mut current = lock(&self.state.value);
        if value <= *current {
            return Err(InteropError::driver(
                "host timeline signal",
                format!("value {value} does not exceed {}", *current),
            ));
        }
        *current = value;
        self.state.advanced.notify_all();
        Ok(())
    }

    fn wait(&self, value: u64) -> InteropResult<WaitOutcome> {
        let guard = lock(&self.state.value);
        let guard = self
            .state
            .advanced
            .wait_while(guard, |current| *current < value)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(WaitOutcome::Observed(*guard))
    }

    fn current_value(&self) -> Option<u64> {
        Some(self.value())
    }
}

/// Host render device.
#[derive(Debug, Clone)]
pub struct HostExporter {
    hub: HostHub,
    identity: Option<DeviceIdentity>,
    vendor_id: u32,
    export_supported: bool,
}

impl HostExporter {
    /// Exporter for a device with `identity` from `vendor_id`.
    pub fn new(hub: HostHub, identity: Option<DeviceIdentity>, vendor_id: u32) -> Self {
        Self { hub, identity, vendor_id, export_supported: true }
    }

    /// Simulate a driver without external handle support.
    pub fn without_export_support(mut self) -> Self {
        self.export_supported = false;
        self
    }

    fn check_export(&self) -> InteropResult<()> {
        if self.export_supported {
            Ok(())
        } else {
            Err(InteropError::HandleExportUnavailable(
                "host exporter configured without export".into(),
            ))
        }
    }
}

impl RenderExporter for HostExporter {
    type Memory = HostMemory;
    type Semaphore = HostTimeline;

    fn identity(&self) -> Option<DeviceIdentity> {
        self.identity
    }

    fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    fn export_memory(&self, request: &MemoryRequest) -> InteropResult<Export<HostMemory>> {
        self.check_export()?;
        let size = match request {
            MemoryRequest::Buffer { size } => *size,
            MemoryRequest::Image(desc) => desc.packed_size(),
        };
        let memory = HostMemory::zeroed(size);
        let handle = self.hub.publish(HubObject::Memory(memory.clone()));
        Ok(Export { object: memory, handle, size })
    }

    fn export_timeline(&self, initial: u64) -> InteropResult<Export<HostTimeline>> {
        self.check_export()?;
        let timeline = HostTimeline::new(initial);
        let handle = self.hub.publish(HubObject::Timeline(timeline.clone()));
        Ok(Export { object: timeline, handle, size: 0 })
    }
}

/// Host compute API.
#[derive(Debug, Clone)]
pub struct HostCompute {
    name: String,
    hub: HostHub,
    devices: Vec<ComputeDevice>,
    vendors: Option<Vec<u32>>,
}

impl HostCompute {
    /// Compute API listing `devices`. Accepts every vendor.
    pub fn new(name: impl Into<String>, hub: HostHub, devices: Vec<ComputeDevice>) -> Self {
        Self { name: name.into(), hub, devices, vendors: None }
    }

    /// Restrict to the given vendors, the way CUDA only runs on NVIDIA.
    pub fn accepting_vendors(mut self, vendors: &[u32]) -> Self {
        self.vendors = Some(vendors.to_vec());
        self
    }
}

impl ComputeApi for HostCompute {
    type Peer = HostPeer;

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_vendor(&self, vendor_id: u32) -> bool {
        self.vendors.as_ref().is_none_or(|v| v.contains(&vendor_id))
    }

    fn devices(&self) -> InteropResult<Vec<ComputeDevice>> {
        Ok(self.devices.clone())
    }

    fn open(&self, ordinal: usize) -> InteropResult<HostPeer> {
        let device = self
            .devices
            .iter()
            .find(|d| d.ordinal == ordinal)
            .ok_or_else(|| {
                InteropError::driver("host open", format!("no device with ordinal {ordinal}"))
            })?;
        debug!(ordinal, name = %device.name, "Opened host compute device");
        Ok(HostPeer { hub: self.hub.clone(), ordinal })
    }
}

/// Opened host compute device.
#[derive(Debug, Clone)]
pub struct HostPeer {
    hub: HostHub,
    ordinal: usize,
}

impl HostPeer {
    /// Ordinal this peer was opened with.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn claim_memory(&self, handle: ExternalHandle, size: u64) -> InteropResult<HostMemory> {
        match self.hub.claim(handle)? {
            HubObject::Memory(m) if m.len() as u64 >= size => Ok(m),
            HubObject::Memory(m) => Err(InteropError::Import(format!(
                "import of {size} bytes exceeds {}-byte allocation",
                m.len()
            ))),
            HubObject::Timeline(_) => {
                Err(InteropError::Import("handle refers to a timeline".into()))
            }
        }
    }
}

impl ComputePeer for HostPeer {
    type Buffer = HostMemory;
    type Image = HostMemory;
    type Semaphore = HostTimeline;

    fn import_buffer(&self, handle: ExternalHandle, size: u64) -> InteropResult<HostMemory> {
        self.claim_memory(handle, size)
    }

    fn import_image(
        &self,
        handle: ExternalHandle,
        size: u64,
        desc: &ImageDesc,
    ) -> InteropResult<HostMemory> {
        desc.validate()?;
        self.claim_memory(handle, size)
    }

    fn import_timeline(&self, handle: ExternalHandle) -> InteropResult<HostTimeline> {
        match self.hub.claim(handle)? {
            HubObject::Timeline(t) => Ok(t),
            HubObject::Memory(_) => Err(InteropError::Import("handle refers to memory".into())),
        }
    }
}
