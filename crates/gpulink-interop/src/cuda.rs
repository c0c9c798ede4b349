//! CUDA compute peer (driver API through `cudarc`).
//!
//! Devices are matched by `cuDeviceGetUuid_v2` (and `cuDeviceGetLuid` on
//! Windows). Memory is imported with `cuImportExternalMemory` and mapped as
//! a device pointer or a mipmapped array; timeline semaphores go through
//! `cuImportExternalSemaphore`. Signals and waits are enqueued on the
//! context's default stream, so [`TimelineEndpoint::wait`] returns
//! [`WaitOutcome::Enqueued`] and never blocks the host.

use std::ffi::CStr;
use std::mem;
use std::ptr;
use std::sync::Arc;

use cudarc::driver::sys as cuda_sys;
use cudarc::driver::sys::{
    CUexternalMemoryHandleType as MemoryHandle, CUexternalSemaphoreHandleType as SemaphoreHandle,
};
use cudarc::driver::{CudaContext, CudaStream};
use tracing::{debug, warn};

use gpulink_core::vendor;

use crate::api::{ComputeApi, ComputeDevice, ComputePeer};
use crate::fence::{TimelineEndpoint, WaitOutcome};
use crate::resource::{ImageDesc, ImageFormat, Tiling};
use crate::{ExternalHandle, InteropError, InteropResult};

const CUDA_EXTERNAL_MEMORY_DEDICATED: u32 = 0x1;
const CUDA_ARRAY3D_LAYERED: u32 = 0x01;
const CUDA_ARRAY3D_SURFACE_LDST: u32 = 0x02;

#[cfg(unix)]
const MEMORY_FD: MemoryHandle = MemoryHandle::CU_EXTERNAL_MEMORY_HANDLE_TYPE_OPAQUE_FD;
#[cfg(windows)]
const MEMORY_WIN32: MemoryHandle = MemoryHandle::CU_EXTERNAL_MEMORY_HANDLE_TYPE_OPAQUE_WIN32;
#[cfg(unix)]
const SEMAPHORE_FD: SemaphoreHandle =
    SemaphoreHandle::CU_EXTERNAL_SEMAPHORE_HANDLE_TYPE_TIMELINE_SEMAPHORE_FD;
#[cfg(windows)]
const SEMAPHORE_WIN32: SemaphoreHandle =
    SemaphoreHandle::CU_EXTERNAL_SEMAPHORE_HANDLE_TYPE_TIMELINE_SEMAPHORE_WIN32;

fn check(call: &'static str, result: cuda_sys::CUresult) -> InteropResult<()> {
    if result == cuda_sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(InteropError::driver(call, format!("{result:?}")))
    }
}

fn check_import(call: &'static str, result: cuda_sys::CUresult) -> InteropResult<()> {
    check(call, result).map_err(|e| InteropError::Import(e.to_string()))
}

fn bind(ctx: &CudaContext) -> InteropResult<()> {
    ctx.bind_to_thread()
        .map_err(|e| InteropError::driver("cuCtxSetCurrent", format!("{e:?}")))
}

fn array_format(format: ImageFormat) -> (cuda_sys::CUarray_format, u32) {
    use cuda_sys::CUarray_format::*;
    match format {
        ImageFormat::Rgba8Unorm | ImageFormat::Rgba8Uint | ImageFormat::Bgra8Unorm => {
            (CU_AD_FORMAT_UNSIGNED_INT8, 4)
        }
        ImageFormat::Rgba16Float => (CU_AD_FORMAT_HALF, 4),
        ImageFormat::Rgba32Float => (CU_AD_FORMAT_FLOAT, 4),
        ImageFormat::R32Float => (CU_AD_FORMAT_FLOAT, 1),
    }
}

/// CUDA driver API.
#[derive(Debug, Default)]
pub struct CudaCompute;

impl CudaCompute {
    /// Initialize the driver.
    #[allow(unsafe_code)]
    pub fn new() -> InteropResult<Self> {
        check("cuInit", unsafe { cuda_sys::cuInit(0) })?;
        Ok(Self)
    }
}

#[allow(unsafe_code)]
fn describe_device(ordinal: usize) -> InteropResult<ComputeDevice> {
    let mut dev: cuda_sys::CUdevice = 0;
    check("cuDeviceGet", unsafe { cuda_sys::cuDeviceGet(&raw mut dev, ordinal as i32) })?;

    let mut name_buf = [0 as std::ffi::c_char; 256];
    check("cuDeviceGetName", unsafe {
        cuda_sys::cuDeviceGetName(name_buf.as_mut_ptr(), name_buf.len() as i32, dev)
    })?;
    #[allow(unsafe_code)]
    let name = unsafe { CStr::from_ptr(name_buf.as_ptr()) }.to_string_lossy().into_owned();

    let mut uuid: cuda_sys::CUuuid = unsafe { mem::zeroed() };
    let result = unsafe { cuda_sys::cuDeviceGetUuid_v2(&raw mut uuid, dev) };
    let uuid = match check("cuDeviceGetUuid_v2", result) {
        Ok(()) => Some(uuid.bytes.map(|b| b as u8)),
        Err(e) => {
            warn!(ordinal, error = %e, "CUDA device reported no UUID");
            None
        }
    };

    Ok(ComputeDevice { ordinal, name, uuid, luid: device_luid(dev) })
}

#[cfg(windows)]
#[allow(unsafe_code)]
fn device_luid(dev: cuda_sys::CUdevice) -> Option<gpulink_core::Luid> {
    let mut luid = [0 as std::ffi::c_char; 8];
    let mut node_mask: std::ffi::c_uint = 0;
    let result = unsafe { cuda_sys::cuDeviceGetLuid(luid.as_mut_ptr(), &raw mut node_mask, dev) };
    (result == cuda_sys::CUresult::CUDA_SUCCESS).then(|| luid.map(|b| b as u8))
}

#[cfg(not(windows))]
fn device_luid(_dev: cuda_sys::CUdevice) -> Option<gpulink_core::Luid> {
    None
}

impl ComputeApi for CudaCompute {
    type Peer = CudaPeer;

    fn name(&self) -> &str {
        "CUDA"
    }

    fn supports_vendor(&self, vendor_id: u32) -> bool {
        vendor_id == vendor::NVIDIA
    }

    #[allow(unsafe_code)]
    fn devices(&self) -> InteropResult<Vec<ComputeDevice>> {
        let mut count = 0i32;
        check("cuDeviceGetCount", unsafe { cuda_sys::cuDeviceGetCount(&raw mut count) })?;
        (0..count.max(0) as usize).map(describe_device).collect()
    }

    fn open(&self, ordinal: usize) -> InteropResult<CudaPeer> {
        let ctx = CudaContext::new(ordinal)
            .map_err(|e| InteropError::driver("cuDevicePrimaryCtxRetain", format!("{e:?}")))?;
        let stream = ctx.default_stream();
        debug!(ordinal, "Opened CUDA context");
        Ok(CudaPeer { ctx, stream })
    }
}

/// Opened CUDA device.
pub struct CudaPeer {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl CudaPeer {
    /// CUDA context of the peer device.
    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    /// Stream fence operations are enqueued on.
    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    #[allow(unsafe_code)]
    fn import_memory(&self, handle: ExternalHandle, size: u64) -> InteropResult<ExternalMemory> {
        bind(&self.ctx)?;
        let mut desc: cuda_sys::CUDA_EXTERNAL_MEMORY_HANDLE_DESC = unsafe { mem::zeroed() };
        desc.size = size;
        desc.flags = CUDA_EXTERNAL_MEMORY_DEDICATED;
        let mut raw: cuda_sys::CUexternalMemory = ptr::null_mut();

        match handle {
            #[cfg(unix)]
            ExternalHandle::OpaqueFd(fd) => {
                use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
                desc.type_ = MEMORY_FD;
                let raw_fd = fd.into_raw_fd();
                desc.handle.fd = raw_fd;
                let result =
                    unsafe { cuda_sys::cuImportExternalMemory(&raw mut raw, &raw const desc) };
                if result != cuda_sys::CUresult::CUDA_SUCCESS {
                    // The driver only takes the descriptor on success.
                    drop(unsafe { OwnedFd::from_raw_fd(raw_fd) });
                }
                check_import("cuImportExternalMemory", result)?;
            }
            #[cfg(windows)]
            ExternalHandle::OpaqueWin32(h) | ExternalHandle::NtHandle(h) => {
                use std::os::windows::io::AsRawHandle;
                desc.type_ = MEMORY_WIN32;
                let result = unsafe {
                    desc.handle.win32.handle = h.as_raw_handle();
                    cuda_sys::cuImportExternalMemory(&raw mut raw, &raw const desc)
                };
                // Win32 handles stay owned by the caller; `h` closes here.
                check_import("cuImportExternalMemory", result)?;
            }
            ExternalHandle::Host(_) => {
                return Err(InteropError::Import("CUDA cannot import host handles".into()));
            }
        }
        Ok(ExternalMemory { raw, ctx: Arc::clone(&self.ctx) })
    }

    #[allow(unsafe_code)]
    fn import_semaphore(
        &self,
        handle: ExternalHandle,
    ) -> InteropResult<cuda_sys::CUexternalSemaphore> {
        bind(&self.ctx)?;
        let mut desc: cuda_sys::CUDA_EXTERNAL_SEMAPHORE_HANDLE_DESC = unsafe { mem::zeroed() };
        let mut raw: cuda_sys::CUexternalSemaphore = ptr::null_mut();

        match handle {
            #[cfg(unix)]
            ExternalHandle::OpaqueFd(fd) => {
                use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
                desc.type_ = SEMAPHORE_FD;
                let raw_fd = fd.into_raw_fd();
                desc.handle.fd = raw_fd;
                let result =
                    unsafe { cuda_sys::cuImportExternalSemaphore(&raw mut raw, &raw const desc) };
                if result != cuda_sys::CUresult::CUDA_SUCCESS {
                    drop(unsafe { OwnedFd::from_raw_fd(raw_fd) });
                }
                check_import("cuImportExternalSemaphore", result)?;
            }
            #[cfg(windows)]
            ExternalHandle::OpaqueWin32(h) | ExternalHandle::NtHandle(h) => {
                use std::os::windows::io::AsRawHandle;
                desc.type_ = SEMAPHORE_WIN32;
                let result = unsafe {
                    desc.handle.win32.handle = h.as_raw_handle();
                    cuda_sys::cuImportExternalSemaphore(&raw mut raw, &raw const desc)
                };
                check_import("cuImportExternalSemaphore", result)?;
            }
            ExternalHandle::Host(_) => {
                return Err(InteropError::Import("CUDA cannot import host handles".into()));
            }
        }
        Ok(raw)
    }
}

impl ComputePeer for CudaPeer {
    type Buffer = CudaBuffer;
    type Image = CudaImage;
    type Semaphore = CudaTimeline;

    #[allow(unsafe_code)]
    fn import_buffer(&self, handle: ExternalHandle, size: u64) -> InteropResult<CudaBuffer> {
        let ext = self.import_memory(handle, size)?;
        let mut desc: cuda_sys::CUDA_EXTERNAL_MEMORY_BUFFER_DESC = unsafe { mem::zeroed() };
        desc.offset = 0;
        desc.size = size;
        let mut ptr: cuda_sys::CUdeviceptr = 0;
        check_import("cuExternalMemoryGetMappedBuffer", unsafe {
            cuda_sys::cuExternalMemoryGetMappedBuffer(&raw mut ptr, ext.raw, &raw const desc)
        })?;
        debug!(size, "Imported buffer into CUDA");
        Ok(CudaBuffer { ptr, size, ext })
    }

    #[allow(unsafe_code)]
    fn import_image(
        &self,
        handle: ExternalHandle,
        size: u64,
        image: &ImageDesc,
    ) -> InteropResult<CudaImage> {
        if image.tiling == Tiling::Linear {
            return Err(InteropError::Import(
                "linear-tiled images must be imported as buffers".into(),
            ));
        }
        image.validate()?;
        let ext = self.import_memory(handle, size)?;

        let (format, channels) = array_format(image.format);
        let mut desc: cuda_sys::CUDA_EXTERNAL_MEMORY_MIPMAPPED_ARRAY_DESC =
            unsafe { mem::zeroed() };
        desc.offset = 0;
        desc.arrayDesc.Width = image.width as usize;
        desc.arrayDesc.Height = image.height as usize;
        desc.arrayDesc.Depth = match (image.depth, image.array_layers) {
            (d, _) if d > 1 => d as usize,
            (_, l) if l > 1 => l as usize,
            _ => 0,
        };
        desc.arrayDesc.Format = format;
        desc.arrayDesc.NumChannels = channels;
        desc.arrayDesc.Flags = CUDA_ARRAY3D_SURFACE_LDST
            | if image.array_layers > 1 { CUDA_ARRAY3D_LAYERED } else { 0 };
        desc.numLevels = image.mip_levels;

        let mut array: cuda_sys::CUmipmappedArray = ptr::null_mut();
        check_import("cuExternalMemoryGetMappedMipmappedArray", unsafe {
            cuda_sys::cuExternalMemoryGetMappedMipmappedArray(
                &raw mut array,
                ext.raw,
                &raw const desc,
            )
        })?;
        debug!(width = image.width, height = image.height, "Imported image into CUDA");
        Ok(CudaImage { array, desc: *image, ext })
    }

    fn import_timeline(&self, handle: ExternalHandle) -> InteropResult<CudaTimeline> {
        let raw = self.import_semaphore(handle)?;
        Ok(CudaTimeline { raw, ctx: Arc::clone(&self.ctx), stream: Arc::clone(&self.stream) })
    }
}

struct ExternalMemory {
    raw: cuda_sys::CUexternalMemory,
    ctx: Arc<CudaContext>,
}

impl Drop for ExternalMemory {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        if bind(&self.ctx).is_ok() {
            unsafe { cuda_sys::cuDestroyExternalMemory(self.raw) };
        }
    }
}

/// Imported linear memory.
pub struct CudaBuffer {
    ptr: cuda_sys::CUdeviceptr,
    size: u64,
    // Destroyed after the mapping is freed.
    ext: ExternalMemory,
}

impl CudaBuffer {
    /// Device pointer for kernel arguments.
    pub fn device_ptr(&self) -> cuda_sys::CUdeviceptr {
        self.ptr
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for CudaBuffer {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        if bind(&self.ext.ctx).is_ok() {
            unsafe { cuda_sys::cuMemFree_v2(self.ptr) };
        }
    }
}

/// Imported image.
pub struct CudaImage {
    array: cuda_sys::CUmipmappedArray,
    desc: ImageDesc,
    ext: ExternalMemory,
}

impl CudaImage {
    /// Mipmapped array for surface/texture objects.
    pub fn mipmapped_array(&self) -> cuda_sys::CUmipmappedArray {
        self.array
    }

    /// Descriptor used for the import.
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }
}

impl Drop for CudaImage {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        if bind(&self.ext.ctx).is_ok() {
            unsafe { cuda_sys::cuMipmappedArrayDestroy(self.array) };
        }
    }
}

/// Imported timeline semaphore.
pub struct CudaTimeline {
    raw: cuda_sys::CUexternalSemaphore,
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl TimelineEndpoint for CudaTimeline {
    #[allow(unsafe_code)]
    fn signal(&self, value: u64) -> InteropResult<()> {
        bind(&self.ctx)?;
        let mut params: cuda_sys::CUDA_EXTERNAL_SEMAPHORE_SIGNAL_PARAMS = unsafe { mem::zeroed() };
        params.params.fence.value = value;
        check("cuSignalExternalSemaphoresAsync", unsafe {
            cuda_sys::cuSignalExternalSemaphoresAsync(
                &raw const self.raw,
                &raw const params,
                1,
                self.stream.cu_stream(),
            )
        })
    }

    #[allow(unsafe_code)]
    fn wait(&self, value: u64) -> InteropResult<WaitOutcome> {
        bind(&self.ctx)?;
        let mut params: cuda_sys::CUDA_EXTERNAL_SEMAPHORE_WAIT_PARAMS = unsafe { mem::zeroed() };
        params.params.fence.value = value;
        check("cuWaitExternalSemaphoresAsync", unsafe {
            cuda_sys::cuWaitExternalSemaphoresAsync(
                &raw const self.raw,
                &raw const params,
                1,
                self.stream.cu_stream(),
            )
        })?;
        Ok(WaitOutcome::Enqueued)
    }

    fn current_value(&self) -> Option<u64> {
        None
    }
}

impl Drop for CudaTimeline {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        if bind(&self.ctx).is_ok() {
            unsafe { cuda_sys::cuDestroyExternalSemaphore(self.raw) };
        }
    }
}

// The driver API is thread safe once a context is bound; every entry point
// above binds the owning context first.
#[allow(unsafe_code)]
unsafe impl Send for CudaBuffer {}
#[allow(unsafe_code)]
unsafe impl Sync for CudaBuffer {}
#[allow(unsafe_code)]
unsafe impl Send for CudaImage {}
#[allow(unsafe_code)]
unsafe impl Sync for CudaImage {}
#[allow(unsafe_code)]
unsafe impl Send for CudaTimeline {}
#[allow(unsafe_code)]
unsafe impl Sync for CudaTimeline {}
