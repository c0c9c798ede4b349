//! # gpulink-interop
//!
//! Share buffers, images and timeline fences between a host rendering API
//! (Vulkan, Direct3D 12) and a compute API (CUDA, HIP, SYCL) running on the
//! same physical GPU.
//!
//! # Architecture
//!
//! ```text
//! InteropBridge<R, C>
//!     ├── R: RenderExporter      exports memory + timeline semaphores
//!     │       ├── host::HostExporter
//!     │       └── vulkan::VulkanExporter   (`vulkan` feature)
//!     └── C: ComputeApi          matches by identity, imports
//!             ├── host::HostCompute
//!             └── cuda::CudaCompute        (`cuda` feature)
//! ```
//!
//! The peer is the first compute device whose UUID (Vulkan) or LUID
//! (D3D12) equals the render device's identity. The render side owns every
//! allocation; imports hold a lease and must be dropped first.
//!
//! # Example
//!
//! ```ignore
//! use gpulink_interop::{InteropBridge, Side, host::*};
//!
//! let bridge = InteropBridge::open(exporter, &compute)?;
//! let mut fence = bridge.create_fence(0)?;
//! bridge.import_fence(&mut fence)?;
//!
//! fence.signal(Side::Render, 1)?;
//! fence.wait(Side::Compute, 1)?;
//! ```

#![warn(missing_docs)]

pub mod api;
pub mod bridge;
pub mod error;
pub mod fence;
pub mod handle;
pub mod host;
pub mod resource;

#[cfg(feature = "vulkan")]
pub mod vulkan;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use api::{ComputeApi, ComputeDevice, ComputePeer, RenderExporter, find_peer};
pub use bridge::{BridgeFence, InteropBridge, InteropBuffer, InteropImage};
pub use error::{InteropError, InteropResult};
pub use fence::{InteropFence, Side, TimelineCursor, TimelineEndpoint, WaitOutcome};
pub use handle::ExternalHandle;
pub use resource::{Export, Exported, ImageDesc, ImageFormat, Imported, MemoryRequest, Tiling};

/// One line per compute backend, `[+]` compiled in / `[-]` missing.
pub fn describe_backends() -> String {
    let mut desc = String::new();
    desc.push_str("[+] host\n");
    if cfg!(feature = "cuda") {
        desc.push_str("[+] cuda\n");
    } else {
        desc.push_str("[-] cuda (feature not enabled)\n");
    }
    if cfg!(feature = "vulkan") {
        desc.push_str("[+] vulkan export\n");
    } else {
        desc.push_str("[-] vulkan export (feature not enabled)\n");
    }
    desc.push_str("[-] hip (no backend)\n");
    desc.push_str("[-] sycl (no backend)\n");
    desc
}
