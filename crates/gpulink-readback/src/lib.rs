//! # gpulink-readback
//!
//! Screenshots of swapchain images without stalling the render loop.
//!
//! [`ReadbackPool`] keeps one CPU-visible staging image per swapchain image.
//! A request records a GPU copy into the slot's staging image; the PNG is
//! written the next time the same slot is acquired, when the swapchain
//! guarantees the copy has finished.
//!
//! ## Backends
//!
//! - [`host::HostStaging`] - in-process reference, always available
//! - `wgpu_backend::WgpuStaging` - `wgpu` feature
//! - `vulkan::VulkanStaging` - `vulkan` feature
//!
//! ## Example
//!
//! ```ignore
//! use gpulink_readback::{ReadbackConfig, ReadbackPool, SwapchainInfo, Extent};
//!
//! let mut pool = ReadbackPool::new(backend, ReadbackConfig::from_env());
//! pool.on_swapchain_recreated(SwapchainInfo { image_count: 3, extent: Extent::new(1920, 1080) })?;
//!
//! // every frame
//! pool.on_image_acquired(index);
//! if screenshot_key_pressed {
//!     pool.request(&swapchain_image, "shot.png")?;
//! }
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod host;
pub mod output;
pub mod pack;
pub mod pool;
pub mod staging;

#[cfg(feature = "wgpu")]
pub mod wgpu_backend;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use error::{ReadbackError, ReadbackResult};
pub use output::write_png;
pub use pack::unpack_rows;
pub use pool::{ReadbackConfig, ReadbackFrame, ReadbackPool, SwapchainInfo, TRANSPARENT_ENV};
pub use staging::{ChannelOrder, Extent, MappedImage, StagingBackend};

/// One line per staging backend, `[+]` compiled in / `[-]` missing.
pub fn describe_backends() -> String {
    let mut desc = String::from("[+] host\n");
    let backends = [("wgpu", cfg!(feature = "wgpu")), ("vulkan", cfg!(feature = "vulkan"))];
    for (name, enabled) in backends {
        if enabled {
            desc.push_str(&format!("[+] {name}\n"));
        } else {
            desc.push_str(&format!("[-] {name} (feature not enabled)\n"));
        }
    }
    desc
}
