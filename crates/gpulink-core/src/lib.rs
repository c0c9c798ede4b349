//! # gpulink-core
//!
//! Device identity, system configuration hashing and persisted device
//! selection for applications that drive more than one GPU API.
//!
//! The crate answers two questions at startup:
//!
//! - *Which GPUs are there?* [`DeviceRegistry`] enumerates the suitable
//!   physical devices of one rendering API through a [`DeviceEnumerator`]
//!   and computes an enumeration-order independent [`config_hash`].
//! - *Which one did the user pick last time?* [`DeviceSelector`] restores a
//!   [`SelectionRecord`] from the application's [`SettingsDocument`] and
//!   drops it when the hardware changed.
//!
//! ## Crate Structure
//!
//! ```text
//! gpulink-core (this crate)
//!    ^
//!    |
//!    +-- gpulink-interop   (peer matching by DeviceIdentity)
//!    +-- gpulink-view      (egui device menu + restart dialog)
//!    +-- gpulink-cli       (device listing / selection tool)
//! ```
//!
//! ## Backends
//!
//! - [`StaticEnumerator`] - fixed device list or JSON device manifest
//! - `VulkanEnumerator` - `vulkan` feature, identities from `VkPhysicalDeviceIDProperties`
//! - `DxgiEnumerator` - Windows only, identities from `DXGI_ADAPTER_DESC1.AdapterLuid`
//!
//! ## Example
//!
//! ```ignore
//! use gpulink_core::{DeviceRegistry, DeviceSelector, SettingsDocument, backend};
//!
//! let enumerator = backend::system_enumerator(RenderApi::Vulkan)?;
//! let registry = DeviceRegistry::new(enumerator.as_ref())?;
//! let mut selector = DeviceSelector::new(&registry);
//!
//! let doc = SettingsDocument::load(settings::settings_path(None))?;
//! let choice = selector.deserialize(&doc);
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod hash;
pub mod identity;
pub mod registry;
pub mod selection;
pub mod settings;

pub use backend::StaticEnumerator;
pub use error::{DeviceError, DeviceResult};
pub use hash::config_hash;
pub use identity::{DeviceIdentity, PeerKey, RenderApi, Uuid, Luid, vendor};
pub use registry::{
    DeviceEnumerator, DeviceKind, DeviceRegistry, IdentityLookup, PhysicalDevice, identity_of,
    lookup_identity,
};
pub use selection::{DeviceChoice, DeviceSelector, MenuEntry, SelectionRecord, DEVICE_SELECTION_KEY};
pub use settings::SettingsDocument;
