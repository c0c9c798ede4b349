//! CLI command implementations

pub mod devices;
pub mod hash;
pub mod peer;
pub mod select;
pub mod status;

use anyhow::{Context, Result};
use gpulink_core::settings::settings_path;
use gpulink_core::{DeviceRegistry, DeviceSelector, SettingsDocument, StaticEnumerator, backend};
use std::path::PathBuf;
use tracing::debug;

use crate::{DeviceArgs, SettingsArgs};

/// Enumerate devices from the manifest or the native backend.
pub fn load_registry(args: &DeviceArgs) -> Result<DeviceRegistry> {
    let registry = match &args.manifest {
        Some(path) => {
            let enumerator = StaticEnumerator::from_manifest_file(path)
                .with_context(|| format!("Failed to load manifest: {}", path.display()))?;
            DeviceRegistry::new(&enumerator)
        }
        None => {
            let enumerator = backend::system_enumerator(args.api)
                .with_context(|| format!("{} enumeration unavailable", args.api.name()))?;
            DeviceRegistry::new(enumerator.as_ref())
        }
    }
    .context("Device enumeration failed")?;
    debug!(api = registry.api().name(), count = registry.len(), "Enumerated devices");
    Ok(registry)
}

/// Load the settings document; a missing file is an empty document.
pub fn load_settings(args: &SettingsArgs) -> Result<(PathBuf, SettingsDocument)> {
    let path = settings_path(args.settings.as_deref());
    let doc = SettingsDocument::load(&path)
        .with_context(|| format!("Failed to read settings: {}", path.display()))?;
    Ok((path, doc))
}

/// Selector restored from the settings document.
pub fn restore_selector(registry: &DeviceRegistry, doc: &SettingsDocument) -> DeviceSelector {
    let mut selector = DeviceSelector::new(registry);
    selector.deserialize(doc);
    selector
}

/// Device the application would run on: the restored choice, else the
/// enumerator's default.
pub fn effective_device(registry: &DeviceRegistry, selector: &DeviceSelector) -> Option<usize> {
    selector.current().index().or_else(|| registry.default_device())
}

/// Backend listing of every crate.
pub fn describe_all() -> String {
    format!(
        "Rendering APIs:\n{}\nCompute APIs:\n{}",
        backend::describe_backends(),
        gpulink_interop::describe_backends()
    )
}
