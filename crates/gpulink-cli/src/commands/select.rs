//! Persist a device choice.

use crate::SelectArgs;
use anyhow::{Context, Result, bail};
use gpulink_core::{DeviceChoice, DeviceRegistry, SettingsDocument};
use tracing::warn;

/// Parse a menu index (`0` / `default` or a 1-based device index).
pub fn parse_choice(text: &str, device_count: usize) -> Result<DeviceChoice> {
    if text.eq_ignore_ascii_case("default") {
        return Ok(DeviceChoice::Default);
    }
    let index: usize = text
        .parse()
        .with_context(|| format!("Invalid choice '{text}': expected a device index or 'default'"))?;
    if index > device_count {
        bail!("Device index {index} out of range (1..={device_count})");
    }
    Ok(DeviceChoice::from_menu_index(index))
}

/// Apply `choice` to `doc`. Returns whether the stored choice changed.
pub fn apply(
    registry: &DeviceRegistry,
    doc: &mut SettingsDocument,
    choice: DeviceChoice,
) -> Result<bool> {
    if let Some(i) = choice.index() {
        if registry.get(i).is_some_and(|d| d.identity.is_none()) {
            bail!("Device [{}] reports no identity and cannot be persisted", i + 1);
        }
    }
    let mut selector = super::restore_selector(registry, doc);
    let changed = selector.choose_device(choice);
    selector.serialize(doc);
    Ok(changed)
}

/// Runs the select command.
pub fn run(args: SelectArgs) -> Result<()> {
    let registry = super::load_registry(&args.device)?;
    let choice = parse_choice(&args.choice, registry.len())?;
    let (path, mut doc) = super::load_settings(&args.settings)?;

    if apply(&registry, &mut doc, choice)? {
        warn!("Restart the application for the new device to take effect");
    }
    doc.save(&path)
        .with_context(|| format!("Failed to write settings: {}", path.display()))?;

    match choice.index().and_then(|i| registry.get(i)) {
        Some(device) => println!("Selected [{}] {}", choice.menu_index(), device.name),
        None => println!("Selection cleared, using the default device"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::load_registry;
    use crate::commands::tests::{device_args, write_manifest};
    use gpulink_core::DEVICE_SELECTION_KEY;

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("default", 2).unwrap(), DeviceChoice::Default);
        assert_eq!(parse_choice("0", 2).unwrap(), DeviceChoice::Default);
        assert_eq!(parse_choice("2", 2).unwrap(), DeviceChoice::Device(1));
        assert!(parse_choice("3", 2).is_err());
        assert!(parse_choice("gpu", 2).is_err());
    }

    #[test]
    fn test_apply_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let registry = load_registry(&device_args(write_manifest(dir.path()))).unwrap();
        let mut doc = SettingsDocument::new();
        doc.insert("windowSize", serde_json::json!([1280, 720]));

        assert!(apply(&registry, &mut doc, DeviceChoice::Device(0)).unwrap());
        assert!(doc.contains_key(DEVICE_SELECTION_KEY));
        // Same choice again is not a change.
        assert!(!apply(&registry, &mut doc, DeviceChoice::Device(0)).unwrap());

        assert!(apply(&registry, &mut doc, DeviceChoice::Default).unwrap());
        assert!(!doc.contains_key(DEVICE_SELECTION_KEY));
        assert!(doc.contains_key("windowSize"));
    }
}
