//! Persisted selection status.

use crate::StatusArgs;
use anyhow::Result;
use gpulink_core::{DeviceChoice, DeviceRegistry, SelectionRecord, SettingsDocument};

/// State of the persisted selection against the current hardware.
#[derive(Debug, PartialEq, Eq)]
pub enum SelectionStatus {
    /// Nothing stored; the default device is used.
    Unset,
    /// Stored record cannot be parsed.
    Malformed(String),
    /// Hash differs: the set of devices changed since the choice was made.
    HardwareChanged,
    /// Hash matches but no device carries the stored identity.
    DeviceMissing,
    /// Stored choice applies to this device.
    Valid(usize),
}

/// Evaluate the selection stored in `doc`.
pub fn evaluate(registry: &DeviceRegistry, doc: &SettingsDocument) -> SelectionStatus {
    let record = match SelectionRecord::read(doc) {
        Ok(Some(record)) => record,
        Ok(None) => return SelectionStatus::Unset,
        Err(e) => return SelectionStatus::Malformed(e.to_string()),
    };
    match super::restore_selector(registry, doc).current() {
        DeviceChoice::Device(i) => SelectionStatus::Valid(i),
        DeviceChoice::Default if record.system_config_hash != registry.config_hash() => {
            SelectionStatus::HardwareChanged
        }
        DeviceChoice::Default => SelectionStatus::DeviceMissing,
    }
}

/// Runs the status command.
pub fn run(args: StatusArgs) -> Result<()> {
    let registry = super::load_registry(&args.device)?;
    let (path, doc) = super::load_settings(&args.settings)?;
    println!("Settings: {}", path.display());

    if let Ok(Some(record)) = SelectionRecord::read(&doc) {
        println!("Stored:   {} (hash {:#018x})", record.device_name, record.system_config_hash);
    }
    println!("Current:  hash {:#018x}", registry.config_hash());

    match evaluate(&registry, &doc) {
        SelectionStatus::Unset => println!("Status:   no selection, using the default device"),
        SelectionStatus::Malformed(e) => {
            println!("Status:   stored selection is malformed ({e}), using the default device");
        }
        SelectionStatus::HardwareChanged => {
            println!(
                "Status:   hardware changed since the selection was made, using the default device"
            );
        }
        SelectionStatus::DeviceMissing => {
            println!("Status:   stored device not found, using the default device");
        }
        SelectionStatus::Valid(i) => {
            let name = registry.get(i).map_or("?", |d| d.name.as_str());
            println!("Status:   valid, device [{}] {}", i + 1, name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::load_registry;
    use crate::commands::tests::{device_args, write_manifest};
    use gpulink_core::DeviceSelector;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = load_registry(&device_args(write_manifest(dir.path()))).unwrap();
        let mut doc = SettingsDocument::new();
        assert_eq!(evaluate(&registry, &doc), SelectionStatus::Unset);

        let mut selector = DeviceSelector::new(&registry);
        selector.choose_device(DeviceChoice::Device(0));
        selector.serialize(&mut doc);
        assert_eq!(evaluate(&registry, &doc), SelectionStatus::Valid(0));

        let mut record = SelectionRecord::read(&doc).unwrap().unwrap();
        record.selected_device_uuid = Some([9; 16]);
        doc.insert("deviceSelection", serde_json::to_value(&record).unwrap());
        assert_eq!(evaluate(&registry, &doc), SelectionStatus::DeviceMissing);

        record.system_config_hash ^= 1;
        doc.insert("deviceSelection", serde_json::to_value(&record).unwrap());
        assert_eq!(evaluate(&registry, &doc), SelectionStatus::HardwareChanged);

        doc.insert("deviceSelection", json!("garbage"));
        assert!(matches!(evaluate(&registry, &doc), SelectionStatus::Malformed(_)));
    }
}
