//! Persisted device selection.
//!
//! The user's device choice is a two-phase decision: it is made in a running
//! process but only takes effect at the next start, because a live graphics
//! context is never migrated between GPUs. [`DeviceSelector`] therefore
//! keeps three pieces of state:
//!
//! - the current [`DeviceChoice`] (what will be persisted),
//! - a *restart requested* flag raised whenever the choice changes,
//! - the restart dialog model (`dialog open`, `restart now`).
//!
//! The persisted [`SelectionRecord`] is only trusted when the stored
//! configuration hash equals the current one; otherwise the hardware moved
//! and the default device is used. A stale record is left in the document so
//! the choice comes back when the hardware does.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::identity::{DeviceIdentity, Luid, RenderApi, Uuid};
use crate::registry::{DeviceRegistry, IdentityLookup, PhysicalDevice, lookup_identity};
use crate::settings::SettingsDocument;

/// Top-level settings key of the persisted record.
pub const DEVICE_SELECTION_KEY: &str = "deviceSelection";

/// Persisted form of a device choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRecord {
    /// [`config_hash`](crate::config_hash) at the time the choice was made.
    pub system_config_hash: u64,
    /// Vulkan driver UUID.
    #[serde(rename = "selectedDriverUUID", default, skip_serializing_if = "Option::is_none")]
    pub selected_driver_uuid: Option<Uuid>,
    /// Vulkan device UUID.
    #[serde(rename = "selectedDeviceUUID", default, skip_serializing_if = "Option::is_none")]
    pub selected_device_uuid: Option<Uuid>,
    /// D3D12 adapter LUID.
    #[serde(rename = "selectedAdapterLUID", default, skip_serializing_if = "Option::is_none")]
    pub selected_adapter_luid: Option<Luid>,
    /// Display name, diagnostics only.
    #[serde(default)]
    pub device_name: String,
}

impl SelectionRecord {
    /// Record for a device with the given name and identity.
    pub fn new(system_config_hash: u64, device_name: &str, identity: DeviceIdentity) -> Self {
        let mut record = Self {
            system_config_hash,
            selected_driver_uuid: None,
            selected_device_uuid: None,
            selected_adapter_luid: None,
            device_name: device_name.to_string(),
        };
        match identity {
            DeviceIdentity::Vulkan { driver_uuid, device_uuid } => {
                record.selected_driver_uuid = Some(driver_uuid);
                record.selected_device_uuid = Some(device_uuid);
            }
            DeviceIdentity::D3d12 { adapter_luid } => {
                record.selected_adapter_luid = Some(adapter_luid);
            }
        }
        record
    }

    /// Record for `device`, or `None` when it has no identity.
    pub fn for_device(system_config_hash: u64, device: &PhysicalDevice) -> Option<Self> {
        Some(Self::new(system_config_hash, &device.name, device.identity?))
    }

    /// Identity stored in the record for `api`.
    ///
    /// Vulkan needs both UUIDs; a record carrying only one of them is
    /// unusable since partial matches are never accepted.
    pub fn identity(&self, api: RenderApi) -> Option<DeviceIdentity> {
        match api {
            RenderApi::Vulkan => match (self.selected_driver_uuid, self.selected_device_uuid) {
                (Some(driver_uuid), Some(device_uuid)) => {
                    Some(DeviceIdentity::Vulkan { driver_uuid, device_uuid })
                }
                _ => None,
            },
            RenderApi::D3d12 => self
                .selected_adapter_luid
                .map(|adapter_luid| DeviceIdentity::D3d12 { adapter_luid }),
        }
    }

    /// Read the record from `doc`.
    ///
    /// `Ok(None)` when absent, `Err` when present but malformed.
    pub fn read(doc: &SettingsDocument) -> Result<Option<Self>, serde_json::Error> {
        doc.get(DEVICE_SELECTION_KEY)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }
}

/// Device choice of the selector.
///
/// `Default` lets the windowing layer pick; it is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceChoice {
    /// No override.
    #[default]
    Default,
    /// Index into the registry's device list.
    Device(usize),
}

impl DeviceChoice {
    /// Position in the menu: 0 is Default, devices start at 1.
    pub fn menu_index(&self) -> usize {
        match self {
            Self::Default => 0,
            Self::Device(i) => i + 1,
        }
    }

    /// Inverse of [`menu_index`](Self::menu_index).
    pub fn from_menu_index(index: usize) -> Self {
        match index {
            0 => Self::Default,
            i => Self::Device(i - 1),
        }
    }

    /// Device index, `None` for Default.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Default => None,
            Self::Device(i) => Some(*i),
        }
    }
}

impl fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Device(i) => write!(f, "device {i}"),
        }
    }
}

/// One line of the device menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    /// Choice this entry selects.
    pub choice: DeviceChoice,
    /// Label shown to the user.
    pub label: String,
    /// True for the current choice.
    pub selected: bool,
}

/// Selection state for one process run.
#[derive(Debug, Clone)]
pub struct DeviceSelector {
    api: RenderApi,
    names: Vec<String>,
    identities: Vec<Option<DeviceIdentity>>,
    config_hash: u64,
    current: DeviceChoice,
    restart_requested: bool,
    dialog_open: bool,
    restart_now: bool,
    collisions: Vec<Vec<usize>>,
}

impl DeviceSelector {
    /// Selector over a registry snapshot. Starts at [`DeviceChoice::Default`].
    pub fn new(registry: &DeviceRegistry) -> Self {
        Self {
            api: registry.api(),
            names: registry.devices().iter().map(|d| d.name.clone()).collect(),
            identities: registry.devices().iter().map(|d| d.identity).collect(),
            config_hash: registry.config_hash(),
            current: DeviceChoice::Default,
            restart_requested: false,
            dialog_open: false,
            restart_now: false,
            collisions: Vec::new(),
        }
    }

    /// Current choice.
    pub fn current(&self) -> DeviceChoice {
        self.current
    }

    /// Configuration hash of the snapshot.
    pub fn config_hash(&self) -> u64 {
        self.config_hash
    }

    /// Number of devices in the snapshot.
    pub fn device_count(&self) -> usize {
        self.names.len()
    }

    /// Display name of device `index`.
    pub fn device_name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Identity collisions seen by [`deserialize`](Self::deserialize).
    /// Each entry lists the indices sharing one identity.
    pub fn collisions(&self) -> &[Vec<usize>] {
        &self.collisions
    }

    /// Write the current choice into `doc`.
    ///
    /// `Default` removes the key. A device without identity cannot be
    /// persisted and is treated the same way.
    pub fn serialize(&self, doc: &mut SettingsDocument) {
        let record = match self.current {
            DeviceChoice::Default => None,
            DeviceChoice::Device(i) => {
                let record = self.record_for(i);
                if record.is_none() {
                    warn!(index = i, "Selected device has no identity; persisting default");
                }
                record
            }
        };

        match record.map(|r| serde_json::to_value(&r)) {
            Some(Ok(value)) => {
                doc.insert(DEVICE_SELECTION_KEY, value);
            }
            Some(Err(e)) => {
                warn!(error = %e, "Failed to encode device selection; persisting default");
                doc.remove(DEVICE_SELECTION_KEY);
            }
            None => {
                doc.remove(DEVICE_SELECTION_KEY);
            }
        }
    }

    fn record_for(&self, index: usize) -> Option<SelectionRecord> {
        let identity = (*self.identities.get(index)?)?;
        Some(SelectionRecord::new(self.config_hash, &self.names[index], identity))
    }

    /// Restore the choice stored in `doc` and make it current.
    ///
    /// Falls back to `Default` when the record is absent, malformed, was
    /// written for different hardware or names a device that is not
    /// present. `doc` is never modified.
    pub fn deserialize(&mut self, doc: &SettingsDocument) -> DeviceChoice {
        self.current = self.resolve(doc);
        self.current
    }

    fn resolve(&mut self, doc: &SettingsDocument) -> DeviceChoice {
        let record = match SelectionRecord::read(doc) {
            Ok(Some(record)) => record,
            Ok(None) => return DeviceChoice::Default,
            Err(e) => {
                warn!(error = %e, "Malformed device selection; using default device");
                return DeviceChoice::Default;
            }
        };

        if record.system_config_hash != self.config_hash {
            info!(
                stored = record.system_config_hash,
                current = self.config_hash,
                device = %record.device_name,
                "GPU configuration changed; ignoring stored device selection"
            );
            return DeviceChoice::Default;
        }

        let Some(identity) = record.identity(self.api) else {
            warn!(api = self.api.name(), "Stored device selection has no identity for this API");
            return DeviceChoice::Default;
        };

        match lookup_identity(self.identities.iter().map(Option::as_ref), &identity) {
            IdentityLookup::NotFound => {
                info!(
                    device = %record.device_name,
                    "Stored device not present; using default device"
                );
                DeviceChoice::Default
            }
            IdentityLookup::Unique(i) => {
                debug!(index = i, device = %self.names[i], "Restored device selection");
                DeviceChoice::Device(i)
            }
            IdentityLookup::Collision { chosen, all } => {
                if !self.collisions.contains(&all) {
                    self.collisions.push(all);
                }
                DeviceChoice::Device(chosen)
            }
        }
    }

    /// Change the choice. Returns `true` and raises the restart request
    /// when it differs from the current one. Out-of-range indices are
    /// ignored.
    pub fn choose_device(&mut self, choice: DeviceChoice) -> bool {
        if let DeviceChoice::Device(i) = choice {
            if i >= self.names.len() {
                warn!(index = i, count = self.names.len(), "Ignoring out-of-range device choice");
                return false;
            }
        }
        if choice == self.current {
            return false;
        }
        info!(from = %self.current, to = %choice, "Device selection changed; restart required");
        self.current = choice;
        self.restart_requested = true;
        true
    }

    /// Menu model, `None` when fewer than two devices exist.
    pub fn menu_entries(&self) -> Option<Vec<MenuEntry>> {
        if self.names.len() < 2 {
            return None;
        }
        let default = MenuEntry {
            choice: DeviceChoice::Default,
            label: "Default".to_string(),
            selected: self.current == DeviceChoice::Default,
        };
        let devices = self.names.iter().enumerate().map(|(i, name)| MenuEntry {
            choice: DeviceChoice::Device(i),
            label: name.clone(),
            selected: self.current == DeviceChoice::Device(i),
        });
        Some(std::iter::once(default).chain(devices).collect())
    }

    /// True while a restart request has not been shown to the user yet.
    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    /// Open the restart dialog if a request is pending. Returns whether the
    /// dialog is open. Each request opens the dialog once.
    pub fn poll_restart_dialog(&mut self) -> bool {
        if self.restart_requested {
            self.restart_requested = false;
            self.dialog_open = true;
        }
        self.dialog_open
    }

    /// True while the dialog is shown.
    pub fn is_restart_dialog_open(&self) -> bool {
        self.dialog_open
    }

    /// *Close Now*: close the dialog and ask the application to exit.
    pub fn restart_close_now(&mut self) {
        self.dialog_open = false;
        self.restart_now = true;
    }

    /// *Later*: close the dialog; the choice applies at the next start.
    pub fn restart_later(&mut self) {
        self.dialog_open = false;
    }

    /// Polled by the application loop.
    pub fn shall_restart(&self) -> bool {
        self.restart_now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceKind;
    use serde_json::json;

    fn dev(name: &str, id: u8) -> PhysicalDevice {
        PhysicalDevice {
            raw: id as u64,
            name: name.into(),
            vendor_id: 0x10DE,
            kind: DeviceKind::Discrete,
            identity: Some(DeviceIdentity::Vulkan {
                driver_uuid: [0xD0; 16],
                device_uuid: [id; 16],
            }),
        }
    }

    fn selector(devices: Vec<PhysicalDevice>) -> DeviceSelector {
        DeviceSelector::new(&DeviceRegistry::from_devices(RenderApi::Vulkan, devices, Some(0)))
    }

    #[test]
    fn test_round_trip() {
        let mut sel = selector(vec![dev("A", 1), dev("B", 2)]);
        sel.choose_device(DeviceChoice::Device(1));
        let mut doc = SettingsDocument::new();
        sel.serialize(&mut doc);

        let mut fresh = selector(vec![dev("A", 1), dev("B", 2)]);
        assert_eq!(fresh.deserialize(&doc), DeviceChoice::Device(1));
        assert_eq!(fresh.current(), DeviceChoice::Device(1));
        assert!(!fresh.restart_requested());
    }

    #[test]
    fn test_default_removes_key() {
        let sel = selector(vec![dev("A", 1), dev("B", 2)]);
        let mut doc = SettingsDocument::new();
        doc.insert(DEVICE_SELECTION_KEY, json!({"stale": true}));
        doc.insert("other", json!(7));
        sel.serialize(&mut doc);
        assert!(!doc.contains_key(DEVICE_SELECTION_KEY));
        assert_eq!(doc.get("other"), Some(&json!(7)));
    }

    #[test]
    fn test_record_layout() {
        let mut sel = selector(vec![dev("A", 1), dev("B", 2)]);
        sel.choose_device(DeviceChoice::Device(0));
        let mut doc = SettingsDocument::new();
        sel.serialize(&mut doc);

        let v = doc.get(DEVICE_SELECTION_KEY).unwrap();
        assert_eq!(v["systemConfigHash"], json!(sel.config_hash()));
        assert_eq!(v["selectedDeviceUUID"], json!(vec![1u8; 16]));
        assert_eq!(v["selectedDriverUUID"], json!(vec![0xD0u8; 16]));
        assert_eq!(v["deviceName"], json!("A"));
        assert!(v.get("selectedAdapterLUID").is_none());
    }

    #[test]
    fn test_hash_mismatch_is_default() {
        let mut sel = selector(vec![dev("A", 1), dev("B", 2)]);
        sel.choose_device(DeviceChoice::Device(1));
        let mut doc = SettingsDocument::new();
        sel.serialize(&mut doc);

        let mut changed = selector(vec![dev("A", 1), dev("C", 2)]);
        assert_eq!(changed.deserialize(&doc), DeviceChoice::Default);
        // Stale record stays for when the hardware comes back.
        assert!(doc.contains_key(DEVICE_SELECTION_KEY));
    }

    #[test]
    fn test_reordered_devices_restore_by_identity() {
        let mut sel = selector(vec![dev("A", 1), dev("B", 2)]);
        sel.choose_device(DeviceChoice::Device(1));
        let mut doc = SettingsDocument::new();
        sel.serialize(&mut doc);

        let mut swapped = selector(vec![dev("B", 2), dev("A", 1)]);
        assert_eq!(swapped.config_hash(), sel.config_hash());
        assert_eq!(swapped.deserialize(&doc), DeviceChoice::Device(0));
    }

    #[test]
    fn test_driver_uuid_must_match() {
        let mut sel = selector(vec![dev("A", 1), dev("B", 2)]);
        sel.choose_device(DeviceChoice::Device(1));
        let mut doc = SettingsDocument::new();
        sel.serialize(&mut doc);

        let mut b = dev("B", 2);
        b.identity = Some(DeviceIdentity::Vulkan { driver_uuid: [0xD1; 16], device_uuid: [2; 16] });
        let mut updated_driver = selector(vec![dev("A", 1), b]);
        assert_eq!(updated_driver.deserialize(&doc), DeviceChoice::Default);
    }

    #[test]
    fn test_collision_picks_lowest_and_records() {
        let mut sel = selector(vec![dev("X", 9), dev("A", 1), dev("A", 1)]);
        sel.choose_device(DeviceChoice::Device(2));
        let mut doc = SettingsDocument::new();
        sel.serialize(&mut doc);

        let mut again = selector(vec![dev("X", 9), dev("A", 1), dev("A", 1)]);
        assert_eq!(again.deserialize(&doc), DeviceChoice::Device(1));
        assert_eq!(again.collisions(), &[vec![1, 2]]);

        // Restoring agrees with the registry's own lookup.
        let registry = DeviceRegistry::from_devices(
            RenderApi::Vulkan,
            vec![dev("X", 9), dev("A", 1), dev("A", 1)],
            None,
        );
        let record = SelectionRecord::read(&doc).unwrap().unwrap();
        let identity = record.identity(RenderApi::Vulkan).unwrap();
        assert_eq!(registry.find_by_identity(&identity).index(), again.current().index());
    }

    #[test]
    fn test_malformed_is_default_and_untouched() {
        let mut sel = selector(vec![dev("A", 1), dev("B", 2)]);
        let mut doc = SettingsDocument::new();
        doc.insert(DEVICE_SELECTION_KEY, json!({"systemConfigHash": "nope"}));
        let before = doc.clone();
        assert_eq!(sel.deserialize(&doc), DeviceChoice::Default);
        assert_eq!(doc, before);
    }

    #[test]
    fn test_half_identity_record_rejected() {
        let mut sel = selector(vec![dev("A", 1), dev("B", 2)]);
        let mut doc = SettingsDocument::new();
        let device_uuid = [1u8; 16];
        doc.insert(
            DEVICE_SELECTION_KEY,
            json!({
                "systemConfigHash": sel.config_hash(),
                "selectedDeviceUUID": device_uuid,
                "deviceName": "A"
            }),
        );
        assert_eq!(sel.deserialize(&doc), DeviceChoice::Default);
    }

    #[test]
    fn test_d3d12_luid_round_trip() {
        let luid_dev = |name: &str, b: u8| PhysicalDevice {
            raw: b as u64,
            name: name.into(),
            vendor_id: 0x1002,
            kind: DeviceKind::Discrete,
            identity: Some(DeviceIdentity::D3d12 { adapter_luid: [b; 8] }),
        };
        let devices = vec![luid_dev("A", 1), luid_dev("B", 2)];
        let reg = DeviceRegistry::from_devices(RenderApi::D3d12, devices, None);
        let mut sel = DeviceSelector::new(&reg);
        sel.choose_device(DeviceChoice::Device(1));
        let mut doc = SettingsDocument::new();
        sel.serialize(&mut doc);

        let v = doc.get(DEVICE_SELECTION_KEY).unwrap();
        assert_eq!(v["selectedAdapterLUID"], json!(vec![2u8; 8]));
        assert!(v.get("selectedDeviceUUID").is_none());

        let mut fresh = DeviceSelector::new(&reg);
        assert_eq!(fresh.deserialize(&doc), DeviceChoice::Device(1));
    }

    #[test]
    fn test_menu_hidden_for_single_device() {
        assert!(selector(vec![dev("A", 1)]).menu_entries().is_none());
        assert!(selector(vec![]).menu_entries().is_none());
    }

    #[test]
    fn test_menu_entries() {
        let mut sel = selector(vec![dev("A", 1), dev("B", 2)]);
        sel.choose_device(DeviceChoice::Device(1));
        let entries = sel.menu_entries().unwrap();
        let labels: Vec<_> = entries.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, ["Default", "A", "B"]);
        assert!(entries[2].selected);
        assert!(!entries[0].selected);
        assert_eq!(entries[2].choice.menu_index(), 2);
    }

    #[test]
    fn test_restart_flow() {
        let mut sel = selector(vec![dev("A", 1), dev("B", 2)]);
        assert!(!sel.choose_device(DeviceChoice::Default));
        assert!(!sel.poll_restart_dialog());

        assert!(sel.choose_device(DeviceChoice::Device(0)));
        assert!(sel.restart_requested());
        assert!(sel.poll_restart_dialog());
        assert!(!sel.restart_requested());

        sel.restart_later();
        assert!(!sel.poll_restart_dialog());
        assert!(!sel.shall_restart());

        sel.choose_device(DeviceChoice::Device(1));
        assert!(sel.poll_restart_dialog());
        sel.restart_close_now();
        assert!(!sel.is_restart_dialog_open());
        assert!(sel.shall_restart());
    }

    #[test]
    fn test_out_of_range_choice_ignored() {
        let mut sel = selector(vec![dev("A", 1), dev("B", 2)]);
        assert!(!sel.choose_device(DeviceChoice::Device(5)));
        assert_eq!(sel.current(), DeviceChoice::Default);
    }

    #[test]
    fn test_menu_index_mapping() {
        assert_eq!(DeviceChoice::from_menu_index(0), DeviceChoice::Default);
        assert_eq!(DeviceChoice::from_menu_index(3), DeviceChoice::Device(2));
        assert_eq!(DeviceChoice::Device(2).menu_index(), 3);
    }
}
