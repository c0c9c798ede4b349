//! Application settings document.
//!
//! A flat JSON object shared by the whole application. The device selector
//! only owns the `deviceSelection` key; every other key is carried through
//! load/save untouched.

use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{DeviceError, DeviceResult};

/// Env var overriding the settings file location.
pub const SETTINGS_ENV: &str = "GPULINK_SETTINGS";

/// Resolve the settings file path.
///
/// Order: `explicit`, then `GPULINK_SETTINGS`, then
/// `<config_dir>/gpulink/settings.json`, then `./gpulink-settings.json`
/// when no config directory exists.
pub fn settings_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Ok(p) = std::env::var(SETTINGS_ENV) {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    dirs::config_dir()
        .map(|p| p.join("gpulink").join("settings.json"))
        .unwrap_or_else(|| PathBuf::from("gpulink-settings.json"))
}

/// JSON object holding application settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsDocument {
    root: Map<String, Value>,
}

impl SettingsDocument {
    /// Empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `path`. A missing file yields an empty document.
    pub fn load<P: AsRef<Path>>(path: P) -> DeviceResult<Self> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file; starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_json(&text).map_err(|source| DeviceError::Settings {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse a document from JSON text. The top level must be an object.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let root: Map<String, Value> = serde_json::from_str(text)?;
        Ok(Self { root })
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> String {
        // Serializing a Map<String, Value> cannot fail.
        serde_json::to_string_pretty(&self.root).unwrap_or_default()
    }

    /// Write to `path`, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> DeviceResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json())?;
        debug!(path = %path.display(), keys = self.root.len(), "Saved settings");
        Ok(())
    }

    /// Value under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Set `key`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.root.insert(key.into(), value)
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.root.remove(key)
    }

    /// True when `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.root.contains_key(key)
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.root.len()
    }

    /// True when the document has no keys.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}
