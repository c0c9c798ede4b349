//! Error types for device enumeration and selection persistence.
//!
//! Enumeration failures at the driver level are fatal and surface as
//! [`DeviceError::Driver`]. An empty device list is *not* an error by itself;
//! callers that need a device ask [`DeviceRegistry::require_any`] and get
//! [`DeviceError::NoSuitableDevice`].
//!
//! [`DeviceRegistry::require_any`]: crate::DeviceRegistry::require_any

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`DeviceError`].
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors raised while enumerating devices or reading/writing settings.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A native API call failed during enumeration.
    #[error("driver failure in {call}: {message}")]
    Driver {
        /// The API entry point that failed.
        call: &'static str,
        /// Driver-provided detail.
        message: String,
    },

    /// Enumeration succeeded but returned zero suitable devices.
    #[error("no suitable GPU device found")]
    NoSuitableDevice,

    /// The requested enumeration backend is not compiled in or not supported
    /// on this platform.
    #[error("device backend not available: {0}")]
    BackendNotAvailable(String),

    /// Settings document could not be parsed or serialized.
    #[error("settings error in {path}: {source}")]
    Settings {
        /// Settings file.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Device manifest is malformed.
    #[error("invalid device manifest: {0}")]
    Manifest(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// Shorthand for a [`DeviceError::Driver`].
    pub fn driver(call: &'static str, message: impl ToString) -> Self {
        Self::Driver { call, message: message.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_display() {
        let err = DeviceError::driver("vkEnumeratePhysicalDevices", "ERROR_INITIALIZATION_FAILED");
        let msg = err.to_string();
        assert!(msg.contains("vkEnumeratePhysicalDevices"));
        assert!(msg.contains("ERROR_INITIALIZATION_FAILED"));
    }

    #[test]
    fn test_io_from() {
        let err: DeviceError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, DeviceError::Io(_)));
    }
}
