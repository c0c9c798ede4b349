//! Interop errors.
//!
//! Every failure that a caller can recover from (usually by falling back to
//! a non-interop path) is an [`InteropError`]. Ownership and ordering bugs
//! such as releasing a native allocation with live imports, or a timeline
//! value going backwards, are panics instead.

use gpulink_core::DeviceError;
use thiserror::Error;

/// Result type alias using [`InteropError`].
pub type InteropResult<T> = std::result::Result<T, InteropError>;

/// Interop failures.
#[derive(Debug, Error)]
pub enum InteropError {
    /// A native API call failed.
    #[error("driver failure in {call}: {message}")]
    Driver {
        /// Failing entry point.
        call: &'static str,
        /// Driver detail.
        message: String,
    },

    /// No compute device reports the identity of the render device.
    #[error("no {compute} device matches render device {key}")]
    IdentityMismatch {
        /// Compute API name.
        compute: String,
        /// Identity looked for, or `none` when the render device has none.
        key: String,
    },

    /// The compute API does not run on the render device's vendor.
    #[error("{compute} does not support vendor {vendor_id:#06x}")]
    VendorUnsupported {
        /// Compute API name.
        compute: String,
        /// PCI vendor ID of the render device.
        vendor_id: u32,
    },

    /// The driver cannot export the required external handle type.
    #[error("external handle export unavailable: {0}")]
    HandleExportUnavailable(String),

    /// The compute side rejected an import.
    #[error("import failed: {0}")]
    Import(String),

    /// The foreign handle was already imported once.
    #[error("foreign handle already consumed by an earlier import")]
    HandleConsumed,

    /// A buffer size or image descriptor is unusable.
    #[error("invalid resource description: {0}")]
    InvalidDescriptor(String),

    /// Device enumeration or selection failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl InteropError {
    /// Shorthand for [`InteropError::Driver`].
    pub fn driver(call: &'static str, message: impl ToString) -> Self {
        Self::Driver { call, message: message.to_string() }
    }
}
