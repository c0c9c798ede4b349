//! Readback errors.
//!
//! A failed screenshot never takes the renderer down: the pool logs the
//! error, consumes the request and keeps going. Requesting a second
//! screenshot on a slot that is still in flight is a caller bug and panics.

use std::io;
use thiserror::Error;

/// Result type alias using [`ReadbackError`].
pub type ReadbackResult<T> = std::result::Result<T, ReadbackError>;

/// Readback failures.
#[derive(Debug, Error)]
pub enum ReadbackError {
    /// A native API call failed.
    #[error("driver failure in {call}: {message}")]
    Driver {
        /// Failing entry point.
        call: &'static str,
        /// Driver detail.
        message: String,
    },

    /// The staging image could not be mapped or its layout is unusable.
    #[error("failed to map staging image: {0}")]
    Map(String),

    /// PNG encoding failed.
    #[error("PNG encoding failed: {0}")]
    Encode(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Zero-sized extent, or source and staging extents differ.
    #[error("invalid extent {width}x{height}")]
    InvalidExtent {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
    },

    /// No readback frame exists for the swapchain slot.
    #[error("no readback frame for swapchain slot {slot} (pool holds {len})")]
    NoFrame {
        /// Requested slot.
        slot: usize,
        /// Pool length.
        len: usize,
    },
}

impl ReadbackError {
    /// Shorthand for [`ReadbackError::Driver`].
    pub fn driver(call: &'static str, message: impl ToString) -> Self {
        Self::Driver { call, message: message.to_string() }
    }
}
