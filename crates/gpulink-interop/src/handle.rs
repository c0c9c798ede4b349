//! OS-level handles passed between the render and compute APIs.

use std::fmt;

use crate::host::HostHandle;

#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd};
#[cfg(windows)]
use std::os::windows::io::{AsRawHandle, OwnedHandle};

/// An exported handle waiting to be imported.
///
/// Not `Clone`: importing moves the handle into the compute API, which owns
/// it afterwards. Dropping an unimported handle closes it.
pub enum ExternalHandle {
    /// `VK_EXTERNAL_MEMORY_HANDLE_TYPE_OPAQUE_FD` or the semaphore equivalent.
    #[cfg(unix)]
    OpaqueFd(OwnedFd),
    /// `VK_EXTERNAL_MEMORY_HANDLE_TYPE_OPAQUE_WIN32`.
    #[cfg(windows)]
    OpaqueWin32(OwnedHandle),
    /// NT handle from a D3D12 shared-handle export.
    #[cfg(windows)]
    NtHandle(OwnedHandle),
    /// Object in an in-process [`HostHub`](crate::host::HostHub).
    Host(HostHandle),
}

impl ExternalHandle {
    /// Short name of the handle type.
    pub fn kind(&self) -> &'static str {
        match self {
            #[cfg(unix)]
            Self::OpaqueFd(_) => "opaque-fd",
            #[cfg(windows)]
            Self::OpaqueWin32(_) => "opaque-win32",
            #[cfg(windows)]
            Self::NtHandle(_) => "nt-handle",
            Self::Host(_) => "host",
        }
    }
}

impl fmt::Debug for ExternalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Self::OpaqueFd(fd) => write!(f, "OpaqueFd({})", fd.as_raw_fd()),
            #[cfg(windows)]
            Self::OpaqueWin32(h) => write!(f, "OpaqueWin32({:?})", h.as_raw_handle()),
            #[cfg(windows)]
            Self::NtHandle(h) => write!(f, "NtHandle({:?})", h.as_raw_handle()),
            Self::Host(h) => write!(f, "Host({})", h.id()),
        }
    }
}
