//! DXGI adapter enumeration for Direct3D 12.

use tracing::debug;
use windows::Win32::Graphics::Direct3D::{D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_11_0};
use windows::Win32::Graphics::Direct3D12::{D3D12CreateDevice, ID3D12Device};
use windows::Win32::Graphics::Dxgi::*;

use crate::identity::{DeviceIdentity, RenderApi};
use crate::registry::{DeviceEnumerator, DeviceKind, PhysicalDevice};
use crate::{DeviceError, DeviceResult};

/// Adapters with at least this much dedicated VRAM are reported as discrete.
const DISCRETE_VRAM_THRESHOLD: usize = 512 * 1024 * 1024;

/// Lowest feature level an adapter must support to be listed.
pub const MIN_FEATURE_LEVEL: D3D_FEATURE_LEVEL = D3D_FEATURE_LEVEL_11_0;

/// Call `next` with increasing indices until it reports
/// `DXGI_ERROR_NOT_FOUND`. Any other error is a driver failure.
fn walk_adapters<T>(
    mut next: impl FnMut(u32) -> windows::core::Result<T>,
    mut visit: impl FnMut(u32, T) -> DeviceResult<()>,
) -> DeviceResult<()> {
    for index in 0.. {
        match next(index) {
            Ok(adapter) => visit(index, adapter)?,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => return Ok(()),
            Err(e) => return Err(DeviceError::driver("IDXGIFactory1::EnumAdapters1", e)),
        }
    }
    Ok(())
}

/// True when a D3D12 device at [`MIN_FEATURE_LEVEL`] can be created on
/// `adapter`. No device is kept.
#[allow(unsafe_code)]
fn supports_d3d12(adapter: &IDXGIAdapter1) -> bool {
    unsafe {
        D3D12CreateDevice(adapter, MIN_FEATURE_LEVEL, std::ptr::null_mut::<Option<ID3D12Device>>())
    }
    .is_ok()
}

/// Enumerates hardware adapters through `IDXGIFactory4::EnumAdapters1`.
#[derive(Debug, Default)]
pub struct DxgiEnumerator;

impl DxgiEnumerator {
    /// New enumerator. The factory is created per [`enumerate`](DeviceEnumerator::enumerate) call.
    pub fn new() -> Self {
        Self
    }
}

impl DeviceEnumerator for DxgiEnumerator {
    fn api(&self) -> RenderApi {
        RenderApi::D3d12
    }

    #[allow(unsafe_code)]
    fn enumerate(&self) -> DeviceResult<Vec<PhysicalDevice>> {
        let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory2(DXGI_CREATE_FACTORY_FLAGS(0)) }
            .map_err(|e| DeviceError::driver("CreateDXGIFactory2", e))?;

        let mut devices = Vec::new();
        walk_adapters(
            |index| unsafe { factory.EnumAdapters1(index) },
            |ordinal, adapter| {
                let desc = unsafe { adapter.GetDesc1() }
                    .map_err(|e| DeviceError::driver("IDXGIAdapter1::GetDesc1", e))?;

                let name = String::from_utf16_lossy(&desc.Description)
                    .trim_end_matches('\0')
                    .to_string();

                // Skip software adapters (WARP / Basic Render Driver)
                if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
                    debug!(name = %name, "Skipping software adapter");
                    return Ok(());
                }
                if !supports_d3d12(&adapter) {
                    debug!(name = %name, "Skipping adapter below feature level 11_0");
                    return Ok(());
                }

                let kind = if desc.DedicatedVideoMemory >= DISCRETE_VRAM_THRESHOLD {
                    DeviceKind::Discrete
                } else {
                    DeviceKind::Integrated
                };

                devices.push(PhysicalDevice {
                    raw: ordinal as u64,
                    name,
                    vendor_id: desc.VendorId,
                    kind,
                    identity: Some(DeviceIdentity::from_luid_parts(
                        desc.AdapterLuid.LowPart,
                        desc.AdapterLuid.HighPart,
                    )),
                });
                Ok(())
            },
        )?;
        Ok(devices)
    }

    /// DXGI lists the adapter driving the primary output first.
    fn default_device(&self, devices: &[PhysicalDevice]) -> Option<usize> {
        (!devices.is_empty()).then_some(0)
    }
}
