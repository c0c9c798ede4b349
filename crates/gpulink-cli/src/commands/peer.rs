//! Compute peer lookup for the selected device.

use crate::PeerArgs;
use anyhow::{Context, Result, bail};
use gpulink_core::PhysicalDevice;
use gpulink_interop::{ComputeApi, ComputeDevice, find_peer};
use tracing::debug;

/// Outcome of a peer lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum PeerReport {
    /// Compute device sharing memory with the render device.
    Found(ComputeDevice),
    /// The render device has no identity to match on.
    NoIdentity,
    /// The compute API does not run on this vendor's hardware.
    VendorUnsupported(u32),
    /// No compute device carries the render device's identity.
    NotFound { candidates: usize },
}

/// Look up the peer of `device` among the devices of `compute`.
pub fn lookup<C: ComputeApi>(compute: &C, device: &PhysicalDevice) -> Result<PeerReport> {
    if !compute.supports_vendor(device.vendor_id) {
        return Ok(PeerReport::VendorUnsupported(device.vendor_id));
    }
    let Some(identity) = device.identity else {
        return Ok(PeerReport::NoIdentity);
    };
    let devices = compute
        .devices()
        .with_context(|| format!("{} device enumeration failed", compute.name()))?;
    let key = identity.peer_key();
    debug!(api = compute.name(), %key, candidates = devices.len(), "Matching peer");
    Ok(match find_peer(&key, &devices) {
        Some(i) => PeerReport::Found(devices[i].clone()),
        None => PeerReport::NotFound { candidates: devices.len() },
    })
}

#[cfg(feature = "cuda")]
fn lookup_cuda(device: &PhysicalDevice) -> Result<PeerReport> {
    let cuda = gpulink_interop::cuda::CudaCompute::new().context("CUDA initialization failed")?;
    lookup(&cuda, device)
}

#[cfg(not(feature = "cuda"))]
fn lookup_cuda(_device: &PhysicalDevice) -> Result<PeerReport> {
    bail!("CUDA support not compiled in (enable the `cuda` feature)")
}

/// Runs the peer command.
pub fn run(args: PeerArgs) -> Result<()> {
    let registry = super::load_registry(&args.device)?;
    let (_, doc) = super::load_settings(&args.settings)?;
    let selector = super::restore_selector(&registry, &doc);
    let index =
        super::effective_device(&registry, &selector).context("No render device available")?;
    let device = registry.get(index).context("No render device available")?;
    println!("Render device: [{}] {} ({})", index + 1, device.name, device.vendor_name());

    let report = match args.compute.to_ascii_lowercase().as_str() {
        "cuda" => lookup_cuda(device)?,
        "hip" | "sycl" => bail!("No {} backend available", args.compute),
        other => bail!("Unknown compute API: {other} (expected cuda, hip, sycl)"),
    };

    match report {
        PeerReport::Found(peer) => {
            let identity = peer.describe_identity();
            println!("Peer:          [{}] {}  {identity}", peer.ordinal, peer.name);
        }
        PeerReport::NoIdentity => bail!("{} reports no identity; cannot match a peer", device.name),
        PeerReport::VendorUnsupported(vendor) => {
            bail!("{} does not run on vendor {vendor:#06x}", args.compute)
        }
        PeerReport::NotFound { candidates } => {
            bail!("None of {candidates} {} device(s) matches {}", args.compute, device.name)
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpulink_core::{DeviceIdentity, DeviceKind, vendor};
    use gpulink_interop::host::{HostCompute, HostHub};

    fn render_device(vendor_id: u32, device_uuid: u8) -> PhysicalDevice {
        PhysicalDevice {
            raw: 1,
            name: "GPU".to_string(),
            vendor_id,
            kind: DeviceKind::Discrete,
            identity: Some(DeviceIdentity::Vulkan {
                driver_uuid: [1; 16],
                device_uuid: [device_uuid; 16],
            }),
        }
    }

    fn cuda_like() -> HostCompute {
        let devices = (0..3)
            .map(|i| ComputeDevice {
                ordinal: i,
                name: format!("cu{i}"),
                uuid: Some([10 + i as u8; 16]),
                luid: None,
            })
            .collect();
        HostCompute::new("CUDA", HostHub::new(), devices).accepting_vendors(&[vendor::NVIDIA])
    }

    #[test]
    fn test_lookup_found() {
        let report = lookup(&cuda_like(), &render_device(vendor::NVIDIA, 12)).unwrap();
        match report {
            PeerReport::Found(peer) => assert_eq!(peer.ordinal, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_lookup_misses() {
        let compute = cuda_like();
        assert_eq!(
            lookup(&compute, &render_device(vendor::NVIDIA, 99)).unwrap(),
            PeerReport::NotFound { candidates: 3 }
        );
        assert_eq!(
            lookup(&compute, &render_device(vendor::AMD, 10)).unwrap(),
            PeerReport::VendorUnsupported(vendor::AMD)
        );
        let mut anonymous = render_device(vendor::NVIDIA, 10);
        anonymous.identity = None;
        assert_eq!(lookup(&compute, &anonymous).unwrap(), PeerReport::NoIdentity);
    }
}
