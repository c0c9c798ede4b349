//! Bridge tests against the host backend.

use std::sync::Arc;
use std::thread;

use gpulink_core::{DeviceIdentity, vendor};
use gpulink_interop::host::{HostCompute, HostExporter, HostHub};
use gpulink_interop::{
    ComputeDevice, ImageDesc, ImageFormat, InteropBridge, InteropError, Side, WaitOutcome,
    describe_backends,
};

fn uuid(n: u8) -> [u8; 16] {
    let mut u = [0u8; 16];
    u[0] = 0xA0;
    u[15] = n;
    u
}

fn vk_identity(n: u8) -> DeviceIdentity {
    DeviceIdentity::Vulkan { driver_uuid: [0x11; 16], device_uuid: uuid(n) }
}

fn cuda_like(hub: &HostHub, count: u8) -> HostCompute {
    let devices = (0..count)
        .map(|n| ComputeDevice {
            ordinal: n as usize,
            name: format!("GPU {n}"),
            uuid: Some(uuid(n)),
            luid: None,
        })
        .collect();
    HostCompute::new("CUDA", hub.clone(), devices).accepting_vendors(&[vendor::NVIDIA])
}

fn bridge(target: u8) -> InteropBridge<HostExporter, HostCompute> {
    let hub = HostHub::new();
    let render = HostExporter::new(hub.clone(), Some(vk_identity(target)), vendor::NVIDIA);
    InteropBridge::open(render, &cuda_like(&hub, 4)).unwrap()
}

#[test]
fn test_describe_backends() {
    let desc = describe_backends();
    println!("{desc}");
    assert!(desc.contains("[+] host"));
}

#[test]
fn test_peer_matches_device_uuid() {
    for target in 0..4 {
        let b = bridge(target);
        assert_eq!(b.peer_device().ordinal, target as usize);
        assert_eq!(b.peer().ordinal(), target as usize);
        assert_eq!(b.compute_name(), "CUDA");
    }
}

#[test]
fn test_unknown_uuid_is_mismatch() {
    let hub = HostHub::new();
    let render = HostExporter::new(hub.clone(), Some(vk_identity(9)), vendor::NVIDIA);
    let err = InteropBridge::open(render, &cuda_like(&hub, 4)).err().unwrap();
    assert!(matches!(err, InteropError::IdentityMismatch { .. }), "{err}");
}

#[test]
fn test_render_without_identity_is_mismatch() {
    let hub = HostHub::new();
    let render = HostExporter::new(hub.clone(), None, vendor::NVIDIA);
    match InteropBridge::open(render, &cuda_like(&hub, 2)) {
        Err(InteropError::IdentityMismatch { key, .. }) => assert_eq!(key, "none"),
        other => panic!("unexpected: {:?}", other.err()),
    }
}

#[test]
fn test_vendor_rejected_before_matching() {
    let hub = HostHub::new();
    // The UUID matches, the vendor does not.
    let render = HostExporter::new(hub.clone(), Some(vk_identity(0)), vendor::AMD);
    match InteropBridge::open(render, &cuda_like(&hub, 2)) {
        Err(InteropError::VendorUnsupported { vendor_id, compute }) => {
            assert_eq!(vendor_id, vendor::AMD);
            assert_eq!(compute, "CUDA");
        }
        other => panic!("unexpected: {:?}", other.err()),
    }
}

#[test]
fn test_d3d12_matches_by_luid() {
    let hub = HostHub::new();
    let identity = DeviceIdentity::from_luid_parts(0x0000_BEEF, 1);
    let DeviceIdentity::D3d12 { adapter_luid } = identity else { unreachable!() };
    let devices = vec![
        ComputeDevice { ordinal: 0, name: "a".into(), uuid: Some(uuid(0)), luid: Some([9; 8]) },
        ComputeDevice {
            ordinal: 1,
            name: "b".into(),
            uuid: Some(uuid(1)),
            luid: Some(adapter_luid),
        },
    ];
    let compute = HostCompute::new("HIP", hub.clone(), devices);
    let render = HostExporter::new(hub, Some(identity), vendor::AMD);
    let b = InteropBridge::open(render, &compute).unwrap();
    assert_eq!(b.peer_device().ordinal, 1);
}

#[test]
fn test_buffer_is_shared_and_imported_once() {
    let b = bridge(1);
    let mut buffer = b.create_buffer(64).unwrap();
    let imported = b.import_buffer(&mut buffer).unwrap();
    assert_eq!(buffer.live_imports(), 1);

    buffer.native().write(8, &[1, 2, 3, 4]);
    assert_eq!(imported.read(8, 4), vec![1, 2, 3, 4]);

    assert!(matches!(b.import_buffer(&mut buffer), Err(InteropError::HandleConsumed)));

    imported.release();
    assert_eq!(buffer.live_imports(), 0);
    assert_eq!(buffer.release().len(), 64);
}

#[test]
fn test_released_exports_leave_nothing_pending() {
    let hub = HostHub::new();
    let render = HostExporter::new(hub.clone(), Some(vk_identity(0)), vendor::NVIDIA);
    let b = InteropBridge::open(render, &cuda_like(&hub, 1)).unwrap();

    let buffer = b.create_buffer(32).unwrap();
    let image = b.create_image(&ImageDesc::new_2d(4, 4, ImageFormat::Rgba8Unorm)).unwrap();
    let fence = b.create_fence(0).unwrap();
    assert_eq!(hub.pending(), 3);

    buffer.release();
    image.release();
    fence.release();
    assert_eq!(hub.pending(), 0);
}

#[test]
fn test_zero_sized_buffer_rejected() {
    let b = bridge(0);
    assert!(matches!(b.create_buffer(0), Err(InteropError::InvalidDescriptor(_))));
}

#[test]
fn test_image_export_and_import() {
    let b = bridge(2);
    let mut desc = ImageDesc::new_2d(16, 8, ImageFormat::Rgba16Float);
    desc.mip_levels = 2;
    let mut image = b.create_image(&desc).unwrap();
    assert_eq!(image.allocation_size(), desc.packed_size());

    let imported = b.import_image(&mut image).unwrap();
    assert_eq!(imported.len() as u64, image.allocation_size());
    drop(imported);
    image.release();
}

#[test]
fn test_export_unavailable() {
    let hub = HostHub::new();
    let render = HostExporter::new(hub.clone(), Some(vk_identity(0)), vendor::NVIDIA)
        .without_export_support();
    let b = InteropBridge::open(render, &cuda_like(&hub, 1)).unwrap();
    assert!(matches!(b.create_buffer(16), Err(InteropError::HandleExportUnavailable(_))));
    assert!(matches!(b.create_fence(0), Err(InteropError::HandleExportUnavailable(_))));
}

#[test]
#[should_panic(expected = "released while 1 import(s) are still alive")]
fn test_release_with_live_import_panics() {
    let b = bridge(0);
    let mut buffer = b.create_buffer(32).unwrap();
    let _imported = b.import_buffer(&mut buffer).unwrap();
    buffer.release();
}

#[test]
fn test_fence_compute_side_requires_import() {
    let b = bridge(0);
    let fence = b.create_fence(0).unwrap();
    assert!(!fence.is_imported());
    assert!(matches!(fence.signal(Side::Compute, 1), Err(InteropError::Import(_))));
    // The failed signal did not consume a value.
    fence.signal(Side::Render, 1).unwrap();
    assert_eq!(fence.last_signaled_value(), 1);
}

#[test]
fn test_fence_import_once() {
    let b = bridge(0);
    let mut fence = b.create_fence(0).unwrap();
    b.import_fence(&mut fence).unwrap();
    assert!(matches!(b.import_fence(&mut fence), Err(InteropError::HandleConsumed)));
}

#[test]
fn test_fence_ping_pong_across_threads() {
    let b = bridge(3);
    let mut fence = b.create_fence(0).unwrap();
    b.import_fence(&mut fence).unwrap();
    let fence = Arc::new(fence);

    let worker = {
        let fence = Arc::clone(&fence);
        thread::spawn(move || {
            for round in 0..10u64 {
                let ready = round * 2 + 1;
                let outcome = fence.wait(Side::Compute, ready).unwrap();
                assert!(matches!(outcome, WaitOutcome::Observed(v) if v >= ready));
                fence.signal(Side::Compute, ready + 1).unwrap();
            }
        })
    };

    for round in 0..10u64 {
        let value = round * 2 + 1;
        fence.signal(Side::Render, value).unwrap();
        let outcome = fence.wait(Side::Render, value + 1).unwrap();
        assert_eq!(outcome, WaitOutcome::Observed(value + 1));
    }
    worker.join().unwrap();

    assert_eq!(fence.last_signaled_value(), 20);
    assert_eq!(fence.last_observed_value(), 20);
    let fence = Arc::try_unwrap(fence).unwrap();
    assert_eq!(fence.release().value(), 20);
}

#[test]
#[should_panic(expected = "timeline regression")]
fn test_fence_signal_regression_panics() {
    let b = bridge(0);
    let mut fence = b.create_fence(5).unwrap();
    b.import_fence(&mut fence).unwrap();
    fence.signal(Side::Render, 6).unwrap();
    let _ = fence.signal(Side::Compute, 6);
}
