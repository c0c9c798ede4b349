//! Device listing.

use crate::DevicesArgs;
use anyhow::Result;
use gpulink_core::{DeviceRegistry, PhysicalDevice};
use serde_json::json;

/// Runs the devices command.
pub fn run(args: DevicesArgs, verbose: bool) -> Result<()> {
    let registry = super::load_registry(&args.device)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&to_json(&registry))?);
    } else {
        print_text(&registry, verbose);
    }
    Ok(())
}

fn identity_text(device: &PhysicalDevice) -> String {
    device.identity.map_or_else(|| "no identity".to_string(), |id| id.to_string())
}

fn print_text(registry: &DeviceRegistry, verbose: bool) {
    println!(
        "{} devices: {}  (config hash {:#018x})",
        registry.api().name(),
        registry.len(),
        registry.config_hash()
    );
    for (i, device) in registry.devices().iter().enumerate() {
        let marker = if registry.default_device() == Some(i) { "*" } else { " " };
        println!(
            "  [{}]{} {}  ({} {})",
            i + 1,
            marker,
            device.name,
            device.vendor_name(),
            device.kind.label()
        );
        if verbose {
            println!("       vendor {:#06x}  {}", device.vendor_id, identity_text(device));
        }
    }
    if registry.is_empty() {
        println!("  (none)");
    }
}

fn to_json(registry: &DeviceRegistry) -> serde_json::Value {
    let devices: Vec<_> = registry
        .devices()
        .iter()
        .enumerate()
        .map(|(i, d)| {
            json!({
                "index": i + 1,
                "name": d.name,
                "vendorId": d.vendor_id,
                "vendor": d.vendor_name(),
                "kind": d.kind,
                "identity": d.identity.map(|id| id.to_string()),
                "default": registry.default_device() == Some(i),
            })
        })
        .collect();
    json!({
        "api": registry.api(),
        "systemConfigHash": registry.config_hash(),
        "devices": devices,
    })
}
