//! End-to-end scenarios for gpulink crates.
//!
//! Each test walks one application-level story across crates: device
//! enumeration and persisted selection, the egui menu, the interop fence
//! and the screenshot pool writing PNGs to disk.
