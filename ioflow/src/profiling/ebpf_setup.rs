//! # eBPF Object Loading and Map Setup
//!
//! Loads the compiled probe object, hands kernel struct offsets to the probes
//! through the `LAYOUT` map and takes the `STAGES` ring buffer.
//!
//! The object is read at runtime (`--object`), so one userspace build can
//! drive probes compiled for different kernels.

use anyhow::{Context, Result};
use aya::maps::{Array, MapData, RingBuf};
use aya::Ebpf;
use aya_log::EbpfLogger;
use ioflow_common::KernelLayout;
use log::{info, warn};
use std::path::Path;

/// Load the eBPF object at `path`
///
/// # Errors
/// Returns an error if the object cannot be read or parsed
pub fn load_ebpf_program(path: &Path) -> Result<Ebpf> {
    let bpf = Ebpf::load_file(path)
        .with_context(|| format!("Failed to load eBPF object {}", path.display()))?;
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Store `layout` in slot 0 of the `LAYOUT` map
///
/// Must run before any probe attaches; probes without a layout skip their
/// firing.
///
/// # Errors
/// Returns an error if the map is missing or the update fails
pub fn write_kernel_layout(bpf: &mut Ebpf, layout: &KernelLayout) -> Result<()> {
    let mut map: Array<_, KernelLayout> =
        Array::try_from(bpf.map_mut("LAYOUT").context("LAYOUT map not found")?)?;
    map.set(0, layout, 0).context("Failed to write kernel layout")?;
    info!("✓ Wrote kernel layout to LAYOUT map");
    Ok(())
}

/// Take ownership of the `STAGES` ring buffer
///
/// # Errors
/// Returns an error if the map is missing or is not a ring buffer
pub fn take_stage_ring(bpf: &mut Ebpf) -> Result<RingBuf<MapData>> {
    let ring = RingBuf::try_from(bpf.take_map("STAGES").context("STAGES map not found")?)?;
    Ok(ring)
}
