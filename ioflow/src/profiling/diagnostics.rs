use anyhow::{Context, Result};
use aya::maps::HashMap;
use aya::Ebpf;

/// Stage records the probes failed to push into the `STAGES` ring buffer
///
/// A non-zero count means the ring buffer filled up faster than the
/// pipeline drained it; affected identities show up as correlation gaps.
///
/// # Errors
/// Returns an error if the `STAGE_DROPS` map cannot be accessed
pub fn stage_drops(bpf: &Ebpf) -> Result<u64> {
    let drops: HashMap<_, u32, u64> =
        HashMap::try_from(bpf.map("STAGE_DROPS").context("STAGE_DROPS map not found")?)?;
    Ok(drops.get(&0u32, 0).unwrap_or(0))
}

/// Print kernel-side counters
///
/// # Errors
/// Returns an error if the eBPF diagnostic maps cannot be accessed
pub fn print_stage_diagnostics(bpf: &Ebpf) -> Result<()> {
    let dropped = stage_drops(bpf)?;
    if dropped > 0 {
        eprintln!("warning: {dropped} stage records lost in the kernel ring buffer");
    }
    Ok(())
}
