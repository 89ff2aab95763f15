//! Kernel-facing modules
//!
//! - eBPF object loading and map setup
//! - Kprobe attachment with per-kernel hook fallbacks
//! - Kernel-side diagnostic counters

pub mod attach;
pub mod diagnostics;
pub mod ebpf_setup;

pub use attach::{
    attach_plan, detach_all, AttachPolicy, AttachReport, AttachStatus, EbpfAttacher,
    KernelSymbols, ProbeAttacher, ProbeSpec,
};
pub use diagnostics::{print_stage_diagnostics, stage_drops};
pub use ebpf_setup::{init_ebpf_logger, load_ebpf_program, take_stage_ring, write_kernel_layout};
