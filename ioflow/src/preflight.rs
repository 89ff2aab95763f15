//! Pre-flight checks for ioflow
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use std::path::Path;

/// Minimum kernel version: BPF ring buffer
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns the first unmet requirement
pub fn run_preflight_checks(object_path: &Path) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_kallsyms()?;
    check_object_exists(object_path)?;
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    bail!(
        "Permission denied: ioflow requires root privileges to load eBPF programs.\n\n\
         Run with: sudo ioflow ..."
    );
}

/// Parse `(major, minor)` from the contents of `/proc/version`
fn parse_kernel_version(version_str: &str) -> Option<(u32, u32, &str)> {
    // "Linux version 5.15.0-generic ..." or "Linux version 6.1.0-arch1-1 ..."
    let release = version_str.split_whitespace().nth(2)?;
    let mut parts = release.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor, release))
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // Can't parse, assume it's fine
    let Some((major, minor, release)) = parse_kernel_version(&version_str) else {
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {}.{} is too old.\n\n\
             ioflow requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {}",
            major,
            minor,
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
            release
        );
    }

    Ok(())
}

/// Hook fallbacks are resolved against /proc/kallsyms
fn check_kallsyms() -> Result<()> {
    std::fs::File::open("/proc/kallsyms").context(
        "Cannot read /proc/kallsyms\n\n\
         This usually means:\n\
         - Permission denied (run with sudo)\n\
         - /proc is not mounted",
    )?;
    Ok(())
}

/// Check that the compiled eBPF object exists
fn check_object_exists(object_path: &Path) -> Result<()> {
    if !object_path.is_file() {
        bail!(
            "eBPF object not found: {}\n\n\
             Build it with: cargo xtask build-ebpf --release\n\
             or point --object at a compiled ioflow-ebpf binary.",
            object_path.display()
        );
    }
    Ok(())
}
