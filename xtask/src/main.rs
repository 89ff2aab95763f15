use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Cross-compile the kprobe object loaded by `ioflow --object`
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        #[arg(long)]
        release: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, release } => build_ebpf(&target, release)?,
    }

    Ok(())
}

fn build_ebpf(target: &str, release: bool) -> Result<()> {
    // Debug builds pull in formatting code the BPF linker rejects, so the
    // object is always built with the release profile.
    if !release {
        println!("note: building ioflow-ebpf in release mode regardless of --release");
    }

    let status = Command::new("cargo")
        .arg("+nightly")
        .arg("build")
        .arg("--package")
        .arg("ioflow-ebpf")
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release")
        .status()
        .context("Failed to run cargo for ioflow-ebpf")?;

    if !status.success() {
        anyhow::bail!("Failed to build eBPF program");
    }

    let object: PathBuf = ["target", target, "release", "ioflow"].iter().collect();
    println!("✓ eBPF program built successfully");
    println!("  Object: {}", object.display());
    println!("  Run:    sudo ioflow --object {} read", object.display());

    Ok(())
}
