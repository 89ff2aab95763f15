//! # ioflow - Main Entry Point
//!
//! Loads the probe object, attaches the selected tool's kprobes, then feeds
//! the `STAGES` ring buffer through the stage pipeline on this thread while
//! a polling consumer renders rows on its own thread. Ctrl-C cancels the
//! consumer, which prints the tool's histograms before exiting.

// Main function is intentionally long for clarity
#![allow(clippy::too_many_lines)]

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use log::{info, warn};
use std::io::{self, BufWriter};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ioflow::cli::Args;
use ioflow::config::load_layout;
use ioflow::consumer::PollingConsumer;
use ioflow::domain::ConfigError;
use ioflow::emitter::transport;
use ioflow::pipeline::{ProbeEvent, Session};
use ioflow::preflight::run_preflight_checks;
use ioflow::profiling::{
    attach_plan, detach_all, init_ebpf_logger, load_ebpf_program, print_stage_diagnostics,
    take_stage_ring, write_kernel_layout, EbpfAttacher, KernelSymbols,
};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_USAGE;
    }
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;
    let tool = args.command.tool();

    // Validate everything before touching the kernel
    run_preflight_checks(&args.object)?;
    let layout = load_layout(args.layout.as_deref())?;

    if !quiet {
        info!("ioflow v{} ({})", env!("CARGO_PKG_VERSION"), tool.name());
    }

    // ── Load eBPF and hand it the struct layout ─────────────────────────
    let mut bpf = load_ebpf_program(&args.object)?;
    init_ebpf_logger(&mut bpf);
    write_kernel_layout(&mut bpf, &layout)?;
    let mut ring_buf = take_stage_ring(&mut bpf)?;

    // ── Pipeline, transport and consumer ────────────────────────────────
    let (emitter, records) = transport(args.capacity);
    let histograms = Arc::new(tool.histograms());
    let session = Session::new(tool.session_config(), Arc::clone(&histograms), emitter);

    let (cancel_tx, cancel_rx) = bounded::<()>(1);
    let filter = tool.filter();
    let rows = tool.row_layout();
    let histogram_layout = tool.histogram_layout();
    let consumer_histograms = Arc::clone(&histograms);
    let consumer_handle = std::thread::Builder::new()
        .name("ioflow-consumer".to_string())
        .spawn(move || {
            let mut consumer = PollingConsumer::new(
                records,
                cancel_rx,
                filter,
                rows,
                consumer_histograms,
                histogram_layout,
                BufWriter::new(io::stdout()),
            );
            consumer.run()
        })
        .context("Failed to spawn consumer thread")?;

    // ── Attach kprobes (syscall returns last) ───────────────────────────
    let symbols = KernelSymbols::load()?;
    let mut attacher = EbpfAttacher::new(&mut bpf, symbols);
    let report = attach_plan(&mut attacher, &tool.probes());
    if report.attached.is_empty() {
        anyhow::bail!("No {} probes could be attached on this kernel", tool.name());
    }

    print!("{}", tool.banner());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();
    let mut malformed = 0u64;
    let mut exit_reason = "interrupted";

    // Main event processing loop
    loop {
        while let Some(item) = ring_buf.next() {
            match ProbeEvent::decode(&item) {
                Ok(event) => session.handle(&event),
                Err(e) => {
                    malformed += 1;
                    warn!("Dropping stage record: {e}");
                }
            }
        }

        if consumer_handle.is_finished() {
            exit_reason = "output closed";
            break;
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    // Stop producing before the consumer renders histograms
    detach_all(&mut attacher, &report);
    drop(attacher);

    if cancel_tx.send(()).is_err() {
        info!("consumer already stopped");
    }
    let consumer_stats = match consumer_handle.join() {
        Ok(Ok(stats)) => Some(stats),
        Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => None,
        Ok(Err(e)) => return Err(e).context("Failed to write output"),
        Err(_) => anyhow::bail!("consumer thread panicked"),
    };

    if !quiet {
        let stats = session.stats();
        let (in_syscall, in_bio, in_request) = session.in_flight();
        eprintln!(
            "\n{}: {:.1}s, {} stage events (malformed: {}, gaps: {}, discarded: {}), \
             {} records emitted / {} dropped, in flight: {}/{}/{}",
            exit_reason,
            started.elapsed().as_secs_f64(),
            stats.events,
            malformed,
            stats.gaps,
            stats.discarded,
            stats.emitter.emitted,
            stats.emitter.dropped,
            in_syscall,
            in_bio,
            in_request,
        );
        if let Some(consumer) = consumer_stats {
            eprintln!(
                "output: {} of {} records rendered, {} undecodable",
                consumer.rendered, consumer.received, consumer.malformed
            );
        }
        if !report.omitted.is_empty() {
            eprintln!("omitted programs: {}", report.omitted.join(", "));
        }
    }

    print_stage_diagnostics(&bpf)?;

    Ok(())
}
