//! # ioflow - Block I/O Flow Tracer
//!
//! ioflow follows individual I/Os from the VFS syscall down through the page
//! cache, the filesystem, bio split/merge and block request queuing to
//! completion, and reports per-stage latencies. It is built on kprobes
//! loaded with aya; every stage the kernel reports is correlated in
//! userspace.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     eBPF Programs (Kernel)                      │
//! │  • Kprobes: vfs, page cache, ext4, submit_bio, bio_split,       │
//! │    bio_attempt_*_merge, blk_account_io_*                        │
//! │  • One StageRecord per firing, struct offsets from LAYOUT map   │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ STAGES ring buffer
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Pipeline (main thread)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │    Stage     │──▶│  Keystores   │──▶│   Emitter    │         │
//! │  │   Session    │   │ + Sequences  │   │  (drops on   │         │
//! │  └──────┬───────┘   └──────────────┘   │    full)     │         │
//! │         │                              └──────┬───────┘         │
//! │         ▼                                     │                 │
//! │  ┌──────────────┐                             │                 │
//! │  │  Histograms  │◀────────────┐               │                 │
//! │  └──────────────┘             │               │                 │
//! └───────────────────────────────┼───────────────┼─────────────────┘
//!                                 │               │ bounded channel
//!                                 │               ▼
//! ┌───────────────────────────────┴─────────────────────────────────┐
//! │               Polling Consumer (own thread)                     │
//! │   decode ──▶ threshold filter ──▶ printf-style rows ──▶ stdout   │
//! │   on cancel: render histograms                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`profiling`]: eBPF object loading, layout map, kprobe attachment with
//!   per-kernel hook fallbacks, kernel-side drop counters
//! - [`pipeline`]: decoding of stage records and the per-session state
//!   machine
//! - [`correlation`]: identity keystores and per-process sequence numbers
//! - [`emitter`]: finalized records and the bounded record transport
//! - [`consumer`]: the polling consumer, threshold filter and row rendering
//! - [`histogram`]: log2 and linear histograms with atomic buckets
//! - [`tools`]: the five tools and what each one traces and prints
//! - [`cli`], [`config`], [`preflight`]: argument parsing and validation
//! - [`domain`]: handle newtypes and errors
//!
//! ## Typical Usage
//!
//! ```bash
//! # Read flow with default thresholds (1 ms syscalls, 0.2 ms requests)
//! sudo ./ioflow read
//!
//! # Sync writes, with a row per bio split/merge
//! sudo ./ioflow syncwrite --bio-events
//!
//! # Request latency histograms only
//! sudo ./ioflow rqhist
//! ```

pub mod cli;
pub mod config;
pub mod consumer;
pub mod correlation;
pub mod domain;
pub mod emitter;
pub mod histogram;
pub mod pipeline;
pub mod preflight;
pub mod profiling;
pub mod tools;
