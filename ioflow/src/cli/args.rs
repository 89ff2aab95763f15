//! CLI argument definitions

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{parse_capacity, parse_threshold, DEFAULT_CAPACITY};
use crate::tools::{Tool, TraceOptions};

#[derive(Parser)]
#[command(
    name = "ioflow",
    about = "Trace block I/O flow from syscall to request completion",
    after_help = "\
EXAMPLES:
    sudo ioflow read                    Read flow, 1 ms syscall / 0.2 ms request thresholds
    sudo ioflow read -s 5 -r 0.5        Raise both thresholds
    sudo ioflow syncwrite --bio-events  Sync write flow with per-bio split/merge rows
    sudo ioflow splitmerge -S           Bio splits only
    sudo ioflow rqhist                  Request queue/service histograms"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Compiled eBPF object
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        default_value = "target/bpfel-unknown-none/release/ioflow"
    )]
    pub object: PathBuf,

    /// JSON file overriding kernel struct offsets
    #[arg(long, global = true, value_name = "FILE")]
    pub layout: Option<PathBuf>,

    /// Records buffered between pipeline and output before dropping
    #[arg(long, global = true, value_parser = parse_capacity, default_value_t = DEFAULT_CAPACITY)]
    pub capacity: usize,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Trace read I/Os: syscall, page cache, block layer and request latencies
    Read(TraceArgs),

    /// Trace synchronous write I/Os
    #[command(name = "syncwrite")]
    SyncWrite(TraceArgs),

    /// Trace bio splits and merges
    #[command(name = "splitmerge")]
    SplitMerge {
        /// Trace split events only
        #[arg(short = 'S', long)]
        split: bool,

        /// Trace merge events only
        #[arg(short = 'M', long)]
        merge: bool,
    },

    /// Histograms of request queuing and service time
    #[command(name = "rqhist")]
    RqHist,

    /// Histograms of request size
    #[command(name = "sizehist")]
    SizeHist,
}

#[derive(ClapArgs, Debug, Clone, PartialEq)]
pub struct TraceArgs {
    /// Syscall threshold in ms: print syscalls at least this slow
    #[arg(short = 's', long = "sys-thres", value_parser = parse_threshold, default_value_t = 1.0)]
    pub sys_thres: f64,

    /// Request threshold in ms: print requests at least this slow
    #[arg(short = 'r', long = "rq-thres", value_parser = parse_threshold, default_value_t = 0.2)]
    pub rq_thres: f64,

    /// Also print a row per bio split/merge under its owning syscall
    #[arg(long)]
    pub bio_events: bool,
}

impl From<&TraceArgs> for TraceOptions {
    fn from(args: &TraceArgs) -> Self {
        Self { sys_thres: args.sys_thres, rq_thres: args.rq_thres, bio_events: args.bio_events }
    }
}

impl Command {
    #[must_use]
    pub fn tool(&self) -> Tool {
        match self {
            Command::Read(args) => Tool::Read(args.into()),
            Command::SyncWrite(args) => Tool::SyncWrite(args.into()),
            Command::SplitMerge { split, merge } => Tool::SplitMerge { split: *split, merge: *merge },
            Command::RqHist => Tool::RqHist,
            Command::SizeHist => Tool::SizeHist,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("ioflow").chain(argv.iter().copied()))
    }

    #[test]
    fn test_read_defaults() {
        let args = parse(&["read"]).unwrap();
        assert_eq!(args.command.tool(), Tool::Read(TraceOptions::default()));
        assert_eq!(args.capacity, DEFAULT_CAPACITY);
        assert!(args.layout.is_none());
    }

    #[test]
    fn test_thresholds_and_global_flags() {
        let args = parse(&["syncwrite", "-s", "5", "-r", "0.5", "--bio-events", "-q"]).unwrap();
        assert!(args.quiet);
        assert_eq!(
            args.command.tool(),
            Tool::SyncWrite(TraceOptions { sys_thres: 5.0, rq_thres: 0.5, bio_events: true })
        );
    }

    #[test]
    fn test_negative_threshold_rejected() {
        assert!(parse(&["read", "-s", "-1"]).is_err());
        assert!(parse(&["read", "--rq-thres", "abc"]).is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(parse(&["--capacity", "0", "rqhist"]).is_err());
    }

    #[test]
    fn test_split_merge_selectors() {
        let args = parse(&["splitmerge", "-M"]).unwrap();
        assert_eq!(args.command.tool(), Tool::SplitMerge { split: false, merge: true });
    }

    #[test]
    fn test_missing_subcommand() {
        assert!(parse(&[]).is_err());
    }
}
