//! The tool family: what each subcommand traces, prints and aggregates

use crate::consumer::render::{bio_header, split_merge_header};
use crate::consumer::{Filter, HistogramLayout, RowLayout, SyscallColumns, Threshold};
use crate::domain::Direction;
use crate::histogram::{Histogram, HistogramSet, Metric, LINEAR_BUCKETS};
use crate::pipeline::SessionConfig;
use crate::profiling::attach::{AttachPolicy, ProbeSpec};

/// Selected tool and its options
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tool {
    /// Per-syscall read flow
    Read(TraceOptions),
    /// Per-syscall synchronous write flow
    SyncWrite(TraceOptions),
    /// Bio split and merge events
    SplitMerge { split: bool, merge: bool },
    /// Request queue and service time histograms
    RqHist,
    /// Request size histograms
    SizeHist,
}

/// Options shared by the read and syncwrite tools
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceOptions {
    /// Syscall latency floor (ms)
    pub sys_thres: f64,
    /// Request latency floor (ms)
    pub rq_thres: f64,
    pub bio_events: bool,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self { sys_thres: 1.0, rq_thres: 0.2, bio_events: false }
    }
}

impl Tool {
    fn direction(&self) -> Option<(Direction, &TraceOptions)> {
        match self {
            Tool::Read(options) => Some((Direction::Read, options)),
            Tool::SyncWrite(options) => Some((Direction::Write, options)),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Tool::Read(_) => "read",
            Tool::SyncWrite(_) => "syncwrite",
            Tool::SplitMerge { .. } => "splitmerge",
            Tool::RqHist => "rqhist",
            Tool::SizeHist => "sizehist",
        }
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        match self {
            Tool::Read(options) | Tool::SyncWrite(options) => SessionConfig {
                syscalls: self.direction().map(|(direction, _)| direction),
                request_records: true,
                bio_records: options.bio_events,
                unowned: false,
            },
            Tool::SplitMerge { .. } => SessionConfig {
                syscalls: None,
                request_records: false,
                bio_records: true,
                unowned: true,
            },
            Tool::RqHist => SessionConfig {
                syscalls: None,
                request_records: false,
                bio_records: false,
                unowned: true,
            },
            Tool::SizeHist => SessionConfig {
                syscalls: None,
                request_records: false,
                bio_records: false,
                unowned: false,
            },
        }
    }

    /// Histograms in render order
    #[must_use]
    pub fn histograms(&self) -> HistogramSet {
        let set = HistogramSet::new();
        let block_layer = |set: HistogramSet| {
            set.with(Metric::Block, "Block Entry (us)", Histogram::log2())
                .with(Metric::Split, "Bio Split (us)", Histogram::log2())
                .with(Metric::Merge, "Bio Merge (us)", Histogram::log2())
                .with(Metric::RequestQueue, "Request Queue (us)", Histogram::log2())
                .with(Metric::RequestService, "Request Service (us)", Histogram::log2())
        };
        match self {
            Tool::Read(_) => block_layer(
                set.with(Metric::Vfs, "VFS (us)", Histogram::log2())
                    .with(Metric::PageCache, "Page Cache Entry (us)", Histogram::log2())
                    .with(Metric::ReadPage, "Read Page (us)", Histogram::log2())
                    .with(Metric::Ext4ReadPage, "EXT4 Read Page (us)", Histogram::log2()),
            ),
            Tool::SyncWrite(_) => block_layer(
                set.with(Metric::Vfs, "VFS (us)", Histogram::log2())
                    .with(Metric::Ext4, "EXT4 (us)", Histogram::log2())
                    .with(Metric::WritePage, "Write Page (us)", Histogram::log2())
                    .with(Metric::Ext4Sync, "EXT4 Sync (us)", Histogram::log2()),
            ),
            Tool::SplitMerge { .. } => set,
            Tool::RqHist => set
                .with(Metric::RequestQueue, "Queuing time (us)", Histogram::log2())
                .with(Metric::RequestService, "Service time (us)", Histogram::log2()),
            Tool::SizeHist => set
                .with(Metric::IoSize, "kbytes", Histogram::log2())
                .with(Metric::IoSizeLinear, "kbytes", Histogram::linear(LINEAR_BUCKETS)),
        }
    }

    #[must_use]
    pub fn row_layout(&self) -> RowLayout {
        match self.direction() {
            Some((direction, options)) => RowLayout::Syscalls {
                columns: SyscallColumns::for_direction(direction),
                bio_rows: options.bio_events,
            },
            None if matches!(self, Tool::SplitMerge { .. }) => RowLayout::SplitMerge,
            None => RowLayout::Silent,
        }
    }

    #[must_use]
    pub fn histogram_layout(&self) -> HistogramLayout {
        match self {
            Tool::Read(_) | Tool::SyncWrite(_) => HistogramLayout::Stacked,
            Tool::SplitMerge { .. } => HistogramLayout::None,
            Tool::RqHist => HistogramLayout::RequestPair,
            Tool::SizeHist => HistogramLayout::SizePair,
        }
    }

    #[must_use]
    pub fn filter(&self) -> Filter {
        match self.direction() {
            Some((_, options)) => Filter::new(
                Threshold::from_millis(options.sys_thres),
                Threshold::from_millis(options.rq_thres),
            ),
            None => Filter::default(),
        }
    }

    /// Text printed before tracing starts, headers included
    #[must_use]
    pub fn banner(&self) -> String {
        match self {
            Tool::Read(options) => trace_banner(Direction::Read, options),
            Tool::SyncWrite(options) => trace_banner(Direction::Write, options),
            Tool::SplitMerge { .. } => format!("{}\n", split_merge_header()),
            Tool::RqHist => "Tracing I/O requests... Hit Ctrl-C to end.\n".to_string(),
            Tool::SizeHist => "Tracing... Hit Ctrl-C to end.\n".to_string(),
        }
    }

    /// Programs to attach, in attach order
    #[must_use]
    pub fn probes(&self) -> Vec<ProbeSpec> {
        match self {
            Tool::Read(_) => syscall_probes(READ_PATH, Direction::Read),
            Tool::SyncWrite(_) => syscall_probes(WRITE_PATH, Direction::Write),
            Tool::SplitMerge { split, merge } => {
                let mut probes = Vec::new();
                if *split || !*merge {
                    probes.extend_from_slice(SPLIT_PROBES);
                }
                if *merge || !*split {
                    probes.extend_from_slice(MERGE_PROBES);
                }
                probes
            }
            Tool::RqHist => REQUEST_PATH.to_vec(),
            Tool::SizeHist => vec![RQ_COMPLETION],
        }
    }
}

fn trace_banner(direction: Direction, options: &TraceOptions) -> String {
    let columns = SyscallColumns::for_direction(direction);
    let kinds = if options.bio_events { 3 } else { 2 };
    let mut banner = match direction {
        Direction::Read => format!(
            "Tracing read I/Os. Time threshold: {:.1} ms for syscalls and {:.1} ms for requests. \n\
             {kinds} types of emit output with the following formats:\n\n",
            options.sys_thres, options.rq_thres
        ),
        Direction::Write => format!(
            "Tracing sync write I/Os. Time threshold: {:.1} ms for syscalls and {:.1} ms for requests. \
             Emit data that takes time longer than its threshold.\n\
             {kinds} types of emit output with the following formats (unit: us):\n\n",
            options.sys_thres, options.rq_thres
        ),
    };
    banner.push_str(&format!("{}\n\n", columns.request_header()));
    banner.push_str(&format!("{}\n\n", columns.syscall_header()));
    if options.bio_events {
        banner.push_str(&format!("{}\n\n", bio_header()));
    }
    banner.push_str("Hit Ctrl-C to end and display histograms.\n\n");
    banner
}

const fn first(program: &'static str, hooks: &'static [&'static str]) -> ProbeSpec {
    ProbeSpec { program, hooks, policy: AttachPolicy::FirstAvailable }
}

const fn every(program: &'static str, hooks: &'static [&'static str]) -> ProbeSpec {
    ProbeSpec { program, hooks, policy: AttachPolicy::EveryAvailable }
}

const READ_PAGE_HOOKS: &[&str] =
    &["__do_page_cache_readahead", "do_page_cache_ra", "page_cache_ra_unbounded"];
const SUBMIT_HOOKS: &[&str] = &["submit_bio", "generic_make_request"];
const MERGE_HOOKS: &[&str] =
    &["bio_attempt_front_merge", "bio_attempt_back_merge", "bio_attempt_discard_merge"];

const READ_PATH: &[ProbeSpec] = &[
    first("vfs_read_entry", &["vfs_read"]),
    first("page_cache_entry", &["generic_file_read_iter"]),
    first("read_page_entry", READ_PAGE_HOOKS),
    first("ext4_read_page_entry", &["ext4_mpage_readpages"]),
];

const WRITE_PATH: &[ProbeSpec] = &[
    first("vfs_write_entry", &["vfs_write"]),
    first("ext4_write_entry", &["ext4_file_write_iter"]),
    first("write_page_entry", &["generic_perform_write"]),
    first("ext4_sync_entry", &["ext4_sync_file"]),
];

const SPLIT_PROBES: &[ProbeSpec] =
    &[first("split_entry", &["bio_split"]), first("split_return", &["bio_split"])];

const MERGE_PROBES: &[ProbeSpec] = &[
    first("front_merge_entry", &["bio_attempt_front_merge"]),
    first("back_merge_entry", &["bio_attempt_back_merge"]),
    first("discard_merge_entry", &["bio_attempt_discard_merge"]),
    every("merge_return", MERGE_HOOKS),
];

const BLOCK_PROBES: &[ProbeSpec] =
    &[first("block_entry", SUBMIT_HOOKS), first("block_return", SUBMIT_HOOKS)];

const REQUEST_PATH: &[ProbeSpec] = &[
    first("rq_create", &["blk_account_io_start", "__blk_account_io_start"]),
    every("rq_issue", &["blk_mq_start_request", "blk_start_request"]),
    first("rq_done", &["blk_account_io_done", "__blk_account_io_done"]),
];

const RQ_COMPLETION: ProbeSpec =
    first("rq_completion", &["blk_account_io_completion", "blk_account_io_done"]);

/// Full probe set of a syscall tool
///
/// The syscall return attaches last so no return can arrive for an entry
/// that was never captured.
fn syscall_probes(fs_path: &[ProbeSpec], direction: Direction) -> Vec<ProbeSpec> {
    let vfs_return = match direction {
        Direction::Read => first("vfs_read_return", &["vfs_read"]),
        Direction::Write => first("vfs_write_return", &["vfs_write"]),
    };
    let mut probes = [fs_path, BLOCK_PROBES, SPLIT_PROBES, MERGE_PROBES, REQUEST_PATH].concat();
    probes.push(vfs_return);
    probes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programs(tool: Tool) -> Vec<&'static str> {
        tool.probes().iter().map(|spec| spec.program).collect()
    }

    #[test]
    fn test_read_banner() {
        let banner = Tool::Read(TraceOptions::default()).banner();
        let mut lines = banner.lines();
        assert_eq!(
            lines.next(),
            Some("Tracing read I/Os. Time threshold: 1.0 ms for syscalls and 0.2 ms for requests. ")
        );
        assert_eq!(lines.next(), Some("2 types of emit output with the following formats:"));
        assert_eq!(lines.next(), Some(""));
        assert!(lines.next().is_some_and(|line| line.starts_with("[REQUEST]")));
        assert!(banner.ends_with("Hit Ctrl-C to end and display histograms.\n\n"));
    }

    #[test]
    fn test_write_banner_with_bio_events() {
        let options = TraceOptions { sys_thres: 5.0, rq_thres: 0.5, bio_events: true };
        let banner = Tool::SyncWrite(options).banner();
        assert!(banner.starts_with(
            "Tracing sync write I/Os. Time threshold: 5.0 ms for syscalls and 0.5 ms for requests. \
             Emit data that takes time longer than its threshold.\n\
             3 types of emit output with the following formats (unit: us):\n"
        ));
        assert!(banner.contains("[BIO]"));
    }

    #[test]
    fn test_split_merge_mode_selectors() {
        let all = programs(Tool::SplitMerge { split: false, merge: false });
        assert_eq!(all, programs(Tool::SplitMerge { split: true, merge: true }));
        assert!(all.contains(&"split_entry") && all.contains(&"merge_return"));

        let split_only = programs(Tool::SplitMerge { split: true, merge: false });
        assert_eq!(split_only, vec!["split_entry", "split_return"]);

        let merge_only = programs(Tool::SplitMerge { split: false, merge: true });
        assert!(!merge_only.contains(&"split_entry"));
        assert_eq!(merge_only.len(), 4);
    }

    #[test]
    fn test_histogram_titles_in_order() {
        let titles: Vec<_> =
            Tool::SyncWrite(TraceOptions::default()).histograms().iter().map(|(t, _)| t).collect();
        assert_eq!(
            titles,
            vec![
                "VFS (us)",
                "EXT4 (us)",
                "Write Page (us)",
                "EXT4 Sync (us)",
                "Block Entry (us)",
                "Bio Split (us)",
                "Bio Merge (us)",
                "Request Queue (us)",
                "Request Service (us)",
            ]
        );
        assert!(Tool::SplitMerge { split: false, merge: false }.histograms().is_empty());
    }

    #[test]
    fn test_syscall_return_attaches_last() {
        let read = programs(Tool::Read(TraceOptions::default()));
        assert_eq!(read.first(), Some(&"vfs_read_entry"));
        assert_eq!(read.last(), Some(&"vfs_read_return"));
        assert!(read.contains(&"rq_issue") && read.contains(&"block_return"));
        assert!(!read.contains(&"rq_completion"));
    }

    #[test]
    fn test_histogram_only_tools_are_silent() {
        assert_eq!(Tool::RqHist.row_layout(), RowLayout::Silent);
        assert_eq!(Tool::SizeHist.row_layout(), RowLayout::Silent);
        assert_eq!(Tool::SizeHist.session_config().syscalls, None);
        assert!(Tool::RqHist.session_config().unowned);
    }
}
