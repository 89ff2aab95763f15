//! Fixed-column row and histogram rendering
//!
//! Column widths, precisions and labels reproduce the printf layouts of the
//! classic ioflow, biosplitmerge, blkrqhist and bitehist tools so existing
//! parsers of their output keep working.

use std::io::{self, Write};

use super::event::{BioEvent, Event, IoEvent, RequestEvent};
use crate::domain::{ns_to_us_f64, Direction};
use crate::histogram::{HistogramSet, Scale};

/// Labels and widths of the four filesystem columns of a syscall row
///
/// The same widths are reused by the request row for its create, queue,
/// service and sector columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallColumns {
    pub labels: [&'static str; 4],
    pub widths: [usize; 4],
}

impl SyscallColumns {
    pub const READ: SyscallColumns = SyscallColumns {
        labels: ["VFS_LAT", "PGCACHE_LAT", "READPG_LAT", "EXT4READPG_LAT"],
        widths: [9, 11, 10, 14],
    };

    pub const WRITE: SyscallColumns = SyscallColumns {
        labels: ["VFS_LAT", "EXT4_LAT", "WRITEPG_LAT", "EXT4SYNC_LAT"],
        widths: [9, 9, 11, 12],
    };

    #[must_use]
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Read => Self::READ,
            Direction::Write => Self::WRITE,
        }
    }

    /// `[REQUEST]` column header
    #[must_use]
    pub fn request_header(&self) -> String {
        let [w0, w1, w2, w3] = self.widths;
        format!(
            "[REQUEST] {:>6} {:>6} {:>9} {:>w0$} {:>w1$} {:>w2$} {:>w3$} {:>8} {:>6}",
            "PID", "IO_NUM", "TOTAL_LAT", "CREATE_TS", "QUEUE_LAT", "SERV_LAT", "SECTOR", "LEN", "DISK"
        )
    }

    /// `[SYSCALL]` column header
    #[must_use]
    pub fn syscall_header(&self) -> String {
        let [w0, w1, w2, w3] = self.widths;
        let [l0, l1, l2, l3] = self.labels;
        format!(
            "[SYSCALL] {:>6} {:>6} {:>9} {l0:>w0$} {l1:>w1$} {l2:>w2$} {l3:>w3$} {:>9} {:>8} {:>8} {:>5} \
             {:>11} {:>9} {:>9} {:>5} {:>11} {:>9} {:>9} {:>5} {:>10} {:>8} {:>8} {:>6}",
            "PID",
            "IO_NUM",
            "TOTAL_LAT",
            "BLK_START",
            "BLK_LAT",
            "BLK_END",
            "COUNT",
            "SPLIT_START",
            "SPLIT_LAT",
            "SPLIT_END",
            "COUNT",
            "MERGE_START",
            "MERGE_LAT",
            "MERGE_END",
            "COUNT",
            "COMMAND",
            "OFFSET",
            "SIZE",
            "FILE"
        )
    }
}

/// `[BIO]` column header (split/merge rows under their owning syscall)
#[must_use]
pub fn bio_header() -> String {
    format!(
        "[BIO]     {:>6} {:>6} {:<13} {:>10} {:>10} {:>10} {:>10}",
        "PID", "IO_NUM", "EVENT", "IN-SECTOR", "IN-BYTES", "OUT-SECTOR", "OUT-BYTES"
    )
}

/// Column header of the split/merge tool
#[must_use]
pub fn split_merge_header() -> String {
    format!(
        "{:<11} {:<13} {:<14} {:<6} {:<7} {:<1} {:>10} {:>10} {:>10} {:>10}",
        "TIME(s)",
        "EVENT",
        "COMMAND",
        "PID",
        "DISK",
        "T",
        "IN-SECTOR",
        "IN-BYTES",
        "OUT-SECTOR",
        "OUT-BYTES"
    )
}

/// Which rows a tool prints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLayout {
    /// `[SYSCALL]` and `[REQUEST]` rows, plus `[BIO]` rows when enabled
    Syscalls { columns: SyscallColumns, bio_rows: bool },
    /// One row per split or merge, timestamped from the first one seen
    SplitMerge,
    /// Histogram-only tools
    Silent,
}

/// Turns decoded events into rows
#[derive(Debug)]
pub struct Renderer {
    layout: RowLayout,
    first_bio_ts: Option<u64>,
}

impl Renderer {
    #[must_use]
    pub fn new(layout: RowLayout) -> Self {
        Self { layout, first_bio_ts: None }
    }

    #[must_use]
    pub fn layout(&self) -> RowLayout {
        self.layout
    }

    /// Row for `event`, `None` when the layout has no row for it
    pub fn render(&mut self, event: &Event) -> Option<String> {
        match (self.layout, event) {
            (RowLayout::Syscalls { columns, .. }, Event::Io(io)) => Some(syscall_row(&columns, io)),
            (RowLayout::Syscalls { columns, .. }, Event::Request(rq)) => {
                Some(request_row(&columns, rq))
            }
            (RowLayout::Syscalls { bio_rows: true, .. }, Event::Bio(bio)) => Some(bio_row(bio)),
            (RowLayout::SplitMerge, Event::Bio(bio)) => {
                let first = *self.first_bio_ts.get_or_insert(bio.ts);
                Some(split_merge_row(first, bio))
            }
            _ => None,
        }
    }
}

/// `[SYSCALL]` row; latencies and window timestamps in microseconds
#[must_use]
pub fn syscall_row(columns: &SyscallColumns, io: &IoEvent) -> String {
    let [w0, w1, w2, w3] = columns.widths;
    let [f0, f1, f2, f3] = io.fs.map(ns_to_us_f64);
    format!(
        "[SYSCALL] {:>6} {:>6} {:9.3} {f0:w0$.3} {f1:w1$.3} {f2:w2$.3} {f3:w3$.3} {:9.3} {:8.3} {:8.3} {:>5} \
         {:11.3} {:9.3} {:9.3} {:>5} {:11.3} {:9.3} {:9.3} {:>5} {:>10} {:>8} {:>8} {:>6}",
        io.pid.0,
        io.seq.0,
        ns_to_us_f64(io.total),
        ns_to_us_f64(io.blk.start),
        ns_to_us_f64(io.blk.latency),
        ns_to_us_f64(io.blk.end),
        io.blk.count,
        ns_to_us_f64(io.split.start),
        ns_to_us_f64(io.split.latency),
        ns_to_us_f64(io.split.end),
        io.split.count,
        ns_to_us_f64(io.merge.start),
        ns_to_us_f64(io.merge.latency),
        ns_to_us_f64(io.merge.end),
        io.merge.count,
        io.comm,
        io.offset,
        io.size,
        io.file_name
    )
}

/// `[REQUEST]` row; total is queue plus service
#[must_use]
pub fn request_row(columns: &SyscallColumns, rq: &RequestEvent) -> String {
    let [w0, w1, w2, w3] = columns.widths;
    format!(
        "[REQUEST] {:>6} {:>6} {:9.3} {:w0$.3} {:w1$.3} {:w2$.3} {:>w3$} {:>8} {:>6}",
        rq.pid.0,
        rq.seq.0,
        ns_to_us_f64(rq.total()),
        ns_to_us_f64(rq.ts_create),
        ns_to_us_f64(rq.queue),
        ns_to_us_f64(rq.service),
        rq.extent.sector,
        rq.extent.len,
        rq.disk_name
    )
}

/// `[BIO]` row tagged with the owning sequence number
#[must_use]
pub fn bio_row(bio: &BioEvent) -> String {
    format!(
        "[BIO]     {:>6} {:>6} {:<13} {:>10} {:>10} {:>10} {:>10}",
        bio.pid.0,
        bio.seq.0,
        bio.kind.label(),
        bio.input.sector,
        bio.input.len,
        bio.out1.sector,
        bio.out1.len
    )
}

/// Split/merge tool row, time in seconds since `first_ts`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn split_merge_row(first_ts: u64, bio: &BioEvent) -> String {
    let secs = bio.ts.saturating_sub(first_ts) as f64 / 1_000_000_000.0;
    let rw = if bio.write { "W" } else { "R" };
    format!(
        "{:<11.4} {:<13} {:<14.14} {:<6} {:<7} {:<1} {:>10} {:>10} {:>10} {:>10}",
        secs,
        bio.kind.label(),
        bio.comm,
        bio.pid.0,
        bio.disk_name,
        rw,
        bio.input.sector,
        bio.input.len,
        bio.out1.sector,
        bio.out1.len
    )
}

/// How the final histograms are laid out at shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistogramLayout {
    /// Every histogram, each preceded by a blank line
    Stacked,
    /// Two histograms separated by two blank lines
    RequestPair,
    /// Log2 then linear, each under a captioned rule
    SizePair,
    None,
}

impl HistogramLayout {
    /// Write the final render of `set` to `out`
    ///
    /// # Errors
    /// Propagates write errors from `out`
    pub fn write_histograms(self, set: &HistogramSet, out: &mut impl Write) -> io::Result<()> {
        match self {
            HistogramLayout::None => {}
            HistogramLayout::Stacked => {
                for (title, histogram) in set.iter() {
                    writeln!(out)?;
                    out.write_all(histogram.render(title).as_bytes())?;
                }
            }
            HistogramLayout::RequestPair => {
                writeln!(out)?;
                for (idx, (title, histogram)) in set.iter().enumerate() {
                    if idx > 0 {
                        write!(out, "\n\n")?;
                    }
                    out.write_all(histogram.render(title).as_bytes())?;
                }
            }
            HistogramLayout::SizePair => {
                writeln!(out)?;
                for (idx, (title, histogram)) in set.iter().enumerate() {
                    let caption = match histogram.scale() {
                        Scale::Log2 => "log2 histogram",
                        Scale::Linear { .. } => "linear histogram",
                    };
                    if idx > 0 {
                        writeln!(out)?;
                    }
                    writeln!(out, "{caption}")?;
                    writeln!(out, "{}", "~".repeat(caption.len()))?;
                    out.write_all(histogram.render(title).as_bytes())?;
                }
            }
        }
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::event::StageWindow;
    use crate::domain::{BioKind, Pid, SequenceNumber};
    use crate::histogram::{Histogram, Metric};
    use crate::pipeline::Extent;

    fn bio(ts: u64) -> BioEvent {
        BioEvent {
            ts,
            latency: 3_000,
            kind: BioKind::BackMerge,
            pid: Pid(812),
            seq: SequenceNumber(4),
            write: true,
            input: Extent::new(2048, 4096),
            out1: Extent::new(2040, 8192),
            out2: Extent::default(),
            disk_name: "sda".to_string(),
            comm: "postgres-writer-long".to_string(),
        }
    }

    #[test]
    fn test_read_headers() {
        assert_eq!(
            SyscallColumns::READ.request_header(),
            "[REQUEST]    PID IO_NUM TOTAL_LAT CREATE_TS   QUEUE_LAT   SERV_LAT         SECTOR      LEN   DISK"
        );
        assert!(SyscallColumns::READ
            .syscall_header()
            .starts_with("[SYSCALL]    PID IO_NUM TOTAL_LAT   VFS_LAT PGCACHE_LAT READPG_LAT EXT4READPG_LAT"));
    }

    #[test]
    fn test_write_request_row() {
        let rq = RequestEvent {
            pid: Pid(1234),
            seq: SequenceNumber(7),
            ts_create: 12_500,
            queue: 1_250,
            service: 250_000,
            extent: Extent::new(123_456, 4096),
            disk_name: "sda".to_string(),
        };
        assert_eq!(
            request_row(&SyscallColumns::WRITE, &rq),
            "[REQUEST]   1234      7   251.250    12.500     1.250     250.000       123456     4096    sda"
        );
    }

    #[test]
    fn test_syscall_row_zero_block_columns() {
        let io = IoEvent {
            pid: Pid(42),
            seq: SequenceNumber(1),
            direction: Direction::Read,
            total: 8_000,
            fs: [2_000, 6_000, 0, 0],
            blk: StageWindow::default(),
            split: StageWindow::default(),
            merge: StageWindow::default(),
            last_split: Extent::default(),
            offset: 0,
            size: 4096,
            comm: "cat".to_string(),
            file_name: "notes".to_string(),
        };
        assert_eq!(
            syscall_row(&SyscallColumns::READ, &io),
            "[SYSCALL]     42      1     8.000     2.000       6.000      0.000          0.000     0.000    0.000    0.000     0       0.000     0.000     0.000     0       0.000     0.000     0.000     0        cat        0     4096  notes"
        );
    }

    #[test]
    fn test_split_merge_rows_relative_to_first() {
        let mut renderer = Renderer::new(RowLayout::SplitMerge);
        let first = renderer.render(&Event::Bio(bio(5_000_000_000))).unwrap();
        let second = renderer.render(&Event::Bio(bio(6_250_000_000))).unwrap();

        assert_eq!(
            first,
            "0.0000      Back Merge    postgres-write 812    sda     W       2048       4096       2040       8192"
        );
        assert!(second.starts_with("1.2500      Back Merge"));
    }

    #[test]
    fn test_bio_rows_only_when_enabled() {
        let columns = SyscallColumns::WRITE;
        let mut quiet = Renderer::new(RowLayout::Syscalls { columns, bio_rows: false });
        assert_eq!(quiet.render(&Event::Bio(bio(1))), None);

        let mut verbose = Renderer::new(RowLayout::Syscalls { columns, bio_rows: true });
        assert_eq!(
            verbose.render(&Event::Bio(bio(1))).as_deref(),
            Some("[BIO]        812      4 Back Merge          2048       4096       2040       8192")
        );
    }

    #[test]
    fn test_size_pair_layout() {
        let set = HistogramSet::new()
            .with(Metric::IoSize, "kbytes", Histogram::log2())
            .with(Metric::IoSizeLinear, "kbytes", Histogram::linear(4));
        set.record(Metric::IoSize, 1);
        set.record(Metric::IoSizeLinear, 1);

        let mut out = Vec::new();
        HistogramLayout::SizePair.write_histograms(&set, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("\nlog2 histogram\n~~~~~~~~~~~~~~\n     kbytes "));
        assert!(text.contains("\nlinear histogram\n~~~~~~~~~~~~~~~~\n     kbytes        : count"));
    }
}
