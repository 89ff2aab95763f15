//! Per-identity correlation state held in the session keystores

use ioflow_common::{DISK_NAME_LEN, DNAME_INLINE_LEN};

use crate::correlation::{Stage, StageTimestamps};
use crate::domain::{BioKind, Direction, ObjectHandle, Pid, SequenceNumber};
use crate::histogram::Metric;

/// Position of a logical I/O along the block path
///
/// Phases only move forward. A stage firing out of order leaves the phase
/// where it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Phase {
    #[default]
    Opened,
    Filesystem,
    AtBlockLayer,
    Splitting,
    Merging,
    Queued,
    Issued,
    Completed,
}

impl Phase {
    pub fn advance(&mut self, to: Phase) {
        if to > *self {
            *self = to;
        }
    }
}

/// Sector range of a bio or request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    pub sector: u64,
    /// Length in bytes
    pub len: u64,
}

impl Extent {
    #[must_use]
    pub fn new(sector: u64, len: u64) -> Self {
        Self { sector, len }
    }

    /// What is left of `self` once `head` has been split off its front
    #[must_use]
    pub fn remainder_after(self, head: Extent) -> Extent {
        Extent { sector: self.sector + (head.len >> 9), len: self.len.saturating_sub(head.len) }
    }
}

/// Accumulated time spent in a stage that may fire several times per syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    /// First entry
    pub start: Option<u64>,
    /// Most recent return
    pub end: Option<u64>,
    /// Sum of `return - entry`
    pub total: u64,
    /// Number of entries
    pub count: u32,
}

impl Window {
    pub fn open(&mut self, ts: u64) {
        self.start.get_or_insert(ts);
        self.count += 1;
    }

    /// Close one entry/return pair, returning its latency
    pub fn close(&mut self, entered: u64, ts: u64) -> u64 {
        let latency = ts.saturating_sub(entered);
        self.total += latency;
        self.end = Some(ts);
        latency
    }
}

/// Filesystem stage latencies in column order
///
/// - read: vfs, page cache, read page, ext4 read page
/// - write: vfs, ext4, write page, ext4 sync
pub type FsDeltas = [u64; 4];

impl Direction {
    /// Histograms fed by the four [`FsDeltas`] columns
    #[must_use]
    pub fn fs_metrics(self) -> [Metric; 4] {
        match self {
            Direction::Read => [Metric::Vfs, Metric::PageCache, Metric::ReadPage, Metric::Ext4ReadPage],
            Direction::Write => [Metric::Vfs, Metric::Ext4, Metric::WritePage, Metric::Ext4Sync],
        }
    }
}

/// Syscall scope: one traced `read()`/`write()`
#[derive(Debug, Clone)]
pub struct SyscallState {
    pub direction: Direction,
    pub seq: SequenceNumber,
    pub phase: Phase,
    pub stamps: StageTimestamps,
    pub offset: i64,
    pub file_name: [u8; DNAME_INLINE_LEN],
    pub blk: Window,
    pub split: Window,
    pub merge: Window,
    /// Requests created on behalf of this syscall
    pub cnt_blk: u32,
    /// Output of the most recent split
    pub last_split: Option<Extent>,
}

impl SyscallState {
    #[must_use]
    pub fn new(
        direction: Direction,
        seq: SequenceNumber,
        ts: u64,
        offset: i64,
        file_name: [u8; DNAME_INLINE_LEN],
    ) -> Self {
        let mut stamps = StageTimestamps::default();
        stamps.set(Stage::Vfs, ts);
        Self {
            direction,
            seq,
            phase: Phase::Opened,
            stamps,
            offset,
            file_name,
            blk: Window::default(),
            split: Window::default(),
            merge: Window::default(),
            cnt_blk: 0,
            last_split: None,
        }
    }

    /// Syscall entry timestamp
    #[must_use]
    pub fn started(&self) -> u64 {
        self.stamps.get_or_zero(Stage::Vfs)
    }

    /// Filesystem deltas at syscall return `end`
    ///
    /// `None` when the syscall never took the buffered path: reads without a
    /// page cache lookup, writes without both ext4 and write page stamps.
    #[must_use]
    pub fn fs_deltas(&self, end: u64) -> Option<FsDeltas> {
        match self.direction {
            Direction::Read => self.read_deltas(end),
            Direction::Write => self.write_deltas(end),
        }
    }

    fn read_deltas(&self, end: u64) -> Option<FsDeltas> {
        let vfs_ts = self.started();
        let pgcache_ts = self.stamps.get(Stage::PageCache)?;
        let readpg_ts = self.stamps.get_or_zero(Stage::ReadPage);
        let ext4readpg_ts = self.stamps.get_or_zero(Stage::Ext4ReadPage);
        let blk_start = self.blk.start.unwrap_or(0);

        let vfs = if pgcache_ts > vfs_ts {
            pgcache_ts - vfs_ts
        } else {
            // Direct I/O falls straight through to the block layer
            blk_start.saturating_sub(vfs_ts)
        };

        let pgcache = if readpg_ts > pgcache_ts {
            readpg_ts - pgcache_ts
        } else if blk_start > pgcache_ts {
            blk_start - pgcache_ts
        } else {
            end.saturating_sub(pgcache_ts)
        };

        let readpg = if readpg_ts != 0 && ext4readpg_ts > readpg_ts {
            ext4readpg_ts - readpg_ts
        } else {
            0
        };

        let ext4readpg = if ext4readpg_ts != 0 && blk_start > ext4readpg_ts {
            blk_start - ext4readpg_ts
        } else {
            0
        };

        Some([vfs, pgcache, readpg, ext4readpg])
    }

    fn write_deltas(&self, end: u64) -> Option<FsDeltas> {
        let vfs_ts = self.started();
        let ext4_ts = self.stamps.get(Stage::Ext4Write)?;
        let writepg_ts = self.stamps.get(Stage::WritePage)?;
        let sync_ts = self.stamps.get_or_zero(Stage::Ext4Sync);
        let blk_start = self.blk.start.unwrap_or(0);

        let vfs = ext4_ts.saturating_sub(vfs_ts);
        let ext4 = writepg_ts.saturating_sub(ext4_ts);
        let writepg = if sync_ts > writepg_ts {
            sync_ts - writepg_ts
        } else {
            end.saturating_sub(writepg_ts)
        };

        // Async writes never reach ext4_sync_file
        let ext4sync = if sync_ts == 0 {
            0
        } else if blk_start > sync_ts {
            blk_start - sync_ts
        } else {
            end.saturating_sub(sync_ts)
        };

        Some([vfs, ext4, writepg, ext4sync])
    }
}

/// Request scope: one block-layer request
#[derive(Debug, Clone)]
pub struct RequestState {
    /// Process of the submitting context
    pub pid: Pid,
    pub seq: SequenceNumber,
    /// Entry time of the owning syscall (creation time when unowned)
    pub syscall_started: u64,
    pub phase: Phase,
    pub stamps: StageTimestamps,
    pub extent: Extent,
    pub disk_name: [u8; DISK_NAME_LEN],
}

/// Queue and service time of a completed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTiming {
    pub queue: u64,
    pub service: u64,
}

impl RequestState {
    #[must_use]
    pub fn created(&self) -> u64 {
        self.stamps.get_or_zero(Stage::RequestCreate)
    }

    /// Split `done - create` at the issue stamp
    ///
    /// A request that was never seen being issued counts entirely as service.
    #[must_use]
    pub fn timing(&self, done: u64) -> RequestTiming {
        let created = self.created();
        match self.stamps.get(Stage::RequestIssue) {
            Some(issued) => RequestTiming {
                queue: issued.saturating_sub(created),
                service: done.saturating_sub(issued),
            },
            None => RequestTiming { queue: 0, service: done.saturating_sub(created) },
        }
    }
}

/// Bio scope: one in-flight split or merge call
#[derive(Debug, Clone)]
pub struct BioState {
    pub kind: BioKind,
    pub pid: Pid,
    pub seq: SequenceNumber,
    /// Input bio
    pub bio: ObjectHandle,
    pub input: Extent,
    pub entered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_state(vfs: u64) -> SyscallState {
        SyscallState::new(Direction::Read, SequenceNumber(1), vfs, 0, [0; DNAME_INLINE_LEN])
    }

    fn write_state(vfs: u64) -> SyscallState {
        SyscallState::new(Direction::Write, SequenceNumber(1), vfs, 0, [0; DNAME_INLINE_LEN])
    }

    #[test]
    fn test_phase_never_regresses() {
        let mut phase = Phase::Opened;
        phase.advance(Phase::Queued);
        phase.advance(Phase::Splitting);
        assert_eq!(phase, Phase::Queued);
        phase.advance(Phase::Completed);
        assert_eq!(phase, Phase::Completed);
    }

    #[test]
    fn test_window_accumulates() {
        let mut window = Window::default();
        window.open(100);
        assert_eq!(window.close(100, 130), 30);
        window.open(200);
        assert_eq!(window.close(200, 205), 5);

        assert_eq!(window.start, Some(100));
        assert_eq!(window.end, Some(205));
        assert_eq!(window.total, 35);
        assert_eq!(window.count, 2);
    }

    #[test]
    fn test_extent_remainder() {
        let input = Extent::new(2048, 1_048_576);
        let head = Extent::new(2048, 131_072);
        assert_eq!(input.remainder_after(head), Extent::new(2048 + 256, 917_504));
    }

    #[test]
    fn test_read_deltas_page_cache_hit() {
        let mut state = read_state(1_000);
        state.stamps.set(Stage::PageCache, 1_400);
        assert_eq!(state.fs_deltas(3_000), Some([400, 1_600, 0, 0]));
    }

    #[test]
    fn test_read_deltas_full_path() {
        let mut state = read_state(1_000);
        state.stamps.set(Stage::PageCache, 1_100);
        state.stamps.set(Stage::ReadPage, 1_300);
        state.stamps.set(Stage::Ext4ReadPage, 1_600);
        state.blk.open(2_000);
        assert_eq!(state.fs_deltas(9_000), Some([100, 200, 300, 400]));
    }

    #[test]
    fn test_read_without_page_cache_is_discarded() {
        let state = read_state(1_000);
        assert_eq!(state.fs_deltas(2_000), None);
    }

    #[test]
    fn test_write_deltas_sync() {
        let mut state = write_state(1_000);
        state.stamps.set(Stage::Ext4Write, 1_050);
        state.stamps.set(Stage::WritePage, 1_250);
        state.stamps.set(Stage::Ext4Sync, 2_000);
        state.blk.open(2_600);
        assert_eq!(state.fs_deltas(10_000), Some([50, 200, 750, 600]));
    }

    #[test]
    fn test_write_deltas_async() {
        let mut state = write_state(1_000);
        state.stamps.set(Stage::Ext4Write, 1_010);
        state.stamps.set(Stage::WritePage, 1_020);
        assert_eq!(state.fs_deltas(1_500), Some([10, 10, 480, 0]));
    }

    #[test]
    fn test_write_missing_stamps_is_discarded() {
        let mut state = write_state(1_000);
        state.stamps.set(Stage::Ext4Write, 1_010);
        assert_eq!(state.fs_deltas(1_500), None);
    }

    #[test]
    fn test_request_timing() {
        let mut state = RequestState {
            pid: Pid(1),
            seq: SequenceNumber(1),
            syscall_started: 0,
            phase: Phase::Queued,
            stamps: StageTimestamps::default(),
            extent: Extent::default(),
            disk_name: [0; DISK_NAME_LEN],
        };
        state.stamps.set(Stage::RequestCreate, 100);
        assert_eq!(state.timing(400), RequestTiming { queue: 0, service: 300 });

        state.stamps.set(Stage::RequestIssue, 150);
        assert_eq!(state.timing(400), RequestTiming { queue: 50, service: 250 });
    }
}
