//! # Event Emitter
//!
//! Assembles immutable finalized records from correlation state and hands
//! them to the bounded transport read by the polling consumer.
//!
//! The producer never blocks. A full (or disconnected) transport drops the
//! record and bumps a drop counter that is reported at shutdown.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use ioflow_common::{BioRecord, RequestRecord, SyscallRecord, DISK_NAME_LEN, TASK_COMM_LEN};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::ThreadHandle;
use crate::pipeline::state::{
    BioState, Extent, FsDeltas, RequestState, RequestTiming, SyscallState,
};

/// A finalized record in transit
#[derive(Clone, Copy)]
pub enum OutputRecord {
    Syscall(SyscallRecord),
    Request(RequestRecord),
    Bio(BioRecord),
}

/// Emitted/dropped counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitterStats {
    pub emitted: u64,
    pub dropped: u64,
}

/// Producer half of the record transport
pub struct Emitter {
    tx: Sender<OutputRecord>,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

/// Create a transport holding at most `capacity` records
#[must_use]
pub fn transport(capacity: usize) -> (Emitter, Receiver<OutputRecord>) {
    let (tx, rx) = bounded(capacity);
    (Emitter { tx, emitted: AtomicU64::new(0), dropped: AtomicU64::new(0) }, rx)
}

/// Return-side facts of a split or merge call
#[derive(Debug, Clone, Copy)]
pub struct BioOutcome {
    pub ts: u64,
    pub out1: Extent,
    pub out2: Extent,
    pub disk_name: [u8; DISK_NAME_LEN],
    pub write: bool,
    pub comm: [u8; TASK_COMM_LEN],
}

impl Emitter {
    /// Finalize a syscall returning at `end` with `size` bytes
    pub fn emit_syscall(
        &self,
        thread: ThreadHandle,
        state: &SyscallState,
        end: u64,
        size: i64,
        fs: FsDeltas,
        comm: [u8; TASK_COMM_LEN],
    ) -> bool {
        let last_split = state.last_split.unwrap_or_default();
        #[allow(clippy::cast_possible_truncation)]
        let split_len = last_split.len as u32;
        let record = SyscallRecord {
            pid: thread.pid().0,
            seq_num: state.seq.0,
            direction: state.direction.as_wire(),
            cnt_blk: state.cnt_blk,
            cnt_split: state.split.count,
            cnt_merge: state.merge.count,
            fs,
            blk: state.blk.total,
            split: state.split.total,
            merge: state.merge.total,
            total: end.saturating_sub(state.started()),
            ts_vfs: state.started(),
            ts_blk_start: state.blk.start.unwrap_or(0),
            ts_blk_end: state.blk.end.unwrap_or(0),
            ts_split_start: state.split.start.unwrap_or(0),
            ts_split_end: state.split.end.unwrap_or(0),
            ts_merge_start: state.merge.start.unwrap_or(0),
            ts_merge_end: state.merge.end.unwrap_or(0),
            split_sector: last_split.sector,
            offset: state.offset,
            size,
            split_len,
            _padding: [0; 4],
            file_name: state.file_name,
            cmd_name: comm,
        };
        self.send(OutputRecord::Syscall(record))
    }

    /// Finalize a completed request
    pub fn emit_request(&self, state: &RequestState, timing: RequestTiming) -> bool {
        #[allow(clippy::cast_possible_truncation)]
        let record = RequestRecord {
            pid: state.pid.0,
            seq_num: state.seq.0,
            ts_create: state.created().saturating_sub(state.syscall_started),
            queue: timing.queue,
            service: timing.service,
            sector: state.extent.sector,
            len: state.extent.len as u32,
            _padding: [0; 4],
            disk_name: state.disk_name,
        };
        self.send(OutputRecord::Request(record))
    }

    /// Finalize a split or merge call
    pub fn emit_bio(&self, state: &BioState, outcome: &BioOutcome) -> bool {
        let record = BioRecord {
            ts: state.entered,
            latency: outcome.ts.saturating_sub(state.entered),
            in_sector: state.input.sector,
            in_len: state.input.len,
            out_sector1: outcome.out1.sector,
            out_len1: outcome.out1.len,
            out_sector2: outcome.out2.sector,
            out_len2: outcome.out2.len,
            pid: state.pid.0,
            seq_num: state.seq.0,
            rwflag: u8::from(outcome.write),
            kind: state.kind.as_wire(),
            _padding: [0; 6],
            disk_name: outcome.disk_name,
            cmd_name: outcome.comm,
        };
        self.send(OutputRecord::Bio(record))
    }

    fn send(&self, record: OutputRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::{Stage, StageTimestamps};
    use crate::domain::{BioKind, Pid, SequenceNumber};
    use crate::pipeline::state::Phase;

    fn request() -> RequestState {
        let mut stamps = StageTimestamps::default();
        stamps.set(Stage::RequestCreate, 1_500);
        RequestState {
            pid: Pid(7),
            seq: SequenceNumber(3),
            syscall_started: 1_000,
            phase: Phase::Queued,
            stamps,
            extent: Extent::new(2048, 4096),
            disk_name: [0; DISK_NAME_LEN],
        }
    }

    #[test]
    fn test_full_transport_drops_and_counts() {
        let (emitter, rx) = transport(1);
        let timing = RequestTiming { queue: 10, service: 20 };

        assert!(emitter.emit_request(&request(), timing));
        assert!(!emitter.emit_request(&request(), timing));
        assert_eq!(emitter.stats(), EmitterStats { emitted: 1, dropped: 1 });

        match rx.try_recv() {
            Ok(OutputRecord::Request(record)) => {
                assert_eq!(record.ts_create, 500);
                assert_eq!(record.seq_num, 3);
                assert_eq!(record.queue + record.service, 30);
            }
            _ => panic!("expected a request record"),
        }
    }

    #[test]
    fn test_disconnected_transport_counts_drop() {
        let (emitter, rx) = transport(4);
        drop(rx);
        assert!(!emitter.emit_request(&request(), RequestTiming { queue: 0, service: 0 }));
        assert_eq!(emitter.stats().dropped, 1);
    }

    #[test]
    fn test_bio_record_latency() {
        let (emitter, rx) = transport(1);
        let state = BioState {
            kind: BioKind::Split,
            pid: Pid(9),
            seq: SequenceNumber(1),
            bio: crate::domain::ObjectHandle(0x10),
            input: Extent::new(0, 8192),
            entered: 100,
        };
        let outcome = BioOutcome {
            ts: 160,
            out1: Extent::new(0, 4096),
            out2: Extent::new(8, 4096),
            disk_name: [0; DISK_NAME_LEN],
            write: true,
            comm: [0; TASK_COMM_LEN],
        };
        assert!(emitter.emit_bio(&state, &outcome));
        match rx.try_recv() {
            Ok(OutputRecord::Bio(record)) => {
                assert_eq!(record.latency, 60);
                assert_eq!(record.rwflag, 1);
                assert_eq!(record.kind, ioflow_common::BIO_SPLIT);
            }
            _ => panic!("expected a bio record"),
        }
    }
}
