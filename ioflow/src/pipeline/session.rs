//! # Stage Pipeline Session
//!
//! Explicit, session-scoped correlation state. A [`Session`] owns the three
//! identity keystores, the sequence correlator and the histograms, and turns
//! the stream of [`ProbeEvent`]s into finalized records through the
//! [`Emitter`].
//!
//! ## Identity scopes
//!
//! - **syscall**: keyed by thread, opened at VFS entry, closed at VFS return
//! - **bio**: keyed by thread, one in-flight split or merge call between its
//!   entry and return probes
//! - **request**: keyed by request pointer, opened at creation, closed at done
//!
//! Every close path deletes its entry. A stage whose identity has no live
//! entry, or that closes a stage which never opened (checked against the
//! entry's [`Phase`]), is a correlation gap: counted, traced, never fatal.

use log::trace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::probe_event::{ProbeEvent, ProbeKind};
use super::state::{BioState, Extent, Phase, RequestState, SyscallState};
use crate::correlation::{Keystore, SequenceCorrelator, Stage, StageTimestamps, TokenAllocator};
use crate::domain::{
    ns_to_us, BioKind, CorrelationGap, Direction, ObjectHandle, SequenceNumber, ThreadHandle,
};
use crate::emitter::{BioOutcome, Emitter, EmitterStats};
use crate::histogram::{HistogramSet, Metric};

/// Which records a session correlates and emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Syscall direction to correlate, `None` for tools without syscall rows
    pub syscalls: Option<Direction>,
    /// Emit a record for every completed request
    pub request_records: bool,
    /// Emit a record for every completed split or merge
    pub bio_records: bool,
    /// Track requests and bios that no traced syscall owns (sequence 0)
    pub unowned: bool,
}

/// Counters kept by a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Probe events handled
    pub events: u64,
    /// Stages whose identity had no live entry
    pub gaps: u64,
    /// Syscalls that never took the buffered path
    pub discarded: u64,
    pub emitter: EmitterStats,
}

/// Explicit correlation state for one tracing session
pub struct Session {
    config: SessionConfig,
    syscalls: Keystore<ThreadHandle, SyscallState>,
    bios: Keystore<ThreadHandle, BioState>,
    requests: Keystore<ObjectHandle, RequestState>,
    sequences: SequenceCorrelator,
    histograms: Arc<HistogramSet>,
    emitter: Emitter,
    events: AtomicU64,
    gaps: AtomicU64,
    discarded: AtomicU64,
}

impl Session {
    #[must_use]
    pub fn new(config: SessionConfig, histograms: Arc<HistogramSet>, emitter: Emitter) -> Self {
        let tokens = Arc::new(TokenAllocator::new());
        Self {
            config,
            syscalls: Keystore::new("syscall", Arc::clone(&tokens)),
            bios: Keystore::new("bio", Arc::clone(&tokens)),
            requests: Keystore::new("request", tokens),
            sequences: SequenceCorrelator::new(),
            histograms,
            emitter,
            events: AtomicU64::new(0),
            gaps: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> SessionConfig {
        self.config
    }

    #[must_use]
    pub fn histograms(&self) -> &HistogramSet {
        &self.histograms
    }

    /// Live entries per scope: (syscall, bio, request)
    #[must_use]
    pub fn in_flight(&self) -> (usize, usize, usize) {
        (self.syscalls.len(), self.bios.len(), self.requests.len())
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            events: self.events.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            emitter: self.emitter.stats(),
        }
    }

    /// Drop all correlation state and zero the histograms
    pub fn reset(&self) {
        self.syscalls.clear();
        self.bios.clear();
        self.requests.clear();
        self.sequences.reset();
        self.histograms.reset();
    }

    /// Advance the state machine with one probe firing
    pub fn handle(&self, event: &ProbeEvent) {
        self.events.fetch_add(1, Ordering::Relaxed);
        let ts = event.ts;
        let thread = event.thread;

        let result = match &event.kind {
            ProbeKind::VfsEntry { direction, offset, file_name } => {
                if self.tracks(*direction) {
                    let seq = self.sequences.next(thread.pid());
                    self.syscalls.open(
                        thread,
                        SyscallState::new(*direction, seq, ts, *offset, *file_name),
                    );
                }
                Ok(())
            }
            ProbeKind::Filesystem(stage) => self
                .syscalls
                .update(thread, |state| {
                    state.stamps.set(*stage, ts);
                    state.phase.advance(Phase::Filesystem);
                })
                .map_err(CorrelationGap::from),
            ProbeKind::BlockEntry => self
                .syscalls
                .update(thread, |state| {
                    state.stamps.set(Stage::BlockEntry, ts);
                    state.blk.open(ts);
                    state.phase.advance(Phase::AtBlockLayer);
                })
                .map_err(CorrelationGap::from),
            ProbeKind::BlockReturn => self.block_return(thread, ts),
            ProbeKind::SplitEntry { bio, extent } => {
                self.bio_entry(thread, BioKind::Split, *bio, *extent, ts)
            }
            ProbeKind::SplitReturn { split, extent, disk_name, write } => {
                self.split_return(event, *split, *extent, *disk_name, *write)
            }
            ProbeKind::MergeEntry { bio, kind, extent } => {
                self.bio_entry(thread, *kind, *bio, *extent, ts)
            }
            ProbeKind::MergeReturn { merged, extent, disk_name, write, .. } => {
                self.merge_return(event, *merged, *extent, *disk_name, *write)
            }
            ProbeKind::RequestCreate { request, extent, disk_name, .. } => {
                self.request_create(thread, *request, *extent, *disk_name, ts)
            }
            ProbeKind::RequestIssue { request } => self
                .requests
                .update(*request, |state| {
                    state.stamps.set(Stage::RequestIssue, ts);
                    state.phase.advance(Phase::Issued);
                })
                .map_err(CorrelationGap::from),
            ProbeKind::RequestDone { request } => self.request_done(*request, ts),
            ProbeKind::RequestCompletion { len, .. } => {
                self.histograms.record(Metric::IoSize, len / 1024);
                self.histograms.record(Metric::IoSizeLinear, len / 1024);
                Ok(())
            }
            ProbeKind::VfsReturn { direction, size } => {
                if self.tracks(*direction) {
                    self.vfs_return(event, *size)
                } else {
                    Ok(())
                }
            }
        };

        if let Err(gap) = result {
            self.gaps.fetch_add(1, Ordering::Relaxed);
            trace!("{gap}");
        }
    }

    fn tracks(&self, direction: Direction) -> bool {
        self.config.syscalls == Some(direction)
    }

    /// Sequence for a bio or request no traced syscall owns
    fn unowned(&self) -> Option<SequenceNumber> {
        if self.config.unowned {
            Some(SequenceNumber::UNOWNED)
        } else {
            None
        }
    }

    fn block_return(&self, thread: ThreadHandle, ts: u64) -> Result<(), CorrelationGap> {
        self.syscalls.update(thread, |state| {
            if state.phase < Phase::AtBlockLayer {
                return Err(CorrelationGap::OutOfOrder {
                    scope: "syscall",
                    stage: "block return",
                    handle: thread.0,
                });
            }
            if let Some(entered) = state.stamps.take(Stage::BlockEntry) {
                state.blk.close(entered, ts);
            }
            Ok(())
        })?
    }

    fn bio_entry(
        &self,
        thread: ThreadHandle,
        kind: BioKind,
        bio: ObjectHandle,
        input: Extent,
        ts: u64,
    ) -> Result<(), CorrelationGap> {
        let owned = self.syscalls.update(thread, |state| {
            if kind.is_merge() {
                state.stamps.set(Stage::MergeEntry, ts);
                state.merge.open(ts);
                state.phase.advance(Phase::Merging);
            } else {
                state.stamps.set(Stage::SplitEntry, ts);
                state.split.open(ts);
                state.phase.advance(Phase::Splitting);
            }
            state.seq
        });

        let seq = match owned {
            Ok(seq) => seq,
            Err(gap) => self.unowned().ok_or(gap)?,
        };
        self.bios.open(thread, BioState { kind, pid: thread.pid(), seq, bio, input, entered: ts });
        Ok(())
    }

    fn split_return(
        &self,
        event: &ProbeEvent,
        split: ObjectHandle,
        extent: Extent,
        disk_name: [u8; ioflow_common::DISK_NAME_LEN],
        write: bool,
    ) -> Result<(), CorrelationGap> {
        let thread = event.thread;
        let ts = event.ts;

        if let Err(gap) = self.syscalls.update(thread, |state| {
            if let Some(entered) = state.stamps.take(Stage::SplitEntry) {
                state.split.close(entered, ts);
            }
            if !split.is_null() {
                state.last_split = Some(extent);
            }
        }) {
            trace!("{gap}");
        }

        // The bio entry is released whether or not a split happened
        let bio = self.bios.delete(thread)?;
        if split.is_null() || bio.value.kind != BioKind::Split {
            return Ok(());
        }
        if self.config.bio_records {
            let outcome = BioOutcome {
                ts,
                out1: extent,
                out2: bio.value.input.remainder_after(extent),
                disk_name,
                write,
                comm: event.comm,
            };
            self.emitter.emit_bio(&bio.value, &outcome);
        }
        Ok(())
    }

    fn merge_return(
        &self,
        event: &ProbeEvent,
        merged: bool,
        extent: Extent,
        disk_name: [u8; ioflow_common::DISK_NAME_LEN],
        write: bool,
    ) -> Result<(), CorrelationGap> {
        let thread = event.thread;
        let ts = event.ts;

        if let Err(gap) = self.syscalls.update(thread, |state| {
            if let Some(entered) = state.stamps.take(Stage::MergeEntry) {
                state.merge.close(entered, ts);
            }
        }) {
            trace!("{gap}");
        }

        let bio = self.bios.delete(thread)?;
        if !merged || !bio.value.kind.is_merge() {
            return Ok(());
        }
        if self.config.bio_records {
            let outcome = BioOutcome {
                ts,
                out1: extent,
                out2: Extent::default(),
                disk_name,
                write,
                comm: event.comm,
            };
            self.emitter.emit_bio(&bio.value, &outcome);
        }
        Ok(())
    }

    fn request_create(
        &self,
        thread: ThreadHandle,
        request: ObjectHandle,
        extent: Extent,
        disk_name: [u8; ioflow_common::DISK_NAME_LEN],
        ts: u64,
    ) -> Result<(), CorrelationGap> {
        let owned = self.syscalls.update(thread, |state| {
            state.cnt_blk += 1;
            state.phase.advance(Phase::Queued);
            (state.seq, state.started())
        });

        let (pid, seq, syscall_started) = match owned {
            Ok((seq, started)) => (thread.pid(), seq, started),
            Err(gap) => {
                let seq = self.unowned().ok_or(gap)?;
                (thread.pid(), seq, ts)
            }
        };

        let mut stamps = StageTimestamps::default();
        stamps.set(Stage::RequestCreate, ts);
        self.requests.open(
            request,
            RequestState {
                pid,
                seq,
                syscall_started,
                phase: Phase::Queued,
                stamps,
                extent,
                disk_name,
            },
        );
        Ok(())
    }

    fn request_done(&self, request: ObjectHandle, ts: u64) -> Result<(), CorrelationGap> {
        let mut entry = self.requests.delete(request)?;
        let issued = entry.value.phase >= Phase::Issued;
        entry.value.phase.advance(Phase::Completed);

        let timing = entry.value.timing(ts);
        if self.config.request_records {
            self.emitter.emit_request(&entry.value, timing);
        }
        // Without an issue stamp there is no queue time to sample
        if issued {
            self.histograms.record(Metric::RequestQueue, ns_to_us(timing.queue));
        }
        self.histograms.record(Metric::RequestService, ns_to_us(timing.service));
        Ok(())
    }

    fn vfs_return(&self, event: &ProbeEvent, size: i64) -> Result<(), CorrelationGap> {
        let thread = event.thread;
        let end = event.ts;

        let mut entry = self.syscalls.delete(thread)?;
        entry.value.phase.advance(Phase::Completed);
        let state = &entry.value;

        let Some(fs) = state.fs_deltas(end) else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            trace!("syscall {} on {thread} skipped the buffered path", state.seq);
            return Ok(());
        };

        self.emitter.emit_syscall(thread, state, end, size, fs, event.comm);

        for (metric, delta) in state.direction.fs_metrics().into_iter().zip(fs) {
            if delta != 0 {
                self.histograms.record(metric, ns_to_us(delta));
            }
        }
        for (metric, total) in [
            (Metric::Block, state.blk.total),
            (Metric::Split, state.split.total),
            (Metric::Merge, state.merge.total),
        ] {
            if total != 0 {
                self.histograms.record(metric, ns_to_us(total));
            }
        }
        Ok(())
    }
}
