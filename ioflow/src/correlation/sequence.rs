//! Per-process syscall sequence numbers
//!
//! The only bridge between the syscall scope and the request scope: the
//! number captured at syscall entry is stamped on the syscall row and on every
//! request and bio row spawned underneath it.

use dashmap::DashMap;

use crate::domain::{Pid, SequenceNumber};

/// Monotonic counter per originating process
#[derive(Debug, Default)]
pub struct SequenceCorrelator {
    counters: DashMap<Pid, u32>,
}

impl SequenceCorrelator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the next sequence number for `pid`
    ///
    /// The first syscall of a process gets `1`. Wrapping skips `0`, which is
    /// reserved for unowned records.
    pub fn next(&self, pid: Pid) -> SequenceNumber {
        let mut counter = self.counters.entry(pid).or_insert(0);
        *counter = counter.wrapping_add(1).max(1);
        SequenceNumber(*counter)
    }

    /// Last number handed out for `pid`
    #[must_use]
    pub fn current(&self, pid: Pid) -> SequenceNumber {
        self.counters.get(&pid).map_or(SequenceNumber::UNOWNED, |counter| SequenceNumber(*counter))
    }

    /// Forget every process (session reset)
    pub fn reset(&self) {
        self.counters.clear();
    }
}
