//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep the three correlation scopes apart: a
//! [`ThreadHandle`] (syscall and bio scope) can never be passed where an
//! [`ObjectHandle`] (request scope) is expected.

use std::fmt;
use std::hash::Hash;

use ioflow_common::{
    BIO_BACK_MERGE, BIO_DISCARD_MERGE, BIO_FRONT_MERGE, BIO_SPLIT, DIR_READ, DIR_WRITE,
};

/// Process ID (TGID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Identity key usable by a [`Keystore`](crate::correlation::Keystore)
pub trait Handle: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Raw kernel value, for diagnostics only
    fn raw(self) -> u64;
}

/// Thread identity: the kernel's `pid_tgid` (TGID upper half, TID lower half)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(pub u64);

impl ThreadHandle {
    /// Owning process
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn pid(self) -> Pid {
        Pid((self.0 >> 32) as u32)
    }
}

impl Handle for ThreadHandle {
    fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadHandle {
    #[allow(clippy::cast_possible_truncation)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TGID:{}/TID:{}", self.0 >> 32, self.0 as u32)
    }
}

/// Kernel object address (bio or request)
///
/// Valid only while the object is in flight. The kernel recycles addresses,
/// so a handle says nothing about identity once the object completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

impl ObjectHandle {
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Handle for ObjectHandle {
    fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Synthetic identity assigned at first observation of a kernel object
///
/// Tokens increase monotonically for the whole session and are never reused,
/// even after the handle they were bound to is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-process syscall sequence number
///
/// `0` marks a request or bio with no owning syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SequenceNumber(pub u32);

impl SequenceNumber {
    /// Sequence number of records with no owning syscall
    pub const UNOWNED: SequenceNumber = SequenceNumber(0);

    #[must_use]
    pub fn is_owned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Syscall direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    /// Decode the `DIR_*` flag of a VFS stage record
    #[must_use]
    pub fn from_flags(flags: u32) -> Self {
        if flags & DIR_WRITE == DIR_WRITE {
            Direction::Write
        } else {
            Direction::Read
        }
    }

    /// Wire value (`DIR_*`)
    #[must_use]
    pub fn as_wire(self) -> u32 {
        match self {
            Direction::Read => DIR_READ,
            Direction::Write => DIR_WRITE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// Bio split/merge event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BioKind {
    Split,
    FrontMerge,
    BackMerge,
    DiscardMerge,
}

impl BioKind {
    /// Column label used by the split/merge row layout
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            BioKind::Split => "Split",
            BioKind::FrontMerge => "Front Merge",
            BioKind::BackMerge => "Back Merge",
            BioKind::DiscardMerge => "Discard Merge",
        }
    }

    #[must_use]
    pub fn is_merge(self) -> bool {
        !matches!(self, BioKind::Split)
    }

    /// Wire value (`BIO_*`)
    #[must_use]
    pub fn as_wire(self) -> u8 {
        match self {
            BioKind::Split => BIO_SPLIT,
            BioKind::FrontMerge => BIO_FRONT_MERGE,
            BioKind::BackMerge => BIO_BACK_MERGE,
            BioKind::DiscardMerge => BIO_DISCARD_MERGE,
        }
    }

    #[must_use]
    pub fn from_wire(kind: u8) -> Option<Self> {
        match kind {
            BIO_SPLIT => Some(BioKind::Split),
            BIO_FRONT_MERGE => Some(BioKind::FrontMerge),
            BIO_BACK_MERGE => Some(BioKind::BackMerge),
            BIO_DISCARD_MERGE => Some(BioKind::DiscardMerge),
            _ => None,
        }
    }
}

impl fmt::Display for BioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Nanoseconds to whole microseconds (histogram unit)
#[must_use]
pub fn ns_to_us(ns: u64) -> u64 {
    ns / 1_000
}

/// Nanoseconds to fractional microseconds (row unit)
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ns_to_us_f64(ns: u64) -> f64 {
    ns as f64 / 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_handle_pid() {
        let handle = ThreadHandle((4321u64 << 32) | 4325);
        assert_eq!(handle.pid(), Pid(4321));
        assert_eq!(handle.to_string(), "TGID:4321/TID:4325");
    }

    #[test]
    fn test_object_handle_display() {
        assert_eq!(ObjectHandle(0xffff_8880_1234).to_string(), "0xffff88801234");
        assert!(ObjectHandle(0).is_null());
    }

    #[test]
    fn test_sequence_number_ownership() {
        assert!(!SequenceNumber::UNOWNED.is_owned());
        assert!(SequenceNumber(1).is_owned());
    }

    #[test]
    fn test_direction_flags() {
        assert_eq!(Direction::from_flags(DIR_READ), Direction::Read);
        assert_eq!(Direction::from_flags(DIR_WRITE), Direction::Write);
        assert_eq!(Direction::Write.as_wire(), DIR_WRITE);
    }

    #[test]
    fn test_bio_kind_labels() {
        assert_eq!(BioKind::Split.label(), "Split");
        assert_eq!(BioKind::DiscardMerge.to_string(), "Discard Merge");
        assert!(BioKind::FrontMerge.is_merge());
        assert!(!BioKind::Split.is_merge());
    }

    #[test]
    fn test_unit_conversions() {
        assert_eq!(ns_to_us(1_999), 1);
        assert!((ns_to_us_f64(1_500) - 1.5).abs() < f64::EPSILON);
    }
}
