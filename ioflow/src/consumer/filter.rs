//! Per-channel latency floors
//!
//! A record is admitted iff its total latency is at least the threshold of its
//! channel (boundary inclusive). Bio rows carry no threshold.

use super::event::Event;

/// Latency floor in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Threshold(u64);

impl Threshold {
    /// Admit everything
    pub const NONE: Threshold = Threshold(0);

    /// Convert a (validated, finite and non-negative) millisecond value
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_millis(ms: f64) -> Self {
        Threshold((ms * 1_000_000.0).round().max(0.0) as u64)
    }

    #[must_use]
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn admits(self, total_ns: u64) -> bool {
        total_ns >= self.0
    }
}

/// Thresholds for the syscall and request channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Filter {
    pub syscall: Threshold,
    pub request: Threshold,
}

impl Filter {
    #[must_use]
    pub fn new(syscall: Threshold, request: Threshold) -> Self {
        Self { syscall, request }
    }

    #[must_use]
    pub fn admits(&self, event: &Event) -> bool {
        match event {
            Event::Io(io) => self.syscall.admits(io.total),
            Event::Request(rq) => self.request.admits(rq.total()),
            Event::Bio(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let threshold = Threshold::from_millis(1.0);
        assert_eq!(threshold.as_nanos(), 1_000_000);
        assert!(threshold.admits(1_000_000));
        assert!(!threshold.admits(999_999));
        assert!(threshold.admits(1_000_001));
    }

    #[test]
    fn test_fractional_millis() {
        assert_eq!(Threshold::from_millis(0.2).as_nanos(), 200_000);
        assert_eq!(Threshold::from_millis(0.0), Threshold::NONE);
        assert!(Threshold::NONE.admits(0));
    }
}
