//! # Histogram Aggregator
//!
//! Log2-bucketed and linear-bucketed distributions with lock-free
//! [`AtomicU64`] buckets, rendered in the fixed text layout of the classic
//! BCC tools (`print_log2_hist` / `print_linear_hist`).
//!
//! Log2 bucket `0` holds only zeros; bucket `k >= 1` holds
//! `2^(k-1) <= value < 2^k`. Rendering starts at bucket 0 and stops at the
//! highest populated bucket. Rendering never mutates, so two renders with no
//! increment in between are byte-identical.

use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Buckets of a log2 histogram: zero plus one per bit of a `u64`
const LOG2_BUCKETS: usize = 65;

/// Default number of linear buckets (values `0..64`)
pub const LINEAR_BUCKETS: usize = 64;

/// Bar width of the narrow log2 layout and of the linear layout
const STARS_MAX: u64 = 40;

/// Bucket layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    Log2,
    /// One bucket per value in `0..buckets`
    Linear { buckets: usize },
}

/// A single distribution
#[derive(Debug)]
pub struct Histogram {
    scale: Scale,
    buckets: Box<[AtomicU64]>,
    /// Linear increments beyond the last bucket
    overflow: AtomicU64,
}

impl Histogram {
    #[must_use]
    pub fn log2() -> Self {
        Self::with_scale(Scale::Log2)
    }

    #[must_use]
    pub fn linear(buckets: usize) -> Self {
        Self::with_scale(Scale::Linear { buckets })
    }

    fn with_scale(scale: Scale) -> Self {
        let len = match scale {
            Scale::Log2 => LOG2_BUCKETS,
            Scale::Linear { buckets } => buckets,
        };
        Self {
            scale,
            buckets: (0..len).map(|_| AtomicU64::new(0)).collect(),
            overflow: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn scale(&self) -> Scale {
        self.scale
    }

    /// Bucket index for `value`, `None` when a linear value is out of range
    #[must_use]
    pub fn bucket_of(&self, value: u64) -> Option<usize> {
        match self.scale {
            Scale::Log2 => Some(log2_bucket(value)),
            Scale::Linear { buckets } => {
                usize::try_from(value).ok().filter(|&index| index < buckets)
            }
        }
    }

    pub fn increment(&self, value: u64) {
        match self.bucket_of(value) {
            Some(index) => self.buckets[index].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Count held by `bucket` (0 for buckets past the end)
    #[must_use]
    pub fn count(&self, bucket: usize) -> u64 {
        self.buckets.get(bucket).map_or(0, |b| b.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn overflow(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Sum of all buckets, excluding overflow
    #[must_use]
    pub fn total(&self) -> u64 {
        self.snapshot().iter().sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Point-in-time copy of every bucket
    #[must_use]
    pub fn snapshot(&self) -> Vec<u64> {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }

    /// Zero every bucket (explicit session reset only)
    pub fn reset(&self) {
        for bucket in &*self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.overflow.store(0, Ordering::Relaxed);
    }

    /// Render the distribution under `label`; empty when nothing was recorded
    #[must_use]
    pub fn render(&self, label: &str) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail
        let _ = self.write_to(&mut out, label);
        out
    }

    /// Write the rendered distribution to `out`
    ///
    /// # Errors
    /// Propagates errors from `out`
    pub fn write_to(&self, out: &mut impl Write, label: &str) -> fmt::Result {
        let counts = self.snapshot();
        let Some(idx_max) = counts.iter().rposition(|&count| count > 0) else {
            return Ok(());
        };
        let val_max = counts.iter().copied().max().unwrap_or(0);

        match self.scale {
            Scale::Log2 if idx_max > 32 => {
                writeln!(out, "               {label:<29} : count     distribution")?;
                for (idx, &val) in counts.iter().enumerate().take(idx_max + 1) {
                    let (low, high) = log2_range(idx);
                    let bar = stars(val, val_max, STARS_MAX / 2);
                    writeln!(out, "{low:>20} -> {high:<20} : {val:<8} |{bar:<20}|")?;
                }
            }
            Scale::Log2 => {
                writeln!(out, "     {label:<19} : count     distribution")?;
                for (idx, &val) in counts.iter().enumerate().take(idx_max + 1) {
                    let (low, high) = log2_range(idx);
                    let bar = stars(val, val_max, STARS_MAX);
                    writeln!(out, "{low:>10} -> {high:<10} : {val:<8} |{bar:<40}|")?;
                }
            }
            Scale::Linear { .. } => {
                writeln!(out, "     {label:<13} : count     distribution")?;
                for (idx, &val) in counts.iter().enumerate().take(idx_max + 1) {
                    let bar = stars(val, val_max, STARS_MAX);
                    writeln!(out, "        {idx:<10} : {val:<8} |{bar:<40}|")?;
                }
            }
        }
        Ok(())
    }
}

/// `0` for zero, otherwise `floor(log2(value)) + 1`
#[must_use]
pub fn log2_bucket(value: u64) -> usize {
    (u64::BITS - value.leading_zeros()) as usize
}

/// Inclusive value range covered by log2 bucket `idx`
fn log2_range(idx: usize) -> (u64, u64) {
    if idx == 0 {
        return (0, 0);
    }
    let low = 1u64 << (idx - 1);
    let high = u64::MAX >> (64 - idx);
    (low, high)
}

fn stars(val: u64, val_max: u64, width: u64) -> String {
    if val_max == 0 {
        return String::new();
    }
    let count = (u128::from(val) * u128::from(width) / u128::from(val_max)).min(u128::from(width));
    #[allow(clippy::cast_possible_truncation)]
    "*".repeat(count as usize)
}

/// What a histogram measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Vfs,
    PageCache,
    ReadPage,
    Ext4ReadPage,
    Ext4,
    WritePage,
    Ext4Sync,
    Block,
    Split,
    Merge,
    RequestQueue,
    RequestService,
    /// Request size in KB, log2
    IoSize,
    /// Request size in KB, linear
    IoSizeLinear,
}

/// Ordered collection of titled histograms owned by one session
#[derive(Debug, Default)]
pub struct HistogramSet {
    entries: Vec<(Metric, &'static str, Histogram)>,
}

impl HistogramSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a histogram; render order is insertion order
    #[must_use]
    pub fn with(mut self, metric: Metric, title: &'static str, histogram: Histogram) -> Self {
        self.entries.push((metric, title, histogram));
        self
    }

    /// Record `value` into `metric`; untracked metrics are ignored
    pub fn record(&self, metric: Metric, value: u64) {
        if let Some(histogram) = self.get(metric) {
            histogram.increment(value);
        }
    }

    #[must_use]
    pub fn get(&self, metric: Metric) -> Option<&Histogram> {
        self.entries.iter().find(|(m, _, _)| *m == metric).map(|(_, _, h)| h)
    }

    #[must_use]
    pub fn tracks(&self, metric: Metric) -> bool {
        self.get(metric).is_some()
    }

    /// `(title, histogram)` in render order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Histogram)> {
        self.entries.iter().map(|(_, title, histogram)| (*title, histogram))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&self) {
        for (_, _, histogram) in &self.entries {
            histogram.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log2_bucket_law() {
        assert_eq!(log2_bucket(0), 0);
        for k in 1..=64usize {
            let low = 1u64 << (k - 1);
            let high = u64::MAX >> (64 - k);
            assert_eq!(log2_bucket(low), k, "low edge of bucket {k}");
            assert_eq!(log2_bucket(high), k, "high edge of bucket {k}");
        }
    }

    #[test]
    fn test_zero_only_lands_in_bucket_zero() {
        let hist = Histogram::log2();
        hist.increment(0);
        hist.increment(0);
        hist.increment(1);
        assert_eq!(hist.count(0), 2);
        assert_eq!(hist.count(1), 1);
        assert_eq!(hist.total(), 3);
    }

    #[test]
    fn test_linear_overflow() {
        let hist = Histogram::linear(4);
        hist.increment(3);
        hist.increment(4);
        hist.increment(u64::MAX);
        assert_eq!(hist.count(3), 1);
        assert_eq!(hist.overflow(), 2);
    }

    #[test]
    fn test_empty_renders_nothing() {
        assert_eq!(Histogram::log2().render("usecs"), "");
        assert_eq!(Histogram::linear(LINEAR_BUCKETS).render("kbytes"), "");
    }

    #[test]
    fn test_log2_render_layout() {
        let hist = Histogram::log2();
        hist.increment(0);
        for _ in 0..4 {
            hist.increment(3);
        }
        hist.increment(5);

        let expected = "     \
VFS (us)            : count     distribution
         0 -> 0          : 1        |**********                              |
         1 -> 1          : 0        |                                        |
         2 -> 3          : 4        |****************************************|
         4 -> 7          : 1        |**********                              |
";
        assert_eq!(hist.render("VFS (us)"), expected);
    }

    #[test]
    fn test_log2_wide_layout_above_bucket_32() {
        let hist = Histogram::log2();
        hist.increment(1u64 << 40);
        let rendered = hist.render("usecs");
        let mut lines = rendered.lines();
        assert_eq!(
            lines.next(),
            Some("               usecs                         : count     distribution")
        );
        let last = rendered.lines().last().unwrap();
        assert_eq!(
            last,
            "       1099511627776 -> 2199023255551        : 1        |********************|"
        );
    }

    #[test]
    fn test_linear_render_layout() {
        let hist = Histogram::linear(LINEAR_BUCKETS);
        hist.increment(2);
        hist.increment(2);
        hist.increment(1);

        let expected = "     kbytes        : count     distribution
        0          : 0        |                                        |
        1          : 1        |********************                    |
        2          : 2        |****************************************|
";
        assert_eq!(hist.render("kbytes"), expected);
    }

    #[test]
    fn test_render_is_idempotent() {
        let hist = Histogram::log2();
        for v in [0, 1, 17, 900, 65_000] {
            hist.increment(v);
        }
        let first = hist.render("Block Entry (us)");
        let second = hist.render("Block Entry (us)");
        assert_eq!(first, second);
        assert_eq!(hist.total(), 5);
    }

    #[test]
    fn test_reset_clears_buckets() {
        let hist = Histogram::linear(8);
        hist.increment(1);
        hist.increment(100);
        hist.reset();
        assert!(hist.is_empty());
        assert_eq!(hist.overflow(), 0);
    }

    #[test]
    fn test_set_records_tracked_metrics_only() {
        let set = HistogramSet::new().with(Metric::Vfs, "VFS (us)", Histogram::log2());
        set.record(Metric::Vfs, 12);
        set.record(Metric::Merge, 12);

        assert!(set.tracks(Metric::Vfs));
        assert!(!set.tracks(Metric::Merge));
        assert_eq!(set.get(Metric::Vfs).map(Histogram::total), Some(1));
        assert_eq!(set.iter().map(|(title, _)| title).collect::<Vec<_>>(), vec!["VFS (us)"]);
    }
}
