//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines data structures and constants shared between kernel-side eBPF programs
//! and userspace. All types use `#[repr(C)]` for consistent memory layout across
//! the kernel/userspace boundary.
//!
//! ## Data Flow
//!
//! 1. **Probes** (kernel) - every kprobe/kretprobe writes one [`StageRecord`] to the
//!    `STAGES` ring buffer. Probes never correlate; they only capture.
//! 2. **Stage pipeline** (userspace) - decodes stage records, correlates them per
//!    identity and finalizes [`SyscallRecord`], [`RequestRecord`] and [`BioRecord`].
//! 3. **Consumer** (userspace) - decodes the finalized records and renders rows.
//!
//! ## Key Types
//!
//! - [`StageRecord`] - Raw probe firing passed via ring buffer
//! - [`SyscallRecord`] - Finalized per-syscall latency breakdown
//! - [`RequestRecord`] - Finalized block-layer request record
//! - [`BioRecord`] - Finalized bio split/merge record
//! - [`KernelLayout`] - Kernel struct field offsets used by the probes

#![no_std]

// ============================================================================
// Stage Codes (StageRecord::stage)
// ============================================================================

/// `vfs_read` / `vfs_write` entry. Opens the syscall scope.
///
/// Flags: [`DIR_READ`] or [`DIR_WRITE`]. `value` carries the file offset,
/// `name` the file name.
pub const STAGE_VFS_ENTRY: u32 = 1;

/// `vfs_read` / `vfs_write` return. Closes the syscall scope.
///
/// `value` carries the syscall return value (bytes transferred).
pub const STAGE_VFS_RETURN: u32 = 2;

/// `generic_file_read_iter` entry (page cache lookup)
pub const STAGE_PAGE_CACHE: u32 = 3;

/// Readahead entry (`__do_page_cache_readahead` and its renames)
pub const STAGE_READ_PAGE: u32 = 4;

/// `ext4_mpage_readpages` entry
pub const STAGE_EXT4_READ_PAGE: u32 = 5;

/// `ext4_file_write_iter` entry
pub const STAGE_EXT4_WRITE: u32 = 6;

/// `generic_perform_write` entry
pub const STAGE_WRITE_PAGE: u32 = 7;

/// `ext4_sync_file` entry
pub const STAGE_EXT4_SYNC: u32 = 8;

/// `submit_bio` entry
pub const STAGE_BLOCK_ENTRY: u32 = 9;

/// `submit_bio` return
pub const STAGE_BLOCK_RETURN: u32 = 10;

/// `bio_split` entry. `handle` is the bio being split, `sector`/`len` its range.
pub const STAGE_SPLIT_ENTRY: u32 = 11;

/// `bio_split` return. `handle` is the returned bio (0 when no split happened).
pub const STAGE_SPLIT_RETURN: u32 = 12;

/// `bio_attempt_{front,back,discard}_merge` entry. Flags carry the merge kind.
pub const STAGE_MERGE_ENTRY: u32 = 13;

/// Merge attempt return. `value` is non-zero when the bio was merged;
/// `sector`/`len` describe the resulting request.
pub const STAGE_MERGE_RETURN: u32 = 14;

/// `blk_account_io_start`: request created. `handle` is the request pointer.
pub const STAGE_RQ_CREATE: u32 = 15;

/// `blk_mq_start_request` / `blk_start_request`: request dispatched to the driver
pub const STAGE_RQ_ISSUE: u32 = 16;

/// `blk_account_io_done`: request completed
pub const STAGE_RQ_DONE: u32 = 17;

/// `blk_account_io_completion`: request bytes accounted (size histograms)
pub const STAGE_RQ_COMPLETION: u32 = 18;

// ============================================================================
// Flag Values (StageRecord::flags)
// ============================================================================

/// Syscall direction: read
pub const DIR_READ: u32 = 0;

/// Syscall direction: write
pub const DIR_WRITE: u32 = 1;

/// Bio/request operation is a write (bit 0)
pub const FLAG_WRITE: u32 = 1;

/// Merge kind occupies bits 8..16 of `flags` on merge entries
pub const MERGE_KIND_SHIFT: u32 = 8;

/// Merge kind: front merge
pub const MERGE_FRONT: u32 = 1;

/// Merge kind: back merge
pub const MERGE_BACK: u32 = 2;

/// Merge kind: discard merge
pub const MERGE_DISCARD: u32 = 3;

// ============================================================================
// Bio Record Kinds (BioRecord::kind)
// ============================================================================

/// Bio was split
pub const BIO_SPLIT: u8 = 0;

/// Bio was merged at the front of a request
pub const BIO_FRONT_MERGE: u8 = 1;

/// Bio was merged at the back of a request
pub const BIO_BACK_MERGE: u8 = 2;

/// Discard bio was merged into a request
pub const BIO_DISCARD_MERGE: u8 = 3;

// ============================================================================
// Sizes
// ============================================================================

/// Length of `task_struct::comm`
pub const TASK_COMM_LEN: usize = 16;

/// Length of `gendisk::disk_name`
pub const DISK_NAME_LEN: usize = 32;

/// Inline dentry name length on 64-bit kernels
pub const DNAME_INLINE_LEN: usize = 32;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Raw probe firing sent from eBPF to userspace via ring buffer
///
/// One record per probe invocation. The meaning of the payload fields depends
/// on `stage` (see the `STAGE_*` constants).
///
/// **Memory Layout**: `#[repr(C)]`, 104 bytes
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StageRecord {
    /// Timestamp in nanoseconds (from `bpf_ktime_get_ns()`)
    pub ts_ns: u64,

    /// `bpf_get_current_pid_tgid()`: TGID in the upper half, TID in the lower
    ///
    /// Identifies the thread for thread-scoped stages. Meaningless for
    /// request issue/done, which fire in whatever context dispatches them.
    pub pid_tgid: u64,

    /// Kernel object address (bio or request), 0 when not applicable
    ///
    /// Only valid for the lifetime of the object. Never dereferenced by
    /// userspace and never assumed stable after completion.
    pub handle: u64,

    /// Start sector of the bio/request
    pub sector: u64,

    /// Stage specific scalar: file offset, syscall return value, merge result
    pub value: i64,

    /// Length in bytes of the bio/request
    pub len: u32,

    /// Stage code (`STAGE_*`)
    pub stage: u32,

    /// Stage specific flags (`DIR_*`, `FLAG_WRITE`, merge kind)
    pub flags: u32,

    /// File name (VFS entry) or disk name (block stages), NUL-terminated
    pub name: [u8; DISK_NAME_LEN],

    /// Current task command name, NUL-terminated
    pub comm: [u8; TASK_COMM_LEN],
}

impl StageRecord {
    /// An all-zero record for the given stage
    #[must_use]
    pub const fn empty(stage: u32) -> Self {
        Self {
            ts_ns: 0,
            pid_tgid: 0,
            handle: 0,
            sector: 0,
            value: 0,
            len: 0,
            stage,
            flags: 0,
            name: [0; DISK_NAME_LEN],
            comm: [0; TASK_COMM_LEN],
        }
    }
}

/// Finalized syscall-scope record (one per traced `read()`/`write()`)
///
/// Latencies are nanoseconds. Window timestamps (`ts_*_start`/`ts_*_end`) are
/// absolute; 0 means the stage never fired.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SyscallRecord {
    /// Process ID (TGID)
    pub pid: u32,

    /// Per-process sequence number assigned at syscall entry
    pub seq_num: u32,

    /// Syscall direction (`DIR_READ` / `DIR_WRITE`)
    pub direction: u32,

    /// Number of block requests created on behalf of this syscall
    pub cnt_blk: u32,

    /// Number of bio splits
    pub cnt_split: u32,

    /// Number of merge attempts
    pub cnt_merge: u32,

    /// Filesystem stage latencies, in tool column order
    ///
    /// - read: vfs, page cache, read page, ext4 read page
    /// - write: vfs, ext4, write page, ext4 sync
    pub fs: [u64; 4],

    /// Accumulated time inside `submit_bio`
    pub blk: u64,

    /// Accumulated time inside `bio_split`
    pub split: u64,

    /// Accumulated time inside merge attempts
    pub merge: u64,

    /// Total syscall latency (return - entry)
    pub total: u64,

    /// Syscall entry timestamp
    pub ts_vfs: u64,

    pub ts_blk_start: u64,
    pub ts_blk_end: u64,
    pub ts_split_start: u64,
    pub ts_split_end: u64,
    pub ts_merge_start: u64,
    pub ts_merge_end: u64,

    /// Output sector of the most recent split
    pub split_sector: u64,

    /// File offset at syscall entry
    pub offset: i64,

    /// Syscall return value
    pub size: i64,

    /// Output length of the most recent split
    pub split_len: u32,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 4],

    pub file_name: [u8; DNAME_INLINE_LEN],
    pub cmd_name: [u8; TASK_COMM_LEN],
}

/// Finalized block-layer request record
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RequestRecord {
    /// Process ID of the syscall that created the request (0 if unowned)
    pub pid: u32,

    /// Sequence number of the owning syscall (0 if unowned)
    pub seq_num: u32,

    /// Creation time relative to the owning syscall's entry
    pub ts_create: u64,

    /// Queuing latency (issue - create)
    pub queue: u64,

    /// Service latency (done - issue)
    pub service: u64,

    pub sector: u64,
    pub len: u32,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 4],

    pub disk_name: [u8; DISK_NAME_LEN],
}

/// Finalized bio split or merge record
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BioRecord {
    /// Entry timestamp of the split/merge call
    pub ts: u64,

    /// Time spent inside the split/merge call
    pub latency: u64,

    pub in_sector: u64,
    pub in_len: u64,

    /// Resulting bio (split) or request (merge)
    pub out_sector1: u64,
    pub out_len1: u64,

    /// Remaining bio after a split (0 for merges)
    pub out_sector2: u64,
    pub out_len2: u64,

    pub pid: u32,

    /// Sequence number of the owning syscall (0 if none)
    pub seq_num: u32,

    /// 1 for writes, 0 for reads
    pub rwflag: u8,

    /// `BIO_*` kind
    pub kind: u8,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 6],

    pub disk_name: [u8; DISK_NAME_LEN],
    pub cmd_name: [u8; TASK_COMM_LEN],
}

/// Kernel struct field offsets read by the probes
///
/// Probes read kernel memory with `bpf_probe_read_kernel` at these offsets,
/// so the same object works across kernels whose layouts differ. Stored in
/// the single-slot `LAYOUT` array map by userspace before any probe attaches.
///
/// Defaults describe an x86_64 5.4-series kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Deserialize), serde(default, deny_unknown_fields))]
pub struct KernelLayout {
    /// `struct file::f_path.dentry`
    pub file_dentry: u32,
    /// `struct file::f_op`
    pub file_f_op: u32,
    /// `struct file::f_flags`
    pub file_f_flags: u32,
    /// `struct file::f_pos`
    pub file_f_pos: u32,
    /// `struct dentry::d_iname`
    pub dentry_d_iname: u32,
    /// `struct file_operations::read_iter`
    pub fops_read_iter: u32,
    /// `struct file_operations::write_iter`
    pub fops_write_iter: u32,
    /// `struct bio::bi_disk`
    pub bio_disk: u32,
    /// `struct bio::bi_opf`
    pub bio_opf: u32,
    /// `struct bio::bi_iter.bi_sector`
    pub bio_sector: u32,
    /// `struct bio::bi_iter.bi_size`
    pub bio_size: u32,
    /// `struct request::cmd_flags`
    pub rq_cmd_flags: u32,
    /// `struct request::__data_len`
    pub rq_data_len: u32,
    /// `struct request::__sector`
    pub rq_sector: u32,
    /// `struct request::rq_disk`
    pub rq_disk: u32,
    /// `struct gendisk::disk_name`
    pub disk_name: u32,
    /// `O_DIRECT` flag value
    pub o_direct: u32,
}

impl Default for KernelLayout {
    fn default() -> Self {
        Self {
            file_dentry: 24,
            file_f_op: 40,
            file_f_flags: 64,
            file_f_pos: 104,
            dentry_d_iname: 56,
            fops_read_iter: 32,
            fops_write_iter: 40,
            bio_disk: 8,
            bio_opf: 16,
            bio_sector: 32,
            bio_size: 40,
            rq_cmd_flags: 24,
            rq_data_len: 40,
            rq_sector: 48,
            rq_disk: 152,
            disk_name: 12,
            o_direct: 0o40000,
        }
    }
}

#[cfg(feature = "user")]
use aya::Pod;

// These unsafe impls are required for eBPF <-> userspace communication
// Pod trait ensures types can be safely transmitted as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for StageRecord {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for KernelLayout {}
