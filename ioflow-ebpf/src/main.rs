//! # eBPF Kernel-Side Instrumentation
//!
//! kprobes/kretprobes along the Linux block I/O path. Every probe captures its
//! timestamp, an identity handle and whatever kernel fields it can read, then
//! writes one `StageRecord` to the `STAGES` ring buffer. Correlation of the
//! records into per-operation timelines happens in userspace.
//!
//! ## Programs
//!
//! - **VFS**: `vfs_read_entry`, `vfs_write_entry`, `vfs_read_return`, `vfs_write_return`
//! - **Filesystem**: `page_cache_entry`, `read_page_entry`, `ext4_read_page_entry`,
//!   `ext4_write_entry`, `write_page_entry`, `ext4_sync_entry`
//! - **Block layer**: `block_entry`, `block_return`, `split_entry`, `split_return`,
//!   `front_merge_entry`, `back_merge_entry`, `discard_merge_entry`, `merge_return`
//! - **Requests**: `rq_create`, `rq_issue`, `rq_done`, `rq_completion`
//!
//! ## Maps (Shared with Userspace)
//!
//! - `STAGES` - Ring buffer (4MB) for stage records
//! - `LAYOUT` - Kernel struct offsets written by userspace before attach
//! - `PENDING_MERGE` - Request pointer stashed between merge entry and return
//! - `STAGE_DROPS` - Ring buffer output failures
//!
//! ## Build
//!
//! Always compiled in release mode:
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_kernel,
        bpf_probe_read_kernel_buf,
    },
    macros::{kprobe, kretprobe, map},
    maps::{Array, HashMap, RingBuf},
    programs::{ProbeContext, RetProbeContext},
};
use aya_log_ebpf::debug;
use ioflow_common::{
    KernelLayout, StageRecord, DIR_READ, DIR_WRITE, FLAG_WRITE, MERGE_BACK, MERGE_DISCARD,
    MERGE_FRONT, MERGE_KIND_SHIFT, STAGE_BLOCK_ENTRY, STAGE_BLOCK_RETURN, STAGE_EXT4_READ_PAGE,
    STAGE_EXT4_SYNC, STAGE_EXT4_WRITE, STAGE_MERGE_ENTRY, STAGE_MERGE_RETURN, STAGE_PAGE_CACHE,
    STAGE_READ_PAGE, STAGE_RQ_COMPLETION, STAGE_RQ_CREATE, STAGE_RQ_DONE, STAGE_RQ_ISSUE,
    STAGE_SPLIT_ENTRY, STAGE_SPLIT_RETURN, STAGE_VFS_ENTRY, STAGE_VFS_RETURN, STAGE_WRITE_PAGE,
};

/// `REQ_OP_MASK` from `include/linux/blk_types.h`
const REQ_OP_MASK: u32 = 0xff;

/// `REQ_OP_WRITE`
const REQ_OP_WRITE: u32 = 1;

// ============================================================================
// eBPF Maps
// ============================================================================

/// Ring buffer for stage records
///
/// A single ring buffer (not per-CPU) so records for one identity reach
/// userspace in the order the kernel produced them, whichever CPU fired.
#[map]
static STAGES: RingBuf = RingBuf::with_byte_size(4 * 1024 * 1024, 0);

/// Kernel struct offsets (single slot, written by userspace)
#[map]
static LAYOUT: Array<KernelLayout> = Array::with_max_entries(1, 0);

/// Map: pid_tgid → request pointer of an in-flight merge attempt
///
/// Merge kretprobes cannot see their arguments. The entry probe stashes the
/// request and the return probe removes it on every path.
#[map]
static PENDING_MERGE: HashMap<u64, u64> = HashMap::with_max_entries(10240, 0);

/// Number of stage records that could not be written (ring buffer full)
#[map]
static STAGE_DROPS: HashMap<u32, u64> = HashMap::with_max_entries(1, 0);

// ============================================================================
// Helpers
// ============================================================================

fn layout() -> Result<&'static KernelLayout, i64> {
    LAYOUT.get(0).ok_or(1i64)
}

/// Read a `T` at `base + offset` in kernel memory
fn read_at<T>(base: u64, offset: u32) -> Result<T, i64> {
    if base == 0 {
        return Err(1);
    }
    unsafe { bpf_probe_read_kernel((base + u64::from(offset)) as *const T) }
}

/// Copy a NUL-terminated kernel string at `addr` into `dst`
fn read_name(addr: u64, dst: &mut [u8]) {
    if addr == 0 {
        return;
    }
    let _ = unsafe { bpf_probe_read_kernel_buf(addr as *const u8, dst) };
}

/// Fill the common fields and submit the record
fn submit(mut record: StageRecord) -> Result<(), i64> {
    record.ts_ns = unsafe { bpf_ktime_get_ns() };
    record.pid_tgid = bpf_get_current_pid_tgid();
    record.comm = bpf_get_current_comm().unwrap_or([0u8; 16]);

    if STAGES.output(&record, 0).is_err() {
        unsafe {
            let key = 0u32;
            let current = STAGE_DROPS.get(&key).copied().unwrap_or(0);
            let _ = STAGE_DROPS.insert(&key, &(current + 1), 0);
        }
        return Err(1);
    }
    Ok(())
}

fn emit(stage: u32) -> u32 {
    match submit(StageRecord::empty(stage)) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Sector, size, write flag and disk name of a `struct bio`
fn fill_bio(record: &mut StageRecord, bio: u64, layout: &KernelLayout) -> Result<(), i64> {
    record.sector = read_at::<u64>(bio, layout.bio_sector)?;
    record.len = read_at::<u32>(bio, layout.bio_size)?;
    let opf = read_at::<u32>(bio, layout.bio_opf)?;
    if opf & REQ_OP_MASK == REQ_OP_WRITE {
        record.flags |= FLAG_WRITE;
    }
    let disk = read_at::<u64>(bio, layout.bio_disk).unwrap_or(0);
    if disk != 0 {
        read_name(disk + u64::from(layout.disk_name), &mut record.name);
    }
    Ok(())
}

/// Sector, length, write flag and disk name of a `struct request`
fn fill_request(record: &mut StageRecord, rq: u64, layout: &KernelLayout) -> Result<(), i64> {
    record.sector = read_at::<u64>(rq, layout.rq_sector)?;
    record.len = read_at::<u32>(rq, layout.rq_data_len)?;
    let cmd_flags = read_at::<u32>(rq, layout.rq_cmd_flags)?;
    if cmd_flags & REQ_OP_MASK == REQ_OP_WRITE {
        record.flags |= FLAG_WRITE;
    }
    let disk = read_at::<u64>(rq, layout.rq_disk).unwrap_or(0);
    if disk != 0 {
        read_name(disk + u64::from(layout.disk_name), &mut record.name);
    }
    Ok(())
}

// ============================================================================
// VFS Layer
// ============================================================================

#[kprobe]
pub fn vfs_read_entry(ctx: ProbeContext) -> u32 {
    match try_vfs_entry(&ctx, DIR_READ) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[kprobe]
pub fn vfs_write_entry(ctx: ProbeContext) -> u32 {
    match try_vfs_entry(&ctx, DIR_WRITE) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_vfs_entry(ctx: &ProbeContext, direction: u32) -> Result<(), i64> {
    let layout = layout()?;
    let file: u64 = ctx.arg(0).ok_or(1i64)?;

    // Only buffered I/O through the iter interface is traced
    let f_op = read_at::<u64>(file, layout.file_f_op)?;
    let iter_offset =
        if direction == DIR_WRITE { layout.fops_write_iter } else { layout.fops_read_iter };
    if read_at::<u64>(f_op, iter_offset)? == 0 {
        return Ok(());
    }
    if direction == DIR_WRITE {
        let f_flags = read_at::<u32>(file, layout.file_f_flags)?;
        if f_flags & layout.o_direct != 0 {
            return Ok(());
        }
    }

    let mut record = StageRecord::empty(STAGE_VFS_ENTRY);
    record.flags = direction;
    record.value = read_at::<i64>(file, layout.file_f_pos).unwrap_or(0);
    let dentry = read_at::<u64>(file, layout.file_dentry).unwrap_or(0);
    if dentry != 0 {
        read_name(dentry + u64::from(layout.dentry_d_iname), &mut record.name);
    }
    submit(record)
}

#[kretprobe]
pub fn vfs_read_return(ctx: RetProbeContext) -> u32 {
    vfs_return(&ctx, DIR_READ)
}

#[kretprobe]
pub fn vfs_write_return(ctx: RetProbeContext) -> u32 {
    vfs_return(&ctx, DIR_WRITE)
}

fn vfs_return(ctx: &RetProbeContext, direction: u32) -> u32 {
    let mut record = StageRecord::empty(STAGE_VFS_RETURN);
    record.flags = direction;
    record.value = ctx.ret::<i64>().unwrap_or(-1);
    match submit(record) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

// ============================================================================
// Filesystem Layer
// ============================================================================

#[kprobe]
pub fn page_cache_entry(_ctx: ProbeContext) -> u32 {
    emit(STAGE_PAGE_CACHE)
}

#[kprobe]
pub fn read_page_entry(_ctx: ProbeContext) -> u32 {
    emit(STAGE_READ_PAGE)
}

#[kprobe]
pub fn ext4_read_page_entry(_ctx: ProbeContext) -> u32 {
    emit(STAGE_EXT4_READ_PAGE)
}

#[kprobe]
pub fn ext4_write_entry(_ctx: ProbeContext) -> u32 {
    emit(STAGE_EXT4_WRITE)
}

#[kprobe]
pub fn write_page_entry(_ctx: ProbeContext) -> u32 {
    emit(STAGE_WRITE_PAGE)
}

#[kprobe]
pub fn ext4_sync_entry(_ctx: ProbeContext) -> u32 {
    emit(STAGE_EXT4_SYNC)
}

// ============================================================================
// Block Layer
// ============================================================================

#[kprobe]
pub fn block_entry(_ctx: ProbeContext) -> u32 {
    emit(STAGE_BLOCK_ENTRY)
}

#[kretprobe]
pub fn block_return(_ctx: RetProbeContext) -> u32 {
    emit(STAGE_BLOCK_RETURN)
}

#[kprobe]
pub fn split_entry(ctx: ProbeContext) -> u32 {
    match try_split_entry(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_split_entry(ctx: &ProbeContext) -> Result<(), i64> {
    let layout = layout()?;
    let bio: u64 = ctx.arg(0).ok_or(1i64)?;

    let mut record = StageRecord::empty(STAGE_SPLIT_ENTRY);
    record.handle = bio;
    fill_bio(&mut record, bio, layout)?;
    submit(record)
}

#[kretprobe]
pub fn split_return(ctx: RetProbeContext) -> u32 {
    match try_split_return(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_split_return(ctx: &RetProbeContext) -> Result<(), i64> {
    let split: u64 = ctx.ret().unwrap_or(0);

    // Always submitted: a null split or an unreadable bio still closes the
    // userspace bio entry
    let mut record = StageRecord::empty(STAGE_SPLIT_RETURN);
    record.handle = split;
    if split != 0 {
        if let Ok(layout) = layout() {
            let _ = fill_bio(&mut record, split, layout);
        }
    }
    submit(record)
}

#[kprobe]
pub fn front_merge_entry(ctx: ProbeContext) -> u32 {
    merge_entry(&ctx, MERGE_FRONT)
}

#[kprobe]
pub fn back_merge_entry(ctx: ProbeContext) -> u32 {
    merge_entry(&ctx, MERGE_BACK)
}

#[kprobe]
pub fn discard_merge_entry(ctx: ProbeContext) -> u32 {
    merge_entry(&ctx, MERGE_DISCARD)
}

fn merge_entry(ctx: &ProbeContext, kind: u32) -> u32 {
    match try_merge_entry(ctx, kind) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_merge_entry(ctx: &ProbeContext, kind: u32) -> Result<(), i64> {
    let layout = layout()?;

    // bio_attempt_*_merge(struct request *req, struct bio *bio, ...) on 5.3+;
    // the discard variant keeps the queue as its first argument.
    let (rq, bio): (u64, u64) = if kind == MERGE_DISCARD {
        (ctx.arg(1).ok_or(1i64)?, ctx.arg(2).ok_or(1i64)?)
    } else {
        (ctx.arg(0).ok_or(1i64)?, ctx.arg(1).ok_or(1i64)?)
    };

    let mut record = StageRecord::empty(STAGE_MERGE_ENTRY);
    record.handle = bio;
    fill_bio(&mut record, bio, layout)?;
    record.flags |= kind << MERGE_KIND_SHIFT;

    let pid_tgid = bpf_get_current_pid_tgid();
    unsafe {
        PENDING_MERGE.insert(&pid_tgid, &rq, 0)?;
    }
    submit(record)
}

#[kretprobe]
pub fn merge_return(ctx: RetProbeContext) -> u32 {
    match try_merge_return(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_merge_return(ctx: &RetProbeContext) -> Result<(), i64> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let rq = unsafe { PENDING_MERGE.get(&pid_tgid).copied() };
    let _ = unsafe { PENDING_MERGE.remove(&pid_tgid) };

    let merged: u64 = ctx.ret().unwrap_or(0);

    // Always submitted so the userspace bio entry is closed
    let mut record = StageRecord::empty(STAGE_MERGE_RETURN);
    record.value = i64::from(merged != 0);
    if let Some(rq) = rq {
        record.handle = rq;
        if merged != 0 {
            if let Ok(layout) = layout() {
                let _ = fill_request(&mut record, rq, layout);
            }
        }
    } else {
        debug!(ctx, "merge return without pending request");
    }
    submit(record)
}

// ============================================================================
// Request Lifecycle
// ============================================================================

#[kprobe]
pub fn rq_create(ctx: ProbeContext) -> u32 {
    request_stage(&ctx, STAGE_RQ_CREATE, true)
}

#[kprobe]
pub fn rq_issue(ctx: ProbeContext) -> u32 {
    request_stage(&ctx, STAGE_RQ_ISSUE, false)
}

#[kprobe]
pub fn rq_done(ctx: ProbeContext) -> u32 {
    // Closes the request entry; userspace reads nothing but the handle
    request_stage(&ctx, STAGE_RQ_DONE, false)
}

#[kprobe]
pub fn rq_completion(ctx: ProbeContext) -> u32 {
    request_stage(&ctx, STAGE_RQ_COMPLETION, true)
}

fn request_stage(ctx: &ProbeContext, stage: u32, with_fields: bool) -> u32 {
    match try_request_stage(ctx, stage, with_fields) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_request_stage(ctx: &ProbeContext, stage: u32, with_fields: bool) -> Result<(), i64> {
    let rq: u64 = ctx.arg(0).ok_or(1i64)?;

    let mut record = StageRecord::empty(stage);
    record.handle = rq;
    if with_fields {
        fill_request(&mut record, rq, layout()?)?;
    }
    submit(record)
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
