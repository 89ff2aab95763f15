//! Decoding of raw `StageRecord`s read from the `STAGES` ring buffer

use ioflow_common::{
    StageRecord, DISK_NAME_LEN, DNAME_INLINE_LEN, FLAG_WRITE, MERGE_BACK, MERGE_DISCARD, MERGE_FRONT,
    MERGE_KIND_SHIFT, STAGE_BLOCK_ENTRY, STAGE_BLOCK_RETURN, STAGE_EXT4_READ_PAGE, STAGE_EXT4_SYNC,
    STAGE_EXT4_WRITE, STAGE_MERGE_ENTRY, STAGE_MERGE_RETURN, STAGE_PAGE_CACHE, STAGE_READ_PAGE,
    STAGE_RQ_COMPLETION, STAGE_RQ_CREATE, STAGE_RQ_DONE, STAGE_RQ_ISSUE, STAGE_SPLIT_ENTRY,
    STAGE_SPLIT_RETURN, STAGE_VFS_ENTRY, STAGE_VFS_RETURN, STAGE_WRITE_PAGE, TASK_COMM_LEN,
};

use super::state::Extent;
use crate::correlation::Stage;
use crate::domain::{BioKind, DecodeError, Direction, ObjectHandle, ThreadHandle};

/// One probe firing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeEvent {
    /// Kernel monotonic timestamp (ns)
    pub ts: u64,
    /// Thread the probe fired on
    pub thread: ThreadHandle,
    pub comm: [u8; TASK_COMM_LEN],
    pub kind: ProbeKind,
}

/// Stage-specific payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    VfsEntry { direction: Direction, offset: i64, file_name: [u8; DNAME_INLINE_LEN] },
    VfsReturn { direction: Direction, size: i64 },
    /// Page cache, read page, ext4 and write page stages
    Filesystem(Stage),
    BlockEntry,
    BlockReturn,
    SplitEntry { bio: ObjectHandle, extent: Extent },
    /// `split` is null when the bio was not split
    SplitReturn { split: ObjectHandle, extent: Extent, disk_name: [u8; DISK_NAME_LEN], write: bool },
    MergeEntry { bio: ObjectHandle, kind: BioKind, extent: Extent },
    /// `extent` describes the request after the merge
    MergeReturn {
        merged: bool,
        request: ObjectHandle,
        extent: Extent,
        disk_name: [u8; DISK_NAME_LEN],
        write: bool,
    },
    RequestCreate {
        request: ObjectHandle,
        extent: Extent,
        disk_name: [u8; DISK_NAME_LEN],
        write: bool,
    },
    RequestIssue { request: ObjectHandle },
    RequestDone { request: ObjectHandle },
    /// Bytes accounted on completion
    RequestCompletion { request: ObjectHandle, len: u64 },
}

impl ProbeEvent {
    /// Decode a ring buffer item
    ///
    /// # Errors
    /// Returns [`DecodeError`] for short records and unknown stage codes
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let expected = std::mem::size_of::<StageRecord>();
        if bytes.len() < expected {
            return Err(DecodeError::ShortRecord { expected, actual: bytes.len() });
        }

        // SAFETY: We verified the buffer size covers a StageRecord, and the eBPF
        // program writes valid StageRecord data
        #[allow(unsafe_code)]
        let record = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<StageRecord>()) };

        Self::from_record(&record)
    }

    /// Interpret a stage record
    ///
    /// # Errors
    /// Returns [`DecodeError::UnknownStage`] for stage codes this build does not know
    pub fn from_record(record: &StageRecord) -> Result<Self, DecodeError> {
        let handle = ObjectHandle(record.handle);
        let extent = Extent::new(record.sector, u64::from(record.len));
        let write = record.flags & FLAG_WRITE != 0;

        let kind = match record.stage {
            STAGE_VFS_ENTRY => ProbeKind::VfsEntry {
                direction: Direction::from_flags(record.flags),
                offset: record.value,
                file_name: record.name,
            },
            STAGE_VFS_RETURN => ProbeKind::VfsReturn {
                direction: Direction::from_flags(record.flags),
                size: record.value,
            },
            STAGE_PAGE_CACHE => ProbeKind::Filesystem(Stage::PageCache),
            STAGE_READ_PAGE => ProbeKind::Filesystem(Stage::ReadPage),
            STAGE_EXT4_READ_PAGE => ProbeKind::Filesystem(Stage::Ext4ReadPage),
            STAGE_EXT4_WRITE => ProbeKind::Filesystem(Stage::Ext4Write),
            STAGE_WRITE_PAGE => ProbeKind::Filesystem(Stage::WritePage),
            STAGE_EXT4_SYNC => ProbeKind::Filesystem(Stage::Ext4Sync),
            STAGE_BLOCK_ENTRY => ProbeKind::BlockEntry,
            STAGE_BLOCK_RETURN => ProbeKind::BlockReturn,
            STAGE_SPLIT_ENTRY => ProbeKind::SplitEntry { bio: handle, extent },
            STAGE_SPLIT_RETURN => {
                ProbeKind::SplitReturn { split: handle, extent, disk_name: record.name, write }
            }
            STAGE_MERGE_ENTRY => {
                let kind = match (record.flags >> MERGE_KIND_SHIFT) & 0xff {
                    MERGE_FRONT => BioKind::FrontMerge,
                    MERGE_BACK => BioKind::BackMerge,
                    MERGE_DISCARD => BioKind::DiscardMerge,
                    other => return Err(DecodeError::UnknownMergeKind(other)),
                };
                ProbeKind::MergeEntry { bio: handle, kind, extent }
            }
            STAGE_MERGE_RETURN => ProbeKind::MergeReturn {
                merged: record.value != 0,
                request: handle,
                extent,
                disk_name: record.name,
                write,
            },
            STAGE_RQ_CREATE => {
                ProbeKind::RequestCreate { request: handle, extent, disk_name: record.name, write }
            }
            STAGE_RQ_ISSUE => ProbeKind::RequestIssue { request: handle },
            STAGE_RQ_DONE => ProbeKind::RequestDone { request: handle },
            STAGE_RQ_COMPLETION => {
                ProbeKind::RequestCompletion { request: handle, len: u64::from(record.len) }
            }
            other => return Err(DecodeError::UnknownStage(other)),
        };

        Ok(Self { ts: record.ts_ns, thread: ThreadHandle(record.pid_tgid), comm: record.comm, kind })
    }
}
