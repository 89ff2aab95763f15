//! Typed events decoded from transport records

use ioflow_common::{BioRecord, RequestRecord, SyscallRecord};

use crate::domain::{BioKind, DecodeError, Direction, Pid, SequenceNumber};
use crate::emitter::OutputRecord;
use crate::pipeline::Extent;

/// Bytes up to the first NUL, lossily decoded
#[must_use]
pub fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Start/end of a stage window, relative to syscall entry (ns, 0 when absent)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageWindow {
    pub start: u64,
    pub end: u64,
    pub latency: u64,
    pub count: u32,
}

/// Finalized syscall-scope event
#[derive(Debug, Clone, PartialEq)]
pub struct IoEvent {
    pub pid: Pid,
    pub seq: SequenceNumber,
    pub direction: Direction,
    /// Total syscall latency (ns)
    pub total: u64,
    pub fs: [u64; 4],
    pub blk: StageWindow,
    pub split: StageWindow,
    pub merge: StageWindow,
    pub last_split: Extent,
    pub offset: i64,
    pub size: i64,
    pub comm: String,
    pub file_name: String,
}

/// Finalized request-scope event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    pub pid: Pid,
    pub seq: SequenceNumber,
    /// Creation time relative to the owning syscall's entry (ns)
    pub ts_create: u64,
    pub queue: u64,
    pub service: u64,
    pub extent: Extent,
    pub disk_name: String,
}

impl RequestEvent {
    /// Queue plus service (ns)
    #[must_use]
    pub fn total(&self) -> u64 {
        self.queue + self.service
    }
}

/// Finalized bio split or merge event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BioEvent {
    /// Absolute entry timestamp (ns)
    pub ts: u64,
    pub latency: u64,
    pub kind: BioKind,
    pub pid: Pid,
    pub seq: SequenceNumber,
    pub write: bool,
    pub input: Extent,
    pub out1: Extent,
    pub out2: Extent,
    pub disk_name: String,
    pub comm: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Io(IoEvent),
    Request(RequestEvent),
    Bio(BioEvent),
}

impl Event {
    /// Decode a transport record
    ///
    /// # Errors
    /// Returns [`DecodeError::UnknownBioKind`] for bio records of an unknown kind
    pub fn decode(record: &OutputRecord) -> Result<Self, DecodeError> {
        match record {
            OutputRecord::Syscall(raw) => Ok(Event::Io(IoEvent::from(raw))),
            OutputRecord::Request(raw) => Ok(Event::Request(RequestEvent::from(raw))),
            OutputRecord::Bio(raw) => BioEvent::try_from(raw).map(Event::Bio),
        }
    }
}

impl From<&SyscallRecord> for IoEvent {
    fn from(raw: &SyscallRecord) -> Self {
        let relative = |ts: u64| if ts > 0 { ts.saturating_sub(raw.ts_vfs) } else { 0 };
        Self {
            pid: Pid(raw.pid),
            seq: SequenceNumber(raw.seq_num),
            direction: Direction::from_flags(raw.direction),
            total: raw.total,
            fs: raw.fs,
            blk: StageWindow {
                start: relative(raw.ts_blk_start),
                end: relative(raw.ts_blk_end),
                latency: raw.blk,
                count: raw.cnt_blk,
            },
            split: StageWindow {
                start: relative(raw.ts_split_start),
                end: relative(raw.ts_split_end),
                latency: raw.split,
                count: raw.cnt_split,
            },
            merge: StageWindow {
                start: relative(raw.ts_merge_start),
                end: relative(raw.ts_merge_end),
                latency: raw.merge,
                count: raw.cnt_merge,
            },
            last_split: Extent::new(raw.split_sector, u64::from(raw.split_len)),
            offset: raw.offset,
            size: raw.size,
            comm: c_string(&raw.cmd_name),
            file_name: c_string(&raw.file_name),
        }
    }
}

impl From<&RequestRecord> for RequestEvent {
    fn from(raw: &RequestRecord) -> Self {
        Self {
            pid: Pid(raw.pid),
            seq: SequenceNumber(raw.seq_num),
            ts_create: raw.ts_create,
            queue: raw.queue,
            service: raw.service,
            extent: Extent::new(raw.sector, u64::from(raw.len)),
            disk_name: c_string(&raw.disk_name),
        }
    }
}

impl TryFrom<&BioRecord> for BioEvent {
    type Error = DecodeError;

    fn try_from(raw: &BioRecord) -> Result<Self, Self::Error> {
        let kind = BioKind::from_wire(raw.kind).ok_or(DecodeError::UnknownBioKind(raw.kind))?;
        Ok(Self {
            ts: raw.ts,
            latency: raw.latency,
            kind,
            pid: Pid(raw.pid),
            seq: SequenceNumber(raw.seq_num),
            write: raw.rwflag == 1,
            input: Extent::new(raw.in_sector, raw.in_len),
            out1: Extent::new(raw.out_sector1, raw.out_len1),
            out2: Extent::new(raw.out_sector2, raw.out_len2),
            disk_name: c_string(&raw.disk_name),
            comm: c_string(&raw.cmd_name),
        })
    }
}
