//! End-to-end flows: probe events through the session, transport and
//! polling consumer into rendered text

use crossbeam_channel::{bounded, Sender};
use ioflow::consumer::{ConsumerStats, Event, PollingConsumer};
use ioflow::correlation::Stage;
use ioflow::domain::{Direction, ObjectHandle, ThreadHandle};
use ioflow::emitter::transport;
use ioflow::pipeline::{Extent, ProbeEvent, ProbeKind, Session};
use ioflow::tools::{Tool, TraceOptions};
use std::collections::HashSet;
use std::sync::Arc;

const DD: ThreadHandle = ThreadHandle((4242 << 32) | 4242);
const SPLIT_BYTES: u64 = 131_072;

fn padded<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0u8; N];
    out[..text.len()].copy_from_slice(text.as_bytes());
    out
}

fn at(ts: u64, kind: ProbeKind) -> ProbeEvent {
    ProbeEvent { ts, thread: DD, comm: padded("dd"), kind }
}

/// Feed `events` through a session configured for `tool` and render
/// everything once the producer is gone
fn trace(tool: Tool, events: &[ProbeEvent]) -> (String, ConsumerStats) {
    let (emitter, records) = transport(256);
    let histograms = Arc::new(tool.histograms());
    let session = Session::new(tool.session_config(), Arc::clone(&histograms), emitter);
    for event in events {
        session.handle(event);
    }
    drop(session);

    // Held open so only the closed transport ends the loop
    let (_cancel, cancel_rx): (Sender<()>, _) = bounded(1);
    let mut consumer = PollingConsumer::new(
        records,
        cancel_rx,
        tool.filter(),
        tool.row_layout(),
        histograms,
        tool.histogram_layout(),
        Vec::new(),
    );
    let stats = consumer.run().unwrap();
    (String::from_utf8(consumer.into_inner()).unwrap(), stats)
}

fn columns(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

fn sync_write_with_splits(splits: u64) -> Vec<ProbeEvent> {
    let mut events = vec![
        at(
            1_000_000,
            ProbeKind::VfsEntry {
                direction: Direction::Write,
                offset: 0,
                file_name: padded("out.bin"),
            },
        ),
        at(1_010_000, ProbeKind::Filesystem(Stage::Ext4Write)),
        at(1_020_000, ProbeKind::Filesystem(Stage::WritePage)),
        at(1_100_000, ProbeKind::Filesystem(Stage::Ext4Sync)),
        at(1_200_000, ProbeKind::BlockEntry),
    ];

    let whole = splits * SPLIT_BYTES + 65_536;
    for i in 0..splits {
        let ts = 1_210_000 + i * 10_000;
        let sector = i * (SPLIT_BYTES >> 9);
        events.push(at(
            ts,
            ProbeKind::SplitEntry {
                bio: ObjectHandle(0xffff_8880_0000_1000),
                extent: Extent::new(sector, whole - i * SPLIT_BYTES),
            },
        ));
        events.push(at(
            ts + 1_000,
            ProbeKind::SplitReturn {
                split: ObjectHandle(0xffff_8880_0000_2000 + i),
                extent: Extent::new(sector, SPLIT_BYTES),
                disk_name: padded("sda"),
                write: true,
            },
        ));
    }

    let request = ObjectHandle(0xffff_8880_0001_0000);
    events.extend([
        at(1_300_000, ProbeKind::BlockReturn),
        at(
            1_310_000,
            ProbeKind::RequestCreate {
                request,
                extent: Extent::new(0, 1_048_576),
                disk_name: padded("sda"),
                write: true,
            },
        ),
        at(1_320_000, ProbeKind::RequestIssue { request }),
        at(1_500_000, ProbeKind::RequestDone { request }),
        at(1_600_000, ProbeKind::VfsReturn { direction: Direction::Write, size: 983_040 }),
    ]);
    events
}

#[test]
fn test_sync_write_with_seven_splits() {
    let options = TraceOptions { sys_thres: 0.5, rq_thres: 0.1, bio_events: true };
    let (out, stats) = trace(Tool::SyncWrite(options), &sync_write_with_splits(7));

    let bios: Vec<_> = out.lines().filter(|line| line.starts_with("[BIO]")).collect();
    assert_eq!(bios.len(), 7);
    let mut pairs = HashSet::new();
    for line in &bios {
        let cols = columns(line);
        assert_eq!(cols[1], "4242");
        assert_eq!(cols[2], "1", "every split belongs to the one syscall");
        assert_eq!(cols[3], "Split");
        pairs.insert((cols[4], cols[6]));
    }
    assert_eq!(pairs.len(), 7);

    let request = out.lines().find(|line| line.starts_with("[REQUEST]")).unwrap();
    let cols = columns(request);
    assert_eq!(cols[2], "1");
    assert_eq!(cols[3], "190.000");
    assert_eq!(cols[4], "310.000");
    assert_eq!(cols[5], "10.000");
    assert_eq!(cols[6], "180.000");

    let syscall = out.lines().find(|line| line.starts_with("[SYSCALL]")).unwrap();
    let cols = columns(syscall);
    assert_eq!(cols[3], "600.000");
    assert_eq!(&cols[4..8], ["10.000", "10.000", "80.000", "100.000"]);
    assert_eq!(cols[11], "1", "one request created");
    assert_eq!(cols[13], "7.000", "accumulated split latency");
    assert_eq!(cols[15], "7");
    assert_eq!(cols[20], "dd");
    assert_eq!(cols[23], "out.bin");

    // Arrival order: splits, then the request, then the syscall return
    let first_request = out.find("[REQUEST]").unwrap();
    assert!(out.rfind("[BIO]").unwrap() < first_request);
    assert!(first_request < out.find("[SYSCALL]").unwrap());

    assert_eq!(stats.rendered, 9);
    assert!(out.contains("Bio Split (us)"));
    assert!(out.contains("EXT4 Sync (us)"));
}

#[test]
fn test_syscall_keeps_the_last_split_extent() {
    let options = TraceOptions { sys_thres: 0.0, rq_thres: 0.0, bio_events: false };
    let tool = Tool::SyncWrite(options);
    let (emitter, records) = transport(256);
    let session = Session::new(tool.session_config(), Arc::new(tool.histograms()), emitter);
    for event in &sync_write_with_splits(7) {
        session.handle(event);
    }
    drop(session);

    let io = records
        .try_iter()
        .find_map(|record| match Event::decode(&record) {
            Ok(Event::Io(io)) => Some(io),
            _ => None,
        })
        .unwrap();
    assert_eq!(io.split.count, 7);
    assert_eq!(io.last_split, Extent::new(6 * (SPLIT_BYTES >> 9), SPLIT_BYTES));
}

#[test]
fn test_bio_rows_hidden_without_bio_events() {
    let options = TraceOptions { sys_thres: 0.5, rq_thres: 0.1, bio_events: false };
    let (out, stats) = trace(Tool::SyncWrite(options), &sync_write_with_splits(7));

    assert!(!out.contains("[BIO]"));
    assert_eq!(stats.rendered, 2);
    assert_eq!(stats.received, 2);
}

#[test]
fn test_request_below_default_threshold_is_filtered() {
    let options = TraceOptions { sys_thres: 0.5, ..TraceOptions::default() };
    let (out, stats) = trace(Tool::SyncWrite(options), &sync_write_with_splits(1));

    assert!(!out.contains("[REQUEST]"));
    assert!(out.contains("[SYSCALL]"));
    assert_eq!((stats.received, stats.rendered), (2, 1));
}

#[test]
fn test_page_cache_read_has_empty_block_columns() {
    let options = TraceOptions { sys_thres: 0.0, rq_thres: 0.0, bio_events: false };
    let events = [
        at(
            1_000,
            ProbeKind::VfsEntry { direction: Direction::Read, offset: 8192, file_name: padded("a") },
        ),
        at(3_000, ProbeKind::Filesystem(Stage::PageCache)),
        at(9_000, ProbeKind::VfsReturn { direction: Direction::Read, size: 4096 }),
    ];
    let (out, stats) = trace(Tool::Read(options), &events);

    assert_eq!(stats.rendered, 1);
    let syscall = out.lines().next().unwrap();
    let cols = columns(syscall);
    assert_eq!(cols[0], "[SYSCALL]");
    assert_eq!(cols[3], "8.000");
    assert_eq!(&cols[4..8], ["2.000", "6.000", "0.000", "0.000"]);
    assert_eq!(&cols[8..12], ["0.000", "0.000", "0.000", "0"]);
    assert_eq!(&cols[12..16], ["0.000", "0.000", "0.000", "0"]);
    assert_eq!(&cols[16..20], ["0.000", "0.000", "0.000", "0"]);
    assert_eq!(&cols[20..], ["dd", "8192", "4096", "a"]);

    // Only the fs histograms saw data
    assert!(out.contains("VFS (us)"));
    assert!(out.contains("Page Cache Entry (us)"));
    assert!(!out.contains("Block Entry (us)"));
}

#[test]
fn test_write_without_buffered_path_is_discarded() {
    let (emitter, records) = transport(8);
    let tool = Tool::SyncWrite(TraceOptions::default());
    let session = Session::new(tool.session_config(), Arc::new(tool.histograms()), emitter);

    session.handle(&at(
        1_000,
        ProbeKind::VfsEntry { direction: Direction::Write, offset: 0, file_name: padded("log") },
    ));
    session.handle(&at(2_000, ProbeKind::VfsReturn { direction: Direction::Write, size: 10 }));

    assert!(records.try_recv().is_err());
    assert_eq!(session.stats().discarded, 1);
    assert_eq!(session.in_flight(), (0, 0, 0));
}

#[test]
fn test_split_merge_tool_rows() {
    let tool = Tool::SplitMerge { split: false, merge: false };
    let events = [
        at(
            5_000_000_000,
            ProbeKind::SplitEntry { bio: ObjectHandle(0x10), extent: Extent::new(2048, 8192) },
        ),
        at(
            5_000_002_000,
            ProbeKind::SplitReturn {
                split: ObjectHandle(0x20),
                extent: Extent::new(2048, 4096),
                disk_name: padded("nvme0n1"),
                write: false,
            },
        ),
        at(
            5_250_000_000,
            ProbeKind::MergeEntry {
                bio: ObjectHandle(0x30),
                kind: ioflow::domain::BioKind::BackMerge,
                extent: Extent::new(4096, 4096),
            },
        ),
        at(
            5_250_001_000,
            ProbeKind::MergeReturn {
                merged: true,
                request: ObjectHandle(0x40),
                extent: Extent::new(4088, 8192),
                disk_name: padded("nvme0n1"),
                write: true,
            },
        ),
    ];
    let (out, stats) = trace(tool, &events);

    assert_eq!(stats.rendered, 2);
    let rows: Vec<_> = out.lines().map(columns).collect();
    assert_eq!(rows[0], ["0.0000", "Split", "dd", "4242", "nvme0n1", "R", "2048", "8192", "2048", "4096"]);
    assert_eq!(
        rows[1],
        ["0.2500", "Back", "Merge", "dd", "4242", "nvme0n1", "W", "4096", "4096", "4088", "8192"]
    );
}
