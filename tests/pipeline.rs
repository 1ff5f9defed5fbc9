//! End-to-end conversion scenarios: a synthetic record stream goes through
//! the stream reader and the converter, and the resulting sample files are
//! inspected on disk.

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use oxprof::linux::sys;
use oxprof::linux_shared::converter::{convert_stream, ConvertOptions};
use oxprof::linux_shared::event::{EventConfig, SampleFormat};
use oxprof::linux_shared::event_record::{encode_comm, encode_fork, encode_mmap, encode_sample};
use oxprof::linux_shared::stats::Stats;
use oxprof::samples::db::{OpenMode, SampleDb};
use oxprof::samples::header::{SampleFileHeader, HEADER_SIZE};
use oxprof::samples::mangling::{ImagePart, SampleFileName};
use oxprof::stream::{StreamEvent, StreamReader, StreamSink, StreamWriter};

const EVENT_ID: u64 = 42;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn test_event() -> EventConfig {
    EventConfig {
        name: "cycles".to_owned(),
        kind: sys::PERF_TYPE_RAW,
        code: 0x3c,
        period: 1000,
        unit_mask: 0,
        exclude_kernel: false,
        exclude_user: false,
        exclude_hv: true,
        counter: 0,
    }
}

fn options(session_dir: &Path, callgraph: bool) -> ConvertOptions {
    ConvertOptions {
        session_dir: session_dir.to_owned(),
        separate_cpu: false,
        separate_thread: false,
        callgraph,
        cpu_type: 1,
        cpu_speed: 0.0,
        profiled: None,
    }
}

/// Wrap the records into a full sample stream and run it through the
/// converter, writing sample files under the session directory in `opts`.
fn run_pipeline(format: SampleFormat, opts: ConvertOptions, records: &[Vec<u8>]) -> Stats {
    run_pipeline_with_event(test_event(), format, opts, records)
}

fn run_pipeline_with_event(
    event: EventConfig,
    format: SampleFormat,
    opts: ConvertOptions,
    records: &[Vec<u8>],
) -> Stats {
    let stream_events = vec![StreamEvent {
        config: event,
        ids: vec![EVENT_ID],
        sample_format: format,
    }];

    let buf = SharedBuf::default();
    {
        let mut writer =
            StreamWriter::new(StreamSink::Pipe(Box::new(buf.clone())), &stream_events).unwrap();
        for record in records {
            writer.write_all(record).unwrap();
        }
        writer.finish().unwrap();
    }

    let bytes = std::mem::take(&mut *buf.0.lock().unwrap());
    let mut reader = StreamReader::open_pipe(Box::new(Cursor::new(bytes))).unwrap();
    let quit = AtomicBool::new(false);
    convert_stream(&mut reader, opts, &quit).unwrap()
}

fn read_samples(session_dir: &Path, name: &SampleFileName) -> Vec<(u32, u32)> {
    let path = session_dir
        .join("samples")
        .join("current")
        .join(name.relative_path());
    let db = SampleDb::open(&path, OpenMode::ReadOnly, HEADER_SIZE)
        .unwrap_or_else(|err| panic!("could not open {}: {err}", path.display()));
    let mut samples: Vec<(u32, u32)> = db.iter().collect();
    samples.sort_unstable();
    samples
}

fn flat_name(app: &str, image: &str) -> SampleFileName {
    SampleFileName {
        app: app.to_owned(),
        image: ImagePart::Path(image.to_owned()),
        thread: None,
        cpu: None,
        cg_from: None,
        counter: 0,
    }
}

fn user_sample(pid: u32, tid: u32, ip: u64, format: SampleFormat) -> Vec<u8> {
    encode_sample(
        format,
        sys::PERF_RECORD_MISC_USER,
        ip,
        pid,
        tid,
        EVENT_ID,
        None,
        None,
    )
}

#[test]
fn single_process_two_samples() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);

    let records = vec![
        encode_comm(1001, 1001, "app"),
        encode_mmap(
            1001,
            1001,
            0x400000,
            0x1000,
            0,
            "/bin/app",
            sys::PERF_RECORD_MISC_USER,
        ),
        user_sample(1001, 1001, 0x400100, format),
        user_sample(1001, 1001, 0x400100, format),
    ];
    let stats = run_pipeline(format, options(session.path(), false), &records);

    assert_eq!(
        read_samples(session.path(), &flat_name("/bin/app", "/bin/app")),
        vec![(0x100, 2)]
    );
    assert_eq!(stats.kernel_samples, 0);
    assert_eq!(stats.user_samples, 2);
    assert_eq!(stats.lost_no_mapping, 0);
}

#[test]
fn mmap_before_comm_defers_and_recovers() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);

    let records = vec![
        encode_mmap(
            2002,
            2002,
            0x500000,
            0x2000,
            0,
            "/bin/x",
            sys::PERF_RECORD_MISC_USER,
        ),
        user_sample(2002, 2002, 0x500abc, format),
        encode_comm(2002, 2002, "x"),
    ];
    let stats = run_pipeline(format, options(session.path(), false), &records);

    assert_eq!(
        read_samples(session.path(), &flat_name("/bin/x", "/bin/x")),
        vec![(0xabc, 1)]
    );
    assert_eq!(stats.lost_no_mapping, 0);
    assert_eq!(stats.no_app_user_sample, 0);
    assert_eq!(stats.user_samples, 1);
}

#[test]
fn fork_shares_mappings_until_exec_diverges() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);

    let records = vec![
        encode_comm(3003, 3003, "p"),
        encode_mmap(
            3003,
            3003,
            0x600000,
            0x1000,
            0,
            "/bin/p",
            sys::PERF_RECORD_MISC_USER,
        ),
        encode_fork(3004, 3003, 3004, 3003, 1),
        user_sample(3004, 3004, 0x600200, format),
        encode_comm(3004, 3004, "c"),
        encode_mmap(
            3004,
            3004,
            0x700000,
            0x1000,
            0,
            "/bin/c",
            sys::PERF_RECORD_MISC_USER,
        ),
        user_sample(3004, 3004, 0x700300, format),
    ];
    let stats = run_pipeline(format, options(session.path(), false), &records);

    // The pre-exec sample lands in the parent's binary, the post-exec one in
    // the child's own; both under the child's application name.
    assert_eq!(
        read_samples(session.path(), &flat_name("/bin/c", "/bin/p")),
        vec![(0x200, 1)]
    );
    assert_eq!(
        read_samples(session.path(), &flat_name("/bin/c", "/bin/c")),
        vec![(0x300, 1)]
    );
    assert_eq!(stats.user_samples, 2);
    assert_eq!(stats.lost_no_mapping, 0);
}

#[test]
fn hypervisor_samples_are_deferred_and_bucketed() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);

    let samples = [0x10u64, 0x1000, 0x100];
    let records: Vec<Vec<u8>> = samples
        .iter()
        .map(|&ip| {
            encode_sample(
                format,
                sys::PERF_RECORD_MISC_HYPERVISOR,
                ip,
                4004,
                4004,
                EVENT_ID,
                None,
                None,
            )
        })
        .collect();
    let stats = run_pipeline(format, options(session.path(), false), &records);

    let name = SampleFileName {
        app: String::new(),
        image: ImagePart::Anon {
            name: "[hypervisor_bucket]".to_owned(),
            tgid: 4004,
            start: 0x10,
            end: 0x1000,
        },
        thread: None,
        cpu: None,
        cg_from: None,
        counter: 0,
    };
    assert_eq!(
        read_samples(session.path(), &name),
        vec![(0x10, 1), (0x100, 1), (0x1000, 1)]
    );
    assert_eq!(stats.user_samples, 3);
    assert_eq!(stats.lost_invalid_hv_addr, 0);
}

#[test]
fn out_of_range_hypervisor_samples_are_dropped() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);

    let records = vec![encode_sample(
        format,
        sys::PERF_RECORD_MISC_HYPERVISOR,
        0x1_0000_0000,
        4004,
        4004,
        EVENT_ID,
        None,
        None,
    )];
    let stats = run_pipeline(format, options(session.path(), false), &records);
    assert_eq!(stats.lost_invalid_hv_addr, 1);
    assert_eq!(stats.samples, 0);
}

#[test]
fn kernel_samples_resolve_through_kernel_images() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);

    let records = vec![
        encode_mmap(
            0,
            0,
            0xffff_0000_0000,
            0x10_0000,
            0,
            "/proc/kallsyms",
            sys::PERF_RECORD_MISC_KERNEL,
        ),
        encode_comm(1001, 1001, "app"),
        encode_mmap(
            1001,
            1001,
            0x400000,
            0x1000,
            0,
            "/bin/app",
            sys::PERF_RECORD_MISC_USER,
        ),
        encode_sample(
            format,
            sys::PERF_RECORD_MISC_KERNEL,
            0xffff_0000_1234,
            1001,
            1001,
            EVENT_ID,
            None,
            None,
        ),
    ];
    let stats = run_pipeline(format, options(session.path(), false), &records);

    // Kernel keys are offsets from the kernel image base.
    assert_eq!(
        read_samples(session.path(), &flat_name("/bin/app", "/proc/kallsyms")),
        vec![(0x1234, 1)]
    );
    assert_eq!(stats.kernel_samples, 1);
    assert_eq!(stats.user_samples, 0);
}

#[test]
fn callchain_entries_become_arcs() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, true);

    let chain = [sys::PERF_CONTEXT_USER, 0x400100, 0x400200];
    let records = vec![
        encode_comm(1001, 1001, "app"),
        encode_mmap(
            1001,
            1001,
            0x400000,
            0x1000,
            0,
            "/bin/app",
            sys::PERF_RECORD_MISC_USER,
        ),
        encode_sample(
            format,
            sys::PERF_RECORD_MISC_USER,
            0x400100,
            1001,
            1001,
            EVENT_ID,
            None,
            Some(&chain),
        ),
    ];
    let stats = run_pipeline(format, options(session.path(), true), &records);

    // The flat sample.
    assert_eq!(
        read_samples(session.path(), &flat_name("/bin/app", "/bin/app")),
        vec![(0x100, 1)]
    );
    // The entry repeating the sampled ip is skipped; the one arc goes from
    // the sampled frame to its caller.
    let arc_name = SampleFileName {
        cg_from: Some(ImagePart::Path("/bin/app".to_owned())),
        ..flat_name("/bin/app", "/bin/app")
    };
    assert_eq!(read_samples(session.path(), &arc_name), vec![(0x200, 1)]);
    assert_eq!(stats.samples, 1);
    assert_eq!(stats.bt_lost_no_mapping, 0);
}

#[test]
fn per_cpu_separation_reaches_the_file_name() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(true, false);
    let mut opts = options(session.path(), false);
    opts.separate_cpu = true;

    let records = vec![
        encode_comm(1001, 1001, "app"),
        encode_mmap(
            1001,
            1001,
            0x400000,
            0x1000,
            0,
            "/bin/app",
            sys::PERF_RECORD_MISC_USER,
        ),
        encode_sample(
            format,
            sys::PERF_RECORD_MISC_USER,
            0x400100,
            1001,
            1001,
            EVENT_ID,
            Some(3),
            None,
        ),
    ];
    run_pipeline(format, opts, &records);

    let name = SampleFileName {
        cpu: Some(3),
        ..flat_name("/bin/app", "/bin/app")
    };
    assert_eq!(read_samples(session.path(), &name), vec![(0x100, 1)]);
}

#[test]
fn samples_for_unknown_processes_count_as_lost() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);

    // No comm or mmap ever arrives for this pid, so even the second pass
    // has no process to attribute the deferred sample to.
    let records = vec![user_sample(7777, 7777, 0xdead_0000, format)];
    let stats = run_pipeline(format, options(session.path(), false), &records);

    assert_eq!(stats.samples, 0);
    assert_eq!(stats.no_app_user_sample, 1);
    assert_eq!(stats.lost_no_mapping, 0);
}

fn raw_record(kind: u32, misc: u16, payload: &[u8]) -> Vec<u8> {
    let size = (8 + payload.len()) as u16;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&misc.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[test]
fn mapping_boundaries_are_inclusive() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);

    let records = vec![
        encode_comm(1001, 1001, "app"),
        encode_mmap(
            1001,
            1001,
            0x400000,
            0x1000,
            0,
            "/bin/app",
            sys::PERF_RECORD_MISC_USER,
        ),
        // First byte, last byte, and one past the end.
        user_sample(1001, 1001, 0x400000, format),
        user_sample(1001, 1001, 0x400fff, format),
        user_sample(1001, 1001, 0x401000, format),
    ];
    let stats = run_pipeline(format, options(session.path(), false), &records);

    assert_eq!(stats.user_samples, 2);
    assert_eq!(stats.lost_no_mapping, 1);

    let path = session
        .path()
        .join("samples")
        .join("current")
        .join(flat_name("/bin/app", "/bin/app").relative_path());
    let db = SampleDb::open(&path, OpenMode::ReadOnly, HEADER_SIZE).unwrap();
    // The offset-zero sample occupies a node but is invisible to iteration,
    // which skips zero keys.
    assert_eq!(db.node_count(), 2);
    assert_eq!(db.iter().collect::<Vec<_>>(), vec![(0xfff, 1)]);
}

#[test]
fn per_thread_separation_reaches_the_file_name() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);
    let mut opts = options(session.path(), false);
    opts.separate_thread = true;

    let records = vec![
        encode_comm(1001, 1001, "app"),
        encode_mmap(
            1001,
            1001,
            0x400000,
            0x1000,
            0,
            "/bin/app",
            sys::PERF_RECORD_MISC_USER,
        ),
        user_sample(1001, 1001, 0x400100, format),
        user_sample(1001, 1003, 0x400100, format),
    ];
    run_pipeline(format, opts, &records);

    let main_thread = SampleFileName {
        thread: Some((1001, 1001)),
        ..flat_name("/bin/app", "/bin/app")
    };
    let worker = SampleFileName {
        thread: Some((1001, 1003)),
        ..flat_name("/bin/app", "/bin/app")
    };
    assert_eq!(read_samples(session.path(), &main_thread), vec![(0x100, 1)]);
    assert_eq!(read_samples(session.path(), &worker), vec![(0x100, 1)]);
}

#[test]
fn excluded_user_domain_samples_are_dropped() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);
    let mut event = test_event();
    event.exclude_user = true;

    let records = vec![
        encode_comm(1001, 1001, "app"),
        encode_mmap(
            1001,
            1001,
            0x400000,
            0x1000,
            0,
            "/bin/app",
            sys::PERF_RECORD_MISC_USER,
        ),
        user_sample(1001, 1001, 0x400100, format),
    ];
    let stats = run_pipeline_with_event(event, format, options(session.path(), false), &records);
    assert_eq!(stats.samples, 0);
    assert_eq!(stats.user_samples, 0);
}

#[test]
fn throttle_and_lost_records_are_accounted() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);

    let mut throttle = Vec::new();
    throttle.extend_from_slice(&77u64.to_le_bytes()); // time
    throttle.extend_from_slice(&EVENT_ID.to_le_bytes()); // id
    throttle.extend_from_slice(&EVENT_ID.to_le_bytes()); // stream id

    let mut lost = Vec::new();
    lost.extend_from_slice(&EVENT_ID.to_le_bytes()); // id
    lost.extend_from_slice(&12u64.to_le_bytes()); // count

    let records = vec![
        raw_record(sys::PERF_RECORD_THROTTLE, 0, &throttle),
        // An unthrottle is logged and ignored.
        raw_record(sys::PERF_RECORD_UNTHROTTLE, 0, &throttle),
        raw_record(sys::PERF_RECORD_LOST, 0, &lost),
        // A read record is recognized but has no consumer here.
        raw_record(sys::PERF_RECORD_READ, 0, &[0u8; 16]),
    ];
    let stats = run_pipeline(format, options(session.path(), false), &records);

    assert_eq!(stats.throttle_incidents, 1);
    assert_eq!(stats.kernel_reported_lost, 12);
    assert_eq!(stats.samples, 0);
}

#[test]
fn lazy_conversion_reads_the_stream_from_a_file() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);
    let stream_events = vec![StreamEvent {
        config: test_event(),
        ids: vec![EVENT_ID],
        sample_format: format,
    }];

    let data_path = session.path().join("oxprof.data");
    {
        let file = std::fs::File::create(&data_path).unwrap();
        let mut writer = StreamWriter::new(StreamSink::File(file), &stream_events).unwrap();
        for record in [
            encode_comm(1001, 1001, "app"),
            encode_mmap(
                1001,
                1001,
                0x400000,
                0x1000,
                0,
                "/bin/app",
                sys::PERF_RECORD_MISC_USER,
            ),
            user_sample(1001, 1001, 0x400104, format),
        ] {
            writer.write_all(&record).unwrap();
        }
        writer.finish().unwrap();
    }

    let mut reader = StreamReader::open_file(&data_path).unwrap();
    let quit = AtomicBool::new(false);
    let stats = convert_stream(&mut reader, options(session.path(), false), &quit).unwrap();

    assert_eq!(stats.user_samples, 1);
    assert_eq!(
        read_samples(session.path(), &flat_name("/bin/app", "/bin/app")),
        vec![(0x104, 1)]
    );
}

#[test]
fn header_records_event_parameters() {
    let session = tempfile::tempdir().unwrap();
    let format = SampleFormat::for_options(false, false);

    let records = vec![
        encode_comm(1001, 1001, "app"),
        encode_mmap(
            1001,
            1001,
            0x400000,
            0x1000,
            0,
            "/bin/app",
            sys::PERF_RECORD_MISC_USER,
        ),
        user_sample(1001, 1001, 0x400100, format),
    ];
    run_pipeline(format, options(session.path(), false), &records);

    let path = session
        .path()
        .join("samples")
        .join("current")
        .join(flat_name("/bin/app", "/bin/app").relative_path());
    let db = SampleDb::open(&path, OpenMode::ReadOnly, HEADER_SIZE).unwrap();
    let header = SampleFileHeader::decode(db.header_bytes()).unwrap();
    assert_eq!(header.event_code, 0x3c);
    assert_eq!(header.event_count, 1000);
    assert_eq!(header.unit_mask, 0);
    assert!(!header.is_kernel);
    assert_eq!(header.anon_start, 0);
}
