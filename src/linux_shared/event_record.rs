//! Typed view of the raw event records. The demultiplexer refuses to
//! open-code header casts; every record kind is a variant here, and byte
//! layouts appear in exactly one place, these parse/encode pairs. The
//! encode side is used for the records the recorder synthesizes itself
//! (initial comm/mmap state, kernel images).

use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::StreamError;
use crate::linux::sys;
use crate::stream::{record_header, RawRecord, RECORD_HEADER_SIZE};

use super::event::SampleFormat;

/// The domain a record was taken in, from the misc field's cpumode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Unknown,
    Kernel,
    User,
    Hypervisor,
    GuestKernel,
    GuestUser,
}

impl CpuMode {
    pub fn from_misc(misc: u16) -> CpuMode {
        match misc & sys::PERF_RECORD_MISC_CPUMODE_MASK {
            sys::PERF_RECORD_MISC_KERNEL => CpuMode::Kernel,
            sys::PERF_RECORD_MISC_USER => CpuMode::User,
            sys::PERF_RECORD_MISC_HYPERVISOR => CpuMode::Hypervisor,
            sys::PERF_RECORD_MISC_GUEST_KERNEL => CpuMode::GuestKernel,
            sys::PERF_RECORD_MISC_GUEST_USER => CpuMode::GuestUser,
            _ => CpuMode::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommRecord {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapRecord {
    pub pid: u32,
    pub tid: u32,
    pub start: u64,
    pub len: u64,
    pub pgoff: u64,
    pub filename: String,
    pub cpu_mode: CpuMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRecord {
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostRecord {
    pub id: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleRecord {
    pub time: u64,
    pub id: u64,
    pub stream_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub id: u64,
    pub cpu: Option<u32>,
    pub callchain: Option<Vec<u64>>,
    pub cpu_mode: CpuMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    Comm(CommRecord),
    Mmap(MmapRecord),
    Fork(TaskRecord),
    Exit(TaskRecord),
    Lost(LostRecord),
    Throttle(ThrottleRecord),
    Unthrottle(ThrottleRecord),
    Sample(SampleRecord),
    /// A type byte we know to be possible but have no use for, or one the
    /// kernel grew after this code was written. Logged and skipped.
    Unknown(u32),
}

impl EventRecord {
    pub fn parse(raw: &RawRecord, format: SampleFormat) -> Result<EventRecord, StreamError> {
        let corrupt = |_| StreamError::Corrupt("record payload is shorter than its type requires");
        let mut r = Cursor::new(raw.data.as_slice());
        match raw.kind {
            sys::PERF_RECORD_COMM => {
                let pid = r.read_u32::<LittleEndian>().map_err(corrupt)?;
                let tid = r.read_u32::<LittleEndian>().map_err(corrupt)?;
                let comm = read_fixed_string(&raw.data[8..]);
                Ok(EventRecord::Comm(CommRecord { pid, tid, comm }))
            }
            sys::PERF_RECORD_MMAP => {
                let pid = r.read_u32::<LittleEndian>().map_err(corrupt)?;
                let tid = r.read_u32::<LittleEndian>().map_err(corrupt)?;
                let start = r.read_u64::<LittleEndian>().map_err(corrupt)?;
                let len = r.read_u64::<LittleEndian>().map_err(corrupt)?;
                let pgoff = r.read_u64::<LittleEndian>().map_err(corrupt)?;
                let filename = read_fixed_string(&raw.data[32..]);
                Ok(EventRecord::Mmap(MmapRecord {
                    pid,
                    tid,
                    start,
                    len,
                    pgoff,
                    filename,
                    cpu_mode: CpuMode::from_misc(raw.misc),
                }))
            }
            sys::PERF_RECORD_FORK | sys::PERF_RECORD_EXIT => {
                let pid = r.read_u32::<LittleEndian>().map_err(corrupt)?;
                let ppid = r.read_u32::<LittleEndian>().map_err(corrupt)?;
                let tid = r.read_u32::<LittleEndian>().map_err(corrupt)?;
                let ptid = r.read_u32::<LittleEndian>().map_err(corrupt)?;
                let time = r.read_u64::<LittleEndian>().map_err(corrupt)?;
                let record = TaskRecord {
                    pid,
                    ppid,
                    tid,
                    ptid,
                    time,
                };
                if raw.kind == sys::PERF_RECORD_FORK {
                    Ok(EventRecord::Fork(record))
                } else {
                    Ok(EventRecord::Exit(record))
                }
            }
            sys::PERF_RECORD_LOST => {
                let id = r.read_u64::<LittleEndian>().map_err(corrupt)?;
                let count = r.read_u64::<LittleEndian>().map_err(corrupt)?;
                Ok(EventRecord::Lost(LostRecord { id, count }))
            }
            sys::PERF_RECORD_THROTTLE | sys::PERF_RECORD_UNTHROTTLE => {
                let time = r.read_u64::<LittleEndian>().map_err(corrupt)?;
                let id = r.read_u64::<LittleEndian>().map_err(corrupt)?;
                let stream_id = r.read_u64::<LittleEndian>().map_err(corrupt)?;
                let record = ThrottleRecord {
                    time,
                    id,
                    stream_id,
                };
                if raw.kind == sys::PERF_RECORD_THROTTLE {
                    Ok(EventRecord::Throttle(record))
                } else {
                    Ok(EventRecord::Unthrottle(record))
                }
            }
            sys::PERF_RECORD_SAMPLE => parse_sample(raw, format).map(EventRecord::Sample),
            other => Ok(EventRecord::Unknown(other)),
        }
    }
}

/// Walk the sample payload in the kernel's field order, taking exactly the
/// fields the negotiated format promises. A missing mandatory field shows up
/// as a short read, which is stream corruption.
fn parse_sample(raw: &RawRecord, format: SampleFormat) -> Result<SampleRecord, StreamError> {
    let mut r = Cursor::new(raw.data.as_slice());
    let corrupt = |_| StreamError::Corrupt("sample record is missing a mandatory field");

    if !format.contains(SampleFormat::IP | SampleFormat::TID | SampleFormat::ID) {
        return Err(StreamError::Corrupt(
            "sample format lacks a mandatory field (ip, tid or id)",
        ));
    }

    let ip = r.read_u64::<LittleEndian>().map_err(corrupt)?;
    let pid = r.read_u32::<LittleEndian>().map_err(corrupt)?;
    let tid = r.read_u32::<LittleEndian>().map_err(corrupt)?;
    let id = r.read_u64::<LittleEndian>().map_err(corrupt)?;

    let cpu = if format.contains(SampleFormat::CPU) {
        let cpu = r.read_u32::<LittleEndian>().map_err(corrupt)?;
        let _reserved = r.read_u32::<LittleEndian>().map_err(corrupt)?;
        Some(cpu)
    } else {
        None
    };

    let callchain = if format.contains(SampleFormat::CALLCHAIN) {
        let nr = r
            .read_u64::<LittleEndian>()
            .map_err(|_| StreamError::Corrupt("sample record has a truncated callchain"))?;
        if nr > 1024 {
            return Err(StreamError::Corrupt("callchain length is implausible"));
        }
        let mut ips = Vec::with_capacity(nr as usize);
        for _ in 0..nr {
            ips.push(
                r.read_u64::<LittleEndian>()
                    .map_err(|_| StreamError::Corrupt("sample record has a truncated callchain"))?,
            );
        }
        Some(ips)
    } else {
        None
    };

    Ok(SampleRecord {
        ip,
        pid,
        tid,
        id,
        cpu,
        callchain,
        cpu_mode: CpuMode::from_misc(raw.misc),
    })
}

fn read_fixed_string(bytes: &[u8]) -> String {
    let len = memchr::memchr(0, bytes).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

fn align_8(len: usize) -> usize {
    (len + 7) & !7
}

/// Encode a comm record the way the kernel lays it out, NUL-padded to
/// 8-byte alignment.
pub fn encode_comm(pid: u32, tid: u32, comm: &str) -> Vec<u8> {
    let name_len = align_8(comm.len() + 1);
    let size = RECORD_HEADER_SIZE + 8 + name_len;
    let mut out = record_header(sys::PERF_RECORD_COMM, 0, size as u16).to_vec();
    out.write_u32::<LittleEndian>(pid).unwrap();
    out.write_u32::<LittleEndian>(tid).unwrap();
    out.write_all(comm.as_bytes()).unwrap();
    out.resize(size, 0);
    out
}

pub fn encode_mmap(
    pid: u32,
    tid: u32,
    start: u64,
    len: u64,
    pgoff: u64,
    filename: &str,
    misc: u16,
) -> Vec<u8> {
    let name_len = align_8(filename.len() + 1);
    let size = RECORD_HEADER_SIZE + 8 + 24 + name_len;
    let mut out = record_header(sys::PERF_RECORD_MMAP, misc, size as u16).to_vec();
    out.write_u32::<LittleEndian>(pid).unwrap();
    out.write_u32::<LittleEndian>(tid).unwrap();
    out.write_u64::<LittleEndian>(start).unwrap();
    out.write_u64::<LittleEndian>(len).unwrap();
    out.write_u64::<LittleEndian>(pgoff).unwrap();
    out.write_all(filename.as_bytes()).unwrap();
    out.resize(size, 0);
    out
}

pub fn encode_fork(pid: u32, ppid: u32, tid: u32, ptid: u32, time: u64) -> Vec<u8> {
    let size = RECORD_HEADER_SIZE + 24;
    let mut out = record_header(sys::PERF_RECORD_FORK, 0, size as u16).to_vec();
    out.write_u32::<LittleEndian>(pid).unwrap();
    out.write_u32::<LittleEndian>(ppid).unwrap();
    out.write_u32::<LittleEndian>(tid).unwrap();
    out.write_u32::<LittleEndian>(ptid).unwrap();
    out.write_u64::<LittleEndian>(time).unwrap();
    out
}

pub fn encode_sample(
    format: SampleFormat,
    misc: u16,
    ip: u64,
    pid: u32,
    tid: u32,
    id: u64,
    cpu: Option<u32>,
    callchain: Option<&[u64]>,
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.write_u64::<LittleEndian>(ip).unwrap();
    payload.write_u32::<LittleEndian>(pid).unwrap();
    payload.write_u32::<LittleEndian>(tid).unwrap();
    payload.write_u64::<LittleEndian>(id).unwrap();
    if format.contains(SampleFormat::CPU) {
        payload.write_u32::<LittleEndian>(cpu.unwrap_or(0)).unwrap();
        payload.write_u32::<LittleEndian>(0).unwrap();
    }
    if format.contains(SampleFormat::CALLCHAIN) {
        let chain = callchain.unwrap_or(&[]);
        payload.write_u64::<LittleEndian>(chain.len() as u64).unwrap();
        for &entry in chain {
            payload.write_u64::<LittleEndian>(entry).unwrap();
        }
    }
    let size = RECORD_HEADER_SIZE + payload.len();
    let mut out = record_header(sys::PERF_RECORD_SAMPLE, misc, size as u16).to_vec();
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(bytes: &[u8]) -> RawRecord {
        let kind = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let misc = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        RawRecord {
            kind,
            misc,
            data: bytes[RECORD_HEADER_SIZE..].to_vec(),
        }
    }

    #[test]
    fn comm_round_trip() {
        let bytes = encode_comm(1001, 1001, "app");
        let format = SampleFormat::for_options(false, false);
        let parsed = EventRecord::parse(&raw(&bytes), format).unwrap();
        assert_eq!(
            parsed,
            EventRecord::Comm(CommRecord {
                pid: 1001,
                tid: 1001,
                comm: "app".into()
            })
        );
    }

    #[test]
    fn mmap_round_trip() {
        let bytes = encode_mmap(
            1001,
            1001,
            0x400000,
            0x1000,
            0,
            "/bin/app",
            sys::PERF_RECORD_MISC_USER,
        );
        let format = SampleFormat::for_options(false, false);
        let parsed = EventRecord::parse(&raw(&bytes), format).unwrap();
        match parsed {
            EventRecord::Mmap(m) => {
                assert_eq!(m.start, 0x400000);
                assert_eq!(m.len, 0x1000);
                assert_eq!(m.filename, "/bin/app");
                assert_eq!(m.cpu_mode, CpuMode::User);
            }
            other => panic!("expected mmap, got {other:?}"),
        }
    }

    #[test]
    fn sample_with_all_optional_fields() {
        let format = SampleFormat::for_options(true, true);
        let chain = [sys::PERF_CONTEXT_USER, 0x400123, 0x400456];
        let bytes = encode_sample(
            format,
            sys::PERF_RECORD_MISC_USER,
            0x400123,
            7,
            8,
            42,
            Some(3),
            Some(&chain),
        );
        let parsed = EventRecord::parse(&raw(&bytes), format).unwrap();
        match parsed {
            EventRecord::Sample(s) => {
                assert_eq!(s.ip, 0x400123);
                assert_eq!((s.pid, s.tid), (7, 8));
                assert_eq!(s.id, 42);
                assert_eq!(s.cpu, Some(3));
                assert_eq!(s.callchain.as_deref(), Some(&chain[..]));
                assert_eq!(s.cpu_mode, CpuMode::User);
            }
            other => panic!("expected sample, got {other:?}"),
        }
    }

    #[test]
    fn truncated_sample_is_corruption() {
        let format = SampleFormat::for_options(false, false);
        let good = encode_sample(format, sys::PERF_RECORD_MISC_USER, 1, 2, 3, 4, None, None);
        let mut short = raw(&good);
        short.data.truncate(12);
        assert!(matches!(
            EventRecord::parse(&short, format),
            Err(StreamError::Corrupt(_))
        ));
    }

    #[test]
    fn fork_and_exit_share_a_layout() {
        let bytes = encode_fork(3004, 3003, 3004, 3003, 99);
        let format = SampleFormat::for_options(false, false);
        match EventRecord::parse(&raw(&bytes), format).unwrap() {
            EventRecord::Fork(f) => {
                assert_eq!((f.pid, f.ppid, f.tid, f.ptid), (3004, 3003, 3004, 3003));
            }
            other => panic!("expected fork, got {other:?}"),
        }

        let mut exit = bytes.clone();
        exit[0..4].copy_from_slice(&sys::PERF_RECORD_EXIT.to_le_bytes());
        assert!(matches!(
            EventRecord::parse(&raw(&exit), format).unwrap(),
            EventRecord::Exit(_)
        ));
    }

    #[test]
    fn unknown_types_are_preserved_not_fatal() {
        let mut bytes = record_header(sys::PERF_RECORD_READ, 0, 16).to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        let format = SampleFormat::for_options(false, false);
        assert_eq!(
            EventRecord::parse(&raw(&bytes), format).unwrap(),
            EventRecord::Unknown(sys::PERF_RECORD_READ)
        );
    }
}
