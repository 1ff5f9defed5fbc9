//! The raw sample stream the recorder produces and the converter consumes,
//! either through a pipe or via an intermediate file (lazy conversion).
//!
//! Layout: a fixed header carrying the magic and the attribute-table and
//! data-region geometry, one attribute record per selected event followed by
//! that event's kernel-assigned id list, then the raw event records
//! concatenated. Every record starts with `{u32 type, u16 misc, u16 size}`
//! and is `size` bytes long including that header.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::StreamError;
use crate::linux::sys;
use crate::linux_shared::event::{EventConfig, SampleFormat};

pub const STREAM_MAGIC: [u8; 8] = *b"OPFILE\0\0";

pub const FILE_HEADER_SIZE: u64 = 56;
pub const ATTR_RECORD_SIZE: u64 = 128;
pub const RECORD_HEADER_SIZE: usize = 8;
const EVENT_NAME_LEN: usize = 64;

const ATTR_FLAG_EXCLUDE_KERNEL: u32 = 1;
const ATTR_FLAG_EXCLUDE_USER: u32 = 2;
const ATTR_FLAG_EXCLUDE_HV: u32 = 4;

/// One event's entry in the stream header: its configuration plus the
/// kernel ids that samples of this event carry (one id per opened counter).
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub config: EventConfig,
    pub ids: Vec<u64>,
    pub sample_format: SampleFormat,
}

pub enum StreamSink {
    File(File),
    Pipe(Box<dyn Write + Send>),
}

/// Writes the stream header up front and then appends raw records. In file
/// mode `finish` seeks back and patches the data-region size; pipe readers
/// instead consume until EOF.
pub struct StreamWriter {
    sink: StreamSink,
    data_bytes: u64,
}

impl StreamWriter {
    pub fn new(mut sink: StreamSink, events: &[StreamEvent]) -> io::Result<StreamWriter> {
        let total_ids: u64 = events.iter().map(|e| e.ids.len() as u64).sum();
        let attrs_size = events.len() as u64 * ATTR_RECORD_SIZE;
        let data_offset = FILE_HEADER_SIZE + attrs_size + total_ids * 8;

        let mut header = Vec::with_capacity(data_offset as usize);
        header.write_all(&STREAM_MAGIC)?;
        header.write_u64::<LittleEndian>(FILE_HEADER_SIZE)?;
        header.write_u64::<LittleEndian>(ATTR_RECORD_SIZE)?;
        header.write_u64::<LittleEndian>(FILE_HEADER_SIZE)?;
        header.write_u64::<LittleEndian>(attrs_size)?;
        header.write_u64::<LittleEndian>(data_offset)?;
        header.write_u64::<LittleEndian>(0)?; // data size, patched by finish()

        let mut ids_offset = FILE_HEADER_SIZE + attrs_size;
        for event in events {
            write_attr_record(&mut header, event, ids_offset)?;
            ids_offset += event.ids.len() as u64 * 8;
        }
        for event in events {
            for &id in &event.ids {
                header.write_u64::<LittleEndian>(id)?;
            }
        }
        debug_assert_eq!(header.len() as u64, data_offset);

        match &mut sink {
            StreamSink::File(f) => f.write_all(&header)?,
            StreamSink::Pipe(w) => w.write_all(&header)?,
        }
        Ok(StreamWriter {
            sink,
            data_bytes: 0,
        })
    }

    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    /// Patch the data size into the header (file mode) and flush.
    pub fn finish(mut self) -> io::Result<u64> {
        match &mut self.sink {
            StreamSink::File(f) => {
                f.seek(SeekFrom::Start(48))?;
                f.write_u64::<LittleEndian>(self.data_bytes)?;
                f.flush()?;
            }
            StreamSink::Pipe(w) => w.flush()?,
        }
        Ok(self.data_bytes)
    }
}

// The ring drain writes through this; `write_all` retries EINTR.
impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = match &mut self.sink {
            StreamSink::File(f) => f.write(buf)?,
            StreamSink::Pipe(w) => w.write(buf)?,
        };
        self.data_bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            StreamSink::File(f) => f.flush(),
            StreamSink::Pipe(w) => w.flush(),
        }
    }
}

fn write_attr_record(out: &mut Vec<u8>, event: &StreamEvent, ids_offset: u64) -> io::Result<()> {
    let config = &event.config;
    out.write_u32::<LittleEndian>(config.kind)?;
    out.write_u32::<LittleEndian>(config.counter as u32)?;
    out.write_u64::<LittleEndian>(config.code)?;
    out.write_u64::<LittleEndian>(config.period)?;
    out.write_u64::<LittleEndian>(config.unit_mask)?;
    out.write_u64::<LittleEndian>(event.sample_type())?;
    let mut flags = 0;
    if config.exclude_kernel {
        flags |= ATTR_FLAG_EXCLUDE_KERNEL;
    }
    if config.exclude_user {
        flags |= ATTR_FLAG_EXCLUDE_USER;
    }
    if config.exclude_hv {
        flags |= ATTR_FLAG_EXCLUDE_HV;
    }
    out.write_u32::<LittleEndian>(flags)?;
    out.write_u32::<LittleEndian>(0)?;
    let mut name = [0u8; EVENT_NAME_LEN];
    let len = config.name.len().min(EVENT_NAME_LEN - 1);
    name[..len].copy_from_slice(&config.name.as_bytes()[..len]);
    out.write_all(&name)?;
    out.write_u64::<LittleEndian>(ids_offset)?;
    out.write_u64::<LittleEndian>(event.ids.len() as u64 * 8)?;
    Ok(())
}

impl StreamEvent {
    fn sample_type(&self) -> u64 {
        // All counters of one run share the sample format; it is recorded
        // per attribute anyway so the reader does not have to guess.
        self.sample_format.bits()
    }
}

/// What the reader learns from the stream header.
#[derive(Debug, Clone)]
pub struct StreamAttrs {
    pub events: Vec<EventConfig>,
    pub sample_format: SampleFormat,
    id_to_counter: HashMap<u64, usize>,
}

impl StreamAttrs {
    pub fn counter_for_id(&self, id: u64) -> Option<usize> {
        self.id_to_counter.get(&id).copied()
    }
}

/// One raw record: the `{type, misc, size}` header split out, plus the
/// payload bytes that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub kind: u32,
    pub misc: u16,
    pub data: Vec<u8>,
}

enum StreamSource {
    File {
        map: memmap2::Mmap,
        pos: usize,
        /// End of the data region; `None` when the header was never patched
        /// (recorder died) and we read until the file ends.
        trusted_end: Option<usize>,
    },
    Pipe(Box<dyn Read>),
}

pub struct StreamReader {
    source: StreamSource,
    pub attrs: StreamAttrs,
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("attrs", &self.attrs)
            .finish()
    }
}

impl StreamReader {
    pub fn open_file(path: &Path) -> Result<StreamReader, StreamError> {
        let file = File::open(path)?;
        let map = unsafe { memmap2::Mmap::map(&file) }?;
        if map.len() < FILE_HEADER_SIZE as usize {
            return Err(StreamError::BadMagic);
        }
        let (attrs, data_offset, data_size) = parse_header_and_attrs(&map)?;
        let trusted_end = if data_size > 0 {
            let end = (data_offset + data_size) as usize;
            if end > map.len() {
                return Err(StreamError::Corrupt("data region extends past end of file"));
            }
            Some(end)
        } else {
            log::warn!("sample data file has no recorded data size; it may be incomplete");
            None
        };
        Ok(StreamReader {
            source: StreamSource::File {
                map,
                pos: data_offset as usize,
                trusted_end,
            },
            attrs,
        })
    }

    pub fn open_pipe(mut pipe: Box<dyn Read>) -> Result<StreamReader, StreamError> {
        let mut header = vec![0u8; FILE_HEADER_SIZE as usize];
        read_fully(&mut pipe, &mut header)?
            .then_some(())
            .ok_or(StreamError::BadMagic)?;
        let (data_offset, _data_size, attrs_size) = parse_file_header(&header)?;
        let rest_len = data_offset - FILE_HEADER_SIZE;
        let mut rest = vec![0u8; rest_len as usize];
        if !read_fully(&mut pipe, &mut rest)? {
            return Err(StreamError::Corrupt("truncated attribute table"));
        }
        let mut full = header;
        full.extend_from_slice(&rest);
        let attrs = parse_attrs(&full, attrs_size)?;
        Ok(StreamReader {
            source: StreamSource::Pipe(pipe),
            attrs,
        })
    }

    /// The next record, or `None` at a clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<RawRecord>, StreamError> {
        match &mut self.source {
            StreamSource::File {
                map,
                pos,
                trusted_end,
            } => {
                let end = trusted_end.unwrap_or(map.len());
                if *pos + RECORD_HEADER_SIZE > end {
                    return Ok(None);
                }
                let header = &map[*pos..*pos + RECORD_HEADER_SIZE];
                let (kind, misc, size) = parse_record_header(header);
                if size == 0 && trusted_end.is_none() {
                    // Zeroed tail of a file that was never finished.
                    return Ok(None);
                }
                validate_record_header(kind, size)?;
                if *pos + size as usize > end {
                    return Err(StreamError::Corrupt("record extends past the data region"));
                }
                let data = map[*pos + RECORD_HEADER_SIZE..*pos + size as usize].to_vec();
                *pos += size as usize;
                Ok(Some(RawRecord { kind, misc, data }))
            }
            StreamSource::Pipe(pipe) => {
                let mut header = [0u8; RECORD_HEADER_SIZE];
                if !read_fully(pipe, &mut header)? {
                    return Ok(None);
                }
                let (kind, misc, size) = parse_record_header(&header);
                validate_record_header(kind, size)?;
                let mut data = vec![0u8; size as usize - RECORD_HEADER_SIZE];
                if !read_fully(pipe, &mut data)? {
                    return Err(StreamError::Corrupt("record truncated mid-payload"));
                }
                Ok(Some(RawRecord { kind, misc, data }))
            }
        }
    }
}

fn parse_record_header(bytes: &[u8]) -> (u32, u16, u16) {
    let kind = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let misc = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
    let size = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
    (kind, misc, size)
}

fn validate_record_header(kind: u32, size: u16) -> Result<(), StreamError> {
    if (size as usize) <= RECORD_HEADER_SIZE {
        return Err(StreamError::Corrupt("record size is not larger than its header"));
    }
    if kind > sys::PERF_RECORD_MAX {
        return Err(StreamError::Corrupt("record type out of range"));
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes, retrying on EINTR. Returns false on EOF
/// at the first byte; a partial fill is an error.
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool, StreamError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(StreamError::Corrupt("unexpected end of stream")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn parse_file_header(bytes: &[u8]) -> Result<(u64, u64, u64), StreamError> {
    if bytes[..8] != STREAM_MAGIC {
        return Err(StreamError::BadMagic);
    }
    let mut r = Cursor::new(&bytes[8..]);
    let _header_size = r.read_u64::<LittleEndian>()?;
    let attr_size = r.read_u64::<LittleEndian>()?;
    if attr_size != ATTR_RECORD_SIZE {
        return Err(StreamError::BadAttrSize);
    }
    let attrs_offset = r.read_u64::<LittleEndian>()?;
    let attrs_size = r.read_u64::<LittleEndian>()?;
    if attrs_offset != FILE_HEADER_SIZE || attrs_size % ATTR_RECORD_SIZE != 0 {
        return Err(StreamError::Corrupt("attribute table has bad geometry"));
    }
    let data_offset = r.read_u64::<LittleEndian>()?;
    let data_size = r.read_u64::<LittleEndian>()?;
    Ok((data_offset, data_size, attrs_size))
}

fn parse_header_and_attrs(bytes: &[u8]) -> Result<(StreamAttrs, u64, u64), StreamError> {
    let (data_offset, data_size, attrs_size) = parse_file_header(bytes)?;
    if (data_offset as usize) > bytes.len() {
        return Err(StreamError::Corrupt("header tables extend past end of file"));
    }
    let attrs = parse_attrs(bytes, attrs_size)?;
    Ok((attrs, data_offset, data_size))
}

fn parse_attrs(bytes: &[u8], attrs_size: u64) -> Result<StreamAttrs, StreamError> {
    let count = (attrs_size / ATTR_RECORD_SIZE) as usize;
    let mut events = Vec::with_capacity(count);
    let mut id_to_counter = HashMap::new();
    let mut sample_format = SampleFormat::empty();

    for index in 0..count {
        let at = (FILE_HEADER_SIZE + index as u64 * ATTR_RECORD_SIZE) as usize;
        let record = bytes
            .get(at..at + ATTR_RECORD_SIZE as usize)
            .ok_or(StreamError::Corrupt("truncated attribute record"))?;
        let mut r = Cursor::new(record);
        let kind = r.read_u32::<LittleEndian>()?;
        let counter = r.read_u32::<LittleEndian>()? as usize;
        let code = r.read_u64::<LittleEndian>()?;
        let period = r.read_u64::<LittleEndian>()?;
        let unit_mask = r.read_u64::<LittleEndian>()?;
        let sample_type = r.read_u64::<LittleEndian>()?;
        let flags = r.read_u32::<LittleEndian>()?;
        let _reserved = r.read_u32::<LittleEndian>()?;
        let mut name = [0u8; EVENT_NAME_LEN];
        r.read_exact(&mut name)?;
        let name_len = memchr::memchr(0, &name).unwrap_or(EVENT_NAME_LEN);
        let name = String::from_utf8_lossy(&name[..name_len]).into_owned();
        let ids_offset = r.read_u64::<LittleEndian>()? as usize;
        let ids_len = r.read_u64::<LittleEndian>()? as usize;

        let ids_bytes = bytes
            .get(ids_offset..ids_offset + ids_len)
            .ok_or(StreamError::Corrupt("id list extends past header tables"))?;
        for id_chunk in ids_bytes.chunks_exact(8) {
            let id = u64::from_le_bytes(id_chunk.try_into().unwrap());
            id_to_counter.insert(id, counter);
        }

        sample_format = SampleFormat::from_bits_retain(sample_type);
        events.push(EventConfig {
            name,
            kind,
            code,
            period,
            unit_mask,
            exclude_kernel: flags & ATTR_FLAG_EXCLUDE_KERNEL != 0,
            exclude_user: flags & ATTR_FLAG_EXCLUDE_USER != 0,
            exclude_hv: flags & ATTR_FLAG_EXCLUDE_HV != 0,
            counter,
        });
    }

    if !sample_format.contains(SampleFormat::IP | SampleFormat::TID | SampleFormat::ID) {
        return Err(StreamError::Corrupt(
            "sample format lacks a mandatory field (ip, tid or id)",
        ));
    }

    Ok(StreamAttrs {
        events,
        sample_format,
        id_to_counter,
    })
}

/// Build the 8-byte record header.
pub fn record_header(kind: u32, misc: u16, size: u16) -> [u8; RECORD_HEADER_SIZE] {
    let mut out = [0u8; RECORD_HEADER_SIZE];
    out[0..4].copy_from_slice(&kind.to_le_bytes());
    out[4..6].copy_from_slice(&misc.to_le_bytes());
    out[6..8].copy_from_slice(&size.to_le_bytes());
    out
}
