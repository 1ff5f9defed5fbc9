use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

const MAGIC: [u8; 4] = *b"OXSF";
const VERSION: u32 = 1;

/// Byte length of the header prefix in every sample file.
pub const HEADER_SIZE: usize = 80;

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("not a sample file (bad magic)")]
    BadMagic,

    #[error("sample file format version {0} is not supported")]
    BadVersion(u32),

    #[error("sample file was recorded with different event parameters ({field} differs)")]
    Mismatch { field: &'static str },
}

/// The user header written at the front of every Sample-DB file. It pins the
/// event parameters the file was recorded under; the reader side refuses to
/// mix files whose parameters differ.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleFileHeader {
    pub event_code: u64,
    /// Sampling period (events per sample).
    pub event_count: u64,
    pub unit_mask: u64,
    pub cpu_type: u32,
    /// CPU speed in MHz, 0.0 when unknown.
    pub cpu_speed: f64,
    pub is_kernel: bool,
    /// Start of the anonymous region, 0 for file-backed images.
    pub anon_start: u64,
    /// mtime of the binary, 0 for synthetic images (kallsyms, no-vmlinux).
    pub mtime: u64,
    /// For call-graph files: whether the arc's source is a kernel image.
    pub cg_to_is_kernel: bool,
    /// For call-graph files: anon start of the arc's source region.
    pub cg_to_anon_start: u64,
}

impl SampleFileHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let mut w = Cursor::new(&mut buf[..]);
        w.write_all(&MAGIC).unwrap();
        w.write_u32::<LittleEndian>(VERSION).unwrap();
        w.write_u64::<LittleEndian>(self.event_code).unwrap();
        w.write_u64::<LittleEndian>(self.event_count).unwrap();
        w.write_u64::<LittleEndian>(self.unit_mask).unwrap();
        w.write_u32::<LittleEndian>(self.cpu_type).unwrap();
        w.write_u32::<LittleEndian>(self.is_kernel as u32).unwrap();
        w.write_u32::<LittleEndian>(self.cg_to_is_kernel as u32)
            .unwrap();
        w.write_u32::<LittleEndian>(0).unwrap();
        w.write_f64::<LittleEndian>(self.cpu_speed).unwrap();
        w.write_u64::<LittleEndian>(self.anon_start).unwrap();
        w.write_u64::<LittleEndian>(self.mtime).unwrap();
        w.write_u64::<LittleEndian>(self.cg_to_anon_start).unwrap();
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<SampleFileHeader, HeaderError> {
        let mut r = Cursor::new(bytes);
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(|_| HeaderError::BadMagic)?;
        if magic != MAGIC {
            return Err(HeaderError::BadMagic);
        }
        let version = r.read_u32::<LittleEndian>().unwrap();
        if version != VERSION {
            return Err(HeaderError::BadVersion(version));
        }
        let event_code = r.read_u64::<LittleEndian>().unwrap();
        let event_count = r.read_u64::<LittleEndian>().unwrap();
        let unit_mask = r.read_u64::<LittleEndian>().unwrap();
        let cpu_type = r.read_u32::<LittleEndian>().unwrap();
        let is_kernel = r.read_u32::<LittleEndian>().unwrap() != 0;
        let cg_to_is_kernel = r.read_u32::<LittleEndian>().unwrap() != 0;
        let _reserved = r.read_u32::<LittleEndian>().unwrap();
        let cpu_speed = r.read_f64::<LittleEndian>().unwrap();
        let anon_start = r.read_u64::<LittleEndian>().unwrap();
        let mtime = r.read_u64::<LittleEndian>().unwrap();
        let cg_to_anon_start = r.read_u64::<LittleEndian>().unwrap();
        Ok(SampleFileHeader {
            event_code,
            event_count,
            unit_mask,
            cpu_type,
            cpu_speed,
            is_kernel,
            anon_start,
            mtime,
            cg_to_is_kernel,
            cg_to_anon_start,
        })
    }

    /// Check that a re-opened file was recorded under the same event
    /// parameters. Fields that may legitimately differ between sessions
    /// (cpu speed, mtime, anon ranges) are not compared.
    pub fn check_compatible(&self, existing: &SampleFileHeader) -> Result<(), HeaderError> {
        let mismatch = |field| Err(HeaderError::Mismatch { field });
        if self.event_code != existing.event_code {
            return mismatch("event code");
        }
        if self.event_count != existing.event_count {
            return mismatch("event count");
        }
        if self.unit_mask != existing.unit_mask {
            return mismatch("unit mask");
        }
        if self.cpu_type != existing.cpu_type {
            return mismatch("cpu type");
        }
        if self.is_kernel != existing.is_kernel {
            return mismatch("kernel flag");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> SampleFileHeader {
        SampleFileHeader {
            event_code: 0x3c,
            event_count: 100_000,
            unit_mask: 0,
            cpu_type: 1,
            cpu_speed: 2893.21,
            is_kernel: false,
            anon_start: 0,
            mtime: 1_600_000_000,
            cg_to_is_kernel: false,
            cg_to_anon_start: 0,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let h = header();
        assert_eq!(SampleFileHeader::decode(&h.encode()).unwrap(), h);
    }

    #[test]
    fn mismatched_event_parameters_are_rejected() {
        let recorded = header();
        let mut reopened = header();
        reopened.event_count = 250_000;
        let err = reopened.check_compatible(&recorded).unwrap_err();
        assert!(matches!(
            err,
            HeaderError::Mismatch {
                field: "event count"
            }
        ));

        let mut reopened = header();
        reopened.cpu_speed = 1000.0;
        reopened.mtime = 0;
        // Session-variable fields never fail the check.
        reopened.check_compatible(&recorded).unwrap();
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            SampleFileHeader::decode(&[0u8; HEADER_SIZE]),
            Err(HeaderError::BadMagic)
        ));
    }
}
