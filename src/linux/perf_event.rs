use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::ptr;
use std::slice;
use std::sync::atomic::{fence, Ordering};

use libc::{self, c_void, pid_t};

use super::sys::*;
use crate::error::{RingError, SetupError};
use crate::linux_shared::event::{EventConfig, SampleFormat};

/// Bytes of data pages in each ring (one extra control page is mapped in
/// front of them). Must stay a power-of-two multiple of the page size.
pub const RING_DATA_BYTES: usize = 512 * 1024;

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

unsafe fn read_head(pointer: *const u8) -> u64 {
    let page = &*(pointer as *const PerfEventMmapPage);
    let head = ptr::read_volatile(&page.data_head);
    fence(Ordering::Acquire);
    head
}

unsafe fn write_tail(pointer: *mut u8, value: u64) {
    let page = &mut *(pointer as *mut PerfEventMmapPage);
    fence(Ordering::AcqRel);
    ptr::write_volatile(&mut page.data_tail, value);
}

/// One open performance counter. Closes the fd on drop. The ring buffer, if
/// this counter owns one, is a separate [`RingBuffer`] value.
#[derive(Debug)]
pub struct PerfCounter {
    fd: RawFd,
    id: u64,
}

impl Drop for PerfCounter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl PerfCounter {
    /// Open a counter for `event` on `cpu`, for `pid` (-1 = all processes).
    ///
    /// `with_task_records` requests mmap/comm/fork/exit records alongside the
    /// samples; it is set on exactly one counter per CPU, the one whose fd
    /// the ring is mapped from.
    pub fn open(
        event: &EventConfig,
        pid: pid_t,
        cpu: i32,
        sample_format: SampleFormat,
        enable_on_exec: bool,
        inherit: bool,
        with_task_records: bool,
    ) -> Result<PerfCounter, SetupError> {
        let mut attr: PerfEventAttr = unsafe { std::mem::zeroed() };
        attr.size = std::mem::size_of::<PerfEventAttr>() as u32;
        attr.kind = event.kind;
        attr.config = event.code;
        attr.sample_period_or_freq = event.period;
        attr.sample_type = sample_format.bits();
        attr.read_format = PERF_FORMAT_ID;

        attr.flags = PERF_ATTR_FLAG_DISABLED;
        if inherit {
            attr.flags |= PERF_ATTR_FLAG_INHERIT;
        }
        if enable_on_exec {
            attr.flags |= PERF_ATTR_FLAG_ENABLE_ON_EXEC;
        }
        if event.exclude_kernel {
            attr.flags |= PERF_ATTR_FLAG_EXCLUDE_KERNEL;
        }
        if event.exclude_user {
            attr.flags |= PERF_ATTR_FLAG_EXCLUDE_USER;
        }
        if event.exclude_hv {
            attr.flags |= PERF_ATTR_FLAG_EXCLUDE_HV;
        }
        if with_task_records {
            attr.flags |= PERF_ATTR_FLAG_MMAP | PERF_ATTR_FLAG_COMM | PERF_ATTR_FLAG_TASK;
        }

        let fd = sys_perf_event_open(&attr, pid, cpu, -1, 0);
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EBUSY) => SetupError::PmuBusy,
                Some(libc::ESRCH) => SetupError::TargetEnded,
                Some(libc::EACCES) | Some(libc::EPERM) => SetupError::PermissionDenied(err),
                _ => SetupError::CounterOpen {
                    event: event.name.clone(),
                    source: err,
                },
            });
        }

        // With PERF_FORMAT_ID a read returns {value, id}; the id is what
        // sample records carry, so the converter needs it.
        let mut counter = PerfCounter { fd, id: 0 };
        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n != buf.len() as isize {
            return Err(SetupError::CounterId(io::Error::last_os_error()));
        }
        counter.id = u64::from_ne_bytes(buf[8..16].try_into().unwrap());
        Ok(counter)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The kernel-assigned event id carried in sample records.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn enable(&self) -> io::Result<()> {
        let result = unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_ENABLE as _) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn disable(&self) -> io::Result<()> {
        let result = unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_DISABLE as _) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Redirect this counter's records into another counter's ring.
    pub fn redirect_output_to(&self, owner: &PerfCounter) -> Result<(), SetupError> {
        let result = unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_SET_OUTPUT as _, owner.fd) };
        if result == -1 {
            return Err(SetupError::SetOutput(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        let result = unsafe { libc::fcntl(self.fd, libc::F_SETFL, libc::O_NONBLOCK) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// The kernel-shared ring: one control page followed by a power-of-two data
/// area. The kernel produces; we are the only consumer. All barrier
/// discipline lives here; callers only see a byte-level drain.
pub struct RingBuffer {
    base: *mut u8,
    data_offset: usize,
    data_size: u64,
    tail: u64,
    mapped_len: usize,
}

// The raw pointer aims at a private MAP_SHARED mapping owned by this value.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Map the ring for a counter fd: one control page plus
    /// `RING_DATA_BYTES` of data pages.
    pub fn map(fd: RawFd) -> Result<RingBuffer, SetupError> {
        let page = page_size();
        let mapped_len = page + RING_DATA_BYTES;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SetupError::RingMap(io::Error::last_os_error()));
        }
        Ok(RingBuffer {
            base: base as *mut u8,
            data_offset: page,
            data_size: RING_DATA_BYTES as u64,
            tail: 0,
            mapped_len,
        })
    }

    /// Wrap an externally provided control-page-plus-data region. Used by
    /// tests to exercise the consumer without a kernel producer.
    #[cfg(test)]
    fn from_raw_parts(base: *mut u8, data_offset: usize, data_size: u64) -> RingBuffer {
        RingBuffer {
            base,
            data_offset,
            data_size,
            tail: 0,
            mapped_len: 0,
        }
    }

    fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base.add(self.data_offset), self.data_size as usize) }
    }

    pub fn has_pending(&self) -> bool {
        unsafe { read_head(self.base) != self.tail }
    }

    /// Copy every byte the producer has published since the last drain into
    /// `sink`, in order, and publish the new consumer tail. A wrapped region
    /// is emitted as its two physical segments. Returns the number of bytes
    /// moved.
    pub fn drain_into(&mut self, sink: &mut dyn Write) -> Result<u64, RingError> {
        let head = unsafe { read_head(self.base) };
        if head == self.tail {
            return Ok(0);
        }
        if head < self.tail {
            return Err(RingError::Overrun);
        }

        let data = self.data();
        let mask = self.data_size - 1;
        let mut consumed = self.tail;
        let size = head - consumed;

        if (consumed & mask) + size > self.data_size {
            let start = (consumed & mask) as usize;
            sink.write_all(&data[start..])?;
            consumed += (self.data_size as usize - start) as u64;
        }
        let start = (consumed & mask) as usize;
        let len = (head - consumed) as usize;
        sink.write_all(&data[start..start + len])?;

        self.tail = head;
        unsafe { write_tail(self.base, head) };
        Ok(size)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if self.mapped_len != 0 {
            unsafe {
                libc::munmap(self.base as *mut c_void, self.mapped_len);
            }
        }
    }
}
