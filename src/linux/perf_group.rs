use std::io::{self, Write};

use crate::error::{RingError, SetupError};
use crate::linux_shared::event::{EventConfig, SampleFormat};
use crate::stream::StreamEvent;

use super::perf_event::{PerfCounter, RingBuffer};

/// All counters for one CPU. The first event's fd owns the ring; every
/// other counter is redirected into it, so each CPU produces one totally
/// ordered record stream.
struct CpuGroup {
    cpu: u32,
    counters: Vec<PerfCounter>,
    ring: RingBuffer,
}

/// One counter per (event, CPU) pair, with the per-CPU rings and the poll
/// set over their owner fds.
pub struct PerfGroup {
    groups: Vec<CpuGroup>,
    poll_fds: Vec<libc::pollfd>,
}

impl PerfGroup {
    /// Open everything. `pid` is -1 for system-wide profiling (one group
    /// per CPU covers every process), otherwise the target process.
    pub fn open(
        pid: i32,
        cpus: &[u32],
        events: &[EventConfig],
        sample_format: SampleFormat,
        enable_on_exec: bool,
    ) -> Result<PerfGroup, SetupError> {
        if cpus.is_empty() {
            return Err(SetupError::NoCpus);
        }
        let mut groups = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            let mut counters: Vec<PerfCounter> = Vec::with_capacity(events.len());
            let mut ring = None;
            for event in events {
                // Only the ring owner asks the kernel for comm/mmap/task
                // records; the others would duplicate them.
                let with_task_records = event.counter == 0;
                let counter = PerfCounter::open(
                    event,
                    pid,
                    cpu as i32,
                    sample_format,
                    enable_on_exec,
                    true,
                    with_task_records,
                )?;
                match counters.first() {
                    None => {
                        // The owner's ring must exist before the others can
                        // be redirected into it.
                        counter.set_nonblocking()?;
                        ring = Some(RingBuffer::map(counter.fd())?);
                    }
                    Some(owner) => counter.redirect_output_to(owner)?,
                }
                counters.push(counter);
            }
            let ring = ring.expect("events is never empty");
            groups.push(CpuGroup { cpu, counters, ring });
        }

        let poll_fds = groups
            .iter()
            .map(|group| libc::pollfd {
                fd: group.counters[0].fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        Ok(PerfGroup { groups, poll_fds })
    }

    /// The kernel ids per event, across all CPUs, for the stream header.
    pub fn stream_events(&self, events: &[EventConfig], sample_format: SampleFormat) -> Vec<StreamEvent> {
        events
            .iter()
            .map(|event| StreamEvent {
                config: event.clone(),
                ids: self
                    .groups
                    .iter()
                    .map(|group| group.counters[event.counter].id())
                    .collect(),
                sample_format,
            })
            .collect()
    }

    pub fn enable_all(&self) -> io::Result<()> {
        for group in &self.groups {
            for counter in &group.counters {
                counter.enable()?;
            }
        }
        Ok(())
    }

    pub fn disable_all(&self) {
        for group in &self.groups {
            for counter in &group.counters {
                if let Err(err) = counter.disable() {
                    log::warn!("could not disable a counter on cpu {}: {err}", group.cpu);
                }
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.groups.iter().any(|group| group.ring.has_pending())
    }

    /// Drain every ring into the sink. Returns the number of bytes moved.
    pub fn drain_all(&mut self, sink: &mut dyn Write) -> Result<u64, RingError> {
        let mut total = 0;
        for group in &mut self.groups {
            total += group.ring.drain_into(sink)?;
        }
        Ok(total)
    }

    /// Sleep until any ring has data, a signal arrives, or the timeout
    /// passes. Signals are the expected way out (SIGUSR1 sets the quit
    /// flag), so EINTR is a normal return.
    pub fn wait(&mut self, timeout_ms: i32) {
        for fd in &mut self.poll_fds {
            fd.revents = 0;
        }
        let rc = unsafe {
            libc::poll(
                self.poll_fds.as_mut_ptr(),
                self.poll_fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                log::warn!("poll over ring fds failed: {err}");
            }
        }
    }
}
