//! The recorder process: owns every counter fd and ring mmap for the whole
//! run, synthesizes the records the kernel will not send (kernel images,
//! pre-existing processes), and streams raw records into the sink until it
//! is told to quit.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{RecorderError, SetupError};
use crate::linux_shared::event::{EventConfig, SampleFormat};
use crate::linux_shared::event_record::{encode_comm, encode_mmap};
use crate::stream::{StreamSink, StreamWriter};

use super::cpu_info;
use super::kallsyms;
use super::perf_group::PerfGroup;
use super::proc_maps;
use super::sys;

const POLL_TIMEOUT_MS: i32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTarget {
    /// A command we launched ourselves; counters enable on its exec.
    LaunchedChild(u32),
    /// An already-running process (and its existing threads, via inherit).
    ExistingPid(u32),
    /// Every process on every CPU.
    SystemWide,
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub events: Vec<EventConfig>,
    pub sample_format: SampleFormat,
    pub target: RecordTarget,
    /// Explicit vmlinux path with its text range, if the user supplied one.
    pub vmlinux: Option<(String, u64, u64)>,
}

/// Everything the recorder needs after setup succeeded.
pub struct Recorder {
    group: PerfGroup,
    writer: StreamWriter,
    target: RecordTarget,
    vmlinux: Option<(String, u64, u64)>,
    enable_pending: bool,
}

impl Recorder {
    /// Open all counters and write the stream header. Separated from the
    /// drain loop so the orchestrator can report readiness (and unsuspend
    /// the launched command) in between.
    pub fn setup(config: RecorderConfig, sink: StreamSink) -> Result<Recorder, RecorderError> {
        let cpus = cpu_info::online_cpus().map_err(|_| SetupError::NoCpus)?;
        let (pid, enable_on_exec) = match config.target {
            RecordTarget::LaunchedChild(pid) => (pid as i32, true),
            RecordTarget::ExistingPid(pid) => {
                verify_pid_exists(pid)?;
                (pid as i32, false)
            }
            RecordTarget::SystemWide => (-1, false),
        };

        let mut events = config.events.clone();
        let group = match PerfGroup::open(pid, &cpus, &events, config.sample_format, enable_on_exec)
        {
            Ok(group) => group,
            Err(err)
                if events.len() == 1 && events[0].kind == sys::PERF_TYPE_HARDWARE =>
            {
                // Hardware cycle counting is unavailable in some contexts
                // (VMs, mostly); the software clock still gives a usable
                // time-based profile.
                log::warn!("hardware cycles event unavailable ({err}); using the software cpu clock");
                events = vec![events[0].software_clock_fallback()];
                PerfGroup::open(pid, &cpus, &events, config.sample_format, enable_on_exec)?
            }
            Err(err) => return Err(err.into()),
        };
        let stream_events = group.stream_events(&events, config.sample_format);
        let writer = StreamWriter::new(sink, &stream_events).map_err(RecorderError::Io)?;

        Ok(Recorder {
            group,
            writer,
            target: config.target,
            vmlinux: config.vmlinux,
            enable_pending: !enable_on_exec,
        })
    }

    /// Drain rings into the sink until `quit` is raised, then disable the
    /// counters, take one final pass over the rings, and patch the stream
    /// header. Returns the number of raw bytes recorded.
    pub fn record(mut self, quit: &Arc<AtomicBool>) -> Result<u64, RecorderError> {
        self.write_kernel_records()?;
        self.write_process_records()?;

        if self.enable_pending {
            self.group.enable_all().map_err(RecorderError::Io)?;
        }

        loop {
            let moved = self.group.drain_all(&mut self.writer)?;

            if quit.load(Ordering::Relaxed) {
                self.group.disable_all();
                self.group.drain_all(&mut self.writer)?;
                break;
            }

            if moved == 0 {
                self.group.wait(POLL_TIMEOUT_MS);
            }
        }

        let total = self.writer.finish()?;
        log::debug!("recorded {total} bytes of raw sample data");
        Ok(total)
    }

    /// The kernel never announces its own text mapping, so the converter
    /// learns it from records we synthesize: one for the kernel image (or
    /// the no-vmlinux bucket), then one per loaded module.
    fn write_kernel_records(&mut self) -> Result<(), RecorderError> {
        let info = match &self.vmlinux {
            Some((path, start, end)) => Some((path.clone(), *start, *end)),
            None => kallsyms::read_kernel_range()
                .map(|(start, end)| ("/proc/kallsyms".to_owned(), start, end)),
        };

        let record = match &info {
            Some((name, start, end)) => encode_mmap(
                0,
                0,
                *start,
                end - start,
                0,
                name,
                sys::PERF_RECORD_MISC_KERNEL,
            ),
            None => {
                log::warn!(
                    "kernel address range unavailable; kernel samples go to the no-vmlinux bucket"
                );
                encode_mmap(0, 0, 0, 0, 0, "no-vmlinux", sys::PERF_RECORD_MISC_KERNEL)
            }
        };
        self.writer.write_all(&record)?;

        if info.is_some() {
            self.write_module_records()?;
        }
        Ok(())
    }

    /// One kernel-domain mmap record per line of `/proc/modules`.
    fn write_module_records(&mut self) -> Result<(), RecorderError> {
        if kallsyms::kptr_restrict().unwrap_or(0) != 0 && !nix::unistd::Uid::effective().is_root() {
            eprintln!("Kernel module profiling is unavailable with the current system config.");
            eprintln!("Set /proc/sys/kernel/kptr_restrict to 0 to see samples for kernel modules.");
            return Ok(());
        }
        let Ok(modules) = std::fs::read_to_string("/proc/modules") else {
            log::warn!("could not read /proc/modules; module samples will be unattributable");
            return Ok(());
        };
        for line in modules.lines() {
            // module_name size refcount deps state address
            let mut fields = line.split_whitespace();
            let (Some(name), Some(size)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(size) = size.parse::<u64>() else {
                continue;
            };
            let Some(address) = fields.nth(3).and_then(|a| {
                u64::from_str_radix(a.trim_start_matches("0x"), 16).ok()
            }) else {
                continue;
            };
            if address == 0 {
                log::warn!("module addresses are hidden; skipping module records");
                return Ok(());
            }
            let record = encode_mmap(0, 0, address, size, 0, name, sys::PERF_RECORD_MISC_KERNEL);
            self.writer.write_all(&record)?;
        }
        Ok(())
    }

    /// Comm and mmap records for processes that existed before profiling
    /// started. A launched child needs none of this: the kernel reports its
    /// exec and mappings as they happen.
    fn write_process_records(&mut self) -> Result<(), RecorderError> {
        match self.target {
            RecordTarget::LaunchedChild(_) => Ok(()),
            RecordTarget::ExistingPid(pid) => self.write_one_process(pid, false),
            RecordTarget::SystemWide => {
                let Ok(proc_dir) = std::fs::read_dir("/proc") else {
                    return Ok(());
                };
                for entry in proc_dir.flatten() {
                    if let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() {
                        // Processes may vanish mid-scan; that is not an error.
                        let _ = self.write_one_process(pid, true);
                    }
                }
                Ok(())
            }
        }
    }

    fn write_one_process(&mut self, pid: u32, best_effort: bool) -> Result<(), RecorderError> {
        let (name, tgid) = match read_status(pid) {
            Some(parsed) => parsed,
            None if best_effort => return Ok(()),
            None => return Err(SetupError::NoSuchProcess(pid).into()),
        };

        if tgid != pid {
            // A secondary thread was named; record it against its group
            // leader and leave the rest to the leader's own scan.
            let record = encode_comm(tgid, pid, &name);
            self.writer.write_all(&record)?;
            return Ok(());
        }

        if let Ok(tasks) = std::fs::read_dir(format!("/proc/{pid}/task")) {
            for entry in tasks.flatten() {
                if let Ok(tid) = entry.file_name().to_string_lossy().parse::<u32>() {
                    let record = encode_comm(pid, tid, &name);
                    self.writer.write_all(&record)?;
                }
            }
        }

        let Ok(maps) = std::fs::read_to_string(format!("/proc/{pid}/maps")) else {
            return Ok(());
        };
        for region in proc_maps::parse(&maps) {
            if !region.is_executable {
                continue;
            }
            let image = match synthetic_image_name(&region.name) {
                Some(image) => image,
                None => continue,
            };
            let record = encode_mmap(
                pid,
                pid,
                region.start,
                region.end - region.start,
                region.file_offset,
                image,
                sys::PERF_RECORD_MISC_USER,
            );
            self.writer.write_all(&record)?;
        }
        Ok(())
    }
}

/// Which executable regions of a pre-existing process are worth a record:
/// real files, the vdso/vsyscall pages, and nameless regions (JIT code) as
/// anonymous memory. Other bracketed regions carry nothing executable we
/// could attribute.
fn synthetic_image_name(region_name: &str) -> Option<&str> {
    if region_name.starts_with('/') {
        Some(region_name)
    } else if region_name.starts_with("[vdso]") || region_name.starts_with("[vsyscall]") {
        Some(region_name)
    } else if !region_name.contains('[') {
        Some("//anon")
    } else {
        None
    }
}

/// Name and thread-group id from `/proc/<pid>/status`.
fn read_status(pid: u32) -> Option<(String, u32)> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let mut name = None;
    let mut tgid = None;
    for line in status.lines() {
        if let Some(value) = line.strip_prefix("Name:") {
            // Comm names are capped at 16 bytes, final NUL included.
            let mut value = value.trim().to_owned();
            value.truncate(15);
            name = Some(value);
        } else if let Some(value) = line.strip_prefix("Tgid:") {
            tgid = value.trim().parse().ok();
        }
        if name.is_some() && tgid.is_some() {
            break;
        }
    }
    Some((name?, tgid?))
}

fn verify_pid_exists(pid: u32) -> Result<(), SetupError> {
    if std::path::Path::new(&format!("/proc/{pid}/status")).exists() {
        Ok(())
    } else {
        Err(SetupError::NoSuchProcess(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_names_for_synthesized_mmaps() {
        assert_eq!(synthetic_image_name("/usr/bin/cat"), Some("/usr/bin/cat"));
        assert_eq!(synthetic_image_name("[vdso]"), Some("[vdso]"));
        assert_eq!(synthetic_image_name("[vsyscall]"), Some("[vsyscall]"));
        assert_eq!(synthetic_image_name(""), Some("//anon"));
        assert_eq!(synthetic_image_name("[stack]"), None);
        assert_eq!(synthetic_image_name("[heap]"), None);
    }
}
