//! The reader side: demultiplexes the raw record stream and attributes each
//! sample to (process, image, offset), accumulating counts through the
//! sample-file registry.
//!
//! Attribution is two-pass. Records whose prerequisites have not arrived yet
//! (sample before comm, forked child before exec, every hypervisor sample)
//! are queued as raw bytes and replayed after the stream is exhausted, once
//! the process model has been promoted to its final state. Queuing raw bytes
//! instead of allocating half-initialized records keeps "partially known
//! process" out of the type system entirely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use rustc_hash::FxHashMap;

use crate::error::{ConvertError, StreamError};
use crate::linux::sys;
use crate::samples::header::SampleFileHeader;
use crate::samples::mangling::{ImagePart, SampleFileName};
use crate::samples::registry::SampleFileRegistry;
use crate::stream::{RawRecord, StreamAttrs, StreamReader};

use super::event::EventConfig;
use super::event_record::{CpuMode, EventRecord, SampleRecord};
use super::kernel_image::KernelImages;
use super::process_info::{Mapping, ProcessTable};
use super::stats::Stats;

/// Hypervisor text lives at the bottom of the address space; anything above
/// this is a corrupted or untranslatable hypervisor ip.
pub const MAX_HYPERVISOR_ADDRESS: u64 = 0xfff_ffff;

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub session_dir: std::path::PathBuf,
    pub separate_cpu: bool,
    pub separate_thread: bool,
    pub callgraph: bool,
    pub cpu_type: u32,
    pub cpu_speed: f64,
    /// pid and full path of the launched command, when there is one.
    pub profiled: Option<(u32, String)>,
}

/// Identity of the last frame a sample or arc was logged for; the other
/// endpoint of the next call-graph arc.
#[derive(Debug, Clone)]
struct FrameId {
    image: ImagePart,
    is_kernel: bool,
    anon_start: u64,
}

/// The cached attribution of the most recent sample. Consecutive samples
/// from a hot loop hit the same mapping, so re-resolving every one of them
/// through the process table would be wasted work.
#[derive(Debug, Clone)]
struct Transient {
    tgid: u32,
    tid: u32,
    cpu: Option<u32>,
    sample_id: u64,
    counter: usize,
    in_kernel: bool,
    is_anon: bool,
    start: u64,
    /// Inclusive for user mappings, exclusive for kernel images.
    end: u64,
    kernel_start: u64,
    image: ImagePart,
    mtime_path: Option<String>,
    app: String,
    pc: u64,
}

/// Where an ip landed, before process-level bookkeeping is attached.
enum Resolution {
    Found(Location),
    InvalidContext,
    NotFound,
}

struct Location {
    image: ImagePart,
    start: u64,
    end: u64,
    is_anon: bool,
    kernel_start: u64,
    mtime_path: Option<String>,
    pc: u64,
}

pub struct Converter {
    opts: ConvertOptions,
    attrs: StreamAttrs,
    events: Vec<EventConfig>,
    throttled: Vec<bool>,
    processes: ProcessTable,
    kernel: KernelImages,
    registry: SampleFileRegistry,
    stats: Stats,
    trans: Option<Transient>,
    last_frame: Option<FrameId>,
    deferred: Vec<RawRecord>,
    first_pass: bool,
    mtimes: FxHashMap<String, u64>,
    started: SystemTime,
}

impl Converter {
    pub fn new(attrs: StreamAttrs, opts: ConvertOptions) -> Converter {
        let events = attrs.events.clone();
        let throttled = vec![false; events.len()];
        let registry = SampleFileRegistry::new(&opts.session_dir);
        let processes = ProcessTable::new(opts.profiled.clone());
        Converter {
            opts,
            attrs,
            events,
            throttled,
            processes,
            kernel: KernelImages::new(),
            registry,
            stats: Stats::default(),
            trans: None,
            last_frame: None,
            deferred: Vec::new(),
            first_pass: true,
            mtimes: FxHashMap::default(),
            started: SystemTime::now(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn handle_record(&mut self, raw: &RawRecord) -> Result<(), ConvertError> {
        let record = EventRecord::parse(raw, self.attrs.sample_format)?;
        match record {
            EventRecord::Sample(sample) => self.handle_sample(raw, sample),
            EventRecord::Comm(c) => {
                self.processes.handle_comm(c.pid, c.tid, &c.comm);
                Ok(())
            }
            EventRecord::Mmap(m) => {
                if m.cpu_mode == CpuMode::Kernel {
                    self.kernel.handle_kernel_mmap(&m.filename, m.start, m.len);
                } else {
                    self.processes
                        .handle_mmap(m.pid, Mapping::from_mmap(m.start, m.len, m.pgoff, &m.filename));
                }
                Ok(())
            }
            EventRecord::Fork(f) => {
                self.processes.handle_fork(f.pid, f.tid, f.ppid);
                Ok(())
            }
            EventRecord::Exit(e) => {
                // Late samples for this tid may still be queued in a ring,
                // so the record stays; exit is only worth a trace.
                log::debug!("process {}/{} exited", e.pid, e.tid);
                Ok(())
            }
            EventRecord::Throttle(t) => {
                let counter = self
                    .attrs
                    .counter_for_id(t.id)
                    .ok_or(StreamError::Corrupt("throttle record for unknown event id"))?;
                self.throttled[counter] = true;
                self.stats.throttle_incidents += 1;
                Ok(())
            }
            EventRecord::Unthrottle(_) => {
                log::debug!("kernel unthrottled sampling");
                Ok(())
            }
            EventRecord::Lost(l) => {
                self.stats.kernel_reported_lost += l.count;
                Ok(())
            }
            EventRecord::Unknown(kind) => {
                log::debug!("ignoring event record of type {kind:#x}");
                Ok(())
            }
        }
    }

    fn handle_sample(&mut self, raw: &RawRecord, mut sample: SampleRecord) -> Result<(), ConvertError> {
        let domain = sample.cpu_mode;
        match domain {
            CpuMode::GuestKernel | CpuMode::GuestUser => {
                log::debug!("discarding guest-domain sample at {:#x}", sample.ip);
                return Ok(());
            }
            CpuMode::Unknown => {
                log::debug!("discarding sample from unknown domain at {:#x}", sample.ip);
                return Ok(());
            }
            _ => {}
        }
        let hypervisor = domain == CpuMode::Hypervisor;
        let in_kernel = domain == CpuMode::Kernel;

        if hypervisor {
            if sample.ip > MAX_HYPERVISOR_ADDRESS {
                log::debug!("discarding out-of-range hypervisor sample at {:#x}", sample.ip);
                self.stats.lost_invalid_hv_addr += 1;
                self.trans = None;
                return Ok(());
            }
            if self.first_pass {
                // The bucket's address range isn't known until every sample
                // has been seen; grow it now, count the sample later.
                self.processes.handle_hypervisor_sample(sample.pid, sample.ip);
            }
        }

        // A sample for pid 0 arriving while nothing has been attributed yet
        // is dropped; whether pid 0 ever deserves a record of its own is an
        // open question, and these samples were never attributable.
        if self.trans.is_none() && sample.pid == 0 {
            log::debug!("discarding sample for pid 0 at {:#x}", sample.ip);
            return Ok(());
        }

        let counter = match &self.trans {
            Some(t) if t.sample_id == sample.id => t.counter,
            _ => self
                .attrs
                .counter_for_id(sample.id)
                .ok_or(StreamError::Corrupt("sample id does not belong to any event"))?,
        };

        if self.events[counter].exclude_user && domain == CpuMode::User {
            // The kernel only filters kernel-domain samples for us.
            return Ok(());
        }

        if hypervisor && self.first_pass {
            self.deferred.push(raw.clone());
            return Ok(());
        }

        let mut found = false;
        if let Some(t) = &mut self.trans {
            if t.sample_id == sample.id && t.tgid == sample.pid && t.in_kernel == in_kernel {
                let hit = if in_kernel {
                    (t.start == 0 && t.end == 0) || (sample.ip >= t.start && sample.ip < t.end)
                } else {
                    sample.ip >= t.start && sample.ip <= t.end
                };
                if hit {
                    t.tid = sample.tid;
                    t.cpu = sample.cpu;
                    t.pc = if t.in_kernel || t.is_anon {
                        sample.ip
                    } else {
                        sample.ip - t.start
                    };
                    found = true;
                }
            }
        }

        if !found {
            found = self.rebuild_transient(raw, &sample, counter, in_kernel, hypervisor);
        }

        if found {
            self.log_current_sample();
            if self.opts.callgraph {
                if let Some(chain) = sample.callchain.take() {
                    self.walk_callchain(&chain, &sample);
                }
            }
        }
        Ok(())
    }

    /// The slow path: resolve process and mapping from scratch and rebuild
    /// the transient cache. Handles the defer/drop accounting for misses.
    fn rebuild_transient(
        &mut self,
        raw: &RawRecord,
        sample: &SampleRecord,
        counter: usize,
        in_kernel: bool,
        hypervisor: bool,
    ) -> bool {
        if !self.processes.is_attributable(sample.pid) {
            self.trans = None;
            if self.first_pass {
                self.deferred.push(raw.clone());
            } else if in_kernel {
                self.stats.no_app_kernel_sample += 1;
            } else {
                self.stats.no_app_user_sample += 1;
            }
            return false;
        }

        match self.resolve_location(sample.pid, sample.ip, in_kernel, hypervisor) {
            Resolution::Found(loc) => {
                let app = self
                    .processes
                    .app_name(sample.pid)
                    .unwrap_or_default()
                    .to_owned();
                self.trans = Some(Transient {
                    tgid: sample.pid,
                    tid: sample.tid,
                    cpu: sample.cpu,
                    sample_id: sample.id,
                    counter,
                    in_kernel,
                    is_anon: loc.is_anon,
                    start: loc.start,
                    end: loc.end,
                    kernel_start: loc.kernel_start,
                    image: loc.image,
                    mtime_path: loc.mtime_path,
                    app,
                    pc: loc.pc,
                });
                true
            }
            Resolution::InvalidContext => {
                self.stats.invalid_context += 1;
                self.trans = None;
                false
            }
            Resolution::NotFound => {
                self.trans = None;
                if self.first_pass {
                    self.deferred.push(raw.clone());
                } else {
                    log::debug!(
                        "discarding {} sample for process {} with no mapping (pc={:#x})",
                        if in_kernel { "kernel" } else { "userspace" },
                        sample.pid,
                        sample.ip
                    );
                    self.stats.lost_no_mapping += 1;
                }
                false
            }
        }
    }

    /// Find the image containing `ip` without touching any converter state.
    fn resolve_location(&self, pid: u32, ip: u64, in_kernel: bool, hypervisor: bool) -> Resolution {
        if in_kernel {
            return match self.kernel.find(ip) {
                Some(image) => Resolution::Found(Location {
                    image: ImagePart::Path(image.name.clone()),
                    start: image.start,
                    end: image.end,
                    is_anon: false,
                    kernel_start: image.start,
                    mtime_path: (!image.is_synthetic()).then(|| image.name.clone()),
                    pc: ip,
                }),
                None => Resolution::NotFound,
            };
        }

        match self.processes.find_mapping(pid, ip) {
            Some(mapping) if mapping.is_hypervisor && !hypervisor => Resolution::InvalidContext,
            Some(mapping) => {
                let image = if mapping.is_anon {
                    ImagePart::Anon {
                        name: mapping.filename.clone(),
                        tgid: pid,
                        start: mapping.start,
                        end: mapping.end,
                    }
                } else {
                    ImagePart::Path(mapping.filename.clone())
                };
                Resolution::Found(Location {
                    start: mapping.start,
                    end: mapping.end,
                    is_anon: mapping.is_anon,
                    kernel_start: 0,
                    mtime_path: (!mapping.is_anon).then(|| mapping.filename.clone()),
                    pc: if mapping.is_anon { ip } else { ip - mapping.start },
                    image,
                })
            }
            None => Resolution::NotFound,
        }
    }

    fn log_current_sample(&mut self) {
        let t = self.trans.clone().expect("transient is set on this path");
        let key = if t.in_kernel {
            t.pc - t.kernel_start
        } else {
            t.pc
        };
        let name = self.name_for(&t, None);
        let header = self.header_for(&t, None);
        let frame = FrameId {
            image: t.image.clone(),
            is_kernel: t.in_kernel,
            anon_start: if t.is_anon { t.start } else { 0 },
        };
        let in_kernel = t.in_kernel;
        match self.registry.log_sample(&name, &header, key as u32, 1) {
            Ok(()) => {
                self.stats.samples += 1;
                if in_kernel {
                    self.stats.kernel_samples += 1;
                } else {
                    self.stats.user_samples += 1;
                }
                self.last_frame = Some(frame);
            }
            Err(err) => {
                log::warn!("abandoning one sample file: {err}");
                self.stats.lost_sample_file += 1;
            }
        }
    }

    /// Walk a recorded callchain and log one arc per resolvable frame, each
    /// keyed from the previously logged frame to the current one.
    fn walk_callchain(&mut self, chain: &[u64], sample: &SampleRecord) {
        let counter = match &self.trans {
            Some(t) => t.counter,
            None => return,
        };
        let mut in_kernel = false;
        let mut index = 0;
        while index < chain.len() {
            let entry = chain[index];
            if entry >= sys::PERF_CONTEXT_MAX {
                match entry {
                    sys::PERF_CONTEXT_KERNEL => in_kernel = true,
                    sys::PERF_CONTEXT_USER => in_kernel = false,
                    // Hypervisor frames carry no usable address space.
                    sys::PERF_CONTEXT_HV => {}
                    _ => {}
                }
                // The first chain entry repeats the sampled ip right after
                // its context marker; skip the duplicate.
                if index == 0 && chain.get(1) == Some(&sample.ip) {
                    index += 1;
                }
                index += 1;
                continue;
            }
            if entry == 0 {
                index += 1;
                continue;
            }

            if !self.processes.is_attributable(sample.pid) {
                self.stats.bt_lost_no_mapping += 1;
                index += 1;
                continue;
            }
            match self.resolve_location(sample.pid, entry, in_kernel, false) {
                Resolution::Found(loc) => {
                    let app = self
                        .processes
                        .app_name(sample.pid)
                        .unwrap_or_default()
                        .to_owned();
                    self.trans = Some(Transient {
                        tgid: sample.pid,
                        tid: sample.tid,
                        cpu: sample.cpu,
                        sample_id: sample.id,
                        counter,
                        in_kernel,
                        is_anon: loc.is_anon,
                        start: loc.start,
                        end: loc.end,
                        kernel_start: loc.kernel_start,
                        image: loc.image,
                        mtime_path: loc.mtime_path,
                        app,
                        pc: loc.pc,
                    });
                    self.log_arc();
                }
                _ => {
                    self.stats.bt_lost_no_mapping += 1;
                }
            }
            index += 1;
        }
    }

    fn log_arc(&mut self) {
        let Some(last) = self.last_frame.clone() else {
            return;
        };
        let t = self.trans.clone().expect("transient is set on this path");
        let key = if t.in_kernel {
            t.pc - t.kernel_start
        } else {
            t.pc
        };
        let name = self.name_for(&t, Some(&last));
        let header = self.header_for(&t, Some(&last));
        let frame = FrameId {
            image: t.image.clone(),
            is_kernel: t.in_kernel,
            anon_start: if t.is_anon { t.start } else { 0 },
        };
        match self.registry.log_sample(&name, &header, key as u32, 1) {
            Ok(()) => {
                self.last_frame = Some(frame);
            }
            Err(err) => {
                log::warn!("abandoning one call-graph file: {err}");
                self.stats.lost_sample_file += 1;
            }
        }
    }

    fn name_for(&self, t: &Transient, cg_from: Option<&FrameId>) -> SampleFileName {
        SampleFileName {
            app: t.app.clone(),
            image: t.image.clone(),
            thread: self.opts.separate_thread.then_some((t.tgid, t.tid)),
            cpu: self.opts.separate_cpu.then(|| t.cpu.unwrap_or(0)),
            cg_from: cg_from.map(|f| f.image.clone()),
            counter: t.counter,
        }
    }

    fn header_for(&mut self, t: &Transient, cg_from: Option<&FrameId>) -> SampleFileHeader {
        let event = &self.events[t.counter];
        let mtime = t
            .mtime_path
            .as_ref()
            .map(|path| mtime_of(&mut self.mtimes, path))
            .unwrap_or(0);
        SampleFileHeader {
            event_code: event.code,
            event_count: event.period,
            unit_mask: event.unit_mask,
            cpu_type: self.opts.cpu_type,
            cpu_speed: self.opts.cpu_speed,
            is_kernel: t.in_kernel,
            anon_start: if t.is_anon { t.start } else { 0 },
            mtime,
            cg_to_is_kernel: cg_from.is_some_and(|f| f.is_kernel),
            cg_to_anon_start: cg_from.map_or(0, |f| f.anon_start),
        }
    }

    /// Replay everything that was waiting on a complete process model, then
    /// flush and close the output and write the statistics log.
    pub fn finish(mut self) -> Result<Stats, ConvertError> {
        self.processes.finalize();
        self.first_pass = false;
        self.trans = None;
        self.last_frame = None;

        let deferred = std::mem::take(&mut self.deferred);
        log::debug!("reprocessing {} deferred samples", deferred.len());
        for raw in &deferred {
            self.handle_record(raw)?;
        }

        let throttled: Vec<String> = self
            .events
            .iter()
            .zip(&self.throttled)
            .filter(|(_, &t)| t)
            .map(|(e, _)| e.name.clone())
            .collect();

        self.registry.finish()?;
        self.stats
            .write_log(&self.opts.session_dir, self.started, &throttled)
            .map_err(|source| ConvertError::Log {
                path: self.opts.session_dir.clone(),
                source,
            })?;
        Ok(self.stats)
    }
}

fn mtime_of(cache: &mut FxHashMap<String, u64>, path: &str) -> u64 {
    if let Some(&mtime) = cache.get(path) {
        return mtime;
    }
    let mtime = std::fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    cache.insert(path.to_owned(), mtime);
    mtime
}

/// Drive a whole stream through a converter. `quit` aborts between records
/// once the grace period for conversion has expired.
pub fn convert_stream(
    reader: &mut StreamReader,
    opts: ConvertOptions,
    quit: &AtomicBool,
) -> Result<Stats, ConvertError> {
    let mut converter = Converter::new(reader.attrs.clone(), opts);
    while let Some(raw) = reader.next_record()? {
        converter.handle_record(&raw)?;
        if quit.load(Ordering::Relaxed) {
            log::warn!("conversion interrupted; writing out what was processed");
            break;
        }
    }
    converter.finish()
}
