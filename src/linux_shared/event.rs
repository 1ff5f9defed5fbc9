use bitflags::bitflags;

use crate::linux::sys;

bitflags! {
    /// The sample-format mask agreed between recorder and converter. The
    /// converter can only parse sample payloads whose layout this mask
    /// dictates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SampleFormat: u64 {
        const IP = sys::PERF_SAMPLE_IP;
        const TID = sys::PERF_SAMPLE_TID;
        const CALLCHAIN = sys::PERF_SAMPLE_CALLCHAIN;
        const ID = sys::PERF_SAMPLE_ID;
        const CPU = sys::PERF_SAMPLE_CPU;
    }
}

impl SampleFormat {
    /// ip, tid and id are mandatory for attribution; cpu and callchain are
    /// opt-in.
    pub fn for_options(separate_cpu: bool, callgraph: bool) -> SampleFormat {
        let mut format = SampleFormat::IP | SampleFormat::TID | SampleFormat::ID;
        if separate_cpu {
            format |= SampleFormat::CPU;
        }
        if callgraph {
            format |= SampleFormat::CALLCHAIN;
        }
        format
    }
}

/// One selected event, immutable once profiling starts. `counter` is the
/// stable index among the selected events; it appears in sample-file names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventConfig {
    pub name: String,
    /// Event source for perf_event_open (`PERF_TYPE_*`).
    pub kind: u32,
    /// Raw config value passed to the kernel; already includes shifted
    /// unit-mask bits where the architecture wants them.
    pub code: u64,
    /// Sampling period: events per sample.
    pub period: u64,
    pub unit_mask: u64,
    pub exclude_kernel: bool,
    pub exclude_user: bool,
    pub exclude_hv: bool,
    pub counter: usize,
}

impl EventConfig {
    /// The default event when none is given: hardware cpu cycles. Callers
    /// fall back to the software cpu-clock in environments (VMs, mostly)
    /// where the hardware event cannot be opened.
    pub fn default_cycles(period: u64) -> EventConfig {
        EventConfig {
            name: "cycles".to_owned(),
            kind: sys::PERF_TYPE_HARDWARE,
            code: sys::PERF_COUNT_HW_CPU_CYCLES,
            period,
            unit_mask: 0,
            exclude_kernel: false,
            exclude_user: false,
            exclude_hv: false,
            counter: 0,
        }
    }

    pub fn software_clock_fallback(&self) -> EventConfig {
        EventConfig {
            name: "cpu-clock".to_owned(),
            kind: sys::PERF_TYPE_SOFTWARE,
            code: sys::PERF_COUNT_SW_CPU_CLOCK,
            ..self.clone()
        }
    }
}
