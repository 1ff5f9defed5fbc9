use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;

use crate::linux::sys;
use crate::linux_shared::event::EventConfig;

/// Sampling period used when no event is specified: one sample per 100000
/// cycle events.
pub const DEFAULT_PERIOD: u64 = 100_000;

#[derive(Debug, Parser)]
#[command(
    name = "oxprof",
    version,
    about = r#"
oxprof is a sampling profiler for Linux built on the kernel's perf events.
It records hardware-event samples into persistent per-binary sample files
under the session directory.

EXAMPLES:
    # Profile a freshly launched command:
    oxprof ./yourcommand yourargs

    # Profile an existing process by pid:
    oxprof --pid 12345

    # Profile every process on every CPU until Ctrl+C:
    oxprof --system-wide

    # Sample a raw PMU event every 50000 occurrences:
    oxprof --event inst_retired:0xc0:50000 ./yourcommand
"#
)]
pub struct Opt {
    /// Event to sample, as name:code:period[:unitmask[:kernel[:user[:hv]]]].
    /// code is the raw PMU event number; kernel, user and hv are 1/0 include
    /// flags. May be given multiple times. Defaults to hardware cpu cycles.
    #[arg(short, long, value_name = "SPEC")]
    pub event: Vec<String>,

    /// Profile this existing process instead of launching a command.
    #[arg(short, long, conflicts_with = "system_wide")]
    pub pid: Option<u32>,

    /// Profile all processes on all CPUs.
    #[arg(long)]
    pub system_wide: bool,

    /// Session directory to write sample files into.
    #[arg(long, default_value = "./oxprof_data")]
    pub session_dir: PathBuf,

    /// Keep samples taken on different CPUs in separate sample files.
    #[arg(long)]
    pub separate_cpu: bool,

    /// Keep samples from different threads in separate sample files.
    #[arg(long)]
    pub separate_thread: bool,

    /// Record call-graph arcs alongside flat samples.
    #[arg(short = 'g', long)]
    pub callgraph: bool,

    /// Record raw sample data to a file first and convert after profiling
    /// ends, instead of converting on the fly.
    #[arg(short = 'l', long)]
    pub lazy_conversion: bool,

    /// vmlinux image to attribute kernel samples to (the text range is
    /// still taken from /proc/kallsyms).
    #[arg(long)]
    pub vmlinux: Option<PathBuf>,

    /// The command to launch and profile.
    #[arg(
        conflicts_with_all = ["pid", "system_wide"],
        allow_hyphen_values = true,
        trailing_var_arg = true
    )]
    pub command: Vec<OsString>,
}

/// Parse one `--event` specification into an event descriptor.
pub fn parse_event_spec(spec: &str, counter: usize) -> Result<EventConfig, String> {
    let fields: Vec<&str> = spec.split(':').collect();
    if fields.len() < 3 || fields.len() > 7 {
        return Err(format!(
            "bad event specification {spec:?}; expected name:code:period[:unitmask[:kernel[:user[:hv]]]]"
        ));
    }
    let name = fields[0];
    if name.is_empty() {
        return Err(format!("bad event specification {spec:?}: empty name"));
    }
    let code =
        parse_number(fields[1]).ok_or_else(|| format!("bad event code in {spec:?}"))?;
    let period =
        parse_number(fields[2]).ok_or_else(|| format!("bad sampling period in {spec:?}"))?;
    if period == 0 {
        return Err(format!("sampling period must be non-zero in {spec:?}"));
    }
    let unit_mask = match fields.get(3) {
        Some(text) => parse_number(text).ok_or_else(|| format!("bad unit mask in {spec:?}"))?,
        None => 0,
    };
    let include_kernel = match fields.get(4) {
        Some(text) => parse_include_flag(text)
            .ok_or_else(|| format!("bad kernel flag in {spec:?}; expected 0 or 1"))?,
        None => true,
    };
    let include_user = match fields.get(5) {
        Some(text) => parse_include_flag(text)
            .ok_or_else(|| format!("bad user flag in {spec:?}; expected 0 or 1"))?,
        None => true,
    };
    let include_hv = match fields.get(6) {
        Some(text) => parse_include_flag(text)
            .ok_or_else(|| format!("bad hypervisor flag in {spec:?}; expected 0 or 1"))?,
        None => true,
    };

    Ok(EventConfig {
        name: name.to_owned(),
        kind: sys::PERF_TYPE_RAW,
        // The PMU wants the unit-mask bits folded into the config word.
        code: code | (unit_mask << 8),
        period,
        unit_mask,
        exclude_kernel: !include_kernel,
        exclude_user: !include_user,
        exclude_hv: !include_hv,
        counter,
    })
}

/// The selected events in counter order; the default cycles event when the
/// user named none.
pub fn resolve_events(specs: &[String]) -> Result<Vec<EventConfig>, String> {
    if specs.is_empty() {
        return Ok(vec![EventConfig::default_cycles(DEFAULT_PERIOD)]);
    }
    specs
        .iter()
        .enumerate()
        .map(|(counter, spec)| parse_event_spec(spec, counter))
        .collect()
}

fn parse_number(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_include_flag(text: &str) -> Option<bool> {
    match text {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}
