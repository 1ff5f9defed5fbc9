use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Cumulative per-run counters. They cost nothing to keep and answer the
/// first question every user of a profiler asks: where did my samples go?
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Samples logged into sample files (backtrace arcs not included).
    pub samples: u64,
    pub kernel_samples: u64,
    pub user_samples: u64,
    /// Address fell inside a mapping of the wrong domain (a non-hypervisor
    /// sample in the hypervisor bucket).
    pub invalid_context: u64,
    /// No mapping contained the sample address, even after reprocessing.
    pub lost_no_mapping: u64,
    /// Kernel-domain samples for a process we never learned about.
    pub no_app_kernel_sample: u64,
    /// User-domain samples for a process we never learned about.
    pub no_app_user_sample: u64,
    /// Backtrace frames skipped because no mapping contained them.
    pub bt_lost_no_mapping: u64,
    /// Hypervisor samples above the architectural ceiling.
    pub lost_invalid_hv_addr: u64,
    /// Samples the kernel itself reported as dropped (ring overflow).
    pub kernel_reported_lost: u64,
    /// Samples abandoned because their sample file could not be opened or
    /// written.
    pub lost_sample_file: u64,
    /// Throttle records seen (the kernel lowered the sampling rate).
    pub throttle_incidents: u64,
}

impl Stats {
    /// Append the run's statistics to `<session>/samples/oxprof.log` and
    /// mirror the serious conditions to stderr, so a user who never looks at
    /// the log still learns their profile is short.
    pub fn write_log(
        &self,
        session_dir: &Path,
        started: SystemTime,
        throttled_events: &[String],
    ) -> io::Result<PathBuf> {
        let log_path = session_dir.join("samples").join("oxprof.log");
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        writeln!(log)?;
        writeln!(
            log,
            "Profiling started at {}",
            humantime::format_rfc3339_seconds(started)
        )?;
        writeln!(
            log,
            "Profiling stopped at {}",
            humantime::format_rfc3339_seconds(SystemTime::now())
        )?;
        writeln!(log, "-- oxprof statistics --")?;
        writeln!(log, "Nr. non-backtrace samples: {}", self.samples)?;
        writeln!(log, "Nr. kernel samples: {}", self.kernel_samples)?;
        writeln!(log, "Nr. user space samples: {}", self.user_samples)?;
        writeln!(
            log,
            "Nr. samples lost due to sample address not in expected range for domain: {}",
            self.invalid_context
        )?;
        writeln!(
            log,
            "Nr. samples lost due to no permanent mapping: {}",
            self.lost_no_mapping
        )?;
        writeln!(
            log,
            "Nr. user context kernel samples lost due to no app info available: {}",
            self.no_app_kernel_sample
        )?;
        writeln!(
            log,
            "Nr. user samples lost due to no app info available: {}",
            self.no_app_user_sample
        )?;
        writeln!(
            log,
            "Nr. backtraces skipped due to no file mapping: {}",
            self.bt_lost_no_mapping
        )?;
        writeln!(
            log,
            "Nr. hypervisor samples dropped due to address out-of-range: {}",
            self.lost_invalid_hv_addr
        )?;
        writeln!(
            log,
            "Nr. samples lost due to sample file open failure: {}",
            self.lost_sample_file
        )?;
        writeln!(
            log,
            "Nr. samples lost reported by perf_events kernel: {}",
            self.kernel_reported_lost
        )?;
        writeln!(log, "Nr. throttling incidents: {}", self.throttle_incidents)?;

        if self.kernel_reported_lost > 0 {
            eprintln!(
                "* * * ATTENTION: The kernel lost {} samples. * * *",
                self.kernel_reported_lost
            );
            eprintln!("Try decreasing your sampling rate.");
            eprintln!("See {} for more profiling statistics.", log_path.display());
        } else if !throttled_events.is_empty() {
            eprintln!(
                "* * * WARNING: Profiling of {} was throttled back by the kernel. * * *",
                throttled_events.join(", ")
            );
            eprintln!("The number of samples recorded is less than expected.");
            eprintln!("Try decreasing your sampling rate.");
        }

        log.flush()?;
        Ok(log_path)
    }
}
