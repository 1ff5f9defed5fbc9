//! Host CPU facts: which CPUs are online, how fast they are, and the coarse
//! architecture tag recorded into sample-file headers.

use std::io;

/// Architecture tag stored in sample-file headers. Mixing files recorded on
/// different architectures is refused at header-validation time.
pub fn cpu_type() -> u32 {
    if cfg!(target_arch = "x86_64") {
        1
    } else if cfg!(target_arch = "aarch64") {
        2
    } else if cfg!(any(target_arch = "powerpc64", target_arch = "powerpc")) {
        3
    } else {
        0
    }
}

/// Best-effort CPU speed in MHz from `/proc/cpuinfo`, 0.0 when the field is
/// absent (common on arm).
pub fn cpu_speed_mhz() -> f64 {
    let Ok(text) = std::fs::read_to_string("/proc/cpuinfo") else {
        return 0.0;
    };
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("cpu MHz") {
            if let Some(value) = rest.split(':').nth(1) {
                if let Ok(mhz) = value.trim().parse::<f64>() {
                    return mhz;
                }
            }
        }
    }
    0.0
}

/// The online CPU list from sysfs, e.g. `0-3,5,7-8`. Falls back to assuming
/// `0..num_cpus` when the file is unreadable.
pub fn online_cpus() -> io::Result<Vec<u32>> {
    match std::fs::read_to_string("/sys/devices/system/cpu/online") {
        Ok(text) => {
            let cpus = parse_cpu_list(text.trim());
            if cpus.is_empty() {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "empty online cpu list",
                ))
            } else {
                Ok(cpus)
            }
        }
        Err(err) => {
            log::warn!("could not read the online cpu list ({err}); assuming all are online");
            Ok((0..num_cpus::get() as u32).collect())
        }
    }
}

fn parse_cpu_list(text: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.parse() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges_and_singles() {
        assert_eq!(parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0"), vec![0]);
        assert_eq!(parse_cpu_list("0-1,4,6-7"), vec![0, 1, 4, 6, 7]);
        assert_eq!(parse_cpu_list(""), Vec::<u32>::new());
    }
}
