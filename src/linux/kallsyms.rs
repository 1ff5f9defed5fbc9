//! Kernel address-range discovery from `/proc/kallsyms`, plus the sysctl
//! probes that decide whether kernel-side information is available at all.

use std::path::Path;

struct KallSymIter<'a> {
    remaining_data: &'a [u8],
}

impl<'a> KallSymIter<'a> {
    fn new(proc_kallsyms: &'a [u8]) -> Self {
        Self {
            remaining_data: proc_kallsyms,
        }
    }
}

impl<'a> Iterator for KallSymIter<'a> {
    type Item = (u64, u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining_data.is_empty() {
            return None;
        }

        // Format: <hex address> <space> <letter> <space> <name> \n
        let (after_address, address) = hex_str(self.remaining_data).ok()?;
        let kind = *after_address.get(1)?;
        let starting_with_name = after_address.get(3..)?;
        match memchr::memchr(b'\n', starting_with_name) {
            Some(name_len) => {
                self.remaining_data = &starting_with_name[(name_len + 1)..];
                Some((address, kind, &starting_with_name[..name_len]))
            }
            None => {
                self.remaining_data = &[];
                Some((address, kind, starting_with_name))
            }
        }
    }
}

/// The `[start, end)` range of the core kernel image. `_text`..`_etext` when
/// both are present; otherwise the span of all in-image text symbols.
/// Returns `None` when the addresses are hidden (kptr_restrict) or `_text`
/// is missing.
pub fn parse_kernel_range(data: &[u8]) -> Option<(u64, u64)> {
    let mut text_start = None;
    let mut text_end = None;
    let mut max_addr = 0;
    for (address, kind, name) in KallSymIter::new(data) {
        match name {
            b"_text" => text_start = Some(address),
            b"_etext" => text_end = Some(address),
            _ => {
                // Module symbols carry a bracketed suffix and can live below
                // the kernel image; they must not stretch the range.
                if matches!(kind, b'T' | b't') && !name.ends_with(b"]") && address > max_addr {
                    max_addr = address;
                }
            }
        }
    }
    let start = text_start?;
    if start == 0 {
        return None;
    }
    let end = match text_end {
        Some(end) if end > start => end,
        _ if max_addr > start => max_addr,
        _ => return None,
    };
    Some((start, end))
}

pub fn read_kernel_range() -> Option<(u64, u64)> {
    let data = std::fs::read("/proc/kallsyms").ok()?;
    parse_kernel_range(&data)
}

fn read_sysctl(path: &Path) -> Option<i32> {
    let text = std::fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}

/// `/proc/sys/kernel/perf_event_paranoid`; higher levels deny more to
/// unprivileged users. Used only to phrase the permission hint.
pub fn paranoid_level() -> Option<i32> {
    read_sysctl(Path::new("/proc/sys/kernel/perf_event_paranoid"))
}

/// `/proc/sys/kernel/kptr_restrict`; non-zero hides kernel addresses from
/// unprivileged readers, which makes module profiling impossible.
pub fn kptr_restrict() -> Option<i32> {
    read_sysctl(Path::new("/proc/sys/kernel/kptr_restrict"))
}

fn hex_str(input: &[u8]) -> Result<(&[u8], u64), &'static str> {
    let max_len = 16;
    let mut res: u64 = 0;
    let mut k = 0;
    for v in input.iter().take(max_len) {
        let digit = match (*v as char).to_digit(16) {
            Some(v) => v,
            None => break,
        };
        res = (res << 4) | digit as u64;
        k += 1;
    }
    if k == 0 {
        return Err("bad hex digit");
    }
    Ok((&input[k..], res))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_etext_range() {
        let kallsyms = br#"ffffffffa7e00000 T startup_64
ffffffffa7e00000 T _stext
ffffffffa7e00000 T _text
ffffffffa7e00040 T secondary_startup_64
ffffffffa8e00000 T _etext
ffffffffa9000000 D some_data"#;
        let (start, end) = parse_kernel_range(kallsyms).unwrap();
        assert_eq!(start, 0xffffffffa7e00000);
        assert_eq!(end, 0xffffffffa8e00000);
    }

    #[test]
    fn falls_back_to_last_text_symbol() {
        let kallsyms = br#"ffff8000081e0000 T _text
ffff8000081f0000 t bcm2835_handle_irq
ffff8000081f0060 t bcm2836_arm_irqchip_handle_irq
ffff8000092cc7c4 T __cpu_setup
ffff800001717000 t tls_get_info_size   [tls]"#;
        let (start, end) = parse_kernel_range(kallsyms).unwrap();
        assert_eq!(start, 0xffff8000081e0000);
        assert_eq!(end, 0xffff8000092cc7c4);
    }

    #[test]
    fn restricted_addresses_yield_none() {
        let kallsyms = br#"0000000000000000 T _text
0000000000000000 T _stext
0000000000000000 t some_function"#;
        assert!(parse_kernel_range(kallsyms).is_none());
    }

    #[test]
    fn missing_text_symbol_yields_none() {
        assert!(parse_kernel_range(b"ffff800008000000 T not_the_one\n").is_none());
    }
}
