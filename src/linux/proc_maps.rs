//! `/proc/<pid>/maps` parsing, used to synthesize mmap records for targets
//! that were already running when profiling started.

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub is_executable: bool,
    pub file_offset: u64,
    pub name: String,
}

fn get_until<'a>(p: &mut &'a str, delimiter: char) -> &'a str {
    match p.find(delimiter) {
        Some(index) => {
            let (before, after) = p.split_at(index);
            *p = &after[delimiter.len_utf8()..];
            before
        }
        None => {
            let before = *p;
            *p = "";
            before
        }
    }
}

fn get_char(p: &mut &str) -> Option<char> {
    let ch = p.chars().next()?;
    *p = &p[ch.len_utf8()..];
    Some(ch)
}

fn parse_line(mut line: &str) -> Option<Region> {
    let start = u64::from_str_radix(get_until(&mut line, '-'), 16).ok()?;
    let end = u64::from_str_radix(get_until(&mut line, ' '), 16).ok()?;
    let _read = get_char(&mut line)?;
    let _write = get_char(&mut line)?;
    let is_executable = get_char(&mut line)? == 'x';
    let _shared = get_char(&mut line)?;
    get_char(&mut line);
    let file_offset = u64::from_str_radix(get_until(&mut line, ' '), 16).ok()?;
    let _device = get_until(&mut line, ' ');
    let _inode = get_until(&mut line, ' ');
    let name = line.trim_start_matches(' ').to_owned();
    Some(Region {
        start,
        end,
        is_executable,
        file_offset,
        name,
    })
}

/// Parse the whole maps text. Lines that do not look like map entries are
/// skipped rather than fatal; the file is sampled from a live process and
/// owes us nothing.
pub fn parse(maps: &str) -> Vec<Region> {
    maps.trim()
        .split('\n')
        .filter(|line| !line.is_empty())
        .filter_map(parse_line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_until() {
        let mut p = "1234 5678";
        assert_eq!(get_until(&mut p, ' '), "1234");
        assert_eq!(p, "5678");

        assert_eq!(get_until(&mut p, ' '), "5678");
        assert_eq!(p, "");

        assert_eq!(get_until(&mut p, ' '), "");
    }

    #[test]
    fn test_parse() {
        let maps = r#"
00400000-0040c000 r-xp 00000000 08:02 1321238                            /usr/bin/cat
0060d000-0062e000 rw-p 00000000 00:00 0                                  [heap]
7ffff672c000-7ffff69db000 r--s 00001ac2 1f:33 1335289                    /usr/lib/locale/locale-archive
7ffff5600000-7ffff5800000 rw-p 00000000 00:00 0
"#;

        assert_eq!(
            parse(maps),
            vec![
                Region {
                    start: 0x00400000,
                    end: 0x0040c000,
                    is_executable: true,
                    file_offset: 0,
                    name: "/usr/bin/cat".to_owned()
                },
                Region {
                    start: 0x0060d000,
                    end: 0x0062e000,
                    is_executable: false,
                    file_offset: 0,
                    name: "[heap]".to_owned()
                },
                Region {
                    start: 0x7ffff672c000,
                    end: 0x7ffff69db000,
                    is_executable: false,
                    file_offset: 0x1ac2,
                    name: "/usr/lib/locale/locale-archive".to_owned()
                },
                Region {
                    start: 0x7ffff5600000,
                    end: 0x7ffff5800000,
                    is_executable: false,
                    file_offset: 0,
                    name: "".to_owned()
                }
            ]
        );
    }

    #[test]
    fn test_empty_maps() {
        assert_eq!(parse(""), vec![]);
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let maps = "not a map line\n00400000-00401000 r-xp 00000000 08:02 1 /bin/x\n";
        let regions = parse(maps);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].name, "/bin/x");
    }
}
