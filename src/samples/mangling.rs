use std::path::{Path, PathBuf};

/// Character standing in for `/` inside mangled path components.
pub const MANGLE_CHAR: char = '}';

/// The image endpoint of a sample-file name: either a real binary path or a
/// synthesized anonymous region (heap, stack, vdso, hypervisor bucket)
/// identified by owner and address range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImagePart {
    Path(String),
    Anon {
        name: String,
        tgid: u32,
        start: u64,
        end: u64,
    },
}

/// All fields the post-processing side needs to recover from a sample-file
/// path. `encode` and `parse` are exact inverses for every name the profiler
/// emits; the post-processor relies on that to rebuild the tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleFileName {
    pub app: String,
    pub image: ImagePart,
    pub thread: Option<(u32, u32)>,
    pub cpu: Option<u32>,
    pub cg_from: Option<ImagePart>,
    pub counter: usize,
}

/// Directory component for samples whose process never revealed a name
/// (e.g. a hypervisor-only pid). Distinct from any mangled path, which
/// always begins with the mangle character.
const UNKNOWN_APP: &str = "{unknown}";

pub fn mangle(path: &str) -> String {
    path.replace('/', &MANGLE_CHAR.to_string())
}

pub fn demangle(component: &str) -> String {
    component.replace(MANGLE_CHAR, "/")
}

impl ImagePart {
    fn encode(&self) -> String {
        match self {
            ImagePart::Path(p) => mangle(p),
            ImagePart::Anon {
                name,
                tgid,
                start,
                end,
            } => format!("{{anon:{name}}}{tgid}.{start:#x}.{end:#x}"),
        }
    }

    fn parse(text: &str) -> Option<ImagePart> {
        if let Some(rest) = text.strip_prefix("{anon:") {
            let close = rest.find('}')?;
            let name = rest[..close].to_owned();
            let mut fields = rest[close + 1..].splitn(3, '.');
            let tgid = fields.next()?.parse().ok()?;
            let start = parse_hex(fields.next()?)?;
            let end = parse_hex(fields.next()?)?;
            Some(ImagePart::Anon {
                name,
                tgid,
                start,
                end,
            })
        } else {
            Some(ImagePart::Path(demangle(text)))
        }
    }
}

fn parse_hex(text: &str) -> Option<u64> {
    u64::from_str_radix(text.strip_prefix("0x")?, 16).ok()
}

impl SampleFileName {
    /// The path of this sample file below `<session>/samples/current/`.
    pub fn relative_path(&self) -> PathBuf {
        let mut file = self.image.encode();
        if let Some((tgid, tid)) = self.thread {
            file.push_str(&format!("{{tgid:{tgid},tid:{tid}}}"));
        }
        if let Some(cpu) = self.cpu {
            file.push_str(&format!("{{cpu:{cpu}}}"));
        }
        if let Some(from) = &self.cg_from {
            file.push_str("{cg}");
            file.push_str(&from.encode());
        }
        file.push('#');
        file.push_str(&self.counter.to_string());
        let app = if self.app.is_empty() {
            UNKNOWN_APP.to_owned()
        } else {
            mangle(&self.app)
        };
        PathBuf::from(app).join(file)
    }

    pub fn parse(relative: &Path) -> Option<SampleFileName> {
        let mut components = relative.components();
        let app_component = components.next()?.as_os_str().to_str()?;
        let file = components.next()?.as_os_str().to_str()?;
        if components.next().is_some() {
            return None;
        }
        let app = if app_component == UNKNOWN_APP {
            String::new()
        } else {
            demangle(app_component)
        };

        let (rest, counter) = file.rsplit_once('#')?;
        let counter = counter.parse().ok()?;

        let (rest, cg_from) = match rest.split_once("{cg}") {
            Some((left, from)) => (left, Some(ImagePart::parse(from)?)),
            None => (rest, None),
        };

        let (rest, cpu) = strip_braced_suffix(rest, "{cpu:", |body| body.parse().ok())?;
        let (rest, thread) = strip_braced_suffix(rest, "{tgid:", |body| {
            let (tgid, tid) = body.split_once(",tid:")?;
            Some((tgid.parse().ok()?, tid.parse().ok()?))
        })?;

        Some(SampleFileName {
            app,
            image: ImagePart::parse(rest)?,
            thread,
            cpu,
            cg_from,
            counter,
        })
    }
}

/// Split `"{prefix...}"` off the end of `text` if present, handing the brace
/// body to `parse`. Returns `None` only when a present suffix fails to parse.
fn strip_braced_suffix<'a, T>(
    text: &'a str,
    prefix: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Option<(&'a str, Option<T>)> {
    if !text.ends_with('}') {
        return Some((text, None));
    }
    match text.rfind(prefix) {
        Some(at) if !text[at + prefix.len()..].contains('{') => {
            let body = &text[at + prefix.len()..text.len() - 1];
            Some((&text[..at], Some(parse(body)?)))
        }
        _ => Some((text, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trips(name: SampleFileName) {
        let encoded = name.relative_path();
        let parsed = SampleFileName::parse(&encoded).unwrap_or_else(|| {
            panic!("could not parse {encoded:?}");
        });
        assert_eq!(parsed, name, "via {encoded:?}");
    }

    #[test]
    fn plain_name_round_trips() {
        round_trips(SampleFileName {
            app: "/usr/bin/bash".into(),
            image: ImagePart::Path("/usr/lib/libc-2.31.so".into()),
            thread: None,
            cpu: None,
            cg_from: None,
            counter: 0,
        });
    }

    #[test]
    fn anon_name_round_trips() {
        round_trips(SampleFileName {
            app: "/opt/app/server".into(),
            image: ImagePart::Anon {
                name: "[heap]".into(),
                tgid: 4711,
                start: 0x5600_0000,
                end: 0x5600_ffff,
            },
            thread: None,
            cpu: None,
            cg_from: None,
            counter: 2,
        });
    }

    #[test]
    fn separated_name_round_trips() {
        round_trips(SampleFileName {
            app: "/bin/p".into(),
            image: ImagePart::Path("/bin/p".into()),
            thread: Some((3003, 3004)),
            cpu: Some(6),
            cg_from: None,
            counter: 1,
        });
    }

    #[test]
    fn callgraph_name_round_trips() {
        round_trips(SampleFileName {
            app: "/bin/app".into(),
            image: ImagePart::Path("/usr/lib/libm.so.6".into()),
            thread: None,
            cpu: None,
            cg_from: Some(ImagePart::Path("/bin/app".into())),
            counter: 0,
        });
        round_trips(SampleFileName {
            app: "/bin/app".into(),
            image: ImagePart::Anon {
                name: "anon".into(),
                tgid: 9,
                start: 0x1000,
                end: 0x1fff,
            },
            thread: Some((9, 9)),
            cpu: Some(0),
            cg_from: Some(ImagePart::Anon {
                name: "[stack]".into(),
                tgid: 9,
                start: 0x7f00_0000,
                end: 0x7f00_ffff,
            }),
            counter: 3,
        });
    }

    #[test]
    fn dotted_image_names_are_not_misparsed() {
        // Shared-object names full of dots must not be confused with the
        // numeric suffixes.
        round_trips(SampleFileName {
            app: "/usr/bin/python3.11".into(),
            image: ImagePart::Path("/usr/lib/libssl.so.1.1".into()),
            thread: Some((12, 13)),
            cpu: None,
            cg_from: None,
            counter: 4,
        });
    }

    #[test]
    fn unnamed_app_round_trips() {
        round_trips(SampleFileName {
            app: String::new(),
            image: ImagePart::Anon {
                name: "[hypervisor_bucket]".into(),
                tgid: 4004,
                start: 0x10,
                end: 0x1000,
            },
            thread: None,
            cpu: None,
            cg_from: None,
            counter: 0,
        });
    }

    #[test]
    fn mangle_is_reversible() {
        for path in ["/usr/bin/cat", "/", "/a/b/c.so.1"] {
            assert_eq!(demangle(&mangle(path)), path);
        }
    }
}
