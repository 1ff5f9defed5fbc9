use std::collections::BTreeMap;

/// The canonical image name used when kernel samples cannot be attributed to
/// a real symbol source.
pub const NO_VMLINUX: &str = "no-vmlinux";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelImage {
    pub name: String,
    pub start: u64,
    /// Exclusive upper bound; 0 together with start 0 means "range unknown".
    pub end: u64,
}

impl KernelImage {
    fn contains(&self, pc: u64) -> bool {
        self.start <= pc && self.end > pc
    }

    pub fn is_synthetic(&self) -> bool {
        self.name == NO_VMLINUX || self.name.starts_with("/proc/")
    }
}

/// The vmlinux singleton plus kernel modules ordered by load address.
/// Kernel-domain mmap records are not stored in process records; all
/// processes share this view.
pub struct KernelImages {
    vmlinux: KernelImage,
    modules: BTreeMap<u64, KernelImage>,
    no_vmlinux: bool,
}

impl KernelImages {
    pub fn new() -> KernelImages {
        KernelImages {
            vmlinux: KernelImage {
                name: NO_VMLINUX.to_owned(),
                start: 0,
                end: 0,
            },
            modules: BTreeMap::new(),
            no_vmlinux: true,
        }
    }

    /// Install an image from a kernel-domain mmap record. The recorder emits
    /// the vmlinux record before any module records, so the first one names
    /// the kernel itself.
    pub fn handle_kernel_mmap(&mut self, filename: &str, start: u64, len: u64) {
        if self.no_vmlinux && self.modules.is_empty() {
            self.vmlinux = KernelImage {
                name: filename.to_owned(),
                start,
                end: start + len,
            };
            self.no_vmlinux = filename == NO_VMLINUX || (start == 0 && len == 0);
        } else {
            self.modules.insert(
                start,
                KernelImage {
                    name: filename.to_owned(),
                    start,
                    end: start + len,
                },
            );
        }
    }

    /// The kernel image containing `pc`: the vmlinux range first, then the
    /// modules. Without a usable kernel range every kernel sample lands in
    /// the no-vmlinux bucket.
    pub fn find(&self, pc: u64) -> Option<&KernelImage> {
        if self.no_vmlinux {
            return Some(&self.vmlinux);
        }
        if self.vmlinux.contains(pc) {
            return Some(&self.vmlinux);
        }
        if let Some(module) = self.modules.values().find(|m| m.contains(pc)) {
            return Some(module);
        }
        if self.vmlinux.start == 0 && self.vmlinux.end == 0 {
            return Some(&self.vmlinux);
        }
        None
    }

    pub fn vmlinux(&self) -> &KernelImage {
        &self.vmlinux
    }
}

impl Default for KernelImages {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmlinux_then_modules() {
        let mut images = KernelImages::new();
        images.handle_kernel_mmap("/proc/kallsyms", 0xffff_0000_0000, 0x100_0000);
        images.handle_kernel_mmap("nf_tables", 0xffff_2000_0000, 0x8000);

        let v = images.find(0xffff_0000_1234).unwrap();
        assert_eq!(v.name, "/proc/kallsyms");
        let m = images.find(0xffff_2000_0004).unwrap();
        assert_eq!(m.name, "nf_tables");
        assert!(images.find(0xffff_3000_0000).is_none());
    }

    #[test]
    fn no_vmlinux_catches_everything() {
        let mut images = KernelImages::new();
        images.handle_kernel_mmap(NO_VMLINUX, 0, 0);
        let img = images.find(0xdead_beef).unwrap();
        assert_eq!(img.name, NO_VMLINUX);
        assert_eq!((img.start, img.end), (0, 0));
    }

    #[test]
    fn fresh_table_defaults_to_no_vmlinux() {
        let images = KernelImages::new();
        assert_eq!(images.find(0x1234).unwrap().name, NO_VMLINUX);
    }
}
