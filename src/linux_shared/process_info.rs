//! Per-process state reconstructed from comm/mmap/fork records.
//!
//! Comm records carry only a 16-character basename, and the stream delivers
//! records in whatever order the per-CPU rings drained, so this model has to
//! absorb mmap-before-comm (deferred mappings), fork-before-comm (children
//! share the parent's mappings until they exec), and samples that arrive
//! before any of it (the converter's deferred queue).

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

/// Canonical image name for the synthesized mapping that soaks up
/// hypervisor-domain samples.
pub const HYPERVISOR_IMAGE: &str = "[hypervisor_bucket]";

/// How far fork delegation may be followed before we assume a cycle.
const MAX_FORK_CHAIN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    /// Inclusive upper bound: `start + len - 1` as recorded.
    pub end: u64,
    pub pgoff: u64,
    pub filename: String,
    pub is_anon: bool,
    pub is_hypervisor: bool,
}

impl Mapping {
    /// Build a mapping from an mmap record, recognizing the kernel's
    /// anonymous-region spellings (`[heap]`, `//anon`, `/anon_hugepage`).
    pub fn from_mmap(start: u64, len: u64, pgoff: u64, filename: &str) -> Mapping {
        let (filename, is_anon) = if filename.starts_with('[') {
            (filename.to_owned(), true)
        } else if filename.starts_with("//anon") || filename.starts_with("/anon_hugepage") {
            ("anon".to_owned(), true)
        } else {
            (filename.to_owned(), false)
        };
        Mapping {
            start,
            end: if len == 0 { 0 } else { start + len - 1 },
            pgoff,
            filename,
            is_anon,
            is_hypervisor: false,
        }
    }

    pub fn contains(&self, ip: u64) -> bool {
        ip >= self.start && ip <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum AppnameState {
    /// No name at all yet (record created by an mmap or fork record).
    NotFull,
    /// A comm basename or the best-matching mmap path so far.
    MaybeFull,
    /// The full path is known (profiling a named command).
    YesFull,
}

#[derive(Debug)]
pub struct ProcessInfo {
    appname: String,
    app_basename: String,
    state: AppnameState,
    /// Leading characters of `app_basename` confirmed by an mmap basename;
    /// -1 until any mapping matches.
    matched_chars: i32,
    /// True once a comm record with pid == tid was seen (or after the final
    /// pass promoted the record).
    valid: bool,
    /// Parent pid while this record is a forked child that has not yet
    /// exec'd; lookups fall through to the parent.
    forked_parent: Option<u32>,
    /// Set by the final pass: attribute with whatever appname we have.
    settled: bool,
    mappings: BTreeMap<u64, Mapping>,
    deferred: BTreeMap<u64, Mapping>,
}

impl ProcessInfo {
    fn new(appname: Option<&str>, full: bool, valid: bool) -> ProcessInfo {
        let (appname, state) = match appname {
            Some(name) if full => (name.to_owned(), AppnameState::YesFull),
            Some(name) => (name.to_owned(), AppnameState::MaybeFull),
            None => (String::new(), AppnameState::NotFull),
        };
        let app_basename = basename(&appname).to_owned();
        let matched_chars = if state == AppnameState::YesFull {
            app_basename.len() as i32
        } else {
            -1
        };
        ProcessInfo {
            appname,
            app_basename,
            state,
            matched_chars,
            valid,
            forked_parent: None,
            settled: false,
            mappings: BTreeMap::new(),
            deferred: BTreeMap::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn appname(&self) -> &str {
        &self.appname
    }

    /// A record can take samples once its name is trustworthy: either the
    /// full path is known, or a mapped binary confirmed the comm basename,
    /// or the final pass declared best-effort names good enough.
    fn appname_settled(&self) -> bool {
        self.state == AppnameState::YesFull || self.matched_chars > 0 || self.settled
    }

    fn set_appname(&mut self, comm: &str) {
        if self.state == AppnameState::YesFull {
            return;
        }
        self.appname = comm.to_owned();
        self.app_basename = comm.to_owned();
        self.state = AppnameState::MaybeFull;
        self.matched_chars = -1;
    }

    /// Install a mapping, and let non-anonymous ones compete for the
    /// application name: the mapped file whose basename shares the most
    /// leading characters with the comm-derived name wins.
    fn process_new_mapping(&mut self, mapping: Mapping) {
        if !mapping.is_anon
            && self.state < AppnameState::YesFull
            && self.matched_chars < self.app_basename.len() as i32
        {
            let candidate = basename(&mapping.filename).to_owned();
            let matched = self.matching_chars(&candidate);
            if matched > self.matched_chars {
                log::debug!("best appname match for comm {:?}: {}", self.app_basename, mapping.filename);
                self.appname = mapping.filename.clone();
                self.app_basename = candidate;
                self.matched_chars = matched;
                self.state = AppnameState::MaybeFull;
            }
        }
        self.mappings.insert(mapping.start, mapping);
    }

    fn add_deferred_mapping(&mut self, mapping: Mapping) {
        self.deferred.insert(mapping.start, mapping);
    }

    /// Handle a comm record arriving after mmap records forced us to create
    /// this record in the invalid state.
    fn process_deferred_mappings(&mut self, comm: &str) {
        self.set_appname(comm);
        self.valid = true;
        let deferred = std::mem::take(&mut self.deferred);
        for (_, mapping) in deferred {
            self.process_new_mapping(mapping);
        }
    }

    /// Leading-character overlap between the current appname and a mapped
    /// file's basename. Zero overlap never counts as a match, and a
    /// candidate shorter than the name we already trust cannot match it.
    fn matching_chars(&self, candidate: &str) -> i32 {
        let own: &str = if self.state == AppnameState::NotFull {
            &self.appname
        } else {
            &self.app_basename
        };
        if own.len() > candidate.len() {
            return -1;
        }
        let matched = own
            .bytes()
            .zip(candidate.bytes())
            .take_while(|(a, b)| a == b)
            .count();
        if matched == 0 {
            -1
        } else {
            matched as i32
        }
    }

    fn find_own_mapping(&self, ip: u64) -> Option<&Mapping> {
        self.mappings.values().find(|m| m.contains(ip))
    }

    /// Update or synthesize the hypervisor bucket so that it spans every
    /// hypervisor ip seen so far. The range is only final once all samples
    /// have been read, which is why hypervisor samples take the deferred
    /// path through the converter.
    fn process_hypervisor_mapping(&mut self, ip: u64) {
        let set = if self.valid {
            &mut self.mappings
        } else {
            &mut self.deferred
        };
        let mut preserved_end = None;
        if let Some((&start, mapping)) = set.iter_mut().find(|(_, m)| m.is_hypervisor) {
            if start <= ip {
                if mapping.end <= ip {
                    mapping.end = ip;
                }
                return;
            }
            // A lower ip arrived; recreate the bucket with the wider range.
            preserved_end = Some(mapping.end);
            set.remove(&start);
        }
        let end = match preserved_end {
            Some(end) if end >= ip => end,
            _ => ip,
        };
        let mapping = Mapping {
            start: ip,
            end,
            pgoff: 0,
            filename: HYPERVISOR_IMAGE.to_owned(),
            is_anon: true,
            is_hypervisor: true,
        };
        if self.valid {
            self.process_new_mapping(mapping);
        } else {
            self.add_deferred_mapping(mapping);
        }
    }
}

/// The map from pid to process record, plus the fork-delegation logic that
/// needs to see several records at once.
pub struct ProcessTable {
    processes: FxHashMap<u32, ProcessInfo>,
    /// Set when profiling a named command: that pid's full path is known up
    /// front.
    profiled: Option<(u32, String)>,
}

impl ProcessTable {
    pub fn new(profiled: Option<(u32, String)>) -> ProcessTable {
        ProcessTable {
            processes: FxHashMap::default(),
            profiled,
        }
    }

    fn profiled_name_for(&self, pid: u32) -> Option<&str> {
        match &self.profiled {
            Some((app_pid, name)) if *app_pid == pid => Some(name),
            _ => None,
        }
    }

    /// Create a record the way a non-comm record (mmap, fork, hypervisor
    /// sample) has to: invalid, with the full appname only if this is the
    /// launched command itself.
    fn create_invalid(&mut self, pid: u32) -> &mut ProcessInfo {
        let (name, full) = match self.profiled_name_for(pid) {
            Some(name) => (Some(name.to_owned()), true),
            None => (None, false),
        };
        self.processes
            .entry(pid)
            .or_insert_with(|| ProcessInfo::new(name.as_deref(), full, false))
    }

    pub fn handle_comm(&mut self, pid: u32, tid: u32, comm: &str) {
        if !self.processes.contains_key(&pid) {
            let (name, full) = match self.profiled_name_for(pid) {
                Some(name) => (name.to_owned(), true),
                None => (comm.to_owned(), false),
            };
            let valid = pid == tid;
            self.processes
                .insert(pid, ProcessInfo::new(Some(&name), full, valid));
            return;
        }

        let record = self.processes.get_mut(&pid).unwrap();
        if !record.valid {
            // Comm records for secondary threads never validate a record.
            if pid != tid {
                return;
            }
            if record.forked_parent.is_some() {
                self.disassociate_from_parent(pid, comm);
            } else {
                record.process_deferred_mappings(comm);
            }
        } else if pid == tid {
            record.set_appname(comm);
        }
    }

    /// A forked child exec'd: it stops sharing the parent's address space.
    /// The mappings the parent had at this point are copied over once, so
    /// samples taken between fork and exec still resolve; everything after
    /// the exec arrives as the child's own mmap records.
    fn disassociate_from_parent(&mut self, pid: u32, comm: &str) {
        let parent = self.processes.get_mut(&pid).unwrap().forked_parent.take();
        let inherited: Vec<Mapping> = parent
            .and_then(|ppid| self.processes.get(&ppid))
            .map(|p| p.mappings.values().cloned().collect())
            .unwrap_or_default();
        let record = self.processes.get_mut(&pid).unwrap();
        record.set_appname(comm);
        record.valid = true;
        for mapping in inherited {
            record.process_new_mapping(mapping);
        }
        let deferred = std::mem::take(&mut record.deferred);
        for (_, mapping) in deferred {
            record.process_new_mapping(mapping);
        }
    }

    pub fn handle_fork(&mut self, pid: u32, _tid: u32, ppid: u32) {
        self.create_invalid(ppid);

        // Thread creation: threads share the process record keyed on the
        // thread-group id, so there is nothing to create.
        if pid == ppid {
            return;
        }

        if !self.processes.contains_key(&pid) {
            let record = self.create_invalid(pid);
            record.forked_parent = Some(ppid);
            return;
        }
        // A valid record means the comm record beat the fork record here;
        // the child is already standalone. Duplicate fork reports for an
        // associated child are ignored as well.
        let record = self.processes.get_mut(&pid).unwrap();
        if !record.valid && record.forked_parent.is_none() {
            record.forked_parent = Some(ppid);
        }
    }

    pub fn handle_mmap(&mut self, pid: u32, mapping: Mapping) {
        let record = self.create_invalid(pid);
        if record.valid {
            record.process_new_mapping(mapping);
        } else {
            record.add_deferred_mapping(mapping);
        }
    }

    pub fn handle_hypervisor_sample(&mut self, pid: u32, ip: u64) {
        let record = self.create_invalid(pid);
        record.process_hypervisor_mapping(ip);
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid)
    }

    /// Whether samples for this pid can be attributed right now. False both
    /// for unknown pids and for records whose identity is still in flux
    /// (no validating comm yet, or a forked child that has not exec'd);
    /// the converter defers those samples to the second pass.
    pub fn is_attributable(&self, pid: u32) -> bool {
        let Some(record) = self.processes.get(&pid) else {
            return false;
        };
        if !record.valid {
            return false;
        }
        if record.forked_parent.is_some() {
            // Name and mappings both come from the parent.
            return self
                .resolve(pid)
                .is_some_and(|parent| parent.valid && parent.appname_settled());
        }
        record.appname_settled()
    }

    /// Follow fork delegation to the record that owns the mappings.
    fn resolve(&self, pid: u32) -> Option<&ProcessInfo> {
        let mut record = self.processes.get(&pid)?;
        for _ in 0..MAX_FORK_CHAIN {
            match record.forked_parent {
                Some(ppid) => match self.processes.get(&ppid) {
                    Some(parent) => record = parent,
                    None => return Some(record),
                },
                None => return Some(record),
            }
        }
        Some(record)
    }

    /// The first mapping in address order containing `ip`, searching the
    /// record itself and then the parents it delegates to.
    pub fn find_mapping(&self, pid: u32, ip: u64) -> Option<&Mapping> {
        let mut record = self.processes.get(&pid)?;
        for _ in 0..MAX_FORK_CHAIN {
            if let Some(mapping) = record.find_own_mapping(ip) {
                return Some(mapping);
            }
            match record.forked_parent {
                Some(ppid) => record = self.processes.get(&ppid)?,
                None => return None,
            }
        }
        None
    }

    pub fn app_name(&self, pid: u32) -> Option<&str> {
        self.resolve(pid).map(|record| record.appname())
    }

    /// End-of-stream promotion: every record becomes attributable with its
    /// best-effort name, forked children stay connected to their parents,
    /// and deferred mappings finally take effect.
    pub fn finalize(&mut self) {
        for record in self.processes.values_mut() {
            record.valid = true;
            record.settled = true;
            let deferred = std::mem::take(&mut record.deferred);
            for (_, mapping) in deferred {
                record.process_new_mapping(mapping);
            }
        }
    }

    #[cfg(test)]
    fn record(&self, pid: u32) -> &ProcessInfo {
        &self.processes[&pid]
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(start: u64, len: u64, file: &str) -> Mapping {
        Mapping::from_mmap(start, len, 0, file)
    }

    #[test]
    fn comm_then_mmap_builds_appname() {
        let mut table = ProcessTable::new(None);
        table.handle_comm(1001, 1001, "app");
        assert!(!table.is_attributable(1001), "no mapping confirmed the name yet");

        table.handle_mmap(1001, mapping(0x400000, 0x1000, "/bin/app"));
        assert!(table.is_attributable(1001));
        assert_eq!(table.app_name(1001), Some("/bin/app"));

        let m = table.find_mapping(1001, 0x400fff).unwrap();
        assert_eq!(m.filename, "/bin/app");
        assert!(table.find_mapping(1001, 0x401000).is_none());
    }

    #[test]
    fn end_address_is_inclusive() {
        let mut table = ProcessTable::new(None);
        table.handle_comm(1, 1, "x");
        table.handle_mmap(1, mapping(0x1000, 0x1000, "/bin/x"));
        assert!(table.find_mapping(1, 0x1000).is_some());
        assert!(table.find_mapping(1, 0x1fff).is_some());
        assert!(table.find_mapping(1, 0x2000).is_none());
    }

    #[test]
    fn mmap_before_comm_is_deferred() {
        let mut table = ProcessTable::new(None);
        table.handle_mmap(2002, mapping(0x500000, 0x2000, "/bin/x"));
        assert!(table.contains(2002));
        assert!(!table.is_attributable(2002));
        assert!(table.find_mapping(2002, 0x500abc).is_none());

        table.handle_comm(2002, 2002, "x");
        assert!(table.is_attributable(2002));
        assert_eq!(table.app_name(2002), Some("/bin/x"));
        assert!(table.find_mapping(2002, 0x500abc).is_some());
    }

    #[test]
    fn forked_child_shares_parent_until_comm() {
        let mut table = ProcessTable::new(None);
        table.handle_comm(3003, 3003, "p");
        table.handle_mmap(3003, mapping(0x600000, 0x1000, "/bin/p"));
        table.handle_fork(3004, 3004, 3003);

        assert!(!table.is_attributable(3004));
        // Lookup falls through to the parent while associated.
        let shared = table.find_mapping(3004, 0x600200).unwrap();
        assert_eq!(shared.filename, "/bin/p");

        // Exec: the child diverges and keeps a snapshot of the parent maps.
        table.handle_comm(3004, 3004, "c");
        table.handle_mmap(3004, mapping(0x700000, 0x1000, "/bin/c"));
        assert!(table.is_attributable(3004));
        assert_eq!(table.app_name(3004), Some("/bin/c"));
        assert_eq!(table.find_mapping(3004, 0x600200).unwrap().filename, "/bin/p");
        assert_eq!(table.find_mapping(3004, 0x700300).unwrap().filename, "/bin/c");
    }

    #[test]
    fn thread_fork_creates_no_child_record() {
        let mut table = ProcessTable::new(None);
        table.handle_comm(5, 5, "t");
        table.handle_fork(5, 6, 5);
        assert!(table.contains(5));
        assert_eq!(table.processes.len(), 1);
    }

    #[test]
    fn duplicate_fork_for_valid_child_is_ignored() {
        let mut table = ProcessTable::new(None);
        table.handle_comm(10, 10, "parent");
        table.handle_comm(11, 11, "child");
        table.handle_fork(11, 11, 10);
        assert!(table.record(11).forked_parent.is_none());
    }

    #[test]
    fn profiled_command_name_is_authoritative() {
        let mut table = ProcessTable::new(Some((42, "/usr/bin/workload".to_owned())));
        table.handle_comm(42, 42, "workload");
        assert!(table.is_attributable(42));
        assert_eq!(table.app_name(42), Some("/usr/bin/workload"));

        // A longer-matching library must not displace the known full path.
        table.handle_mmap(42, mapping(0x400000, 0x1000, "/usr/lib/workload-helper"));
        assert_eq!(table.app_name(42), Some("/usr/bin/workload"));
    }

    #[test]
    fn anon_spellings_are_canonicalized() {
        let heap = Mapping::from_mmap(0x1000, 0x1000, 0, "[heap]");
        assert!(heap.is_anon);
        assert_eq!(heap.filename, "[heap]");

        let anon = Mapping::from_mmap(0x2000, 0x1000, 0, "//anon");
        assert!(anon.is_anon);
        assert_eq!(anon.filename, "anon");

        let huge = Mapping::from_mmap(0x3000, 0x1000, 0, "/anon_hugepage (deleted)");
        assert!(huge.is_anon);
        assert_eq!(huge.filename, "anon");

        let file = Mapping::from_mmap(0x4000, 0x1000, 0, "/lib/ld.so");
        assert!(!file.is_anon);
    }

    #[test]
    fn hypervisor_bucket_extends_monotonically() {
        let mut table = ProcessTable::new(None);
        for ip in [0x10, 0x1000, 0x100] {
            table.handle_hypervisor_sample(4004, ip);
        }
        table.finalize();
        let m = table.find_mapping(4004, 0x10).unwrap();
        assert!(m.is_hypervisor);
        assert_eq!((m.start, m.end), (0x10, 0x1000));
        assert_eq!(m.filename, HYPERVISOR_IMAGE);
        assert!(table.find_mapping(4004, 0x100).is_some());
    }

    #[test]
    fn finalize_promotes_and_connects() {
        let mut table = ProcessTable::new(None);
        table.handle_comm(20, 20, "p");
        table.handle_mmap(20, mapping(0x600000, 0x1000, "/bin/p"));
        table.handle_fork(21, 21, 20);
        table.handle_mmap(22, mapping(0x100000, 0x1000, "/bin/orphan"));

        table.finalize();

        // The never-comm'd child stays connected to its parent.
        assert!(table.is_attributable(21));
        assert_eq!(table.app_name(21), Some("/bin/p"));
        assert_eq!(table.find_mapping(21, 0x600500).unwrap().filename, "/bin/p");

        // The mmap-only record gets its deferred mappings and a best-effort
        // name.
        assert!(table.is_attributable(22));
        assert!(table.find_mapping(22, 0x100010).is_some());
    }

    #[test]
    fn zero_overlap_basename_never_becomes_appname() {
        let mut table = ProcessTable::new(None);
        table.handle_comm(30, 30, "myapp");
        table.handle_mmap(30, mapping(0x1000, 0x1000, "/lib/zlib.so"));
        assert_eq!(table.app_name(30), Some("myapp"));
        assert!(!table.is_attributable(30));

        table.handle_mmap(30, mapping(0x2000, 0x1000, "/opt/myapp-bin"));
        assert_eq!(table.app_name(30), Some("/opt/myapp-bin"));
        assert!(table.is_attributable(30));
    }

    #[test]
    fn later_mapping_at_same_start_supersedes() {
        let mut table = ProcessTable::new(None);
        table.handle_comm(31, 31, "x");
        table.handle_mmap(31, mapping(0x1000, 0x1000, "/bin/x"));
        table.handle_mmap(31, mapping(0x1000, 0x2000, "/bin/replacement"));
        let m = table.find_mapping(31, 0x1800).unwrap();
        assert_eq!(m.filename, "/bin/replacement");
    }
}
