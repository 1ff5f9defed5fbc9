use std::io;
use std::path::PathBuf;

use schnellru::{ByLength, LruMap};

use super::db::{DbError, OpenMode, SampleDb};
use super::header::{SampleFileHeader, HeaderError, HEADER_SIZE};
use super::mangling::SampleFileName;

/// Upper bound on simultaneously open sample files. Pressure beyond this (or
/// an EMFILE from the OS) closes least-recently-used handles; closed files
/// are reopened on demand.
const OPEN_FILE_BUDGET: u32 = 256;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("sample file {}: {source}", .path.display())]
    Header {
        path: PathBuf,
        #[source]
        source: HeaderError,
    },

    #[error("could not create sample directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Hands out Sample-DB handles keyed on the full sample-file name, opening
/// and naming files on first use. Open handles live in an LRU; looking one up
/// checks it out of the LRU (so it cannot be evicted mid-use) and logging a
/// sample checks it back in at the MRU position.
pub struct SampleFileRegistry {
    current_dir: PathBuf,
    open_files: LruMap<SampleFileName, SampleDb, ByLength>,
}

impl SampleFileRegistry {
    pub fn new(session_dir: &std::path::Path) -> SampleFileRegistry {
        SampleFileRegistry {
            current_dir: session_dir.join("samples").join("current"),
            open_files: LruMap::new(ByLength::new(OPEN_FILE_BUDGET)),
        }
    }

    /// Add `delta` to the count at `key` in the file identified by `name`.
    /// The header describes the current event parameters; a brand-new file
    /// gets it written, an existing file must match it.
    pub fn log_sample(
        &mut self,
        name: &SampleFileName,
        header: &SampleFileHeader,
        key: u32,
        delta: u32,
    ) -> Result<(), RegistryError> {
        let mut db = match self.open_files.remove(name) {
            Some(db) => db,
            None => self.open_file(name, header)?,
        };
        let result = db.insert_or_add(key, delta);
        self.open_files.insert(name.clone(), db);
        Ok(result?)
    }

    fn open_file(
        &mut self,
        name: &SampleFileName,
        header: &SampleFileHeader,
    ) -> Result<SampleDb, RegistryError> {
        let path = self.current_dir.join(name.relative_path());
        let dir = path.parent().expect("sample paths always have a parent");
        std::fs::create_dir_all(dir).map_err(|source| RegistryError::CreateDir {
            path: dir.to_owned(),
            source,
        })?;

        let mut db = match SampleDb::open(&path, OpenMode::ReadWrite, HEADER_SIZE) {
            Ok(db) => db,
            Err(DbError::Io { source, .. }) if is_fd_exhaustion(&source) => {
                self.close_lru_prefix();
                SampleDb::open(&path, OpenMode::ReadWrite, HEADER_SIZE)?
            }
            Err(err) => return Err(err.into()),
        };

        match SampleFileHeader::decode(db.header_bytes()) {
            Ok(existing) => {
                header
                    .check_compatible(&existing)
                    .map_err(|source| RegistryError::Header {
                        path: path.clone(),
                        source,
                    })?;
            }
            Err(HeaderError::BadMagic) => {
                // Freshly created file.
                db.write_header(&header.encode())?;
            }
            Err(source) => {
                return Err(RegistryError::Header { path, source });
            }
        }
        Ok(db)
    }

    /// Close the least-recently-used half of the open handles to free file
    /// descriptors.
    fn close_lru_prefix(&mut self) {
        let target = (self.open_files.len() / 2).max(1);
        for _ in 0..target {
            if self.open_files.pop_oldest().is_none() {
                break;
            }
        }
        log::debug!(
            "closed sample files under fd pressure, {} remain open",
            self.open_files.len()
        );
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.len()
    }

    /// Flush every open sample file.
    pub fn sync_all(&self) -> Result<(), RegistryError> {
        for (_, db) in self.open_files.iter() {
            db.sync()?;
        }
        Ok(())
    }

    /// Flush and close everything. Used at teardown.
    pub fn finish(mut self) -> Result<(), RegistryError> {
        self.sync_all()?;
        self.open_files.clear();
        Ok(())
    }
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::mangling::ImagePart;

    fn name(counter: usize) -> SampleFileName {
        SampleFileName {
            app: "/bin/app".into(),
            image: ImagePart::Path("/bin/app".into()),
            thread: None,
            cpu: None,
            cg_from: None,
            counter,
        }
    }

    fn header() -> SampleFileHeader {
        SampleFileHeader {
            event_code: 0x3c,
            event_count: 1000,
            unit_mask: 0,
            cpu_type: 1,
            cpu_speed: 0.0,
            is_kernel: false,
            anon_start: 0,
            mtime: 0,
            cg_to_is_kernel: false,
            cg_to_anon_start: 0,
        }
    }

    #[test]
    fn accumulates_into_one_file_per_key() {
        let session = tempfile::tempdir().unwrap();
        let mut registry = SampleFileRegistry::new(session.path());
        registry.log_sample(&name(0), &header(), 0x100, 1).unwrap();
        registry.log_sample(&name(0), &header(), 0x100, 1).unwrap();
        registry.log_sample(&name(1), &header(), 0x200, 1).unwrap();
        assert_eq!(registry.open_file_count(), 2);
        registry.finish().unwrap();

        let path = session
            .path()
            .join("samples/current")
            .join(name(0).relative_path());
        let db = SampleDb::open(&path, OpenMode::ReadOnly, HEADER_SIZE).unwrap();
        assert_eq!(db.iter().collect::<Vec<_>>(), vec![(0x100, 2)]);
    }

    #[test]
    fn reopen_with_changed_parameters_is_rejected() {
        let session = tempfile::tempdir().unwrap();
        {
            let mut registry = SampleFileRegistry::new(session.path());
            registry.log_sample(&name(0), &header(), 0x10, 1).unwrap();
            registry.finish().unwrap();
        }
        let mut registry = SampleFileRegistry::new(session.path());
        let mut changed = header();
        changed.event_count = 5000;
        let err = registry
            .log_sample(&name(0), &changed, 0x10, 1)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Header { .. }), "{err}");
    }

    #[test]
    fn counts_survive_eviction_and_reopen() {
        let session = tempfile::tempdir().unwrap();
        let mut registry = SampleFileRegistry::new(session.path());
        registry.log_sample(&name(0), &header(), 0x40, 1).unwrap();
        registry.close_lru_prefix();
        assert_eq!(registry.open_file_count(), 0);
        registry.log_sample(&name(0), &header(), 0x40, 2).unwrap();
        registry.finish().unwrap();

        let path = session
            .path()
            .join("samples/current")
            .join(name(0).relative_path());
        let db = SampleDb::open(&path, OpenMode::ReadOnly, HEADER_SIZE).unwrap();
        assert_eq!(db.iter().collect::<Vec<_>>(), vec![(0x40, 3)]);
    }
}
