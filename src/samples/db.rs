use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

/// Number of hash-table entries per node-array slot. A power of two; the ip
/// offsets we hash cluster tightly inside a binary, so a larger table buys
/// little. Changing this is a file-format break.
pub const BUCKET_FACTOR: u32 = 1;

/// Initial node-array capacity for freshly created files.
pub const DEFAULT_CAPACITY: u32 = 64;

const NODE_SIZE: usize = 12;
const DESCR_PADDING_WORDS: usize = 6;
const DESCR_SIZE: usize = 8 + DESCR_PADDING_WORDS * 4;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sample file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("sample file {} has an incompatible format: {reason}", .path.display())]
    Format { path: PathBuf, reason: String },

    #[error("sample file {} is open read-only", .path.display())]
    ReadOnly { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug)]
enum Backing {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::ReadOnly(m) => m,
            Backing::ReadWrite(m) => m,
        }
    }
}

/// A sample database: one memory-mapped file holding a growable hash table
/// from a 32-bit key (instruction-pointer offset) to a 32-bit cumulative
/// count.
///
/// The file layout is `[user header | descriptor | node array | hash table]`.
/// Nodes are linked by index rather than pointer so that the arrays survive
/// the remap that happens when the table doubles; the node array grows in
/// place and only the hash region is rebuilt. Node 0 is reserved as the
/// chain terminator.
#[derive(Debug)]
pub struct SampleDb {
    file: File,
    map: Backing,
    path: PathBuf,
    header_size: usize,
    capacity: u32,
    used: u32,
}

impl SampleDb {
    /// Open a sample database, creating it (with the default capacity) if it
    /// does not exist and `mode` is read-write. `header_size` is the length
    /// of the caller-owned header prefix; it is part of the format and must
    /// match on every open.
    pub fn open(path: &Path, mode: OpenMode, header_size: usize) -> Result<Self, DbError> {
        match mode {
            OpenMode::ReadWrite => Self::open_rw(path, header_size, DEFAULT_CAPACITY),
            OpenMode::ReadOnly => Self::open_ro(path, header_size),
        }
    }

    fn open_rw(path: &Path, header_size: usize, initial_capacity: u32) -> Result<Self, DbError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| DbError::Io {
                path: path.to_owned(),
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| DbError::Io {
                path: path.to_owned(),
                source,
            })?
            .len();

        if len == 0 {
            return Self::init_file(file, path, header_size, initial_capacity);
        }

        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| DbError::Io {
            path: path.to_owned(),
            source,
        })?;
        let mut db = SampleDb {
            file,
            map: Backing::ReadWrite(map),
            path: path.to_owned(),
            header_size,
            capacity: 0,
            used: 0,
        };
        db.load_descriptor(len)?;
        Ok(db)
    }

    fn open_ro(path: &Path, header_size: usize) -> Result<Self, DbError> {
        let file = File::open(path).map_err(|source| DbError::Io {
            path: path.to_owned(),
            source,
        })?;
        let len = file
            .metadata()
            .map_err(|source| DbError::Io {
                path: path.to_owned(),
                source,
            })?
            .len();
        let map = unsafe { Mmap::map(&file) }.map_err(|source| DbError::Io {
            path: path.to_owned(),
            source,
        })?;
        let mut db = SampleDb {
            file,
            map: Backing::ReadOnly(map),
            path: path.to_owned(),
            header_size,
            capacity: 0,
            used: 0,
        };
        db.load_descriptor(len)?;
        Ok(db)
    }

    fn init_file(
        file: File,
        path: &Path,
        header_size: usize,
        capacity: u32,
    ) -> Result<Self, DbError> {
        assert!(capacity.is_power_of_two());
        let len = Self::file_len(header_size, capacity);
        file.set_len(len as u64).map_err(|source| DbError::Io {
            path: path.to_owned(),
            source,
        })?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| DbError::Io {
            path: path.to_owned(),
            source,
        })?;
        let mut db = SampleDb {
            file,
            map: Backing::ReadWrite(map),
            path: path.to_owned(),
            header_size,
            capacity,
            used: 1,
        };
        db.set_u32(db.descr_offset(), capacity);
        db.set_u32(db.descr_offset() + 4, 1);
        Ok(db)
    }

    fn load_descriptor(&mut self, file_len: u64) -> Result<(), DbError> {
        let min_len = self.header_size + DESCR_SIZE;
        if (file_len as usize) < min_len {
            return self.format_err("file is shorter than header and descriptor");
        }
        let capacity = self.get_u32(self.descr_offset());
        let used = self.get_u32(self.descr_offset() + 4);
        if capacity == 0 || !capacity.is_power_of_two() {
            return self.format_err(&format!("capacity {capacity} is not a power of two"));
        }
        if used == 0 || used > capacity {
            return self.format_err(&format!("used count {used} out of range for {capacity}"));
        }
        for word in 0..DESCR_PADDING_WORDS {
            if self.get_u32(self.descr_offset() + 8 + word * 4) != 0 {
                return self.format_err("descriptor padding is not zero");
            }
        }
        if file_len != Self::file_len(self.header_size, capacity) as u64 {
            return self.format_err(&format!(
                "file length {file_len} does not match capacity {capacity}"
            ));
        }
        self.capacity = capacity;
        self.used = used;
        Ok(())
    }

    fn format_err<T>(&self, reason: &str) -> Result<T, DbError> {
        Err(DbError::Format {
            path: self.path.clone(),
            reason: reason.to_owned(),
        })
    }

    fn file_len(header_size: usize, capacity: u32) -> usize {
        header_size
            + DESCR_SIZE
            + capacity as usize * NODE_SIZE
            + (BUCKET_FACTOR * capacity) as usize * 4
    }

    fn descr_offset(&self) -> usize {
        self.header_size
    }

    fn node_offset(&self, index: u32) -> usize {
        self.header_size + DESCR_SIZE + index as usize * NODE_SIZE
    }

    fn hash_region_offset(&self) -> usize {
        self.node_offset(self.capacity)
    }

    fn hash_entry_offset(&self, bucket: u32) -> usize {
        self.hash_region_offset() + bucket as usize * 4
    }

    fn hash_mask(&self) -> u32 {
        self.capacity - 1
    }

    /// The fixed key permutation. Stored in files, so changing it is a
    /// format break: iteration stays valid but lookups would miss.
    fn hash(&self, key: u32) -> u32 {
        (key ^ (key >> 8)) & self.hash_mask()
    }

    fn get_u32(&self, offset: usize) -> u32 {
        let b = self.map.bytes();
        u32::from_le_bytes([b[offset], b[offset + 1], b[offset + 2], b[offset + 3]])
    }

    fn set_u32(&mut self, offset: usize, value: u32) {
        match &mut self.map {
            Backing::ReadWrite(m) => m[offset..offset + 4].copy_from_slice(&value.to_le_bytes()),
            Backing::ReadOnly(_) => unreachable!("writes are guarded by writable()"),
        }
    }

    fn writable(&self) -> Result<(), DbError> {
        match self.map {
            Backing::ReadWrite(_) => Ok(()),
            Backing::ReadOnly(_) => Err(DbError::ReadOnly {
                path: self.path.clone(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The caller-owned header prefix.
    pub fn header_bytes(&self) -> &[u8] {
        &self.map.bytes()[..self.header_size]
    }

    pub fn write_header(&mut self, bytes: &[u8]) -> Result<(), DbError> {
        self.writable()?;
        assert_eq!(bytes.len(), self.header_size);
        match &mut self.map {
            Backing::ReadWrite(m) => m[..bytes.len()].copy_from_slice(bytes),
            Backing::ReadOnly(_) => unreachable!(),
        }
        Ok(())
    }

    /// Add `delta` to the count for `key`, inserting a node if the key is
    /// new. Counts saturate at `u32::MAX`.
    pub fn insert_or_add(&mut self, key: u32, delta: u32) -> Result<(), DbError> {
        self.writable()?;

        let bucket = self.hash(key);
        let mut index = self.get_u32(self.hash_entry_offset(bucket));
        while index != 0 {
            let node = self.node_offset(index);
            if self.get_u32(node) == key {
                let value = self.get_u32(node + 4).saturating_add(delta);
                self.set_u32(node + 4, value);
                return Ok(());
            }
            index = self.get_u32(node + 8);
        }

        if self.used == self.capacity {
            self.grow()?;
        }

        // Link the new node at the chain head.
        let index = self.used;
        self.used += 1;
        self.set_u32(self.descr_offset() + 4, self.used);
        let bucket_offset = self.hash_entry_offset(self.hash(key));
        let old_head = self.get_u32(bucket_offset);
        let node = self.node_offset(index);
        self.set_u32(node, key);
        self.set_u32(node + 4, delta);
        self.set_u32(node + 8, old_head);
        self.set_u32(bucket_offset, index);
        Ok(())
    }

    /// Double the file, remap, and rebuild the hash region from the intact
    /// node array.
    fn grow(&mut self) -> Result<(), DbError> {
        let new_capacity = self.capacity * 2;
        let new_len = Self::file_len(self.header_size, new_capacity);
        self.file
            .set_len(new_len as u64)
            .map_err(|source| DbError::Io {
                path: self.path.clone(),
                source,
            })?;
        let map = unsafe { MmapMut::map_mut(&self.file) }.map_err(|source| DbError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.map = Backing::ReadWrite(map);
        self.capacity = new_capacity;
        self.set_u32(self.descr_offset(), new_capacity);

        let hash_start = self.hash_region_offset();
        let hash_len = (BUCKET_FACTOR * new_capacity) as usize * 4;
        match &mut self.map {
            Backing::ReadWrite(m) => m[hash_start..hash_start + hash_len].fill(0),
            Backing::ReadOnly(_) => unreachable!(),
        }
        for index in 1..self.used {
            let key = self.get_u32(self.node_offset(index));
            let bucket_offset = self.hash_entry_offset(self.hash(key));
            let old_head = self.get_u32(bucket_offset);
            self.set_u32(self.node_offset(index) + 8, old_head);
            self.set_u32(bucket_offset, index);
        }
        Ok(())
    }

    /// Flush the used prefix of the node array and the hash region.
    pub fn sync(&self) -> Result<(), DbError> {
        let map = match &self.map {
            Backing::ReadWrite(m) => m,
            Backing::ReadOnly(_) => return Ok(()),
        };
        let used_len = self.node_offset(self.used);
        map.flush_range(0, used_len).map_err(|source| DbError::Io {
            path: self.path.clone(),
            source,
        })?;
        let hash_len = (BUCKET_FACTOR * self.capacity) as usize * 4;
        map.flush_range(self.hash_region_offset(), hash_len)
            .map_err(|source| DbError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Iterate over `(key, value)` pairs. Node 0 and nodes whose key slot is
    /// still zero are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (1..self.used).filter_map(move |index| {
            let node = self.node_offset(index);
            let key = self.get_u32(node);
            if key == 0 {
                None
            } else {
                Some((key, self.get_u32(node + 4)))
            }
        })
    }

    pub fn node_count(&self) -> u32 {
        self.used - 1
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
