//! Memory-mapped region with bounds-checked access.
//!
//! Wraps a `memmap2` mapping behind an index-based accessor API: every read
//! and write names a byte offset and length that are validated against the
//! current mapping length, so no raw slice into mapped memory outlives the
//! call that produced it.
//!
//! ## Protection modes
//!
//! | Mode          | Backing call          | Writes reach the file |
//! |---------------|-----------------------|-----------------------|
//! | `ReadOnly`    | `MmapOptions::map`      | n/a (writes denied)   |
//! | `ReadWrite`   | `MmapOptions::map_mut`  | yes, on flush         |
//! | `CopyOnWrite` | `MmapOptions::map_copy` | never                 |
//! | `Execute`     | `MmapOptions::map_exec` | n/a (writes denied)   |

use std::fs::File;
use std::ops::Range;

use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::debug;

use crate::{Result, StoreError};

/// Access mode requested when mapping a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Read-only shared mapping.
    ReadOnly,
    /// Read-write shared mapping; flushed writes land in the file.
    ReadWrite,
    /// Private writable mapping; writes stay in process memory.
    CopyOnWrite,
    /// Read-only executable mapping.
    Execute,
}

impl Protection {
    /// Whether the mode allows writing through the mapping.
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite | Self::CopyOnWrite)
    }
}

enum Mapping {
    Immutable(Mmap),
    Mutable(MmapMut),
}

impl Mapping {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Immutable(map) => &map[..],
            Self::Mutable(map) => &map[..],
        }
    }
}

/// A mapped byte range of a file or of anonymous memory.
pub struct MappedRegion {
    mapping: Mapping,
    protection: Protection,
    offset: u64,
    locked: bool,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("len", &self.len())
            .field("protection", &self.protection)
            .field("offset", &self.offset)
            .field("locked", &self.locked)
            .finish()
    }
}

/// Operating system page size; mapping offsets must be a multiple of it.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn system_page_size() -> usize {
    // SAFETY: sysconf has no preconditions and only reads a system constant.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(crate::page::codec::PAGE_SIZE)
}

/// Operating system page size; mapping offsets must be a multiple of it.
///
/// Windows requires offsets aligned to the 64 KiB allocation granularity.
#[cfg(not(unix))]
pub const fn system_page_size() -> usize {
    64 * 1024
}

impl MappedRegion {
    /// Map `len` bytes of `file` starting at `offset`.
    ///
    /// When `len` is `None` the mapping extends to the end of the file.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Mapping` if `offset` is not a multiple of the
    /// system page size or the operating system rejects the mapping.
    #[allow(unsafe_code)]
    pub fn map(
        file: &File,
        protection: Protection,
        offset: u64,
        len: Option<usize>,
    ) -> Result<Self> {
        let page_size = system_page_size() as u64;
        if offset % page_size != 0 {
            return Err(StoreError::Mapping(format!(
                "offset {offset} is not a multiple of the system page size {page_size}"
            )));
        }

        let mut options = MmapOptions::new();
        options.offset(offset);
        if let Some(len) = len {
            options.len(len);
        }

        // SAFETY: a file mapping is only sound while no other process
        // truncates or rewrites the file underneath it. The page store holds
        // the only handle it opens and never shrinks the file; callers mapping
        // their own files take on the same obligation.
        let mapping = unsafe {
            match protection {
                Protection::ReadOnly => options.map(file).map(Mapping::Immutable),
                Protection::ReadWrite => options.map_mut(file).map(Mapping::Mutable),
                Protection::CopyOnWrite => options.map_copy(file).map(Mapping::Mutable),
                Protection::Execute => options.map_exec(file).map(Mapping::Immutable),
            }
        }
        .map_err(|e| StoreError::Mapping(format!("failed to map {protection:?} region: {e}")))?;

        debug!(
            "Mapped {} bytes at offset {} ({:?})",
            mapping.as_slice().len(),
            offset,
            protection
        );

        Ok(Self {
            mapping,
            protection,
            offset,
            locked: false,
        })
    }

    /// Map `len` bytes of anonymous, zero-filled memory.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Mapping` if `len` is zero or the allocation fails.
    pub fn anonymous(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(StoreError::Mapping(
                "anonymous mapping requires a non-zero length".to_string(),
            ));
        }

        let map = MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|e| StoreError::Mapping(format!("failed to map anonymous region: {e}")))?;

        Ok(Self {
            mapping: Mapping::Mutable(map),
            protection: Protection::ReadWrite,
            offset: 0,
            locked: false,
        })
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.mapping.as_slice().len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Protection mode of the mapping.
    pub const fn protection(&self) -> Protection {
        self.protection
    }

    /// File offset the mapping starts at.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether the mapping is currently locked into memory.
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    fn range(&self, offset: usize, len: usize) -> Result<Range<usize>> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.len())
            .ok_or_else(|| {
                StoreError::OutOfBounds(format!(
                    "{offset} + {len} exceeds mapping length {}",
                    self.len()
                ))
            })?;
        Ok(offset..end)
    }

    /// Borrow `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::OutOfBounds` if the range leaves the mapping.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let range = self.range(offset, len)?;
        Ok(&self.mapping.as_slice()[range])
    }

    /// Mutably borrow `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AccessDenied` for read-only or executable
    /// mappings and `StoreError::OutOfBounds` if the range leaves the mapping.
    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let range = self.range(offset, len)?;
        match &mut self.mapping {
            Mapping::Mutable(map) => Ok(&mut map[range]),
            Mapping::Immutable(_) => Err(StoreError::AccessDenied(format!(
                "{:?} mapping does not permit writes",
                self.protection
            ))),
        }
    }

    /// Read a single byte.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::OutOfBounds` if `offset` is past the end.
    pub fn byte(&self, offset: usize) -> Result<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    /// Write a single byte.
    ///
    /// # Errors
    ///
    /// Same conditions as [`MappedRegion::bytes_mut`].
    pub fn set_byte(&mut self, offset: usize, value: u8) -> Result<()> {
        self.bytes_mut(offset, 1)?[0] = value;
        Ok(())
    }

    /// Copy `data` into the mapping at `offset`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`MappedRegion::bytes_mut`].
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.bytes_mut(offset, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Synchronously write dirty pages back to the file.
    ///
    /// A no-op for mappings that cannot be dirtied.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Mapping` if the operating system reports a
    /// write-back failure.
    pub fn flush(&self) -> Result<()> {
        match &self.mapping {
            Mapping::Mutable(map) => map
                .flush()
                .map_err(|e| StoreError::Mapping(format!("failed to flush region: {e}"))),
            Mapping::Immutable(_) => Ok(()),
        }
    }

    /// Pin the mapped pages into physical memory.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Mapping` if the lock is refused (for example when
    /// `RLIMIT_MEMLOCK` is too low) or unsupported on this platform.
    pub fn lock(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            let result = match &self.mapping {
                Mapping::Immutable(map) => map.lock(),
                Mapping::Mutable(map) => map.lock(),
            };
            result.map_err(|e| StoreError::Mapping(format!("failed to lock region: {e}")))?;
            self.locked = true;
            Ok(())
        }

        #[cfg(not(unix))]
        {
            Err(StoreError::Mapping(
                "locking mapped pages is not supported on this platform".to_string(),
            ))
        }
    }

    /// Release a previous [`MappedRegion::lock`].
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Mapping` if the operating system rejects the
    /// request or it is unsupported on this platform.
    pub fn unlock(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            let result = match &self.mapping {
                Mapping::Immutable(map) => map.unlock(),
                Mapping::Mutable(map) => map.unlock(),
            };
            result.map_err(|e| StoreError::Mapping(format!("failed to unlock region: {e}")))?;
            self.locked = false;
            Ok(())
        }

        #[cfg(not(unix))]
        {
            Err(StoreError::Mapping(
                "unlocking mapped pages is not supported on this platform".to_string(),
            ))
        }
    }

    /// Flush and release the mapping.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Mapping` if the final flush fails; the mapping
    /// is released either way.
    pub fn unmap(self) -> Result<()> {
        let result = self.flush();
        debug!("Unmapping {} byte region", self.len());
        drop(self);
        result
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempfile;

    fn file_with(len: usize, fill: u8) -> File {
        let mut file = tempfile().expect("tempfile");
        file.write_all(&vec![fill; len]).expect("write");
        file
    }

    #[test]
    fn test_anonymous_region_read_write() {
        let mut region = MappedRegion::anonymous(8192).expect("anonymous map");
        assert_eq!(region.len(), 8192);
        assert_eq!(region.byte(0).expect("byte"), 0);

        region.write(4094, b"abcd").expect("write");
        assert_eq!(region.bytes(4094, 4).expect("bytes"), b"abcd");

        region.set_byte(8191, 0x7F).expect("set byte");
        assert_eq!(region.byte(8191).expect("byte"), 0x7F);
    }

    #[test]
    fn test_anonymous_region_requires_length() {
        assert!(matches!(
            MappedRegion::anonymous(0),
            Err(StoreError::Mapping(_))
        ));
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mut region = MappedRegion::anonymous(4096).expect("anonymous map");
        assert!(matches!(
            region.bytes(4090, 7),
            Err(StoreError::OutOfBounds(_))
        ));
        assert!(matches!(region.byte(4096), Err(StoreError::OutOfBounds(_))));
        assert!(matches!(
            region.write(usize::MAX, b"x"),
            Err(StoreError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_read_only_mapping_denies_writes() {
        let file = file_with(4096, 0xAB);
        let mut region =
            MappedRegion::map(&file, Protection::ReadOnly, 0, None).expect("map read-only");

        assert_eq!(region.byte(100).expect("byte"), 0xAB);
        assert!(matches!(
            region.set_byte(0, 1),
            Err(StoreError::AccessDenied(_))
        ));
        region.flush().expect("flush is a no-op");
    }

    #[test]
    fn test_read_write_mapping_reaches_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("region.bin");
        std::fs::write(&path, vec![0u8; 4096]).expect("write file");

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .expect("open");
        let mut region =
            MappedRegion::map(&file, Protection::ReadWrite, 0, None).expect("map read-write");
        region.write(10, b"persisted").expect("write");
        region.unmap().expect("unmap");

        let contents = std::fs::read(&path).expect("read back");
        assert_eq!(&contents[10..19], b"persisted");
    }

    #[test]
    fn test_copy_on_write_stays_private() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cow.bin");
        std::fs::write(&path, vec![0u8; 4096]).expect("write file");

        let file = File::open(&path).expect("open");
        let mut region =
            MappedRegion::map(&file, Protection::CopyOnWrite, 0, None).expect("map copy");
        region.write(0, b"private").expect("write");
        assert_eq!(region.bytes(0, 7).expect("bytes"), b"private");
        region.unmap().expect("unmap");

        let contents = std::fs::read(&path).expect("read back");
        assert!(contents.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_offset_must_be_page_aligned() {
        let page = system_page_size();
        let file = file_with(page * 2, 0);

        let result = MappedRegion::map(&file, Protection::ReadOnly, 1, None);
        assert!(matches!(result, Err(StoreError::Mapping(_))));

        let region = MappedRegion::map(&file, Protection::ReadOnly, page as u64, Some(page))
            .expect("aligned offset");
        assert_eq!(region.len(), page);
        assert_eq!(region.offset(), page as u64);
    }

    #[test]
    fn test_execute_mapping() {
        let file = file_with(4096, 0xC3);
        match MappedRegion::map(&file, Protection::Execute, 0, None) {
            Ok(mut region) => {
                assert_eq!(region.byte(0).expect("byte"), 0xC3);
                assert!(matches!(
                    region.set_byte(0, 0),
                    Err(StoreError::AccessDenied(_))
                ));
            }
            Err(e) => {
                // noexec temp filesystems refuse PROT_EXEC
                eprintln!("skipping exec mapping test (not available): {e}");
            }
        }
    }

    #[test]
    fn test_lock_unlock() {
        let mut region = MappedRegion::anonymous(4096).expect("anonymous map");
        match region.lock() {
            Ok(()) => {
                assert!(region.is_locked());
                region.unlock().expect("unlock");
                assert!(!region.is_locked());
            }
            Err(e) => {
                // RLIMIT_MEMLOCK may be zero in CI containers
                eprintln!("skipping mlock test (not permitted): {e}");
            }
        }
    }
}
