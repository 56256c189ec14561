//! Page store: recovery, allocation, growth and deletion of records.
//!
//! The store owns the backing file, its read-write mapping, the free-space
//! cursor and the directory of live records. All of it sits behind one
//! `RwLock`: allocation, deletion and growth take the write lock, so a free
//! run is found and claimed atomically and a remap can never invalidate a
//! view another thread is holding. Reads borrow the mapping only for the
//! duration of a single call.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::page::codec::{
    HEADER_SIZE, MAX_PAYLOAD_SIZE, MAX_RUN_PAGES, PAGE_SIZE, PageHeader, mark_free, page_offset,
    payload_capacity, read_header, run_length, write_header,
};
use crate::page::scanner::{FreeSpaceScanner, RunKind, ScanOutcome, page_count, runs};
use crate::region::{MappedRegion, Protection};
use crate::{Result, StoreError};

/// Location and size of a live record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInfo {
    /// First page of the record's run; the record handle.
    pub page: usize,
    /// Pages in the run.
    pub pages: usize,
}

impl RecordInfo {
    /// Payload bytes the run can hold.
    pub const fn capacity(&self) -> usize {
        payload_capacity(self.pages)
    }
}

/// Occupancy summary of the page grid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Total pages in the backing file.
    pub page_count: usize,
    /// Pages marked free.
    pub free_pages: usize,
    /// Pages belonging to records.
    pub occupied_pages: usize,
    /// Live records.
    pub records: usize,
    /// Longest run of contiguous free pages.
    pub largest_free_run: usize,
    /// Size of the backing file in bytes.
    pub file_size: u64,
}

/// Mutable state guarded by the store lock.
struct StoreState {
    file: File,
    region: MappedRegion,
    scanner: FreeSpaceScanner,
    /// Start page -> run length of every live record.
    records: BTreeMap<usize, usize>,
}

impl StoreState {
    fn run_at(&self, page: usize) -> Result<usize> {
        self.records.get(&page).copied().ok_or_else(|| {
            StoreError::InvalidHandle(format!("page {page} does not start a live record"))
        })
    }

    /// Find a free run of `pages`, wrapping to page zero once and growing the
    /// file as a last resort.
    fn find_or_grow(&mut self, pages: usize, config: &StoreConfig) -> Result<usize> {
        let started_at = self.scanner.cursor();
        let mut outcome = self.scanner.find(&self.region, pages)?;

        if started_at > 0 && !matches!(outcome, ScanOutcome::Found { .. }) {
            debug!("No {pages}-page run after page {started_at}, rescanning from page 0");
            self.scanner.seek(0);
            outcome = self.scanner.find(&self.region, pages)?;
        }

        let trailing_free = match outcome {
            ScanOutcome::Found { start } => return Ok(start),
            ScanOutcome::Exhausted { trailing_free } => trailing_free,
        };

        self.grow(pages, trailing_free, config)?;

        match self.scanner.find(&self.region, pages)? {
            ScanOutcome::Found { start } => Ok(start),
            ScanOutcome::Exhausted { .. } => Err(StoreError::OutOfSpace(format!(
                "no {pages}-page run available after growth"
            ))),
        }
    }

    /// Extend the file so that a run of `pages` fits after the
    /// `trailing_free` pages already free at its end.
    fn grow(&mut self, pages: usize, trailing_free: usize, config: &StoreConfig) -> Result<()> {
        let current = page_count(&self.region);
        let shortfall = pages.saturating_sub(trailing_free);
        let step = config.growth.increment(current).max(shortfall);

        let mut target = current.saturating_add(step);
        if let Some(max) = config.max_pages() {
            target = target.min(max);
        }
        if target < current.saturating_add(shortfall) {
            return Err(StoreError::OutOfSpace(format!(
                "growing {current} pages by {shortfall} would exceed the maximum of {} pages",
                config.max_pages().unwrap_or(target)
            )));
        }

        let old_len = page_offset(current) as u64;
        let new_len = page_offset(target) as u64;

        self.region.flush()?;
        if let Err(e) = write_free_pages(&self.file, current..target) {
            self.truncate_to(old_len);
            return Err(StoreError::OutOfSpace(format!(
                "failed to extend file to {new_len} bytes: {e}"
            )));
        }

        let mut region = match MappedRegion::map(&self.file, Protection::ReadWrite, 0, None) {
            Ok(region) => region,
            Err(e) => {
                // The old mapping is still live and only covers `old_len`.
                self.truncate_to(old_len);
                return Err(StoreError::OutOfSpace(format!(
                    "failed to remap grown file: {e}"
                )));
            }
        };

        if self.region.is_locked()
            && let Err(e) = region.lock()
        {
            warn!("Grown region could not be locked into memory: {e}");
        }

        self.region = region;
        self.scanner.seek(current - trailing_free);

        info!(
            "Grew page store from {} to {} pages ({} bytes)",
            current, target, new_len
        );
        Ok(())
    }

    fn truncate_to(&self, len: u64) {
        if let Err(e) = self.file.set_len(len) {
            warn!("Failed to roll back file to {len} bytes: {e}");
        }
    }

    /// Mark the run at `page` free and drop it from the directory once
    /// `commit` succeeds.
    ///
    /// If `commit` fails the overwritten header bytes of every page in the
    /// run are put back, so the record stays live and readable.
    fn release(
        &mut self,
        page: usize,
        commit: impl FnOnce(&MappedRegion) -> Result<()>,
    ) -> Result<usize> {
        let pages = self.run_at(page)?;

        let header = read_header(&self.region, page)?;
        let matches_run = matches!(
            header,
            PageHeader::Occupied { run_length } if usize::from(run_length) == pages
        );
        if !matches_run {
            return Err(StoreError::Corruption(format!(
                "page {page} should start a {pages}-page run but reads {header:?}"
            )));
        }

        let saved = self
            .region
            .bytes(page_offset(page), page_offset(pages))?
            .chunks_exact(PAGE_SIZE)
            .map(|chunk| [chunk[0], chunk[1]])
            .collect::<Vec<_>>();

        mark_free(&mut self.region, page..page + pages)?;

        if let Err(e) = commit(&self.region) {
            // Header page last, as in write_header
            for (offset, bytes) in (page..page + pages).map(page_offset).zip(&saved).rev() {
                self.region.write(offset, bytes)?;
            }
            return Err(e);
        }

        self.records.remove(&page);
        if self.scanner.cursor() > page {
            self.scanner.seek(page);
        }
        Ok(pages)
    }
}

/// Write free pages `pages` through `file`, extending it as needed, and sync
/// them to disk.
///
/// The markers are written by the same writes that extend the file, so the
/// file never grows by zero-filled pages that still wait for their markers.
fn write_free_pages(mut file: &File, pages: Range<usize>) -> std::io::Result<()> {
    const BATCH_PAGES: usize = 64;

    let mut batch = vec![0u8; page_offset(BATCH_PAGES.min(pages.len()))];
    let header = PageHeader::Free.encode();
    for chunk in batch.chunks_exact_mut(PAGE_SIZE) {
        chunk[..HEADER_SIZE].copy_from_slice(&header);
    }

    file.seek(SeekFrom::Start(page_offset(pages.start) as u64))?;
    let mut remaining = pages.len();
    while remaining > 0 {
        let count = remaining.min(BATCH_PAGES);
        file.write_all(&batch[..page_offset(count)])?;
        remaining -= count;
    }
    file.sync_data()
}

/// Page-based record store over a memory-mapped file.
pub struct PageStore {
    path: PathBuf,
    config: StoreConfig,
    state: RwLock<StoreState>,
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PageStore {
    /// Open the store at `path` with the default configuration.
    ///
    /// See [`PageStore::open_with_config`].
    ///
    /// # Errors
    ///
    /// Same conditions as [`PageStore::open_with_config`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Open the store at `path`, creating it if needed.
    ///
    /// A missing (or zero-length) file is created with its parent
    /// directories, sized to `config.initial_size` and every page marked
    /// free. The page grid is then scanned from page zero to rebuild the
    /// record directory, and the cursor is placed on the first free page.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` for an invalid configuration,
    /// `StoreError::Io` if the directory or file cannot be created or sized,
    /// `StoreError::Mapping` if mapping fails, and `StoreError::Corruption`
    /// if the file length or any page header is inconsistent.
    pub fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let region = if len == 0 {
            Self::initialize(&file, &config, path)?
        } else {
            if len % PAGE_SIZE as u64 != 0 {
                return Err(StoreError::Corruption(format!(
                    "{} is {len} bytes, not a multiple of the {PAGE_SIZE}-byte page size",
                    path.display()
                )));
            }
            MappedRegion::map(&file, Protection::ReadWrite, 0, None)?
        };

        let mut records = BTreeMap::new();
        let mut first_free = None;
        for run in runs(&region) {
            let run = run?;
            match run.kind {
                RunKind::Occupied => {
                    records.insert(run.start, run.pages);
                }
                RunKind::Free => {
                    first_free.get_or_insert(run.start);
                }
            }
        }
        let cursor = first_free.unwrap_or_else(|| page_count(&region));

        let mut state = StoreState {
            file,
            region,
            scanner: FreeSpaceScanner::with_cursor(cursor),
            records,
        };

        if config.lock_in_memory {
            state.region.lock()?;
        }

        info!(
            "Opened page store at {} ({} pages, {} records, cursor {})",
            path.display(),
            page_count(&state.region),
            state.records.len(),
            cursor
        );

        Ok(Self {
            path: path.to_path_buf(),
            config,
            state: RwLock::new(state),
        })
    }

    /// Write a fresh grid of free pages and map it.
    fn initialize(file: &File, config: &StoreConfig, path: &Path) -> Result<MappedRegion> {
        write_free_pages(file, 0..config.initial_pages())?;
        let region = MappedRegion::map(file, Protection::ReadWrite, 0, None)?;

        info!(
            "Created page store at {} ({} bytes)",
            path.display(),
            config.initial_size
        );
        Ok(region)
    }

    /// Store `payload` in the first free run large enough for it.
    ///
    /// Returns the first page of the run, which is the record's handle.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::OutOfSpace` if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`] or the file cannot grow enough to hold it, and
    /// `StoreError::Corruption` if the scan meets an invalid header. Page
    /// state is unchanged when an error is returned.
    pub fn allocate(&self, payload: &[u8]) -> Result<usize> {
        let pages = run_length(payload.len());
        if pages > MAX_RUN_PAGES {
            return Err(StoreError::OutOfSpace(format!(
                "record of {} bytes needs {pages} pages; the limit is {MAX_RUN_PAGES} pages \
                 ({MAX_PAYLOAD_SIZE} bytes)",
                payload.len()
            )));
        }

        let mut state = self.state.write();
        let start = state.find_or_grow(pages, &self.config)?;
        write_header(&mut state.region, start, pages, payload)?;

        if self.config.sync_on_write
            && let Err(e) = state.region.flush()
        {
            mark_free(&mut state.region, start..start + pages)?;
            state.scanner.seek(start);
            return Err(e);
        }

        state.records.insert(start, pages);
        debug!(
            "Allocated {} bytes at page {} ({} pages)",
            payload.len(),
            start,
            pages
        );
        Ok(start)
    }

    /// Release the record starting at `page`, marking its whole run free.
    ///
    /// With `sync_on_write` the release is flushed before it takes effect; a
    /// failed flush leaves the record live.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidHandle` if `page` does not start a live
    /// record, `StoreError::Corruption` if its header no longer matches and
    /// `StoreError::Mapping` if the flush fails.
    pub fn free(&self, page: usize) -> Result<()> {
        let sync = self.config.sync_on_write;
        let pages = self.state.write().release(page, |region| {
            if sync {
                region.flush()
            } else {
                Ok(())
            }
        })?;

        debug!("Freed {} pages at page {}", pages, page);
        Ok(())
    }

    /// Copy the payload area of the record at `page`.
    ///
    /// The returned buffer covers the whole run after the header, so it
    /// includes any padding past the bytes originally written.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidHandle` if `page` does not start a live
    /// record.
    pub fn read(&self, page: usize) -> Result<Vec<u8>> {
        self.with_payload(page, <[u8]>::to_vec)
    }

    /// Call `f` with a borrowed view of the payload area of the record at
    /// `page`.
    ///
    /// The view is only valid inside `f`; allocations and growth are blocked
    /// until it returns.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidHandle` if `page` does not start a live
    /// record.
    pub fn with_payload<R>(&self, page: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let state = self.state.read();
        let pages = state.run_at(page)?;
        let payload = state
            .region
            .bytes(page_offset(page) + HEADER_SIZE, payload_capacity(pages))?;
        Ok(f(payload))
    }

    /// Location and size of the record at `page`, if one starts there.
    pub fn record(&self, page: usize) -> Option<RecordInfo> {
        let state = self.state.read();
        state
            .records
            .get(&page)
            .map(|&pages| RecordInfo { page, pages })
    }

    /// All live records in page order.
    pub fn records(&self) -> Vec<RecordInfo> {
        self.state
            .read()
            .records
            .iter()
            .map(|(&page, &pages)| RecordInfo { page, pages })
            .collect()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// Pages in the backing file.
    pub fn page_count(&self) -> usize {
        page_count(&self.state.read().region)
    }

    /// Page the next free-space search starts from.
    pub fn cursor(&self) -> usize {
        self.state.read().scanner.cursor()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configuration the store was opened with.
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Walk the page grid and summarize its occupancy.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Corruption` if a header is invalid.
    pub fn stats(&self) -> Result<StoreStats> {
        let state = self.state.read();
        let mut stats = StoreStats {
            page_count: page_count(&state.region),
            file_size: state.region.len() as u64,
            ..StoreStats::default()
        };

        for run in runs(&state.region) {
            let run = run?;
            match run.kind {
                RunKind::Free => {
                    stats.free_pages += run.pages;
                    stats.largest_free_run = stats.largest_free_run.max(run.pages);
                }
                RunKind::Occupied => {
                    stats.occupied_pages += run.pages;
                    stats.records += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Write dirty pages back to the file.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Mapping` if the write-back fails.
    pub fn flush(&self) -> Result<()> {
        self.state.read().region.flush()
    }

    /// Pin the mapping into physical memory.
    ///
    /// The lock is carried over when the file grows.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Mapping` if the operating system refuses.
    pub fn lock_in_memory(&self) -> Result<()> {
        self.state.write().region.lock()
    }

    /// Undo [`PageStore::lock_in_memory`].
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Mapping` if the operating system refuses.
    pub fn unlock_memory(&self) -> Result<()> {
        self.state.write().region.unlock()
    }

    /// Flush dirty pages and release the mapping and file.
    ///
    /// Dropping the store without closing it also unmaps the file, but
    /// skips the synchronous flush.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Mapping` if the final flush fails.
    pub fn close(self) -> Result<()> {
        let StoreState { file, region, .. } = self.state.into_inner();
        region.unmap()?;
        drop(file);

        info!("Closed page store at {}", self.path.display());
        Ok(())
    }
}
