//! Free-space search over the page grid.
//!
//! The scanner walks forward from a cursor that persists across calls. Free
//! pages extend the current free run one page at a time; an occupied page is
//! skipped together with the rest of its run, so a search is a single pass
//! over the grid regardless of how long the occupied runs are.

use crate::page::codec::{PAGE_SIZE, PageHeader, read_header};
use crate::region::MappedRegion;
use crate::{Result, StoreError};

/// Number of whole pages in `region`.
pub fn page_count(region: &MappedRegion) -> usize {
    region.len() / PAGE_SIZE
}

/// Validate an occupied run starting at `page` and return its length.
fn occupied_run(page: usize, run_length: u8, total: usize) -> Result<usize> {
    let pages = usize::from(run_length);
    if pages == 0 {
        return Err(StoreError::Corruption(format!(
            "page {page} is occupied with a zero run length"
        )));
    }
    if page + pages > total {
        return Err(StoreError::Corruption(format!(
            "run at page {page} spans {pages} pages past the end of a {total}-page grid"
        )));
    }
    Ok(pages)
}

/// Result of a free-space search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A free run of the requested length starts at this page.
    Found {
        /// First page of the run.
        start: usize,
    },
    /// The end of the grid was reached first.
    Exhausted {
        /// Free pages immediately before the end of the grid.
        trailing_free: usize,
    },
}

/// Forward free-run search with a persistent cursor.
#[derive(Debug, Clone, Default)]
pub struct FreeSpaceScanner {
    cursor: usize,
}

impl FreeSpaceScanner {
    /// Create a scanner positioned at page zero.
    pub const fn new() -> Self {
        Self { cursor: 0 }
    }

    /// Create a scanner positioned at `cursor`.
    ///
    /// The cursor must sit on a run boundary.
    pub const fn with_cursor(cursor: usize) -> Self {
        Self { cursor }
    }

    /// Page the next search starts from.
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// Move the cursor to `page`, which must be a run boundary.
    pub const fn seek(&mut self, page: usize) {
        self.cursor = page;
    }

    /// Find the first run of at least `pages` free pages at or after the
    /// cursor.
    ///
    /// On success the cursor is left just past the returned run. When the
    /// grid is exhausted the cursor is left at the end of the grid.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Corruption` if an occupied header has a zero run
    /// length or a run extending past the end of the grid.
    pub fn find(&mut self, region: &MappedRegion, pages: usize) -> Result<ScanOutcome> {
        let pages = pages.max(1);
        let total = page_count(region);
        let mut run_start = self.cursor;
        let mut free_run = 0;

        while self.cursor < total {
            match read_header(region, self.cursor)? {
                PageHeader::Free => {
                    if free_run == 0 {
                        run_start = self.cursor;
                    }
                    free_run += 1;
                    self.cursor += 1;
                    if free_run == pages {
                        return Ok(ScanOutcome::Found { start: run_start });
                    }
                }
                PageHeader::Occupied { run_length } => {
                    self.cursor += occupied_run(self.cursor, run_length, total)?;
                    free_run = 0;
                }
            }
        }

        Ok(ScanOutcome::Exhausted {
            trailing_free: free_run,
        })
    }
}

/// Classification of a run in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// Consecutive free pages.
    Free,
    /// One record's pages.
    Occupied,
}

/// A maximal free run or a single occupied run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    /// First page of the run.
    pub start: usize,
    /// Number of pages in the run.
    pub pages: usize,
    /// Whether the run is free or holds a record.
    pub kind: RunKind,
}

/// Walk the whole grid from page zero, coalescing adjacent free pages.
pub fn runs(region: &MappedRegion) -> Runs<'_> {
    Runs {
        region,
        page: 0,
        total: page_count(region),
        failed: false,
    }
}

/// Iterator returned by [`runs`].
///
/// Yields at most one error, after which it is exhausted.
#[derive(Debug)]
pub struct Runs<'a> {
    region: &'a MappedRegion,
    page: usize,
    total: usize,
    failed: bool,
}

impl Runs<'_> {
    fn fail(&mut self, err: StoreError) -> Option<Result<Run>> {
        self.failed = true;
        Some(Err(err))
    }
}

impl Iterator for Runs<'_> {
    type Item = Result<Run>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.page >= self.total {
            return None;
        }

        let start = self.page;
        match read_header(self.region, start) {
            Ok(PageHeader::Free) => {
                self.page += 1;
                while self.page < self.total {
                    match read_header(self.region, self.page) {
                        Ok(PageHeader::Free) => self.page += 1,
                        Ok(PageHeader::Occupied { .. }) => break,
                        Err(e) => return self.fail(e),
                    }
                }
                Some(Ok(Run {
                    start,
                    pages: self.page - start,
                    kind: RunKind::Free,
                }))
            }
            Ok(PageHeader::Occupied { run_length }) => {
                match occupied_run(start, run_length, self.total) {
                    Ok(pages) => {
                        self.page += pages;
                        Some(Ok(Run {
                            start,
                            pages,
                            kind: RunKind::Occupied,
                        }))
                    }
                    Err(e) => self.fail(e),
                }
            }
            Err(e) => self.fail(e),
        }
    }
}
