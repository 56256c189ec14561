//! Page header layout and payload alignment.
//!
//! Every page starts with a marker byte. [`FREE_MARKER`] means the page is
//! free; any other value means the page starts an occupied run and the next
//! byte holds the run length in pages.
//!
//! Layout of the first page of an occupied run:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00   | 1    | Marker ([`OCCUPIED_MARKER`] when written by this crate) |
//! | 0x01   | 1    | Run length in pages, including this page |
//! | 0x02   | ...  | Payload, continuing across the rest of the run |
//!
//! Pages 2..N of a run carry payload bytes only and are never decoded as
//! headers.

use std::ops::Range;

use crate::region::MappedRegion;
use crate::{Result, StoreError};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Size of the header at the start of an occupied run.
pub const HEADER_SIZE: usize = 2;

/// Marker byte of a free page.
pub const FREE_MARKER: u8 = 0xC1;

/// Marker byte written at the start of an occupied run.
pub const OCCUPIED_MARKER: u8 = 0x5A;

/// Longest representable run (one-byte length field).
pub const MAX_RUN_PAGES: usize = u8::MAX as usize;

/// Largest payload a single record can hold.
pub const MAX_PAYLOAD_SIZE: usize = MAX_RUN_PAGES * PAGE_SIZE - HEADER_SIZE;

/// Number of pages needed for the header plus `payload_size` bytes.
///
/// Always at least one page.
pub const fn run_length(payload_size: usize) -> usize {
    payload_size.saturating_add(HEADER_SIZE).div_ceil(PAGE_SIZE)
}

/// Bytes needed for the header plus `payload_size` bytes, rounded up to a
/// page boundary.
///
/// `align(0)` is exactly one page.
pub const fn align(payload_size: usize) -> usize {
    run_length(payload_size).saturating_mul(PAGE_SIZE)
}

/// Byte offset of `page` within the grid.
pub const fn page_offset(page: usize) -> usize {
    page.saturating_mul(PAGE_SIZE)
}

/// Payload capacity of a run of `pages` pages.
pub const fn payload_capacity(pages: usize) -> usize {
    page_offset(pages).saturating_sub(HEADER_SIZE)
}

/// Decoded header of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageHeader {
    /// The page is free.
    Free,
    /// The page starts an occupied run.
    Occupied {
        /// Raw run length byte; zero is not a valid run.
        run_length: u8,
    },
}

impl PageHeader {
    /// Decode the first two bytes of a page.
    pub const fn decode(bytes: [u8; HEADER_SIZE]) -> Self {
        if bytes[0] == FREE_MARKER {
            Self::Free
        } else {
            Self::Occupied {
                run_length: bytes[1],
            }
        }
    }

    /// Encode the header. The length byte of a free page is written as zero.
    pub const fn encode(self) -> [u8; HEADER_SIZE] {
        match self {
            Self::Free => [FREE_MARKER, 0],
            Self::Occupied { run_length } => [OCCUPIED_MARKER, run_length],
        }
    }

    /// Whether the page is free.
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free)
    }
}

/// Read the header of `page`.
///
/// # Errors
///
/// Returns `StoreError::OutOfBounds` if `page` lies outside the region.
pub fn read_header(region: &MappedRegion, page: usize) -> Result<PageHeader> {
    let bytes = region.bytes(page_offset(page), HEADER_SIZE)?;
    Ok(PageHeader::decode([bytes[0], bytes[1]]))
}

/// Write an occupied header for a run of `run_length` pages at `page`,
/// followed by `payload`.
///
/// The rest of the run after the payload is zeroed, so a reused run never
/// exposes bytes of an earlier record. Nothing is written unless the whole
/// run fits in the region.
///
/// # Errors
///
/// Returns `StoreError::OutOfSpace` if the run length is not representable
/// or the payload does not fit in the run, and `StoreError::OutOfBounds` if
/// the run leaves the region.
pub fn write_header(
    region: &mut MappedRegion,
    page: usize,
    run_length: usize,
    payload: &[u8],
) -> Result<()> {
    let length_byte = u8::try_from(run_length)
        .ok()
        .filter(|&len| len > 0)
        .ok_or_else(|| {
            StoreError::OutOfSpace(format!(
                "run of {run_length} pages is not representable (1..={MAX_RUN_PAGES})"
            ))
        })?;

    if payload.len() > payload_capacity(run_length) {
        return Err(StoreError::OutOfSpace(format!(
            "payload of {} bytes does not fit in a {run_length}-page run",
            payload.len()
        )));
    }

    let run = region.bytes_mut(page_offset(page), page_offset(run_length))?;

    // Marker goes in last so a torn write never exposes a header without
    // its payload.
    let (data, padding) = run[HEADER_SIZE..].split_at_mut(payload.len());
    data.copy_from_slice(payload);
    padding.fill(0);
    let header = PageHeader::Occupied {
        run_length: length_byte,
    }
    .encode();
    run[1] = header[1];
    run[0] = header[0];
    Ok(())
}

/// Mark every page in `pages` as free.
///
/// # Errors
///
/// Returns `StoreError::OutOfBounds` if the range leaves the region; no page
/// is modified in that case.
pub fn mark_free(region: &mut MappedRegion, pages: Range<usize>) -> Result<()> {
    if pages.is_empty() {
        return Ok(());
    }

    let first = page_offset(pages.start);
    let grid = region.bytes_mut(first, page_offset(pages.len()))?;
    let header = PageHeader::Free.encode();
    for page in grid.chunks_exact_mut(PAGE_SIZE) {
        page[..HEADER_SIZE].copy_from_slice(&header);
    }
    Ok(())
}
