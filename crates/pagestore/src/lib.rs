//! Page-based record store on top of a memory-mapped file.
//!
//! The backing file is partitioned into fixed 4 KiB pages. Each record is
//! stored in a contiguous run of pages whose first page carries a two-byte
//! header; the page headers are the only persisted metadata, so the
//! allocation state is rebuilt by re-scanning the file on every open.
//!
//! The crate is layered leaf-first:
//!
//! - **Mapped Region** ([`region`]): bounds-checked byte view over a mapping
//! - **Page Codec** ([`page::codec`]): header layout and alignment
//! - **Free-Space Scanner** ([`page::scanner`]): forward search for free runs
//! - **Page Store** ([`store`]): recovery, allocation, growth and deletion
//!
//! # On-disk layout
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00   | 1    | Marker (`0xC1` = free, anything else = occupied) |
//! | 0x01   | 1    | Run length in pages (occupied pages only) |
//! | 0x02   | ...  | Payload, left-aligned, padded to the end of the run |
//!
//! # Example
//!
//! ```rust,no_run
//! use pagestore::PageStore;
//!
//! # fn example() -> pagestore::Result<()> {
//! let store = PageStore::open("/tmp/records.db")?;
//! let handle = store.allocate(b"hello pages")?;
//! let payload = store.read(handle)?;
//! assert_eq!(&payload[..11], b"hello pages");
//! store.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use thiserror::Error;

// Configuration
pub mod config;

// Page layout and free-space search
pub mod page;

// Memory-mapped region
pub mod region;

// Record store
pub mod store;

pub use config::{GrowthPolicy, StoreConfig};
pub use page::codec::{
    FREE_MARKER, HEADER_SIZE, MAX_PAYLOAD_SIZE, MAX_RUN_PAGES, OCCUPIED_MARKER, PAGE_SIZE,
    PageHeader, align, run_length,
};
pub use page::scanner::{FreeSpaceScanner, Run, RunKind, ScanOutcome};
pub use region::{MappedRegion, Protection};
pub use store::{PageStore, RecordInfo, StoreStats};

/// Result type for page store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during page store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Mapping, flushing, locking or unmapping a region failed.
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// No room for the record, either because it exceeds the run length
    /// field or because the file could not grow.
    #[error("Out of space: {0}")]
    OutOfSpace(String),

    /// Page headers describe an impossible layout.
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Page index does not start a live record.
    #[error("Invalid record handle: {0}")]
    InvalidHandle(String),

    /// Write attempted through a mapping that does not permit it.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Access outside the mapped range.
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Version information for the page store.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default initial size of a newly created backing file (4 MiB).
pub const DEFAULT_INITIAL_SIZE: u64 = 4 * 1024 * 1024;
