//! Page grid layout and free-space search.
//!
//! - [`codec`]: two-byte page headers and payload alignment
//! - [`scanner`]: forward search for contiguous free pages

pub mod codec;
pub mod scanner;

pub use codec::{PageHeader, align, mark_free, read_header, run_length, write_header};
pub use scanner::{FreeSpaceScanner, Run, RunKind, ScanOutcome, page_count, runs};
