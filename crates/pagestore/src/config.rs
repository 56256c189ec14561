//! Configuration for the page store

use serde::{Deserialize, Serialize};

use crate::page::codec::PAGE_SIZE;
use crate::{DEFAULT_INITIAL_SIZE, Result, StoreError};

/// How the backing file is extended when no free run is large enough.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthPolicy {
    /// Double the current page count.
    #[default]
    Double,
    /// Add a fixed number of pages.
    Fixed {
        /// Pages added per growth step.
        pages: usize,
    },
}

impl GrowthPolicy {
    /// Number of pages to add to a file currently holding `current_pages`.
    pub fn increment(self, current_pages: usize) -> usize {
        match self {
            Self::Double => current_pages.max(1),
            Self::Fixed { pages } => pages,
        }
    }
}

/// Configuration for the page store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Size in bytes of a newly created backing file
    pub initial_size: u64,

    /// Growth step applied when the file runs out of free pages
    pub growth: GrowthPolicy,

    /// Upper bound on the backing file size in bytes (`None` = unbounded)
    pub max_size: Option<u64>,

    /// Pin the mapping into physical memory after opening and growing
    pub lock_in_memory: bool,

    /// Flush dirty pages after every allocation and deletion
    pub sync_on_write: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_INITIAL_SIZE,
            growth: GrowthPolicy::Double,
            max_size: None,
            lock_in_memory: false,
            sync_on_write: false,
        }
    }
}

impl StoreConfig {
    /// Create a configuration with the default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial file size in bytes
    #[must_use]
    pub const fn with_initial_size(mut self, size: u64) -> Self {
        self.initial_size = size;
        self
    }

    /// Set the initial file size in pages
    #[must_use]
    pub const fn with_initial_pages(mut self, pages: u64) -> Self {
        self.initial_size = pages * PAGE_SIZE as u64;
        self
    }

    /// Set the growth policy
    #[must_use]
    pub const fn with_growth(mut self, growth: GrowthPolicy) -> Self {
        self.growth = growth;
        self
    }

    /// Cap the backing file size in bytes
    #[must_use]
    pub const fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Enable or disable locking the mapping into memory
    #[must_use]
    pub const fn with_lock_in_memory(mut self, enable: bool) -> Self {
        self.lock_in_memory = enable;
        self
    }

    /// Enable or disable flushing after every write
    #[must_use]
    pub const fn with_sync_on_write(mut self, enable: bool) -> Self {
        self.sync_on_write = enable;
        self
    }

    /// Check that the sizes describe a valid page grid.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` if a size is zero or not a multiple of
    /// the page size, if the maximum is below the initial size, or if a
    /// fixed growth step adds no pages.
    pub fn validate(&self) -> Result<()> {
        let page = PAGE_SIZE as u64;

        if self.initial_size == 0 || self.initial_size % page != 0 {
            return Err(StoreError::Config(format!(
                "initial size {} must be a positive multiple of {page}",
                self.initial_size
            )));
        }

        if let Some(max) = self.max_size {
            if max % page != 0 {
                return Err(StoreError::Config(format!(
                    "maximum size {max} must be a multiple of {page}"
                )));
            }
            if max < self.initial_size {
                return Err(StoreError::Config(format!(
                    "maximum size {max} is below initial size {}",
                    self.initial_size
                )));
            }
        }

        if matches!(self.growth, GrowthPolicy::Fixed { pages: 0 }) {
            return Err(StoreError::Config(
                "fixed growth step must add at least one page".to_string(),
            ));
        }

        Ok(())
    }

    /// Initial file size in pages.
    pub const fn initial_pages(&self) -> usize {
        (self.initial_size / PAGE_SIZE as u64) as usize
    }

    /// Maximum file size in pages, if bounded.
    pub fn max_pages(&self) -> Option<usize> {
        self.max_size.map(|max| (max / PAGE_SIZE as u64) as usize)
    }
}
