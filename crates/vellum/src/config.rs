//! Environment configuration.
//!
//! All tuning knobs are owned by the caller and handed in at open time; the
//! engine only consumes them. Defaults favor small embedded deployments.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default journal file size in bytes.
pub const DEFAULT_JOURNAL_SIZE: u64 = 16 * 1024 * 1024;

/// Configuration for a storage [`Environment`](crate::Environment).
///
/// Constructed through the generated builder:
///
/// ```
/// use vellum::EnvironmentOptions;
///
/// let options = EnvironmentOptions::builder()
///     .page_size(8192)
///     .compress_above(4096)
///     .build();
/// assert_eq!(options.page_size, 8192);
/// ```
#[derive(Debug, Clone, bon::Builder)]
pub struct EnvironmentOptions {
    /// Page size in bytes. Power of two, at least 4KB and at most 32KB
    /// (cell offsets within a page are 16-bit).
    #[builder(default = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Capacity of each journal file in bytes (multiple of 4KB). A single
    /// oversized transaction gets a journal grown to fit it.
    #[builder(default = DEFAULT_JOURNAL_SIZE)]
    pub journal_size: u64,

    /// Upper bound on total scratch buffer bytes across all scratch files.
    #[builder(default = 256 * 1024 * 1024)]
    pub max_scratch_size: u64,

    /// Journal payloads larger than this many bytes are zstd-compressed.
    #[builder(default = 32 * 1024)]
    pub compress_above: usize,

    /// How many flush passes may run concurrently. Additional attempts are
    /// skipped rather than queued.
    #[builder(default = 1)]
    pub max_concurrent_flushes: usize,

    /// Delay between a flush pass and the data-file sync that publishes it.
    #[builder(default = Duration::from_secs(1))]
    pub time_to_sync_after_flush: Duration,

    /// How many sync passes may target the same physical drive at once.
    #[builder(default = 3)]
    pub concurrent_syncs_per_drive: usize,

    /// Number of pages written to the data file per batch during a flush and
    /// read per batch during journal replay.
    #[builder(default = 64)]
    pub prefetch_batch_size: usize,

    /// After this many consecutive batches the flush re-opens its gather
    /// window, bounding memory held per pass.
    #[builder(default = 8)]
    pub prefetch_reset_threshold: usize,

    /// Oldest age lazily buffered journal bytes may reach before the next
    /// commit is downgraded to a safe commit and forces a flush.
    #[builder(default = Duration::from_millis(500))]
    pub lazy_commit_expiration: Duration,

    /// Default time [`Environment::write`](crate::Environment::write) waits
    /// for the single-writer lock.
    #[builder(default = Duration::from_secs(30))]
    pub write_lock_timeout: Duration,
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EnvironmentOptions {
    /// Validates option combinations before the environment uses them.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < DEFAULT_PAGE_SIZE
            || self.page_size > 32768
        {
            return Err(Error::InvalidOptions {
                reason: format!(
                    "page_size {} must be a power of two between 4096 and 32768",
                    self.page_size
                ),
            });
        }
        if self.journal_size == 0 || self.journal_size % 4096 != 0 {
            return Err(Error::InvalidOptions {
                reason: format!("journal_size {} must be a nonzero multiple of 4096", self.journal_size),
            });
        }
        if self.max_scratch_size < self.page_size as u64 * 16 {
            return Err(Error::InvalidOptions {
                reason: format!(
                    "max_scratch_size {} must hold at least 16 pages",
                    self.max_scratch_size
                ),
            });
        }
        if self.max_concurrent_flushes == 0
            || self.concurrent_syncs_per_drive == 0
            || self.prefetch_batch_size == 0
        {
            return Err(Error::InvalidOptions {
                reason: "flush, sync, and prefetch limits must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
