//! Error types and core identifier aliases for the engine.

use std::{io, time::Duration};

use snafu::Snafu;

/// Logical page number. Page 0 is reserved for the data-file header and is
/// never handed out by the allocator.
pub type PageId = u64;

/// Transaction identifier. Monotonically increasing; 0 means "no transaction"
/// (the registry and the oldest-transaction scan rely on that sentinel).
pub type TxId = u64;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during engine operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// An I/O operation failed.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Stored data failed validation (bad magic, checksum, or structure).
    #[snafu(display("corrupted database: {reason}"))]
    Corrupted {
        /// Human-readable description of what failed validation.
        reason: String,
    },

    /// A page had a different type than the operation expected.
    #[snafu(display("page type mismatch: expected {expected:?}, found {found:?}"))]
    PageTypeMismatch {
        /// The page type the caller required.
        expected: PageType,
        /// The page type actually present.
        found: PageType,
    },

    /// An entry cannot be placed on a page even after splitting. This is a
    /// logic defect for supported key/value sizes, not a runtime condition.
    #[snafu(display(
        "page {page_id} cannot hold entry: {needed} bytes needed, {available} available"
    ))]
    PageFull {
        /// The page that ran out of room.
        page_id: PageId,
        /// Bytes the entry requires, including its cell pointer.
        needed: usize,
        /// Bytes of free space remaining on the page.
        available: usize,
    },

    /// A key exceeds the maximum supported length for the configured page size.
    #[snafu(display("key of {size} bytes exceeds maximum of {max}"))]
    KeyTooLarge {
        /// Length of the rejected key.
        size: usize,
        /// Maximum key length for the page size.
        max: usize,
    },

    /// A named tree does not exist in the catalog.
    #[snafu(display("tree not found: {name}"))]
    TreeNotFound {
        /// The requested tree name.
        name: String,
    },

    /// The environment suffered a catastrophic journal I/O failure earlier.
    /// Every write is refused until the process restarts and replays.
    #[snafu(display("storage environment is poisoned by an earlier I/O failure"))]
    Poisoned,

    /// The write lock was not acquired within the requested timeout.
    #[snafu(display("write transaction lock not acquired within {timeout:?}"))]
    WriteTimeout {
        /// How long the caller was willing to wait.
        timeout: Duration,
    },

    /// The scratch buffer pool hit its configured size limit.
    #[snafu(display("scratch buffer limit reached: {requested} bytes requested, {limit} allowed"))]
    ScratchExhausted {
        /// Total scratch bytes the allocation would have required.
        requested: u64,
        /// Configured scratch size limit.
        limit: u64,
    },

    /// Environment options failed validation.
    #[snafu(display("invalid options: {reason}"))]
    InvalidOptions {
        /// Which option was rejected and why.
        reason: String,
    },
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

/// Page type tag stored in the first header byte of every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Interior B+ tree node holding separator keys and child pointers.
    Branch = 1,
    /// B+ tree leaf holding key/value cells.
    Leaf = 2,
    /// Overflow page holding a chunk of a value too large for inline storage.
    Overflow = 3,
    /// Untyped page content (header page, test scaffolding).
    Raw = 4,
}

impl PageType {
    /// Returns the on-disk byte for this page type.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageType::Branch),
            2 => Ok(PageType::Leaf),
            3 => Ok(PageType::Overflow),
            4 => Ok(PageType::Raw),
            other => Err(Error::Corrupted { reason: format!("invalid page type byte {other}") }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err = Error::from(io::Error::new(io::ErrorKind::Other, "disk on fire"));
        assert_eq!(err.to_string(), "I/O error: disk on fire");
    }

    #[test]
    fn test_error_display_corrupted() {
        let err = Error::Corrupted { reason: "bad magic".to_string() };
        assert_eq!(err.to_string(), "corrupted database: bad magic");
    }

    #[test]
    fn test_error_display_page_type_mismatch() {
        let err = Error::PageTypeMismatch { expected: PageType::Leaf, found: PageType::Branch };
        assert_eq!(err.to_string(), "page type mismatch: expected Leaf, found Branch");
    }

    #[test]
    fn test_error_display_page_full() {
        let err = Error::PageFull { page_id: 7, needed: 512, available: 100 };
        assert_eq!(err.to_string(), "page 7 cannot hold entry: 512 bytes needed, 100 available");
    }

    #[test]
    fn test_error_display_key_too_large() {
        let err = Error::KeyTooLarge { size: 5000, max: 2048 };
        assert_eq!(err.to_string(), "key of 5000 bytes exceeds maximum of 2048");
    }

    #[test]
    fn test_error_display_tree_not_found() {
        let err = Error::TreeNotFound { name: "documents".to_string() };
        assert_eq!(err.to_string(), "tree not found: documents");
    }

    #[test]
    fn test_error_display_poisoned() {
        assert_eq!(
            Error::Poisoned.to_string(),
            "storage environment is poisoned by an earlier I/O failure"
        );
    }

    #[test]
    fn test_error_display_scratch_exhausted() {
        let err = Error::ScratchExhausted { requested: 1024, limit: 512 };
        assert_eq!(
            err.to_string(),
            "scratch buffer limit reached: 1024 bytes requested, 512 allowed"
        );
    }

    #[test]
    fn test_error_display_write_timeout() {
        let err = Error::WriteTimeout { timeout: Duration::from_millis(250) };
        assert_eq!(err.to_string(), "write transaction lock not acquired within 250ms");
    }

    #[test]
    fn test_error_display_invalid_options() {
        let err = Error::InvalidOptions { reason: "journal_size 100 must be a multiple of 4096".to_string() };
        assert_eq!(err.to_string(), "invalid options: journal_size 100 must be a multiple of 4096");
    }

    #[test]
    fn test_page_type_roundtrip() {
        for pt in [PageType::Branch, PageType::Leaf, PageType::Overflow, PageType::Raw] {
            assert_eq!(PageType::try_from(pt.as_u8()).unwrap(), pt);
        }
        assert!(PageType::try_from(0).is_err());
        assert!(PageType::try_from(99).is_err());
    }
}
