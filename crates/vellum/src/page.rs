//! Fixed-size page buffers and their 16-byte header.
//!
//! Header layout (little-endian):
//!
//! | offset | size | field     |
//! |--------|------|-----------|
//! | 0      | 1    | page type |
//! | 1      | 1    | flags     |
//! | 2      | 2    | item count|
//! | 4      | 4    | checksum  |
//! | 8      | 8    | writer tx |
//!
//! The checksum covers everything after the header. Pages are exclusive to
//! the transaction that allocated or copied them until commit; after commit
//! the image is immutable and shared.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, PageId, PageType, Result, TxId};

/// Size of the fixed page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

const TYPE_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 1;
const ITEM_COUNT_OFFSET: usize = 2;
const CHECKSUM_OFFSET: usize = 4;
const TXN_ID_OFFSET: usize = 8;

/// An in-memory page image.
#[derive(Debug, Clone)]
pub struct Page {
    /// Logical page number.
    pub id: PageId,
    /// Raw page bytes, header included.
    pub data: Vec<u8>,
}

impl Page {
    /// Creates a zeroed page of the given size with an initialized header.
    pub fn new(id: PageId, size: usize, page_type: PageType, txn_id: TxId) -> Self {
        let mut page = Self { id, data: vec![0u8; size] };
        page.data[TYPE_OFFSET] = page_type.as_u8();
        page.set_txn_id(txn_id);
        page
    }

    /// Wraps existing bytes as a page image without validating them.
    pub fn from_bytes(id: PageId, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Total page size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Decodes the page type byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] for an unknown type byte.
    pub fn page_type(&self) -> Result<PageType> {
        PageType::try_from(self.data[TYPE_OFFSET])
    }

    /// Sets the page type byte.
    pub fn set_page_type(&mut self, page_type: PageType) {
        self.data[TYPE_OFFSET] = page_type.as_u8();
    }

    /// Returns the flags byte.
    pub fn flags(&self) -> u8 {
        self.data[FLAGS_OFFSET]
    }

    /// Sets the flags byte.
    pub fn set_flags(&mut self, flags: u8) {
        self.data[FLAGS_OFFSET] = flags;
    }

    /// Number of items on the page (cells for tree nodes).
    pub fn item_count(&self) -> u16 {
        LittleEndian::read_u16(&self.data[ITEM_COUNT_OFFSET..])
    }

    /// Sets the item count.
    pub fn set_item_count(&mut self, count: u16) {
        LittleEndian::write_u16(&mut self.data[ITEM_COUNT_OFFSET..ITEM_COUNT_OFFSET + 2], count);
    }

    /// Id of the transaction that produced this page image.
    pub fn txn_id(&self) -> TxId {
        LittleEndian::read_u64(&self.data[TXN_ID_OFFSET..])
    }

    /// Stamps the writer transaction id.
    pub fn set_txn_id(&mut self, txn_id: TxId) {
        LittleEndian::write_u64(&mut self.data[TXN_ID_OFFSET..TXN_ID_OFFSET + 8], txn_id);
    }

    /// Recomputes and stores the content checksum.
    pub fn update_checksum(&mut self) {
        let checksum = self.compute_checksum();
        LittleEndian::write_u32(&mut self.data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4], checksum);
    }

    /// Verifies the stored checksum against the page content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] when the stored and computed values differ.
    pub fn verify_checksum(&self) -> Result<()> {
        let stored = LittleEndian::read_u32(&self.data[CHECKSUM_OFFSET..]);
        let computed = self.compute_checksum();
        if stored != computed {
            return Err(Error::Corrupted {
                reason: format!(
                    "page {} checksum mismatch: stored {stored:#010x}, computed {computed:#010x}",
                    self.id
                ),
            });
        }
        Ok(())
    }

    fn compute_checksum(&self) -> u32 {
        xxhash_rust::xxh3::xxh3_64(&self.data[PAGE_HEADER_SIZE..]) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_page_header() {
        let page = Page::new(42, 4096, PageType::Leaf, 7);
        assert_eq!(page.id, 42);
        assert_eq!(page.size(), 4096);
        assert_eq!(page.page_type().unwrap(), PageType::Leaf);
        assert_eq!(page.txn_id(), 7);
        assert_eq!(page.item_count(), 0);
    }

    #[test]
    fn test_checksum_roundtrip() {
        let mut page = Page::new(1, 4096, PageType::Raw, 1);
        page.data[100] = 0xAB;
        page.update_checksum();
        page.verify_checksum().unwrap();

        // Content change invalidates the stored checksum.
        page.data[100] = 0xCD;
        assert!(page.verify_checksum().is_err());
    }

    #[test]
    fn test_checksum_ignores_header() {
        let mut page = Page::new(1, 4096, PageType::Raw, 1);
        page.update_checksum();
        page.set_txn_id(99);
        page.verify_checksum().unwrap();
    }

    #[test]
    fn test_item_count_roundtrip() {
        let mut page = Page::new(1, 4096, PageType::Leaf, 1);
        page.set_item_count(321);
        assert_eq!(page.item_count(), 321);
    }

    #[test]
    fn test_invalid_type_byte() {
        let page = Page::from_bytes(5, vec![0u8; 4096]);
        assert!(page.page_type().is_err());
    }
}
