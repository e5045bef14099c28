//! Low-level leaf and branch node operations on pages.
//!
//! Both node kinds use a slotted layout on top of the 16-byte page header:
//! a sorted array of 16-bit cell pointers grows forward from the node
//! header while cell content grows backward from the end of the page. The
//! content region is kept packed: deleting a cell shifts the content below
//! it and patches the affected pointers, so free space is always the single
//! contiguous gap between `free_start` and `free_end`.
//!
//! Leaf cells store `key_len | val_len | key | payload`. The high bit of
//! `val_len` marks the payload as a 12-byte overflow reference instead of
//! the value itself. Branch cells store `key_len | child | key`; a branch
//! additionally has a rightmost child pointer covering keys at or above its
//! last separator.

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    error::{Error, PageId, PageType, Result},
    page::{PAGE_HEADER_SIZE, Page},
};

/// Offset of `free_start` (u16): end of the cell pointer array.
const FREE_START_OFFSET: usize = PAGE_HEADER_SIZE;
/// Offset of `free_end` (u16): start of the packed cell content region.
const FREE_END_OFFSET: usize = PAGE_HEADER_SIZE + 2;

/// First cell pointer of a leaf node.
pub const LEAF_CELLS_OFFSET: usize = PAGE_HEADER_SIZE + 4;
/// Rightmost child pointer of a branch node (u64).
const BRANCH_RIGHTMOST_OFFSET: usize = PAGE_HEADER_SIZE + 4;
/// First cell pointer of a branch node.
pub const BRANCH_CELLS_OFFSET: usize = BRANCH_RIGHTMOST_OFFSET + 8;

/// High bit of a leaf cell's `val_len`: payload is an overflow reference.
const OVERFLOW_FLAG: u16 = 0x8000;
/// Encoded size of an [`OverflowRef`].
pub const OVERFLOW_REF_SIZE: usize = 12;

/// Largest encoded leaf cell that may be placed inline. The budget reserves
/// the cell's pointer slot and caps cells at half the usable space, which
/// guarantees a split can always distribute any legal page content across
/// two pages.
pub fn max_leaf_entry(page_size: usize) -> usize {
    (page_size - LEAF_CELLS_OFFSET) / 2 - 2
}

/// Largest accepted key for `page_size`. Leaves room for an overflow
/// reference next to a maximum key within the entry budget.
pub fn max_key_len(page_size: usize) -> usize {
    page_size / 2 - 128
}

/// Outcome of a key search within a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Key present at this cell index.
    Found(usize),
    /// Key absent; this is the index it would be inserted at.
    NotFound(usize),
}

/// Reference to a value chain stored outside the leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowRef {
    /// Total value length across the chain.
    pub total_len: u32,
    /// First page of the chain.
    pub first_page: PageId,
}

impl OverflowRef {
    /// Encodes the reference as a leaf cell payload.
    pub fn encode(&self) -> [u8; OVERFLOW_REF_SIZE] {
        let mut buf = [0u8; OVERFLOW_REF_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.total_len);
        LittleEndian::write_u64(&mut buf[4..12], self.first_page);
        buf
    }

    /// Decodes a reference from a leaf cell payload.
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            total_len: LittleEndian::read_u32(&buf[0..4]),
            first_page: LittleEndian::read_u64(&buf[4..12]),
        }
    }
}

/// A leaf cell payload, either the value itself or an overflow reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafValue<'a> {
    /// Value stored inline in the cell.
    Inline(&'a [u8]),
    /// Value stored in an overflow chain.
    Overflow(OverflowRef),
}

fn read_free_start(page: &Page) -> usize {
    LittleEndian::read_u16(&page.data[FREE_START_OFFSET..]) as usize
}

fn read_free_end(page: &Page) -> usize {
    LittleEndian::read_u16(&page.data[FREE_END_OFFSET..]) as usize
}

fn write_free_start(page: &mut Page, value: usize) {
    LittleEndian::write_u16(&mut page.data[FREE_START_OFFSET..], value as u16);
}

fn write_free_end(page: &mut Page, value: usize) {
    LittleEndian::write_u16(&mut page.data[FREE_END_OFFSET..], value as u16);
}

fn cell_offset(page: &Page, cells_offset: usize, idx: usize) -> usize {
    LittleEndian::read_u16(&page.data[cells_offset + idx * 2..]) as usize
}

fn set_cell_offset(page: &mut Page, cells_offset: usize, idx: usize, value: usize) {
    LittleEndian::write_u16(&mut page.data[cells_offset + idx * 2..], value as u16);
}

fn expect_type(page: &Page, expected: PageType) -> Result<()> {
    let found = page.page_type()?;
    if found != expected {
        return Err(Error::PageTypeMismatch { expected, found });
    }
    Ok(())
}

/// Inserts a packed cell at `idx`, shifting the pointer array.
fn insert_cell(page: &mut Page, cells_offset: usize, idx: usize, cell: &[u8]) {
    let count = page.item_count() as usize;
    let free_start = read_free_start(page);
    let free_end = read_free_end(page);
    debug_assert!(cell.len() + 2 <= free_end - free_start);
    debug_assert!(idx <= count);

    let cell_start = free_end - cell.len();
    page.data[cell_start..free_end].copy_from_slice(cell);

    // Shift pointers [idx, count) right by one slot.
    let ptr_from = cells_offset + idx * 2;
    let ptr_to = cells_offset + count * 2;
    page.data.copy_within(ptr_from..ptr_to, ptr_from + 2);
    set_cell_offset(page, cells_offset, idx, cell_start);

    write_free_start(page, free_start + 2);
    write_free_end(page, cell_start);
    page.set_item_count(count as u16 + 1);
}

/// Removes the cell at `idx`, compacting the content region so free space
/// stays contiguous.
fn remove_cell(page: &mut Page, cells_offset: usize, idx: usize, cell_len: usize) {
    let count = page.item_count() as usize;
    let free_start = read_free_start(page);
    let free_end = read_free_end(page);
    let removed = cell_offset(page, cells_offset, idx);

    // Close the hole: slide everything below the removed cell up by its
    // length, then fix the pointers into the moved range.
    page.data.copy_within(free_end..removed, free_end + cell_len);
    for i in 0..count {
        if i == idx {
            continue;
        }
        let offset = cell_offset(page, cells_offset, i);
        if offset < removed {
            set_cell_offset(page, cells_offset, i, offset + cell_len);
        }
    }

    // Drop the pointer slot.
    let ptr_from = cells_offset + (idx + 1) * 2;
    let ptr_to = cells_offset + count * 2;
    page.data.copy_within(ptr_from..ptr_to, ptr_from - 2);

    write_free_start(page, free_start - 2);
    write_free_end(page, free_end + cell_len);
    page.set_item_count(count as u16 - 1);
}

fn leaf_cell_parts(page: &Page, idx: usize) -> (usize, usize, u16) {
    let offset = cell_offset(page, LEAF_CELLS_OFFSET, idx);
    let key_len = LittleEndian::read_u16(&page.data[offset..]) as usize;
    let val_field = LittleEndian::read_u16(&page.data[offset + 2..]);
    (offset, key_len, val_field)
}

fn leaf_key(page: &Page, idx: usize) -> &[u8] {
    let (offset, key_len, _) = leaf_cell_parts(page, idx);
    &page.data[offset + 4..offset + 4 + key_len]
}

fn leaf_raw(page: &Page, idx: usize) -> (&[u8], &[u8], bool) {
    let (offset, key_len, val_field) = leaf_cell_parts(page, idx);
    let payload_len = (val_field & !OVERFLOW_FLAG) as usize;
    let key_end = offset + 4 + key_len;
    (
        &page.data[offset + 4..key_end],
        &page.data[key_end..key_end + payload_len],
        val_field & OVERFLOW_FLAG != 0,
    )
}

fn leaf_cell_len(page: &Page, idx: usize) -> usize {
    let (_, key_len, val_field) = leaf_cell_parts(page, idx);
    4 + key_len + (val_field & !OVERFLOW_FLAG) as usize
}

fn leaf_search(page: &Page, key: &[u8]) -> SearchResult {
    let count = page.item_count() as usize;
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match leaf_key(page, mid).cmp(key) {
            std::cmp::Ordering::Equal => return SearchResult::Found(mid),
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    SearchResult::NotFound(lo)
}

fn branch_key(page: &Page, idx: usize) -> &[u8] {
    let offset = cell_offset(page, BRANCH_CELLS_OFFSET, idx);
    let key_len = LittleEndian::read_u16(&page.data[offset..]) as usize;
    &page.data[offset + 10..offset + 10 + key_len]
}

fn branch_child(page: &Page, idx: usize) -> PageId {
    let offset = cell_offset(page, BRANCH_CELLS_OFFSET, idx);
    LittleEndian::read_u64(&page.data[offset + 2..])
}

fn branch_rightmost(page: &Page) -> PageId {
    LittleEndian::read_u64(&page.data[BRANCH_RIGHTMOST_OFFSET..])
}

/// Index of the child to descend into for `key`: the first separator
/// greater than `key`, or the rightmost child when none is.
fn branch_child_index(page: &Page, key: &[u8]) -> usize {
    let count = page.item_count() as usize;
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if branch_key(page, mid) <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Mutable view of a leaf page.
#[derive(Debug)]
pub struct LeafNode<'a> {
    page: &'a mut Page,
}

impl<'a> LeafNode<'a> {
    /// Initializes `page` as an empty leaf and returns a view of it.
    pub fn init(page: &'a mut Page) -> Self {
        page.set_page_type(PageType::Leaf);
        page.set_item_count(0);
        let size = page.size();
        write_free_start(page, LEAF_CELLS_OFFSET);
        write_free_end(page, size);
        Self { page }
    }

    /// Wraps an existing leaf page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] if the page is not a leaf.
    pub fn from_page(page: &'a mut Page) -> Result<Self> {
        expect_type(page, PageType::Leaf)?;
        Ok(Self { page })
    }

    /// Number of cells.
    pub fn cell_count(&self) -> u16 {
        self.page.item_count()
    }

    /// Contiguous free bytes.
    pub fn free_space(&self) -> usize {
        read_free_end(self.page) - read_free_start(self.page)
    }

    /// Whether a cell of `key_len` key bytes and `payload_len` payload bytes
    /// fits, counting its pointer slot.
    pub fn can_insert(&self, key_len: usize, payload_len: usize) -> bool {
        2 + 4 + key_len + payload_len <= self.free_space()
    }

    /// Binary search for `key`.
    pub fn search(&self, key: &[u8]) -> SearchResult {
        leaf_search(self.page, key)
    }

    /// Key at `idx`.
    pub fn key(&self, idx: usize) -> &[u8] {
        leaf_key(self.page, idx)
    }

    /// Key and decoded value at `idx`.
    pub fn get(&self, idx: usize) -> (&[u8], LeafValue<'_>) {
        let (key, payload, overflow) = leaf_raw(self.page, idx);
        if overflow {
            (key, LeafValue::Overflow(OverflowRef::decode(payload)))
        } else {
            (key, LeafValue::Inline(payload))
        }
    }

    /// Key, raw payload bytes, and overflow flag at `idx`.
    pub fn raw(&self, idx: usize) -> (&[u8], &[u8], bool) {
        leaf_raw(self.page, idx)
    }

    /// Inserts a cell at `idx`. The payload is either the inline value or an
    /// encoded overflow reference, per `overflow`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageFull`] when the cell does not fit.
    pub fn insert(&mut self, idx: usize, key: &[u8], payload: &[u8], overflow: bool) -> Result<()> {
        if !self.can_insert(key.len(), payload.len()) {
            return Err(Error::PageFull {
                page_id: self.page.id,
                needed: 2 + 4 + key.len() + payload.len(),
                available: self.free_space(),
            });
        }
        let mut cell = Vec::with_capacity(4 + key.len() + payload.len());
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u16(&mut len_buf[0..2], key.len() as u16);
        let mut val_field = payload.len() as u16;
        if overflow {
            val_field |= OVERFLOW_FLAG;
        }
        LittleEndian::write_u16(&mut len_buf[2..4], val_field);
        cell.extend_from_slice(&len_buf);
        cell.extend_from_slice(key);
        cell.extend_from_slice(payload);
        insert_cell(self.page, LEAF_CELLS_OFFSET, idx, &cell);
        Ok(())
    }

    /// Overwrites the payload at `idx` in place when the new payload has the
    /// same length. Returns `false` otherwise; the caller deletes and
    /// reinserts.
    pub fn update(&mut self, idx: usize, payload: &[u8], overflow: bool) -> bool {
        let (offset, key_len, val_field) = leaf_cell_parts(self.page, idx);
        if (val_field & !OVERFLOW_FLAG) as usize != payload.len() {
            return false;
        }
        let mut new_field = payload.len() as u16;
        if overflow {
            new_field |= OVERFLOW_FLAG;
        }
        LittleEndian::write_u16(&mut self.page.data[offset + 2..], new_field);
        let payload_start = offset + 4 + key_len;
        self.page.data[payload_start..payload_start + payload.len()].copy_from_slice(payload);
        true
    }

    /// Removes the cell at `idx`.
    pub fn delete(&mut self, idx: usize) {
        let cell_len = leaf_cell_len(self.page, idx);
        remove_cell(self.page, LEAF_CELLS_OFFSET, idx, cell_len);
    }
}

/// Read-only view of a leaf page.
pub struct LeafNodeRef<'a> {
    page: &'a Page,
}

impl<'a> LeafNodeRef<'a> {
    /// Wraps an existing leaf page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] if the page is not a leaf.
    pub fn from_page(page: &'a Page) -> Result<Self> {
        expect_type(page, PageType::Leaf)?;
        Ok(Self { page })
    }

    /// Number of cells.
    pub fn cell_count(&self) -> u16 {
        self.page.item_count()
    }

    /// Binary search for `key`.
    pub fn search(&self, key: &[u8]) -> SearchResult {
        leaf_search(self.page, key)
    }

    /// Key and decoded value at `idx`.
    pub fn get(&self, idx: usize) -> (&'a [u8], LeafValue<'a>) {
        let (key, payload, overflow) = leaf_raw(self.page, idx);
        if overflow {
            (key, LeafValue::Overflow(OverflowRef::decode(payload)))
        } else {
            (key, LeafValue::Inline(payload))
        }
    }
}

/// Mutable view of a branch page.
pub struct BranchNode<'a> {
    page: &'a mut Page,
}

impl<'a> BranchNode<'a> {
    /// Initializes `page` as an empty branch whose rightmost child is
    /// `rightmost`, and returns a view of it.
    pub fn init(page: &'a mut Page, rightmost: PageId) -> Self {
        page.set_page_type(PageType::Branch);
        page.set_item_count(0);
        let size = page.size();
        write_free_start(page, BRANCH_CELLS_OFFSET);
        write_free_end(page, size);
        LittleEndian::write_u64(&mut page.data[BRANCH_RIGHTMOST_OFFSET..], rightmost);
        Self { page }
    }

    /// Wraps an existing branch page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] if the page is not a branch.
    pub fn from_page(page: &'a mut Page) -> Result<Self> {
        expect_type(page, PageType::Branch)?;
        Ok(Self { page })
    }

    /// Number of separator cells.
    pub fn cell_count(&self) -> u16 {
        self.page.item_count()
    }

    /// Contiguous free bytes.
    pub fn free_space(&self) -> usize {
        read_free_end(self.page) - read_free_start(self.page)
    }

    /// Whether a separator of `key_len` bytes fits, counting its pointer.
    pub fn can_insert(&self, key_len: usize) -> bool {
        2 + 10 + key_len <= self.free_space()
    }

    /// Separator key at `idx`.
    pub fn key(&self, idx: usize) -> &[u8] {
        branch_key(self.page, idx)
    }

    /// Child left of the separator at `idx`.
    pub fn child(&self, idx: usize) -> PageId {
        branch_child(self.page, idx)
    }

    /// Child for keys at or above the last separator.
    pub fn rightmost_child(&self) -> PageId {
        branch_rightmost(self.page)
    }

    /// Index of the child to descend into for `key`. Equal to
    /// [`cell_count`](Self::cell_count) when the rightmost child applies.
    pub fn child_index_for_key(&self, key: &[u8]) -> usize {
        branch_child_index(self.page, key)
    }

    /// Child page to descend into for `key`.
    pub fn child_for_key(&self, key: &[u8]) -> PageId {
        let idx = branch_child_index(self.page, key);
        if idx < self.cell_count() as usize {
            self.child(idx)
        } else {
            self.rightmost_child()
        }
    }

    /// Inserts a separator cell at `idx` with `child` to its left.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageFull`] when the cell does not fit.
    pub fn insert(&mut self, idx: usize, key: &[u8], child: PageId) -> Result<()> {
        if !self.can_insert(key.len()) {
            return Err(Error::PageFull {
                page_id: self.page.id,
                needed: 2 + 10 + key.len(),
                available: self.free_space(),
            });
        }
        let mut cell = Vec::with_capacity(10 + key.len());
        let mut head = [0u8; 10];
        LittleEndian::write_u16(&mut head[0..2], key.len() as u16);
        LittleEndian::write_u64(&mut head[2..10], child);
        cell.extend_from_slice(&head);
        cell.extend_from_slice(key);
        insert_cell(self.page, BRANCH_CELLS_OFFSET, idx, &cell);
        Ok(())
    }

    /// Repoints the child left of the separator at `idx`.
    pub fn set_child(&mut self, idx: usize, child: PageId) {
        let offset = cell_offset(self.page, BRANCH_CELLS_OFFSET, idx);
        LittleEndian::write_u64(&mut self.page.data[offset + 2..], child);
    }

    /// Repoints the rightmost child.
    pub fn set_rightmost_child(&mut self, child: PageId) {
        LittleEndian::write_u64(&mut self.page.data[BRANCH_RIGHTMOST_OFFSET..], child);
    }
}

/// Read-only view of a branch page.
pub struct BranchNodeRef<'a> {
    page: &'a Page,
}

impl<'a> BranchNodeRef<'a> {
    /// Wraps an existing branch page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] if the page is not a branch.
    pub fn from_page(page: &'a Page) -> Result<Self> {
        expect_type(page, PageType::Branch)?;
        Ok(Self { page })
    }

    /// Number of separator cells.
    pub fn cell_count(&self) -> u16 {
        self.page.item_count()
    }

    /// Child left of the separator at `idx`.
    pub fn child(&self, idx: usize) -> PageId {
        branch_child(self.page, idx)
    }

    /// Child for keys at or above the last separator.
    pub fn rightmost_child(&self) -> PageId {
        branch_rightmost(self.page)
    }

    /// Child page to descend into for `key`.
    pub fn child_for_key(&self, key: &[u8]) -> PageId {
        let idx = branch_child_index(self.page, key);
        if idx < self.cell_count() as usize {
            self.child(idx)
        } else {
            self.rightmost_child()
        }
    }
}
