//! Scratch buffer pool.
//!
//! Committed page images live in numbered scratch arenas until the flush
//! pass folds them into the data file. Slots are recycled, but a freed slot
//! carries an "available for allocation after" transaction id and is handed
//! out again only once every transaction that was alive when it was freed
//! has ended. That gate is what keeps a recycled slot from being reused for
//! a different logical page while an older reader could still resolve the
//! old mapping.

use parking_lot::RwLock;

use crate::{
    error::{Error, PageId, Result, TxId},
    page::Page,
    ptt::PagePosition,
    registry::ActiveTransactionRegistry,
};

/// Target size of one scratch arena in bytes. The pool grows arena by arena
/// up to its configured total limit.
const SCRATCH_FILE_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug)]
struct FreeSlot {
    slot: u64,
    available_after: TxId,
}

#[derive(Debug)]
struct ScratchFile {
    number: u32,
    buffer: Vec<u8>,
    next_slot: u64,
    capacity_slots: u64,
    free_slots: Vec<FreeSlot>,
}

impl ScratchFile {
    fn new(number: u32, capacity_slots: u64) -> Self {
        Self { number, buffer: Vec::new(), next_slot: 0, capacity_slots, free_slots: Vec::new() }
    }
}

#[derive(Debug)]
struct PoolInner {
    files: Vec<ScratchFile>,
    total_slots: u64,
}

/// Pool of page-sized scratch slots across numbered arenas.
#[derive(Debug)]
pub struct ScratchBufferPool {
    inner: RwLock<PoolInner>,
    page_size: usize,
    slots_per_file: u64,
    max_bytes: u64,
}

impl ScratchBufferPool {
    /// Creates a pool for the given page size, bounded at `max_bytes` total.
    pub fn new(page_size: usize, max_bytes: u64) -> Self {
        let slots_per_file = (SCRATCH_FILE_BYTES / page_size as u64).max(64);
        Self {
            inner: RwLock::new(PoolInner { files: vec![ScratchFile::new(0, slots_per_file)], total_slots: 0 }),
            page_size,
            slots_per_file,
            max_bytes,
        }
    }

    /// Allocates one slot, reusing a freed slot when its availability stamp
    /// is older than every active transaction. Returns `(file number, slot)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScratchExhausted`] when a fresh slot would push the
    /// pool past its configured limit.
    pub fn allocate(&self, registry: &ActiveTransactionRegistry) -> Result<(u32, u64)> {
        let oldest = registry.oldest();
        let mut inner = self.inner.write();

        for file in &mut inner.files {
            let reusable = file.free_slots.iter().position(|slot| match oldest {
                None => true,
                Some(o) => slot.available_after < o,
            });
            if let Some(idx) = reusable {
                let slot = file.free_slots.swap_remove(idx);
                return Ok((file.number, slot.slot));
            }
        }

        let needed = (inner.total_slots + 1) * self.page_size as u64;
        if needed > self.max_bytes {
            return Err(Error::ScratchExhausted { requested: needed, limit: self.max_bytes });
        }

        let slots_per_file = self.slots_per_file;
        let full = inner.files.last().map(|file| file.next_slot >= file.capacity_slots);
        if full.unwrap_or(true) {
            let number = inner.files.len() as u32;
            inner.files.push(ScratchFile::new(number, slots_per_file));
        }
        inner.total_slots += 1;
        let index = inner.files.len() - 1;
        let file = &mut inner.files[index];
        let slot = file.next_slot;
        file.next_slot += 1;
        Ok((file.number, slot))
    }

    /// Copies a finalized page image into its slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] for coordinates the pool never handed out
    /// or an image of the wrong size.
    pub fn write_page(&self, file: u32, slot: u64, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.page_size {
            return Err(Error::Corrupted {
                reason: format!(
                    "scratch write of {} bytes does not match page size {}",
                    bytes.len(),
                    self.page_size
                ),
            });
        }
        let mut inner = self.inner.write();
        let page_size = self.page_size;
        let arena = inner.files.get_mut(file as usize).ok_or_else(|| Error::Corrupted {
            reason: format!("scratch file {file} does not exist"),
        })?;
        if slot >= arena.next_slot {
            return Err(Error::Corrupted {
                reason: format!("scratch slot {slot} in file {file} was never allocated"),
            });
        }
        let start = slot as usize * page_size;
        let end = start + page_size;
        if arena.buffer.len() < end {
            arena.buffer.resize(end, 0);
        }
        arena.buffer[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads the page image a [`PagePosition`] points at, verifying its
    /// content checksum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] for tombstones, unknown coordinates, or a
    /// checksum mismatch.
    pub fn read_page(&self, position: &PagePosition, page_id: PageId) -> Result<Page> {
        if position.is_freed_page_marker {
            return Err(Error::Corrupted {
                reason: format!("attempted to read freed-page tombstone for page {page_id}"),
            });
        }
        let inner = self.inner.read();
        let arena =
            inner.files.get(position.scratch_file_number as usize).ok_or_else(|| Error::Corrupted {
                reason: format!("scratch file {} does not exist", position.scratch_file_number),
            })?;
        let start = position.position_in_scratch as usize * self.page_size;
        let end = start + self.page_size;
        if arena.buffer.len() < end {
            return Err(Error::Corrupted {
                reason: format!(
                    "scratch slot {} in file {} holds no page image",
                    position.position_in_scratch, position.scratch_file_number
                ),
            });
        }
        let page = Page::from_bytes(page_id, arena.buffer[start..end].to_vec());
        page.verify_checksum()?;
        Ok(page)
    }

    /// Returns a slot to the pool. It becomes allocatable once every
    /// transaction with id ≤ `available_after` has ended.
    pub fn free(&self, file: u32, slot: u64, available_after: TxId) {
        let mut inner = self.inner.write();
        if let Some(arena) = inner.files.get_mut(file as usize) {
            arena.free_slots.push(FreeSlot { slot, available_after });
        }
    }

    /// Slots currently sitting in free lists, across all arenas.
    pub fn free_slot_count(&self) -> usize {
        let inner = self.inner.read();
        inner.files.iter().map(|f| f.free_slots.len()).sum()
    }

    /// Total slots ever created (live + freed).
    pub fn allocated_slots(&self) -> u64 {
        self.inner.read().total_slots
    }
}
