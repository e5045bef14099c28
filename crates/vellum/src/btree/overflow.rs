//! Overflow value chains.
//!
//! Values too large to sit inline in a leaf are chunked across dedicated
//! overflow pages, linked first-to-last. The leaf keeps a fixed-size
//! reference (total length plus first page) in place of the value.

use byteorder::{ByteOrder, LittleEndian};

use super::{PageProvider, node::OverflowRef};
use crate::{
    error::{Error, PageId, PageType, Result},
    page::PAGE_HEADER_SIZE,
};

/// Offset of the next-page pointer (u64); 0 terminates the chain.
const NEXT_OFFSET: usize = PAGE_HEADER_SIZE;
/// Offset of this page's chunk length (u32).
const CHUNK_LEN_OFFSET: usize = PAGE_HEADER_SIZE + 8;
/// Offset of the chunk data.
const DATA_OFFSET: usize = PAGE_HEADER_SIZE + 12;

/// Value bytes one overflow page can carry.
pub fn chunk_capacity(page_size: usize) -> usize {
    page_size - DATA_OFFSET
}

/// Writes `value` into a fresh overflow chain and returns its reference.
pub fn write_chain<P: PageProvider>(provider: &mut P, value: &[u8]) -> Result<OverflowRef> {
    debug_assert!(!value.is_empty());
    let capacity = chunk_capacity(provider.page_size());
    let chunk_count = value.len().div_ceil(capacity);

    // Allocate the whole chain first so each page can point at its
    // successor as it is filled. Ids are taken from the allocations, not
    // assumed contiguous.
    let mut pages = Vec::with_capacity(chunk_count);
    for _ in 0..chunk_count {
        pages.push(provider.allocate_page(PageType::Overflow));
    }
    let first_page = pages[0].id;
    let ids: Vec<PageId> = pages.iter().map(|page| page.id).collect();

    for (i, mut page) in pages.into_iter().enumerate() {
        let chunk = &value[i * capacity..value.len().min((i + 1) * capacity)];
        let next = if i + 1 < chunk_count { ids[i + 1] } else { 0 };
        LittleEndian::write_u64(&mut page.data[NEXT_OFFSET..], next);
        LittleEndian::write_u32(&mut page.data[CHUNK_LEN_OFFSET..], chunk.len() as u32);
        page.data[DATA_OFFSET..DATA_OFFSET + chunk.len()].copy_from_slice(chunk);
        provider.write_page(page);
    }

    Ok(OverflowRef { total_len: value.len() as u32, first_page })
}

/// Reads a whole value back from its overflow chain.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] when the chain's chunks do not add up to
/// the recorded total length.
pub fn read_chain<P: PageProvider>(provider: &P, reference: OverflowRef) -> Result<Vec<u8>> {
    let mut value = Vec::with_capacity(reference.total_len as usize);
    let mut page_id = reference.first_page;

    while page_id != 0 {
        let page = provider.read_page(page_id)?;
        let found = page.page_type()?;
        if found != PageType::Overflow {
            return Err(Error::PageTypeMismatch { expected: PageType::Overflow, found });
        }
        let chunk_len = LittleEndian::read_u32(&page.data[CHUNK_LEN_OFFSET..]) as usize;
        if chunk_len > chunk_capacity(page.size())
            || value.len() + chunk_len > reference.total_len as usize
        {
            return Err(Error::Corrupted {
                reason: format!("overflow chain at page {page_id} exceeds its recorded length"),
            });
        }
        value.extend_from_slice(&page.data[DATA_OFFSET..DATA_OFFSET + chunk_len]);
        page_id = LittleEndian::read_u64(&page.data[NEXT_OFFSET..]);
    }

    if value.len() != reference.total_len as usize {
        return Err(Error::Corrupted {
            reason: format!(
                "overflow chain from page {} holds {} bytes, expected {}",
                reference.first_page,
                value.len(),
                reference.total_len
            ),
        });
    }
    Ok(value)
}

/// Frees every page of an overflow chain.
///
/// # Errors
///
/// Returns an error when a chain page cannot be read.
pub fn free_chain<P: PageProvider>(provider: &mut P, first_page: PageId) -> Result<()> {
    let mut page_id = first_page;
    while page_id != 0 {
        let page = provider.read_page(page_id)?;
        let next = LittleEndian::read_u64(&page.data[NEXT_OFFSET..]);
        provider.free_page(page_id);
        page_id = next;
    }
    Ok(())
}
