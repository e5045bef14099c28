//! Sequential journal replay for crash recovery.
//!
//! Replay walks a journal file entry by entry from block 0 and stops at the
//! first invalid entry: bad magic, bad header or payload checksum, a
//! truncated payload, or a non-monotonic transaction id. Everything before
//! the stop point is the recovered prefix; everything after is discarded by
//! the next append. Replaying the same file twice therefore yields the same
//! entries, cursor, and mappings.

use std::fs::File;

use tracing::debug;

use super::entry::{BLOCK_SIZE, ENTRY_HEADER_SIZE, EntryHeader, open_payload};
use crate::{
    error::{PageId, Result, TxId},
    fileio,
};

/// One valid, not-yet-synced transaction recovered from a journal.
pub struct RecoveredEntry {
    /// Committed transaction id.
    pub tx_id: TxId,
    /// Dirty page images the transaction journaled.
    pub pages: Vec<(PageId, Vec<u8>)>,
    /// Page numbers the transaction freed.
    pub freed: Vec<PageId>,
    /// Catalog root as of this commit.
    pub catalog_root: PageId,
    /// Allocation watermark as of this commit.
    pub next_page: PageId,
}

/// Result of replaying one journal file.
pub struct JournalReader {
    entries: Vec<RecoveredEntry>,
    next_block: u64,
    last_tx_id: TxId,
    stopped_early: bool,
}

impl JournalReader {
    /// Replays `file` from the start.
    ///
    /// Entries with id ≤ `synced_tx` are validated and skipped (the data
    /// file already holds their effects); newer ones are materialized.
    /// `prev_tx` is the last valid id seen in earlier journal files, used to
    /// enforce strictly increasing ids across the whole sequence.
    /// `batch_blocks` bounds how many blocks each payload read pulls at once.
    ///
    /// # Errors
    ///
    /// Returns an error only for real I/O failures; corruption is a stop
    /// condition, not an error.
    pub fn read(
        file: &File,
        page_size: usize,
        synced_tx: TxId,
        prev_tx: TxId,
        batch_blocks: usize,
    ) -> Result<Self> {
        let file_len = file.metadata()?.len();
        let mut entries = Vec::new();
        let mut block = 0u64;
        let mut last_tx = prev_tx;
        let mut stopped_early = false;

        loop {
            let offset = block * BLOCK_SIZE as u64;
            if offset + ENTRY_HEADER_SIZE as u64 > file_len {
                break;
            }

            let mut header_buf = [0u8; ENTRY_HEADER_SIZE];
            fileio::read_exact_at(file, &mut header_buf, offset)?;
            let Some(header) = EntryHeader::decode(&header_buf) else {
                // Zeroed preallocated space is the clean end of the journal;
                // anything else here is a torn or corrupted header.
                stopped_early = header_buf != [0u8; ENTRY_HEADER_SIZE];
                break;
            };

            if header.tx_id <= last_tx {
                debug!(tx_id = header.tx_id, last_tx, "journal entry out of order, stopping replay");
                stopped_early = true;
                break;
            }

            let total = ENTRY_HEADER_SIZE as u64 + header.payload_len as u64;
            if offset + total > file_len {
                debug!(tx_id = header.tx_id, "journal entry truncated, stopping replay");
                stopped_early = true;
                break;
            }

            let payload =
                read_chunked(file, offset + ENTRY_HEADER_SIZE as u64, header.payload_len as usize, batch_blocks)?;
            let Some((pages, freed)) = open_payload(&header, &payload, page_size) else {
                debug!(tx_id = header.tx_id, "journal payload invalid, stopping replay");
                stopped_early = true;
                break;
            };

            last_tx = header.tx_id;
            block += total.div_ceil(BLOCK_SIZE as u64);

            if header.tx_id > synced_tx {
                entries.push(RecoveredEntry {
                    tx_id: header.tx_id,
                    pages,
                    freed,
                    catalog_root: header.catalog_root,
                    next_page: header.next_page,
                });
            }
        }

        Ok(Self { entries, next_block: block, last_tx_id: last_tx, stopped_early })
    }

    /// Recovered entries newer than the synced boundary, in commit order.
    pub fn entries(&self) -> &[RecoveredEntry] {
        &self.entries
    }

    /// Consumes the reader, yielding the recovered entries.
    pub fn into_entries(self) -> Vec<RecoveredEntry> {
        self.entries
    }

    /// First block after the last valid entry; appending resumes here.
    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    /// Highest valid transaction id seen (including skipped synced ones),
    /// or the caller's `prev_tx` when the file held none.
    pub fn last_tx_id(&self) -> TxId {
        self.last_tx_id
    }

    /// True when replay stopped because of an invalid entry rather than
    /// reaching the clean end of written entries.
    pub fn stopped_early(&self) -> bool {
        self.stopped_early
    }
}

fn read_chunked(file: &File, mut offset: u64, len: usize, batch_blocks: usize) -> Result<Vec<u8>> {
    let chunk = batch_blocks.max(1) * BLOCK_SIZE;
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let take = chunk.min(len - filled);
        fileio::read_exact_at(file, &mut out[filled..filled + take], offset)?;
        offset += take as u64;
        filled += take;
    }
    Ok(out)
}
