//! Write-ahead journal.
//!
//! Each journal file is an append-only sequence of framed transaction
//! entries plus one page translation table shadowing the data file for
//! every page its entries touched. A single lock per journal guards the
//! table and the write cursor together: commit merges its delta into the
//! table first and advances the cursor second, so any concurrent pass that
//! derives "how much is committed" from the cursor can never observe
//! appended bytes whose mappings are missing.
//!
//! Durability is either *safe* (pwrite + fsync before the commit returns)
//! or *lazy* (buffered in a shared cross-transaction buffer and flushed
//! when the buffer grows large relative to the journal's remaining
//! capacity, when a safe commit arrives, or when the lazy window expires).

pub mod entry;
pub mod replay;

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::Instant,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use self::entry::{BLOCK_SIZE, SealedEntry};
use crate::{
    config::EnvironmentOptions,
    error::{PageId, Result, TxId},
    fileio,
    ptt::{PagePosition, PageTranslationTable},
    scratch::ScratchBufferPool,
};

/// Commit durability requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// The entry is on disk and fsynced before commit returns.
    Safe,
    /// The entry may sit in the shared lazy buffer; a crash inside the lazy
    /// window loses it. Visibility to readers is immediate either way.
    Lazy,
}

/// Returns the on-disk file name for journal `number`.
pub fn journal_file_name(number: u64) -> String {
    format!("{number:016}.journal")
}

#[derive(Debug)]
struct JournalState {
    table: PageTranslationTable,
    /// Write cursor in 4KB blocks. Advanced only after the table merge.
    write_block: u64,
    /// Superseded positions queued at merge time, drained by reclamation.
    unused: Vec<PagePosition>,
    /// Highest transaction whose bytes are physically on disk and synced.
    durable_tx: TxId,
}

#[derive(Debug)]
struct LazyBuffer {
    bytes: Vec<u8>,
    /// Block the buffered region starts at.
    base_block: u64,
    first_buffered_at: Option<Instant>,
    /// Newest transaction sitting in the buffer.
    last_tx: TxId,
}

/// One numbered journal file and its translation table.
#[derive(Debug)]
pub struct JournalFile {
    number: u64,
    path: PathBuf,
    file: File,
    capacity_blocks: u64,
    state: RwLock<JournalState>,
    lazy: Mutex<LazyBuffer>,
}

impl JournalFile {
    /// Creates and preallocates journal `number` in `dir`.
    pub fn create(dir: &Path, number: u64, size_bytes: u64) -> Result<Self> {
        let path = dir.join(journal_file_name(number));
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
        file.set_len(size_bytes)?;
        debug!(number, size_bytes, "created journal file");
        Ok(Self {
            number,
            path,
            file,
            capacity_blocks: size_bytes / BLOCK_SIZE as u64,
            state: RwLock::new(JournalState {
                table: PageTranslationTable::new(),
                write_block: 0,
                unused: Vec::new(),
                durable_tx: 0,
            }),
            lazy: Mutex::new(LazyBuffer {
                bytes: Vec::new(),
                base_block: 0,
                first_buffered_at: None,
                last_tx: 0,
            }),
        })
    }

    /// Reopens an existing journal after replay, resuming the cursor after
    /// the last valid entry and adopting the rebuilt translation table along
    /// with the supersessions observed while rebuilding it.
    pub fn open_existing(
        dir: &Path,
        number: u64,
        table: PageTranslationTable,
        unused: Vec<PagePosition>,
        next_block: u64,
        durable_tx: TxId,
    ) -> Result<Self> {
        let path = dir.join(journal_file_name(number));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let capacity_blocks = file.metadata()?.len() / BLOCK_SIZE as u64;
        Ok(Self {
            number,
            path,
            file,
            capacity_blocks,
            state: RwLock::new(JournalState {
                table,
                write_block: next_block,
                unused,
                durable_tx,
            }),
            lazy: Mutex::new(LazyBuffer {
                bytes: Vec::new(),
                base_block: 0,
                first_buffered_at: None,
                last_tx: 0,
            }),
        })
    }

    /// Journal sequence number.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks still available for appending.
    pub fn remaining_blocks(&self) -> u64 {
        let state = self.state.read();
        self.capacity_blocks.saturating_sub(state.write_block)
    }

    /// Whether `blocks` more blocks fit.
    pub fn has_capacity_for(&self, blocks: u64) -> bool {
        self.remaining_blocks() >= blocks
    }

    /// Resolves `page` for snapshot `tx` through this journal's table.
    pub fn resolve(&self, tx: TxId, page: PageId) -> Option<PagePosition> {
        self.state.read().table.resolve(tx, page)
    }

    /// Highest transaction id merged into the table.
    pub fn last_seen_transaction_id(&self) -> TxId {
        self.state.read().table.last_seen_transaction_id()
    }

    /// Highest transaction whose journal bytes are durable.
    pub fn durable_transaction_id(&self) -> TxId {
        self.state.read().durable_tx
    }

    /// Newest non-tombstone version at or below `boundary` for every mapped
    /// page. Used by the flush pass.
    pub fn latest_visible(&self, boundary: TxId) -> Vec<(PageId, PagePosition)> {
        self.state.read().table.latest_visible(boundary)
    }

    /// True when nothing in this journal is needed anymore: no mappings, no
    /// queued reclamation, no buffered bytes.
    pub fn is_unused(&self) -> bool {
        let state = self.state.read();
        state.table.is_empty() && state.unused.is_empty() && self.lazy.lock().bytes.is_empty()
    }

    /// Records one committed transaction.
    ///
    /// The caller holds the environment's single-writer lock; the cursor
    /// cannot move under this call. The sealed entry is appended (eagerly or
    /// via the lazy buffer), then, under the journal lock, the delta built
    /// from `freed` (tombstones) and `dirty` (final scratch locations) is
    /// merged into the table (tagging and queueing every superseded
    /// predecessor), and only then is the cursor advanced.
    ///
    /// # Errors
    ///
    /// Any I/O error here is catastrophic for the environment; the caller
    /// poisons it and propagates the error.
    pub fn write(
        &self,
        sealed: &SealedEntry,
        dirty: &[(PageId, u32, u64)],
        freed: &[PageId],
        mode: Durability,
        options: &EnvironmentOptions,
    ) -> Result<()> {
        let tx_id = sealed.header.tx_id;
        let start_block = self.state.read().write_block;
        debug_assert!(start_block + sealed.blocks() <= self.capacity_blocks);

        let mut durable_after = None;
        {
            let mut lazy = self.lazy.lock();
            let mut force_safe = mode == Durability::Safe;
            if !force_safe {
                if let Some(first) = lazy.first_buffered_at {
                    if first.elapsed() >= options.lazy_commit_expiration {
                        debug!(tx_id, "lazy window expired, downgrading commit to safe");
                        force_safe = true;
                    }
                }
            }

            if force_safe {
                self.write_buffer_locked(&mut lazy)?;
                fileio::write_all_at(&self.file, &sealed.bytes, start_block * BLOCK_SIZE as u64)?;
                self.file.sync_data()?;
                durable_after = Some(tx_id);
            } else {
                if lazy.bytes.is_empty() {
                    lazy.base_block = start_block;
                    lazy.first_buffered_at = Some(Instant::now());
                }
                lazy.bytes.extend_from_slice(&sealed.bytes);
                lazy.last_tx = tx_id;

                let buffered_blocks = (lazy.bytes.len() / BLOCK_SIZE) as u64;
                let remaining =
                    self.capacity_blocks.saturating_sub(start_block + sealed.blocks());
                if buffered_blocks * 2 >= remaining {
                    debug!(tx_id, buffered_blocks, remaining, "lazy buffer crowding journal, flushing");
                    self.write_buffer_locked(&mut lazy)?;
                    self.file.sync_data()?;
                    durable_after = Some(tx_id);
                }
            }
        }

        let mut delta = Vec::with_capacity(freed.len() + dirty.len());
        for page in freed {
            delta.push((*page, PagePosition::tombstone(tx_id, self.number)));
        }
        for (page, scratch_file, slot) in dirty {
            delta.push((*page, PagePosition::mapped(*scratch_file, *slot, tx_id, self.number)));
        }

        let mut state = self.state.write();
        let superseded = state.table.apply(tx_id, &delta);
        state.unused.extend(superseded);
        state.write_block = start_block + sealed.blocks();
        if let Some(durable) = durable_after {
            state.durable_tx = durable;
        }
        Ok(())
    }

    /// Forces any lazily buffered entries to disk. Returns the durable
    /// transaction id afterward.
    pub fn flush_lazy(&self) -> Result<TxId> {
        let mut lazy = self.lazy.lock();
        if lazy.bytes.is_empty() {
            return Ok(self.state.read().durable_tx);
        }
        let last_tx = lazy.last_tx;
        self.write_buffer_locked(&mut lazy)?;
        self.file.sync_data()?;
        drop(lazy);

        let mut state = self.state.write();
        if last_tx > state.durable_tx {
            state.durable_tx = last_tx;
        }
        Ok(state.durable_tx)
    }

    fn write_buffer_locked(&self, lazy: &mut LazyBuffer) -> Result<()> {
        if lazy.bytes.is_empty() {
            return Ok(());
        }
        fileio::write_all_at(&self.file, &lazy.bytes, lazy.base_block * BLOCK_SIZE as u64)?;
        lazy.bytes.clear();
        lazy.first_buffered_at = None;
        Ok(())
    }

    /// Reclaims scratch positions this journal superseded, once the synced
    /// boundary has passed them.
    ///
    /// Tracked superseded positions with writer id ≤ `synced` are drained
    /// (the rest are kept); fully synced chains are pruned from the table.
    /// Freed-page tombstones are skipped (no scratch backing), as are chain
    /// entries already tagged `unused_in_ptt`: those were queued when they
    /// were superseded and skipping them here prevents a double free. The
    /// remainder goes back to the pool stamped available-after
    /// `reclaim_stamp`, the id held by the current (or next) write
    /// transaction.
    ///
    /// Returns the freed positions.
    pub fn free_scratch_pages_older_than(
        &self,
        reclaim_stamp: TxId,
        synced: TxId,
        pool: &ScratchBufferPool,
    ) -> Vec<PagePosition> {
        let (pruned, drained) = {
            let mut state = self.state.write();
            let pruned = state.table.remove_keys_where_all_pages_older_than(synced);
            let queued = std::mem::take(&mut state.unused);
            let (drained, kept): (Vec<_>, Vec<_>) =
                queued.into_iter().partition(|p| p.transaction_id <= synced);
            state.unused = kept;
            (pruned, drained)
        };

        let mut freed = Vec::new();
        for position in pruned {
            if position.is_freed_page_marker || position.unused_in_ptt {
                continue;
            }
            pool.free(position.scratch_file_number, position.position_in_scratch, reclaim_stamp);
            freed.push(position);
        }
        for position in drained {
            if position.is_freed_page_marker {
                continue;
            }
            pool.free(position.scratch_file_number, position.position_in_scratch, reclaim_stamp);
            freed.push(position);
        }
        if !freed.is_empty() {
            debug!(
                journal = self.number,
                count = freed.len(),
                synced,
                reclaim_stamp,
                "reclaimed scratch positions"
            );
        }
        freed
    }

    /// Deletes the backing file. Called by journal garbage collection once
    /// [`is_unused`](Self::is_unused) holds and everything is synced.
    pub fn delete_file(&self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            warn!(journal = self.number, %error, "could not delete spent journal file");
        } else {
            debug!(journal = self.number, "deleted spent journal file");
        }
    }
}
