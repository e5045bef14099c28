//! The storage environment: single owner of the data file, the journal
//! sequence, the scratch pool, and the committed-state pointer that every
//! transaction snapshots.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    config::EnvironmentOptions,
    error::{Error, PageId, Result, TxId},
    fileio,
    journal::{
        entry::{self, BLOCK_SIZE},
        journal_file_name,
        replay::JournalReader,
        Durability, JournalFile,
    },
    page::Page,
    ptt::{PagePosition, PageTranslationTable},
    registry::ActiveTransactionRegistry,
    scratch::ScratchBufferPool,
    transaction::{ReadTransaction, WriteTransaction},
};

/// Name of the data file inside the environment directory.
pub const DATA_FILE_NAME: &str = "data.vellum";

// Header layout on page 0: magic at the start, a selector byte whose low bit
// names the active state slot, and two 64-byte slots written alternately so a
// torn header write always leaves one valid copy behind.
const DATA_MAGIC: &[u8; 8] = b"VELLUMDB";
const GOD_BYTE_OFFSET: usize = 15;
const SLOT_OFFSETS: [u64; 2] = [64, 128];
const SLOT_LEN: usize = 64;
const SLOT_CONTENT_LEN: usize = 48;
const HEADER_VERSION: u32 = 1;

/// State recorded in the data-file header. It is everything needed to reopen
/// the environment once every journal file has been reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeaderState {
    synced_tx: TxId,
    catalog_root: PageId,
    next_page: PageId,
    journal_number: u64,
}

fn encode_slot(state: &HeaderState, page_size: usize) -> [u8; SLOT_LEN] {
    let mut slot = [0u8; SLOT_LEN];
    LittleEndian::write_u32(&mut slot[0..4], HEADER_VERSION);
    LittleEndian::write_u32(&mut slot[4..8], page_size as u32);
    LittleEndian::write_u64(&mut slot[8..16], state.synced_tx);
    LittleEndian::write_u64(&mut slot[16..24], state.catalog_root);
    LittleEndian::write_u64(&mut slot[24..32], state.next_page);
    LittleEndian::write_u64(&mut slot[32..40], state.journal_number);
    let checksum = xxh3_64(&slot[..SLOT_CONTENT_LEN]);
    LittleEndian::write_u64(&mut slot[48..56], checksum);
    slot
}

fn decode_slot(slot: &[u8]) -> Option<(HeaderState, u32)> {
    if slot.len() < SLOT_LEN {
        return None;
    }
    let stored = LittleEndian::read_u64(&slot[48..56]);
    if xxh3_64(&slot[..SLOT_CONTENT_LEN]) != stored {
        return None;
    }
    if LittleEndian::read_u32(&slot[0..4]) != HEADER_VERSION {
        return None;
    }
    let page_size = LittleEndian::read_u32(&slot[4..8]);
    let state = HeaderState {
        synced_tx: LittleEndian::read_u64(&slot[8..16]),
        catalog_root: LittleEndian::read_u64(&slot[16..24]),
        next_page: LittleEndian::read_u64(&slot[24..32]),
        journal_number: LittleEndian::read_u64(&slot[32..40]),
    };
    Some((state, page_size))
}

/// The data file plus its dual-slot header.
#[derive(Debug)]
struct DataFile {
    file: File,
    page_size: usize,
    /// Which header slot currently holds the newest state (0 or 1).
    active_slot: AtomicU8,
}

impl DataFile {
    fn create(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        let data = Self { file, page_size, active_slot: AtomicU8::new(0) };

        let initial = HeaderState { synced_tx: 0, catalog_root: 0, next_page: 1, journal_number: 1 };
        let slot = encode_slot(&initial, page_size);
        let mut header = vec![0u8; page_size];
        header[..8].copy_from_slice(DATA_MAGIC);
        header[SLOT_OFFSETS[0] as usize..SLOT_OFFSETS[0] as usize + SLOT_LEN].copy_from_slice(&slot);
        header[SLOT_OFFSETS[1] as usize..SLOT_OFFSETS[1] as usize + SLOT_LEN].copy_from_slice(&slot);
        fileio::write_all_at(&data.file, &header, 0)?;
        data.file.sync_data()?;
        Ok(data)
    }

    fn open(path: &Path, page_size: usize) -> Result<(Self, HeaderState)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() < page_size as u64 {
            return Err(Error::Corrupted { reason: "data file shorter than one page".to_string() });
        }

        let mut header = vec![0u8; page_size];
        fileio::read_exact_at(&file, &mut header, 0)?;
        if &header[..8] != DATA_MAGIC {
            return Err(Error::Corrupted { reason: "bad data file magic".to_string() });
        }

        let preferred = header[GOD_BYTE_OFFSET] & 1;
        let mut chosen = None;
        for index in [preferred, 1 - preferred] {
            let offset = SLOT_OFFSETS[index as usize] as usize;
            if let Some(decoded) = decode_slot(&header[offset..offset + SLOT_LEN]) {
                if index != preferred {
                    warn!("active header slot invalid, falling back to the alternate");
                }
                chosen = Some((index, decoded));
                break;
            }
        }
        let Some((index, (state, stored_page_size))) = chosen else {
            return Err(Error::Corrupted { reason: "both header slots invalid".to_string() });
        };
        if stored_page_size as usize != page_size {
            return Err(Error::InvalidOptions {
                reason: format!(
                    "page_size {page_size} does not match the stored page size {stored_page_size}"
                ),
            });
        }

        Ok((Self { file, page_size, active_slot: AtomicU8::new(index) }, state))
    }

    /// Reads and checksum-verifies one page.
    fn read_page(&self, id: PageId) -> Result<Page> {
        let mut data = vec![0u8; self.page_size];
        fileio::read_exact_at(&self.file, &mut data, id * self.page_size as u64).map_err(
            |err| {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::Corrupted { reason: format!("page {id} beyond data file end") }
                } else {
                    Error::from(err)
                }
            },
        )?;
        let page = Page::from_bytes(id, data);
        page.verify_checksum()?;
        Ok(page)
    }

    fn write_page_image(&self, id: PageId, bytes: &[u8]) -> Result<()> {
        fileio::write_all_at(&self.file, bytes, id * self.page_size as u64)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Dual-slot header commit: write the inactive slot, sync, flip the
    /// selector byte, sync again. A crash at any point leaves a valid header.
    fn write_state(&self, state: &HeaderState) -> Result<()> {
        let active = self.active_slot.load(Ordering::Acquire);
        let inactive = 1 - active;
        let slot = encode_slot(state, self.page_size);
        fileio::write_all_at(&self.file, &slot, SLOT_OFFSETS[inactive as usize])?;
        self.file.sync_data()?;
        fileio::write_all_at(&self.file, &[inactive], GOD_BYTE_OFFSET as u64)?;
        self.file.sync_data()?;
        self.active_slot.store(inactive, Ordering::Release);
        Ok(())
    }
}

/// Snapshot pointer swapped on every commit. Readers capture an `Arc` of
/// this and resolve every page against its transaction id.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CommittedState {
    /// Last committed transaction.
    pub tx_id: TxId,
    /// Root page of the tree-name catalog as of that commit, 0 when empty.
    pub catalog_root: PageId,
    /// Page allocation watermark as of that commit.
    pub next_page: PageId,
}

/// Everything a commit hands to the environment after the write transaction
/// finished its tree operations.
pub(crate) struct TxCommit {
    pub tx_id: TxId,
    /// Final images of every page the transaction touched, keyed by number.
    pub dirty: BTreeMap<PageId, Page>,
    /// Committed page numbers the transaction freed, sorted.
    pub freed: Vec<PageId>,
    /// Numbers allocated and freed again within the transaction.
    pub reusable: Vec<PageId>,
    pub catalog_root: PageId,
    pub next_page: PageId,
}

/// Constructor bundle shared by create and recovery.
struct AssembleParts {
    options: EnvironmentOptions,
    dir: PathBuf,
    data: DataFile,
    scratch: ScratchBufferPool,
    registry: ActiveTransactionRegistry,
    committed: CommittedState,
    synced_tx: TxId,
    journals: Vec<Arc<JournalFile>>,
    available: Vec<PageId>,
    commit_points: BTreeMap<TxId, (PageId, PageId)>,
}

/// A transactional page store: write-ahead journal, scratch-backed MVCC page
/// translation, and a data file that the flusher folds committed pages into.
///
/// One writer at a time, any number of readers. Readers never block the
/// writer and never see a partial commit.
#[derive(Debug)]
pub struct Environment {
    pub(crate) options: EnvironmentOptions,
    dir: PathBuf,
    data: DataFile,
    pub(crate) committed: ArcSwap<CommittedState>,
    pub(crate) registry: ActiveTransactionRegistry,
    pub(crate) scratch: ScratchBufferPool,
    journals: RwLock<Vec<Arc<JournalFile>>>,
    /// Serializes snapshot capture in transaction open against the flush
    /// boundary computation, closing the window where a transaction loads
    /// the committed state but has not yet appeared in the registry.
    pub(crate) txn_open_lock: Mutex<()>,
    /// Held for the lifetime of the single write transaction.
    pub(crate) write_lock: Mutex<()>,
    /// Page numbers freed by committed transactions, available for reuse.
    available_pages: Mutex<Vec<PageId>>,
    /// Numbers freed by a commit, keyed by that commit's id. They move to
    /// `available_pages` once the oldest active transaction is newer, so no
    /// pinned snapshot can observe a number being rewritten under it.
    pending_frees: Mutex<BTreeMap<TxId, Vec<PageId>>>,
    /// Catalog root and allocation watermark at each commit not yet covered
    /// by the header, so a sync landing between commits can stamp the header
    /// with the state that matches its boundary.
    commit_points: Mutex<BTreeMap<TxId, (PageId, PageId)>>,
    /// Highest transaction fully copied into the data file.
    flushed_tx: AtomicU64,
    /// Highest transaction covered by a data file sync plus header update.
    synced_tx: AtomicU64,
    /// Serializes flush passes so two passes cannot interleave writes of
    /// different boundaries into the data file.
    flush_lock: Mutex<()>,
    /// Serializes the data sync plus header slot protocol.
    sync_lock: Mutex<()>,
    flushes_running: AtomicUsize,
    syncs_running: AtomicUsize,
    last_flush_at: Mutex<Option<Instant>>,
    /// Set after a journal write failure. All further writes are refused;
    /// reopening the environment replays the journals to a consistent state.
    poisoned: AtomicBool,
    commit_count: AtomicU64,
    lazy_commit_count: AtomicU64,
    flush_pass_count: AtomicU64,
    sync_pass_count: AtomicU64,
    pages_flushed: AtomicU64,
    reclaimed_positions: AtomicU64,
    page_splits: AtomicU64,
}

impl Environment {
    /// Creates a new environment in `dir` with default options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be created or a data
    /// file already exists there.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::create_with_options(dir, EnvironmentOptions::default())
    }

    /// Creates a new environment with custom options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOptions`] if the options fail validation and
    /// [`Error::Io`] on file creation failures.
    pub fn create_with_options<P: AsRef<Path>>(
        dir: P,
        options: EnvironmentOptions,
    ) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let data = DataFile::create(&dir.join(DATA_FILE_NAME), options.page_size)?;
        let journal = Arc::new(JournalFile::create(&dir, 1, options.journal_size)?);
        let scratch = ScratchBufferPool::new(options.page_size, options.max_scratch_size);
        info!(path = %dir.display(), page_size = options.page_size, "created storage environment");
        let mut commit_points = BTreeMap::new();
        commit_points.insert(0, (0, 1));
        Ok(Self::assemble(AssembleParts {
            options,
            dir,
            data,
            scratch,
            registry: ActiveTransactionRegistry::new(),
            committed: CommittedState { tx_id: 0, catalog_root: 0, next_page: 1 },
            synced_tx: 0,
            journals: vec![journal],
            available: Vec::new(),
            commit_points,
        }))
    }

    /// Opens an existing environment, replaying any journal entries newer
    /// than the synced header state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the data file header is unreadable
    /// and [`Error::InvalidOptions`] on a page size mismatch.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open_with_options(dir, EnvironmentOptions::default())
    }

    /// Opens an existing environment with custom options.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_with_options<P: AsRef<Path>>(dir: P, options: EnvironmentOptions) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let (data, header) = DataFile::open(&dir.join(DATA_FILE_NAME), options.page_size)?;
        Self::recover(dir, data, header, options)
    }

    /// Rebuilds the in-memory state from the header and the journal files.
    ///
    /// Journals are replayed in numeric order. Entries at or below the
    /// synced boundary are validated and skipped; newer ones are written
    /// back into scratch and merged into fresh translation tables, exactly
    /// as the original commits did. Replay stops at the first invalid entry,
    /// which makes recovery deterministic for a given set of files.
    fn recover(
        dir: PathBuf,
        data: DataFile,
        header: HeaderState,
        options: EnvironmentOptions,
    ) -> Result<Self> {
        let scratch = ScratchBufferPool::new(options.page_size, options.max_scratch_size);
        let registry = ActiveTransactionRegistry::new();

        let mut numbers: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|dent| {
                let path = dent.ok()?.path();
                if path.extension()? != "journal" {
                    return None;
                }
                path.file_stem()?.to_str()?.parse().ok()
            })
            .collect();
        numbers.sort_unstable();

        let mut journals: Vec<Arc<JournalFile>> = Vec::new();
        let mut committed = CommittedState {
            tx_id: header.synced_tx,
            catalog_root: header.catalog_root,
            next_page: header.next_page,
        };
        let mut commit_points = BTreeMap::new();
        commit_points.insert(header.synced_tx, (header.catalog_root, header.next_page));
        // Final fate of every page mentioned after the synced boundary:
        // true means its newest event is a free.
        let mut final_freed: BTreeMap<PageId, bool> = BTreeMap::new();
        let mut prev_tx = 0;

        for number in &numbers {
            let path = dir.join(journal_file_name(*number));
            let file = File::open(&path)?;
            let reader = JournalReader::read(
                &file,
                options.page_size,
                header.synced_tx,
                prev_tx,
                options.prefetch_batch_size,
            )?;

            let mut table = PageTranslationTable::new();
            let mut unused = Vec::new();
            for recovered in reader.entries() {
                let mut delta =
                    Vec::with_capacity(recovered.freed.len() + recovered.pages.len());
                for page in &recovered.freed {
                    delta.push((*page, PagePosition::tombstone(recovered.tx_id, *number)));
                    final_freed.insert(*page, true);
                }
                for (page, image) in &recovered.pages {
                    let (scratch_file, slot) = scratch.allocate(&registry)?;
                    scratch.write_page(scratch_file, slot, image)?;
                    delta.push((
                        *page,
                        PagePosition::mapped(scratch_file, slot, recovered.tx_id, *number),
                    ));
                    final_freed.insert(*page, false);
                }
                unused.extend(table.apply(recovered.tx_id, &delta));
                committed = CommittedState {
                    tx_id: recovered.tx_id,
                    catalog_root: recovered.catalog_root,
                    next_page: recovered.next_page,
                };
                commit_points
                    .insert(recovered.tx_id, (recovered.catalog_root, recovered.next_page));
            }
            if reader.stopped_early() {
                warn!(number, "journal replay stopped at an invalid entry");
            }

            prev_tx = reader.last_tx_id();
            journals.push(Arc::new(JournalFile::open_existing(
                &dir,
                *number,
                table,
                unused,
                reader.next_block(),
                reader.last_tx_id(),
            )?));
        }

        // Journals that replay proved empty are deleted now; the newest one
        // always survives as the write target.
        let count = journals.len();
        let mut kept = Vec::with_capacity(count);
        for (index, journal) in journals.into_iter().enumerate() {
            if index + 1 < count && journal.is_unused() {
                journal.delete_file();
            } else {
                kept.push(journal);
            }
        }
        let mut journals = kept;
        if journals.is_empty() {
            let number = numbers.last().copied().unwrap_or(header.journal_number) + 1;
            journals.push(Arc::new(JournalFile::create(&dir, number, options.journal_size)?));
        }

        let available: Vec<PageId> = final_freed
            .iter()
            .filter_map(|(page, freed)| freed.then_some(*page))
            .collect();

        info!(
            path = %dir.display(),
            committed = committed.tx_id,
            synced = header.synced_tx,
            journals = journals.len(),
            "opened storage environment"
        );
        Ok(Self::assemble(AssembleParts {
            options,
            dir,
            data,
            scratch,
            registry,
            committed,
            synced_tx: header.synced_tx,
            journals,
            available,
            commit_points,
        }))
    }

    fn assemble(parts: AssembleParts) -> Self {
        Self {
            options: parts.options,
            dir: parts.dir,
            data: parts.data,
            committed: ArcSwap::from_pointee(parts.committed),
            registry: parts.registry,
            scratch: parts.scratch,
            journals: RwLock::new(parts.journals),
            txn_open_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            available_pages: Mutex::new(parts.available),
            pending_frees: Mutex::new(BTreeMap::new()),
            commit_points: Mutex::new(parts.commit_points),
            flushed_tx: AtomicU64::new(parts.synced_tx),
            synced_tx: AtomicU64::new(parts.synced_tx),
            flush_lock: Mutex::new(()),
            sync_lock: Mutex::new(()),
            flushes_running: AtomicUsize::new(0),
            syncs_running: AtomicUsize::new(0),
            last_flush_at: Mutex::new(None),
            poisoned: AtomicBool::new(false),
            commit_count: AtomicU64::new(0),
            lazy_commit_count: AtomicU64::new(0),
            flush_pass_count: AtomicU64::new(0),
            sync_pass_count: AtomicU64::new(0),
            pages_flushed: AtomicU64::new(0),
            reclaimed_positions: AtomicU64::new(0),
            page_splits: AtomicU64::new(0),
        }
    }

    /// Opens a read transaction pinned to the current committed state.
    ///
    /// # Errors
    ///
    /// Currently infallible in practice; the `Result` mirrors the write
    /// path so callers handle both uniformly.
    pub fn read(&self) -> Result<ReadTransaction<'_>> {
        ReadTransaction::open(self)
    }

    /// Opens the single write transaction, waiting up to the configured
    /// `write_lock_timeout` for a previous writer to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteTimeout`] if the lock is not acquired in time
    /// and [`Error::Poisoned`] after an earlier journal write failure.
    pub fn write(&self) -> Result<WriteTransaction<'_>> {
        WriteTransaction::open(self, self.options.write_lock_timeout)
    }

    /// Like [`write`](Self::write) with an explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn write_with_timeout(&self, timeout: Duration) -> Result<WriteTransaction<'_>> {
        WriteTransaction::open(self, timeout)
    }

    /// Whether writes are refused because of an earlier journal failure.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// The options this environment was opened with.
    pub fn options(&self) -> &EnvironmentOptions {
        &self.options
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub(crate) fn record_page_splits(&self, count: u64) {
        if count > 0 {
            self.page_splits.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Pops a reusable page number, if any.
    pub(crate) fn allocate_page_number(&self) -> Option<PageId> {
        self.available_pages.lock().pop()
    }

    /// Returns unused page numbers to the pool.
    pub(crate) fn return_page_numbers(&self, pages: &[PageId]) {
        if !pages.is_empty() {
            self.available_pages.lock().extend_from_slice(pages);
        }
    }

    /// Moves pending frees whose freeing commit every active transaction is
    /// newer than into the allocation pool. Runs after each commit and when
    /// a read transaction closes.
    pub(crate) fn release_pending_frees(&self) {
        let limit = match self.registry.oldest() {
            Some(oldest) => oldest,
            None => self.committed.load().tx_id + 1,
        };
        let mut released = Vec::new();
        {
            let mut pending = self.pending_frees.lock();
            while let Some(entry) = pending.first_entry() {
                if *entry.key() >= limit {
                    break;
                }
                released.extend(entry.remove());
            }
        }
        self.return_page_numbers(&released);
    }

    /// Resolves a page as seen by `snapshot`: the newest journal mapping at
    /// or below the snapshot wins, a tombstone falls through to the data
    /// file, and a page with no journal presence comes from the data file.
    pub(crate) fn read_page_at(&self, snapshot: TxId, page: PageId) -> Result<Page> {
        {
            let journals = self.journals.read();
            for journal in journals.iter().rev() {
                if let Some(position) = journal.resolve(snapshot, page) {
                    if position.is_freed_page_marker {
                        break;
                    }
                    return self.scratch.read_page(&position, page);
                }
            }
        }
        self.data.read_page(page)
    }

    /// Applies one commit: stages dirty pages in scratch, seals and writes
    /// the journal entry, publishes the new committed state, and queues
    /// freed page numbers for reuse.
    ///
    /// The caller holds the write lock. A failure before the journal write
    /// leaves the environment untouched; a failure during it poisons the
    /// environment.
    pub(crate) fn commit_write(&self, commit: TxCommit, durability: Durability) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::Poisoned);
        }
        if commit.dirty.is_empty() && commit.freed.is_empty() {
            self.return_page_numbers(&commit.reusable);
            return Ok(());
        }

        let tx_id = commit.tx_id;
        let mut images: Vec<(PageId, Vec<u8>)> = Vec::with_capacity(commit.dirty.len());
        let mut positions: Vec<(PageId, u32, u64)> = Vec::with_capacity(commit.dirty.len());
        let mut staged: Vec<(u32, u64)> = Vec::with_capacity(commit.dirty.len());

        for (page_id, mut page) in commit.dirty {
            page.set_txn_id(tx_id);
            page.update_checksum();
            let (scratch_file, slot) = match self.scratch.allocate(&self.registry) {
                Ok(pair) => pair,
                Err(err) => {
                    self.release_staged(&staged);
                    return Err(err);
                }
            };
            if let Err(err) = self.scratch.write_page(scratch_file, slot, &page.data) {
                self.scratch.free(scratch_file, slot, 0);
                self.release_staged(&staged);
                return Err(err);
            }
            staged.push((scratch_file, slot));
            positions.push((page_id, scratch_file, slot));
            images.push((page_id, page.data));
        }

        let sealed = match entry::seal(
            tx_id,
            &images,
            &commit.freed,
            commit.catalog_root,
            commit.next_page,
            self.options.compress_above,
        ) {
            Ok(sealed) => sealed,
            Err(err) => {
                self.release_staged(&staged);
                return Err(err);
            }
        };
        drop(images);

        let journal = match self.current_journal_for(sealed.blocks()) {
            Ok(journal) => journal,
            Err(err) => {
                self.release_staged(&staged);
                return Err(err);
            }
        };
        if let Err(err) = journal.write(&sealed, &positions, &commit.freed, durability, &self.options)
        {
            self.poison();
            self.release_staged(&staged);
            error!(tx_id, %err, "journal write failed, poisoning the environment");
            return Err(err);
        }

        self.committed.store(Arc::new(CommittedState {
            tx_id,
            catalog_root: commit.catalog_root,
            next_page: commit.next_page,
        }));
        self.commit_points.lock().insert(tx_id, (commit.catalog_root, commit.next_page));
        if !commit.freed.is_empty() {
            self.pending_frees.lock().insert(tx_id, commit.freed);
        }
        self.return_page_numbers(&commit.reusable);
        self.release_pending_frees();
        self.commit_count.fetch_add(1, Ordering::Relaxed);
        if durability == Durability::Lazy {
            self.lazy_commit_count.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(err) = self.maybe_flush_and_sync() {
            warn!(%err, "post-commit flush failed, will retry on the next commit");
        }
        Ok(())
    }

    fn release_staged(&self, staged: &[(u32, u64)]) {
        for (scratch_file, slot) in staged {
            self.scratch.free(*scratch_file, *slot, 0);
        }
    }

    /// Returns the journal the next entry goes into, rotating to a fresh
    /// file when the current one cannot hold `blocks` more blocks. Rotation
    /// seals the old file by flushing its lazy buffer.
    fn current_journal_for(&self, blocks: u64) -> Result<Arc<JournalFile>> {
        let mut journals = self.journals.write();
        if let Some(current) = journals.last() {
            if current.has_capacity_for(blocks) {
                return Ok(Arc::clone(current));
            }
            if let Err(err) = current.flush_lazy() {
                self.poison();
                error!(%err, "lazy flush during rotation failed, poisoning the environment");
                return Err(err);
            }
        }
        let number = journals.last().map_or(1, |current| current.number() + 1);
        let size = self.options.journal_size.max(blocks * BLOCK_SIZE as u64);
        let journal = Arc::new(JournalFile::create(&self.dir, number, size)?);
        debug!(number, "rotated to a new journal file");
        journals.push(Arc::clone(&journal));
        Ok(journal)
    }

    /// Highest transaction whose effects may be copied into the data file:
    /// nothing above the last commit, nothing a live snapshot still needs,
    /// and nothing whose journal bytes are not yet durable.
    fn flush_boundary(&self) -> TxId {
        let _open = self.txn_open_lock.lock();
        let committed = self.committed.load().tx_id;
        let durable = {
            let journals = self.journals.read();
            journals.iter().map(|journal| journal.durable_transaction_id()).max().unwrap_or(0)
        };
        let mut boundary = committed.min(durable);
        if let Some(oldest) = self.registry.oldest() {
            boundary = boundary.min(oldest.saturating_sub(1));
        }
        boundary
    }

    fn maybe_flush_and_sync(&self) -> Result<()> {
        self.flush_once()?;
        self.sync_pass(false)
    }

    /// Runs one flush pass unless another is already running.
    fn flush_once(&self) -> Result<u64> {
        if self.flushes_running.fetch_add(1, Ordering::AcqRel) >= self.options.max_concurrent_flushes
        {
            self.flushes_running.fetch_sub(1, Ordering::AcqRel);
            return Ok(0);
        }
        let outcome = self.flush_pass();
        self.flushes_running.fetch_sub(1, Ordering::AcqRel);
        outcome
    }

    /// Copies the newest surviving page version at or below the flush
    /// boundary from scratch into the data file, in batches, with a
    /// periodic sync so a large pass does not pile up dirty pages.
    fn flush_pass(&self) -> Result<u64> {
        let _flush = self.flush_lock.lock();
        let boundary = self.flush_boundary();
        if boundary <= self.flushed_tx.load(Ordering::Acquire) {
            return Ok(0);
        }

        let journals: Vec<Arc<JournalFile>> = self.journals.read().clone();
        let mut targets: BTreeMap<PageId, PagePosition> = BTreeMap::new();
        for journal in &journals {
            // Ascending journal order, so later files override earlier ones.
            for (page, position) in journal.latest_visible(boundary) {
                targets.insert(page, position);
            }
        }

        let batch = self.options.prefetch_batch_size;
        let sync_every = self.options.prefetch_reset_threshold.max(1);
        let entries: Vec<(PageId, PagePosition)> = targets.into_iter().collect();
        let mut written = 0u64;
        let mut batches = 0usize;
        for chunk in entries.chunks(batch) {
            for (page, position) in chunk {
                let image = self.scratch.read_page(position, *page)?;
                self.data.write_page_image(*page, &image.data)?;
                written += 1;
            }
            batches += 1;
            if batches % sync_every == 0 {
                self.data.sync()?;
            }
        }

        self.flushed_tx.store(boundary, Ordering::Release);
        *self.last_flush_at.lock() = Some(Instant::now());
        self.flush_pass_count.fetch_add(1, Ordering::Relaxed);
        self.pages_flushed.fetch_add(written, Ordering::Relaxed);
        debug!(boundary, pages = written, "flush pass complete");
        Ok(written)
    }

    /// Hardens the last flush: syncs the data file, persists the header for
    /// the flushed boundary, then reclaims scratch space and spent journals.
    /// Unless forced, runs only after `time_to_sync_after_flush` has passed
    /// since the flush, letting several flushes share one sync.
    fn sync_pass(&self, force: bool) -> Result<()> {
        if self.syncs_running.fetch_add(1, Ordering::AcqRel)
            >= self.options.concurrent_syncs_per_drive
        {
            self.syncs_running.fetch_sub(1, Ordering::AcqRel);
            return Ok(());
        }
        let outcome = self.sync_inner(force);
        self.syncs_running.fetch_sub(1, Ordering::AcqRel);
        outcome
    }

    fn sync_inner(&self, force: bool) -> Result<()> {
        let _sync = self.sync_lock.lock();
        let flushed = self.flushed_tx.load(Ordering::Acquire);
        if flushed <= self.synced_tx.load(Ordering::Acquire) {
            return Ok(());
        }
        if !force {
            let recent_enough = self
                .last_flush_at
                .lock()
                .is_some_and(|at| at.elapsed() >= self.options.time_to_sync_after_flush);
            if !recent_enough {
                return Ok(());
            }
        }

        self.data.sync()?;
        let (catalog_root, next_page) = self.roots_at(flushed);
        let journal_number = self.journals.read().last().map_or(1, |journal| journal.number());
        self.data.write_state(&HeaderState {
            synced_tx: flushed,
            catalog_root,
            next_page,
            journal_number,
        })?;
        self.synced_tx.store(flushed, Ordering::Release);
        self.sync_pass_count.fetch_add(1, Ordering::Relaxed);
        debug!(synced = flushed, "sync pass complete");

        self.reclaim(flushed);
        Ok(())
    }

    /// Catalog root and allocation watermark as of the newest commit at or
    /// below `boundary`.
    fn roots_at(&self, boundary: TxId) -> (PageId, PageId) {
        let points = self.commit_points.lock();
        points
            .range(..=boundary)
            .next_back()
            .map(|(_, roots)| *roots)
            .unwrap_or_else(|| {
                let state = self.committed.load();
                (state.catalog_root, state.next_page)
            })
    }

    /// Frees scratch positions no snapshot can reach anymore and deletes
    /// journal files with nothing left in them.
    fn reclaim(&self, synced: TxId) {
        let reclaim_stamp = self.committed.load().tx_id + 1;
        let journals: Vec<Arc<JournalFile>> = self.journals.read().clone();
        let mut freed = 0u64;
        for journal in &journals {
            freed += journal.free_scratch_pages_older_than(reclaim_stamp, synced, &self.scratch).len()
                as u64;
        }
        self.reclaimed_positions.fetch_add(freed, Ordering::Relaxed);

        {
            let mut points = self.commit_points.lock();
            if let Some(keep) = points.range(..=synced).next_back().map(|(tx, _)| *tx) {
                let newer = points.split_off(&keep);
                *points = newer;
            }
        }

        let mut journals = self.journals.write();
        let count = journals.len();
        let mut kept = Vec::with_capacity(count);
        for (index, journal) in journals.drain(..).enumerate() {
            if index + 1 < count && journal.is_unused() {
                journal.delete_file();
            } else {
                kept.push(journal);
            }
        }
        *journals = kept;
    }

    /// Forces full durability: flushes lazy journal buffers, copies every
    /// eligible committed page into the data file, syncs it, and persists
    /// the header.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures. A lazy-buffer flush failure poisons the
    /// environment, like any journal write failure.
    pub fn sync(&self) -> Result<()> {
        let journals: Vec<Arc<JournalFile>> = self.journals.read().clone();
        for journal in &journals {
            if let Err(err) = journal.flush_lazy() {
                self.poison();
                error!(%err, "lazy flush failed, poisoning the environment");
                return Err(err);
            }
        }
        self.flush_once()?;
        self.sync_pass(true)
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> EnvironmentStats {
        let state = self.committed.load();
        EnvironmentStats {
            page_size: self.options.page_size,
            committed_transaction: state.tx_id,
            flushed_transaction: self.flushed_tx.load(Ordering::Acquire),
            synced_transaction: self.synced_tx.load(Ordering::Acquire),
            next_page: state.next_page,
            active_transactions: self.registry.active_count(),
            journal_files: self.journals.read().len(),
            free_page_numbers: self.available_pages.lock().len(),
            pending_free_numbers: self.pending_frees.lock().values().map(Vec::len).sum(),
            scratch_allocated_slots: self.scratch.allocated_slots(),
            scratch_free_slots: self.scratch.free_slot_count(),
            commits: self.commit_count.load(Ordering::Relaxed),
            lazy_commits: self.lazy_commit_count.load(Ordering::Relaxed),
            flush_passes: self.flush_pass_count.load(Ordering::Relaxed),
            sync_passes: self.sync_pass_count.load(Ordering::Relaxed),
            pages_flushed: self.pages_flushed.load(Ordering::Relaxed),
            reclaimed_positions: self.reclaimed_positions.load(Ordering::Relaxed),
            page_splits: self.page_splits.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.poisoned.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.sync() {
            warn!(%err, "final sync on close failed, journals will replay on reopen");
        }
    }
}

/// Point-in-time environment statistics.
#[derive(Debug, Clone)]
pub struct EnvironmentStats {
    /// Page size in bytes.
    pub page_size: usize,
    /// Last committed transaction id.
    pub committed_transaction: TxId,
    /// Highest transaction fully copied into the data file.
    pub flushed_transaction: TxId,
    /// Highest transaction covered by a sync plus header update.
    pub synced_transaction: TxId,
    /// Page allocation watermark.
    pub next_page: PageId,
    /// Currently registered transactions.
    pub active_transactions: usize,
    /// Journal files on disk.
    pub journal_files: usize,
    /// Freed page numbers available for reuse.
    pub free_page_numbers: usize,
    /// Freed numbers still held back by an active transaction.
    pub pending_free_numbers: usize,
    /// Scratch slots handed out since the environment opened.
    pub scratch_allocated_slots: u64,
    /// Scratch slots currently free for reuse.
    pub scratch_free_slots: usize,
    /// Commits since the environment opened.
    pub commits: u64,
    /// Commits that used lazy durability.
    pub lazy_commits: u64,
    /// Flush passes that copied pages into the data file.
    pub flush_passes: u64,
    /// Sync passes that advanced the durable header.
    pub sync_passes: u64,
    /// Pages copied into the data file.
    pub pages_flushed: u64,
    /// Scratch positions reclaimed.
    pub reclaimed_positions: u64,
    /// B+ tree page splits.
    pub page_splits: u64,
}

#[cfg(test)]
mod tests {
    use std::mem;

    use tempfile::tempdir;

    use super::*;
    use crate::{error::PageType, page::PAGE_HEADER_SIZE};

    fn raw_page(page_size: usize, id: PageId, fill: u8) -> Page {
        let mut page = Page::new(id, page_size, PageType::Raw, 0);
        page.data[PAGE_HEADER_SIZE..].fill(fill);
        page
    }

    fn commit_page(env: &Environment, tx: TxId, id: PageId, fill: u8, durability: Durability) {
        let mut dirty = BTreeMap::new();
        dirty.insert(id, raw_page(env.options().page_size, id, fill));
        env.commit_write(
            TxCommit {
                tx_id: tx,
                dirty,
                freed: Vec::new(),
                reusable: Vec::new(),
                catalog_root: 0,
                next_page: id + 1,
            },
            durability,
        )
        .unwrap();
    }

    fn content_byte(page: &Page) -> u8 {
        page.data[PAGE_HEADER_SIZE]
    }

    #[test]
    fn test_header_slot_roundtrip() {
        let state = HeaderState { synced_tx: 42, catalog_root: 7, next_page: 100, journal_number: 3 };
        let slot = encode_slot(&state, 4096);
        let (decoded, page_size) = decode_slot(&slot).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(page_size, 4096);
    }

    #[test]
    fn test_header_slot_rejects_corruption() {
        let state = HeaderState { synced_tx: 42, catalog_root: 7, next_page: 100, journal_number: 3 };
        let mut slot = encode_slot(&state, 4096);
        slot[10] ^= 0xFF;
        assert!(decode_slot(&slot).is_none());
    }

    #[test]
    fn test_create_then_open_preserves_state() {
        let dir = tempdir().unwrap();
        drop(Environment::create(dir.path()).unwrap());

        let env = Environment::open(dir.path()).unwrap();
        let stats = env.stats();
        assert_eq!(stats.committed_transaction, 0);
        assert_eq!(stats.next_page, 1);
        assert_eq!(stats.journal_files, 1);
    }

    #[test]
    fn test_create_refuses_existing_environment() {
        let dir = tempdir().unwrap();
        let _env = Environment::create(dir.path()).unwrap();
        assert!(matches!(Environment::create(dir.path()), Err(Error::Io { .. })));
    }

    #[test]
    fn test_commit_then_crash_replays_journal() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        commit_page(&env, 1, 3, 0xAB, Durability::Safe);
        mem::forget(env);

        let env = Environment::open(dir.path()).unwrap();
        assert_eq!(env.stats().committed_transaction, 1);
        let page = env.read_page_at(1, 3).unwrap();
        assert_eq!(content_byte(&page), 0xAB);
    }

    #[test]
    fn test_replay_tolerates_garbage_tail() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        commit_page(&env, 1, 3, 0xAB, Durability::Safe);
        mem::forget(env);

        // One 4KB page entry occupies two blocks; scribble after it.
        let path = dir.path().join(journal_file_name(1));
        let file = OpenOptions::new().write(true).open(path).unwrap();
        fileio::write_all_at(&file, &[0xFF; 64], 2 * BLOCK_SIZE as u64).unwrap();

        let env = Environment::open(dir.path()).unwrap();
        assert_eq!(env.stats().committed_transaction, 1);
        assert_eq!(content_byte(&env.read_page_at(1, 3).unwrap()), 0xAB);
    }

    #[test]
    fn test_writes_resume_after_recovery() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        commit_page(&env, 1, 3, 0xAB, Durability::Safe);
        mem::forget(env);

        let env = Environment::open(dir.path()).unwrap();
        commit_page(&env, 2, 3, 0xCD, Durability::Safe);
        assert_eq!(content_byte(&env.read_page_at(2, 3).unwrap()), 0xCD);
        assert_eq!(content_byte(&env.read_page_at(1, 3).unwrap()), 0xAB);
    }

    #[test]
    fn test_flush_boundary_respects_active_reader() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        commit_page(&env, 1, 3, 0xAB, Durability::Safe);
        assert_eq!(env.flush_boundary(), 1);

        let handle = env.registry.add(1);
        assert_eq!(env.flush_boundary(), 0);
        assert!(env.registry.try_remove(1, handle));
        assert_eq!(env.flush_boundary(), 1);
    }

    #[test]
    fn test_lazy_commit_defers_the_flush_boundary() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        commit_page(&env, 1, 3, 0xAB, Durability::Lazy);
        assert_eq!(env.flush_boundary(), 0);
        assert_eq!(env.stats().lazy_commits, 1);

        env.sync().unwrap();
        assert_eq!(env.stats().synced_transaction, 1);
    }

    #[test]
    fn test_sync_moves_pages_to_data_file_and_reclaims() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        commit_page(&env, 1, 5, 0xAA, Durability::Safe);
        commit_page(&env, 2, 5, 0xBB, Durability::Safe);

        env.sync().unwrap();
        let stats = env.stats();
        assert_eq!(stats.synced_transaction, 2);
        assert_eq!(stats.scratch_free_slots, 2);
        assert_eq!(stats.journal_files, 1);

        // Both versions reclaimed: the read now comes from the data file.
        assert_eq!(content_byte(&env.read_page_at(2, 5).unwrap()), 0xBB);

        drop(env);
        let env = Environment::open(dir.path()).unwrap();
        assert_eq!(env.stats().committed_transaction, 2);
        assert_eq!(content_byte(&env.read_page_at(2, 5).unwrap()), 0xBB);
    }

    #[test]
    fn test_empty_commit_is_a_no_op() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        env.commit_write(
            TxCommit {
                tx_id: 1,
                dirty: BTreeMap::new(),
                freed: Vec::new(),
                reusable: vec![9],
                catalog_root: 0,
                next_page: 1,
            },
            Durability::Safe,
        )
        .unwrap();

        let stats = env.stats();
        assert_eq!(stats.committed_transaction, 0);
        assert_eq!(stats.commits, 0);
        assert_eq!(env.allocate_page_number(), Some(9));
    }

    #[test]
    fn test_journal_rotation_under_small_journal() {
        let dir = tempdir().unwrap();
        let options = EnvironmentOptions::builder().journal_size(16384).build();
        let env = Environment::create_with_options(dir.path(), options).unwrap();

        // Each single-page entry takes two of the four blocks.
        commit_page(&env, 1, 3, 1, Durability::Safe);
        commit_page(&env, 2, 4, 2, Durability::Safe);
        assert_eq!(env.stats().journal_files, 1);

        commit_page(&env, 3, 5, 3, Durability::Safe);
        assert_eq!(env.stats().journal_files, 2);
        assert_eq!(content_byte(&env.read_page_at(3, 3).unwrap()), 1);
        assert_eq!(content_byte(&env.read_page_at(3, 5).unwrap()), 3);
    }

    #[test]
    fn test_page_size_mismatch_rejected() {
        let dir = tempdir().unwrap();
        drop(Environment::create(dir.path()).unwrap());

        let options = EnvironmentOptions::builder().page_size(8192).build();
        assert!(matches!(
            Environment::open_with_options(dir.path(), options),
            Err(Error::InvalidOptions { .. })
        ));
    }

    #[test]
    fn test_corrupt_active_header_slot_falls_back() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        commit_page(&env, 1, 3, 0xAB, Durability::Safe);
        env.sync().unwrap();
        mem::forget(env);

        // The sync flipped to slot 1; zero it so open must fall back to
        // slot 0 and replay the journal from the start.
        let path = dir.path().join(DATA_FILE_NAME);
        let file = OpenOptions::new().write(true).open(path).unwrap();
        fileio::write_all_at(&file, &[0u8; SLOT_LEN], SLOT_OFFSETS[1]).unwrap();

        let env = Environment::open(dir.path()).unwrap();
        assert_eq!(env.stats().committed_transaction, 1);
        assert_eq!(content_byte(&env.read_page_at(1, 3).unwrap()), 0xAB);
    }

    #[test]
    fn test_freed_pages_tombstone_and_recycle() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        commit_page(&env, 1, 3, 0xAB, Durability::Safe);
        env.commit_write(
            TxCommit {
                tx_id: 2,
                dirty: BTreeMap::new(),
                freed: vec![3],
                reusable: Vec::new(),
                catalog_root: 0,
                next_page: 4,
            },
            Durability::Safe,
        )
        .unwrap();

        // A snapshot before the free still resolves the page through the
        // translation table, and the freed number is recyclable.
        assert_eq!(content_byte(&env.read_page_at(1, 3).unwrap()), 0xAB);
        assert_eq!(env.allocate_page_number(), Some(3));
    }

    #[test]
    fn test_pending_frees_wait_for_older_transactions() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        commit_page(&env, 1, 3, 0xAB, Durability::Safe);

        let handle = env.registry.add(1);
        env.commit_write(
            TxCommit {
                tx_id: 2,
                dirty: BTreeMap::new(),
                freed: vec![3],
                reusable: Vec::new(),
                catalog_root: 0,
                next_page: 4,
            },
            Durability::Safe,
        )
        .unwrap();

        // The snapshot at 1 may still reach page 3, so its number stays out
        // of the pool until that transaction closes.
        assert_eq!(env.allocate_page_number(), None);
        assert_eq!(env.stats().pending_free_numbers, 1);

        assert!(env.registry.try_remove(1, handle));
        env.release_pending_frees();
        assert_eq!(env.allocate_page_number(), Some(3));
        assert_eq!(env.stats().pending_free_numbers, 0);
    }

    #[test]
    fn test_recovery_rebuilds_free_pool() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        commit_page(&env, 1, 3, 0xAB, Durability::Safe);
        env.commit_write(
            TxCommit {
                tx_id: 2,
                dirty: BTreeMap::new(),
                freed: vec![3],
                reusable: Vec::new(),
                catalog_root: 0,
                next_page: 4,
            },
            Durability::Safe,
        )
        .unwrap();
        mem::forget(env);

        let env = Environment::open(dir.path()).unwrap();
        assert_eq!(env.allocate_page_number(), Some(3));
    }
}
