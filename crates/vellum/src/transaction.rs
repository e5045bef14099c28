//! Read and write transactions over the storage environment.
//!
//! A read transaction pins the committed state it was opened against in the
//! active-transaction registry and resolves every page as of that snapshot,
//! so concurrent commits never show through. The single write transaction
//! buffers all page modifications privately and publishes them as one
//! journal entry at commit.
//!
//! Named trees live in a catalog tree whose root travels with the committed
//! state. A transaction therefore sees the tree set of its snapshot, and a
//! write transaction folds any roots it changed back into the catalog as
//! part of its own commit.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap},
    mem,
    time::Duration,
};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::MutexGuard;
use tracing::warn;

use crate::{
    btree::{BTree, PageProvider},
    env::{Environment, TxCommit},
    error::{Error, PageId, PageType, Result, TxId},
    journal::Durability,
    page::Page,
    registry::SlotHandle,
};

/// Decodes a catalog value into a tree root.
fn decode_tree_root(name: &str, value: Option<Vec<u8>>) -> Result<Option<PageId>> {
    match value {
        None => Ok(None),
        Some(bytes) if bytes.len() == 8 => Ok(Some(LittleEndian::read_u64(&bytes))),
        Some(bytes) => Err(Error::Corrupted {
            reason: format!("catalog entry for {name} has length {}", bytes.len()),
        }),
    }
}

/// A read-only transaction.
///
/// Holds a consistent snapshot of the environment. No locks are held while
/// it lives; it occupies one registry slot, which is what keeps page
/// versions and freed page numbers it might reach from being reclaimed.
pub struct ReadTransaction<'env> {
    env: &'env Environment,
    /// Committed transaction this snapshot observes.
    snapshot: TxId,
    /// Catalog root as of the snapshot.
    catalog_root: PageId,
    /// Registry slot pinning the snapshot.
    handle: SlotHandle,
    /// Pages read so far, so repeated lookups do not re-resolve them.
    page_cache: RefCell<HashMap<PageId, Page>>,
}

impl<'env> ReadTransaction<'env> {
    pub(crate) fn open(env: &'env Environment) -> Result<Self> {
        // Loading the committed state and registering for it must not
        // interleave with the flush boundary computation, or a freshly
        // captured snapshot could be reclaimed before it registers.
        let (snapshot, catalog_root, handle) = {
            let _open = env.txn_open_lock.lock();
            let state = env.committed.load();
            (state.tx_id, state.catalog_root, env.registry.add(state.tx_id))
        };
        Ok(Self { env, snapshot, catalog_root, handle, page_cache: RefCell::new(HashMap::new()) })
    }

    /// The committed transaction id this snapshot observes.
    pub fn snapshot(&self) -> TxId {
        self.snapshot
    }

    /// Opens a named tree for reading.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TreeNotFound`] when no tree with that name existed
    /// at this snapshot.
    pub fn tree(&self, name: &str) -> Result<TreeReader<'_, 'env>> {
        let root = self
            .lookup_root(name)?
            .ok_or_else(|| Error::TreeNotFound { name: name.to_string() })?;
        Ok(TreeReader { txn: self, root })
    }

    fn lookup_root(&self, name: &str) -> Result<Option<PageId>> {
        if self.catalog_root == 0 {
            return Ok(None);
        }
        let provider = CachingReadPageProvider {
            env: self.env,
            snapshot: self.snapshot,
            page_cache: &self.page_cache,
        };
        let catalog = BTree::new(self.catalog_root, provider);
        decode_tree_root(name, catalog.get(name.as_bytes())?)
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        if !self.env.registry.try_remove(self.snapshot, self.handle) {
            warn!(snapshot = self.snapshot, "read transaction slot already released");
        }
        self.env.release_pending_frees();
    }
}

/// Accessor for one named tree inside a read transaction.
pub struct TreeReader<'txn, 'env> {
    txn: &'txn ReadTransaction<'env>,
    root: PageId,
}

impl TreeReader<'_, '_> {
    /// Looks up a key, materializing overflow values.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails during the lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let provider = CachingReadPageProvider {
            env: self.txn.env,
            snapshot: self.txn.snapshot,
            page_cache: &self.txn.page_cache,
        };
        BTree::new(self.root, provider).get(key)
    }

    /// Whether the tree held no entries at this snapshot.
    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    /// Tree height at this snapshot: 0 for empty, 1 when the root is a leaf.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails while walking down.
    pub fn depth(&self) -> Result<u32> {
        let provider = CachingReadPageProvider {
            env: self.txn.env,
            snapshot: self.txn.snapshot,
            page_cache: &self.txn.page_cache,
        };
        BTree::new(self.root, provider).depth()
    }
}

/// Root bookkeeping for one tree touched by a write transaction.
#[derive(Debug)]
struct TreeState {
    /// Current root, moved by splits and deletions.
    root: PageId,
    /// Root recorded in the catalog when the tree was first opened, `None`
    /// when the name was not there yet.
    stored: Option<PageId>,
}

/// Page-number bookkeeping for a write transaction.
///
/// Distinguishes numbers this transaction brought into existence (at or
/// above the starting watermark, or taken from the environment's free pool)
/// from numbers that belong to committed pages. Only the latter need a
/// tombstone and the deferred-reuse ledger when freed; transaction-local
/// numbers recycle immediately.
#[derive(Debug)]
struct PageAllocation {
    /// Allocation watermark, starts at the snapshot's value.
    next_page: PageId,
    /// Watermark at transaction start; numbers at or above it are local.
    base_next_page: PageId,
    /// Local numbers freed again, handed out first on the next allocation.
    reusable: Vec<PageId>,
    /// Numbers taken from the environment's free pool.
    acquired: BTreeSet<PageId>,
    /// Committed numbers freed by this transaction.
    freed: BTreeSet<PageId>,
}

impl PageAllocation {
    fn new(next_page: PageId) -> Self {
        Self {
            next_page,
            base_next_page: next_page,
            reusable: Vec::new(),
            acquired: BTreeSet::new(),
            freed: BTreeSet::new(),
        }
    }

    fn take_number(&mut self, env: &Environment) -> PageId {
        if let Some(id) = self.reusable.pop() {
            return id;
        }
        if let Some(id) = env.allocate_page_number() {
            self.acquired.insert(id);
            return id;
        }
        let id = self.next_page;
        self.next_page += 1;
        id
    }

    fn release_number(&mut self, id: PageId) {
        if id >= self.base_next_page || self.acquired.contains(&id) {
            self.reusable.push(id);
        } else {
            self.freed.insert(id);
        }
    }
}

/// A write transaction.
///
/// Changes are buffered until commit. On commit they become one sealed
/// journal entry, and the committed-state pointer swap makes them visible
/// to transactions opened afterwards. Read transactions run concurrently
/// throughout; they keep seeing their own snapshot.
///
/// # Invariants
///
/// **Lock ordering:** the environment write lock is acquired first and held
/// in `_write_guard` for the transaction's lifetime, so at most one write
/// transaction exists. Registration happens under the transaction-open
/// lock, taken after the write lock. Every other lock is confined to
/// individual environment calls.
///
/// **Dirty page lifecycle:**
/// 1. Tree operations buffer modified page images in `dirty`, keyed by
///    number; freed committed numbers collect in the allocation state.
/// 2. `commit()` folds changed tree roots into the catalog, stamps and
///    stages the buffered images in scratch, and writes one journal entry
///    covering the images, the frees, the catalog root, and the watermark.
/// 3. The committed-state swap publishes the transaction. Freed numbers
///    wait in the pending-free ledger until no active transaction is old
///    enough to reach them.
///
/// **Drop behavior:** dropping without commit discards the buffer, returns
/// pool-acquired numbers, and unregisters the transaction. Nothing of it
/// becomes visible.
#[derive(Debug)]
pub struct WriteTransaction<'env> {
    env: &'env Environment,
    /// This transaction's id, one past the snapshot it builds on.
    id: TxId,
    /// Committed transaction visible to reads inside this transaction.
    snapshot: TxId,
    /// Catalog root as of the snapshot.
    catalog_root: PageId,
    /// Trees opened by this transaction, keyed by name.
    trees: BTreeMap<String, TreeState>,
    /// Buffered page images, invisible to other transactions until commit.
    dirty: BTreeMap<PageId, Page>,
    allocation: PageAllocation,
    handle: SlotHandle,
    committed: bool,
    _write_guard: MutexGuard<'env, ()>,
}

impl<'env> WriteTransaction<'env> {
    pub(crate) fn open(env: &'env Environment, timeout: Duration) -> Result<Self> {
        if env.is_poisoned() {
            return Err(Error::Poisoned);
        }
        let guard = env
            .write_lock
            .try_lock_for(timeout)
            .ok_or(Error::WriteTimeout { timeout })?;
        let (id, snapshot, catalog_root, next_page, handle) = {
            let _open = env.txn_open_lock.lock();
            let state = env.committed.load();
            // Registering the writer's own id keeps the reclamation boundary
            // at or below its snapshot for as long as it runs.
            let id = state.tx_id + 1;
            (id, state.tx_id, state.catalog_root, state.next_page, env.registry.add(id))
        };
        Ok(Self {
            env,
            id,
            snapshot,
            catalog_root,
            trees: BTreeMap::new(),
            dirty: BTreeMap::new(),
            allocation: PageAllocation::new(next_page),
            handle,
            committed: false,
            _write_guard: guard,
        })
    }

    /// This transaction's id; it becomes the committed id on commit.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Opens a named tree, creating an empty one if the name is new.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog lookup fails.
    pub fn create_tree(&mut self, name: &str) -> Result<Tree<'_, 'env>> {
        self.load_tree(name, true)?;
        Ok(Tree { txn: self, name: name.to_string() })
    }

    /// Opens an existing named tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TreeNotFound`] when the name is unknown.
    pub fn open_tree(&mut self, name: &str) -> Result<Tree<'_, 'env>> {
        self.load_tree(name, false)?;
        Ok(Tree { txn: self, name: name.to_string() })
    }

    fn load_tree(&mut self, name: &str, create: bool) -> Result<()> {
        if self.trees.contains_key(name) {
            return Ok(());
        }
        let stored = self.lookup_root(name)?;
        match stored {
            Some(root) => {
                self.trees.insert(name.to_string(), TreeState { root, stored: Some(root) });
                Ok(())
            },
            None if create => {
                self.trees.insert(name.to_string(), TreeState { root: 0, stored: None });
                Ok(())
            },
            None => Err(Error::TreeNotFound { name: name.to_string() }),
        }
    }

    fn lookup_root(&self, name: &str) -> Result<Option<PageId>> {
        if self.catalog_root == 0 {
            return Ok(None);
        }
        let provider = BufferedReadPageProvider {
            env: self.env,
            snapshot: self.snapshot,
            dirty: &self.dirty,
        };
        let catalog = BTree::new(self.catalog_root, provider);
        decode_tree_root(name, catalog.get(name.as_bytes())?)
    }

    fn tree_root(&self, name: &str) -> Result<PageId> {
        self.trees
            .get(name)
            .map(|state| state.root)
            .ok_or_else(|| Error::TreeNotFound { name: name.to_string() })
    }

    /// Commits with full durability: the journal entry is written and synced
    /// before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if staging or the journal write fails. A failed
    /// journal write poisons the environment; earlier failures leave it
    /// unchanged, and the transaction is discarded either way.
    pub fn commit(mut self) -> Result<()> {
        self.finish(Durability::Safe)
    }

    /// Commits with lazy durability: the entry is buffered in memory and
    /// becomes durable with the next safe commit, rotation, or sync. A crash
    /// before then loses this transaction but never corrupts the store.
    ///
    /// # Errors
    ///
    /// See [`commit`](Self::commit).
    pub fn commit_lazy(mut self) -> Result<()> {
        self.finish(Durability::Lazy)
    }

    /// Discards the transaction. Equivalent to dropping it.
    pub fn abort(self) {}

    fn finish(&mut self, durability: Durability) -> Result<()> {
        // Fold changed tree roots into the catalog. A tree whose root never
        // moved is left alone so an untouched catalog stays untouched.
        let pending: Vec<(String, PageId)> = self
            .trees
            .iter()
            .filter(|(_, state)| state.stored != Some(state.root))
            .map(|(name, state)| (name.clone(), state.root))
            .collect();
        let mut catalog_root = self.catalog_root;
        if !pending.is_empty() {
            let provider = BufferedWritePageProvider {
                env: self.env,
                snapshot: self.snapshot,
                txn_id: self.id,
                dirty: &mut self.dirty,
                allocation: &mut self.allocation,
            };
            let mut catalog = BTree::new(catalog_root, provider);
            for (name, root) in &pending {
                catalog.insert(name.as_bytes(), &root.to_le_bytes())?;
            }
            let splits = catalog.split_count();
            catalog_root = catalog.root_page();
            self.env.record_page_splits(splits);
        }

        let commit = TxCommit {
            tx_id: self.id,
            dirty: mem::take(&mut self.dirty),
            freed: self.allocation.freed.iter().copied().collect(),
            reusable: mem::take(&mut self.allocation.reusable),
            catalog_root,
            next_page: self.allocation.next_page,
        };
        self.env.commit_write(commit, durability)?;

        self.committed = true;
        if !self.env.registry.try_remove(self.id, self.handle) {
            warn!(tx = self.id, "write transaction slot already released");
        }
        self.env.release_pending_frees();
        Ok(())
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.dirty.clear();
        let acquired: Vec<PageId> = self.allocation.acquired.iter().copied().collect();
        self.env.return_page_numbers(&acquired);
        if !self.env.registry.try_remove(self.id, self.handle) {
            warn!(tx = self.id, "write transaction slot already released");
        }
        self.env.release_pending_frees();
    }
}

/// Accessor for one named tree inside a write transaction.
///
/// Operations read through the transaction's buffer first, so the
/// transaction always sees its own writes. Root movements are tracked on
/// the transaction and folded into the catalog at commit.
pub struct Tree<'txn, 'env> {
    txn: &'txn mut WriteTransaction<'env>,
    name: String,
}

impl Tree<'_, '_> {
    /// Inserts or replaces a key, returning the previous value if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTooLarge`] for keys over the limit for this page
    /// size, or an error if page access fails.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = &mut *self.txn;
        let root = txn.tree_root(&self.name)?;
        let provider = BufferedWritePageProvider {
            env: txn.env,
            snapshot: txn.snapshot,
            txn_id: txn.id,
            dirty: &mut txn.dirty,
            allocation: &mut txn.allocation,
        };
        let mut btree = BTree::new(root, provider);
        let previous = btree.insert(key, value)?;
        let splits = btree.split_count();
        let new_root = btree.root_page();
        txn.env.record_page_splits(splits);
        if let Some(state) = txn.trees.get_mut(&self.name) {
            state.root = new_root;
        }
        Ok(previous)
    }

    /// Looks up a key, seeing this transaction's own writes.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails during the lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = &*self.txn;
        let root = txn.tree_root(&self.name)?;
        if root == 0 {
            return Ok(None);
        }
        let provider = BufferedReadPageProvider {
            env: txn.env,
            snapshot: txn.snapshot,
            dirty: &txn.dirty,
        };
        BTree::new(root, provider).get(key)
    }

    /// Removes a key, returning its former value, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if page access fails.
    pub fn delete(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = &mut *self.txn;
        let root = txn.tree_root(&self.name)?;
        if root == 0 {
            return Ok(None);
        }
        let provider = BufferedWritePageProvider {
            env: txn.env,
            snapshot: txn.snapshot,
            txn_id: txn.id,
            dirty: &mut txn.dirty,
            allocation: &mut txn.allocation,
        };
        let mut btree = BTree::new(root, provider);
        let previous = btree.delete(key)?;
        let new_root = btree.root_page();
        if let Some(state) = txn.trees.get_mut(&self.name) {
            state.root = new_root;
        }
        Ok(previous)
    }

    /// Whether the tree currently holds no entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TreeNotFound`] if the handle outlived its entry,
    /// which does not happen through this API.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.txn.tree_root(&self.name)? == 0)
    }
}

/// Page provider for read transactions, with per-transaction caching.
///
/// Every miss resolves through the snapshot, so the cache only ever holds
/// images the snapshot is entitled to see.
struct CachingReadPageProvider<'txn, 'env> {
    env: &'env Environment,
    snapshot: TxId,
    page_cache: &'txn RefCell<HashMap<PageId, Page>>,
}

impl PageProvider for CachingReadPageProvider<'_, '_> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.page_cache.borrow().get(&page_id) {
            return Ok(page.clone());
        }
        let page = self.env.read_page_at(self.snapshot, page_id)?;
        self.page_cache.borrow_mut().insert(page_id, page.clone());
        Ok(page)
    }

    fn write_page(&mut self, _page: Page) {
        panic!("write_page called on read-only caching page provider");
    }

    fn allocate_page(&mut self, _page_type: PageType) -> Page {
        panic!("allocate_page called on read-only caching page provider");
    }

    fn free_page(&mut self, _page_id: PageId) {
        panic!("free_page called on read-only caching page provider");
    }

    fn page_size(&self) -> usize {
        self.env.options().page_size
    }

    fn txn_id(&self) -> TxId {
        0
    }
}

/// Page provider for read operations inside a write transaction.
///
/// Reads the transaction's buffer first so it sees its own writes, then
/// falls back to the snapshot.
struct BufferedReadPageProvider<'txn, 'env> {
    env: &'env Environment,
    snapshot: TxId,
    dirty: &'txn BTreeMap<PageId, Page>,
}

impl PageProvider for BufferedReadPageProvider<'_, '_> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.dirty.get(&page_id) {
            return Ok(page.clone());
        }
        self.env.read_page_at(self.snapshot, page_id)
    }

    fn write_page(&mut self, _page: Page) {
        panic!("write_page called on read-only buffered page provider");
    }

    fn allocate_page(&mut self, _page_type: PageType) -> Page {
        panic!("allocate_page called on read-only buffered page provider");
    }

    fn free_page(&mut self, _page_id: PageId) {
        panic!("free_page called on read-only buffered page provider");
    }

    fn page_size(&self) -> usize {
        self.env.options().page_size
    }

    fn txn_id(&self) -> TxId {
        0
    }
}

/// Page provider for write operations, buffering every modification.
///
/// Nothing reaches the environment through this provider except number
/// allocation; images land in the transaction's dirty buffer and committed
/// pages freed here are only tombstoned at commit.
struct BufferedWritePageProvider<'txn, 'env> {
    env: &'env Environment,
    snapshot: TxId,
    txn_id: TxId,
    dirty: &'txn mut BTreeMap<PageId, Page>,
    allocation: &'txn mut PageAllocation,
}

impl PageProvider for BufferedWritePageProvider<'_, '_> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.dirty.get(&page_id) {
            return Ok(page.clone());
        }
        self.env.read_page_at(self.snapshot, page_id)
    }

    fn write_page(&mut self, mut page: Page) {
        page.update_checksum();
        self.dirty.insert(page.id, page);
    }

    fn allocate_page(&mut self, page_type: PageType) -> Page {
        let id = self.allocation.take_number(self.env);
        Page::new(id, self.env.options().page_size, page_type, self.txn_id)
    }

    fn free_page(&mut self, page_id: PageId) {
        self.dirty.remove(&page_id);
        self.allocation.release_number(page_id);
    }

    fn page_size(&self) -> usize {
        self.env.options().page_size
    }

    fn txn_id(&self) -> TxId {
        self.txn_id
    }
}
