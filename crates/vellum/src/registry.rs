//! Active-transaction registry.
//!
//! Every live transaction occupies one slot in an append-only arena of atomic
//! chunks. The slot handle is stored on the transaction and stays valid when
//! the transaction is released from a different thread than the one that
//! created it (deferred commit paths do exactly that).
//!
//! The oldest-transaction scan takes no lock and tolerates races by being
//! conservative: it may return a stale-low value, which only delays
//! reclamation, but it never reports an id newer than a still-live
//! transaction.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::TxId;

const SLOTS_PER_CHUNK: usize = 64;

/// Slots store `tx_id + 1` so that 0 can mean "empty". A transaction id of 0
/// is a valid snapshot on a freshly created environment and still needs a slot.
#[derive(Debug)]
struct SlotChunk {
    slots: [AtomicU64; SLOTS_PER_CHUNK],
}

impl SlotChunk {
    fn new() -> Self {
        Self { slots: std::array::from_fn(|_| AtomicU64::new(0)) }
    }
}

/// Stable address of a registry slot, held by the owning transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    chunk: usize,
    index: usize,
}

/// Registry of all open transactions.
#[derive(Debug)]
pub struct ActiveTransactionRegistry {
    /// Chunk list grows append-only; readers snapshot it lock-free.
    chunks: ArcSwap<Vec<Arc<SlotChunk>>>,
    /// Released slot coordinates, reused before the arena grows.
    free_slots: Mutex<Vec<SlotHandle>>,
}

impl ActiveTransactionRegistry {
    /// Creates an empty registry with one pre-grown chunk.
    pub fn new() -> Self {
        let registry = Self {
            chunks: ArcSwap::from_pointee(vec![Arc::new(SlotChunk::new())]),
            free_slots: Mutex::new(Vec::with_capacity(SLOTS_PER_CHUNK)),
        };
        {
            let mut free = registry.free_slots.lock();
            for index in (0..SLOTS_PER_CHUNK).rev() {
                free.push(SlotHandle { chunk: 0, index });
            }
        }
        registry
    }

    /// Registers a transaction and returns the slot handle bound to it.
    pub fn add(&self, tx: TxId) -> SlotHandle {
        let handle = {
            let mut free = self.free_slots.lock();
            match free.pop() {
                Some(handle) => handle,
                None => {
                    // Grow by one chunk; the mutex serializes growth so the
                    // chunk list only ever appends.
                    let current = self.chunks.load_full();
                    let chunk_idx = current.len();
                    let mut grown = Vec::with_capacity(chunk_idx + 1);
                    grown.extend(current.iter().cloned());
                    grown.push(Arc::new(SlotChunk::new()));
                    self.chunks.store(Arc::new(grown));
                    for index in (1..SLOTS_PER_CHUNK).rev() {
                        free.push(SlotHandle { chunk: chunk_idx, index });
                    }
                    SlotHandle { chunk: chunk_idx, index: 0 }
                },
            }
        };

        let chunks = self.chunks.load();
        chunks[handle.chunk].slots[handle.index].store(tx + 1, Ordering::Release);
        handle
    }

    /// Unregisters a transaction iff `handle` still holds it.
    ///
    /// Returns `false` on double release or when the slot was rebound to a
    /// different transaction in the meantime. Callers report that condition;
    /// it is never a panic.
    pub fn try_remove(&self, tx: TxId, handle: SlotHandle) -> bool {
        let chunks = self.chunks.load();
        let Some(chunk) = chunks.get(handle.chunk) else {
            return false;
        };
        let slot = &chunk.slots[handle.index];
        if slot
            .compare_exchange(tx + 1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.free_slots.lock().push(handle);
        true
    }

    /// Checks whether a transaction id is currently registered.
    pub fn contains(&self, tx: TxId) -> bool {
        let chunks = self.chunks.load();
        chunks
            .iter()
            .any(|chunk| chunk.slots.iter().any(|slot| slot.load(Ordering::Acquire) == tx + 1))
    }

    /// Minimum live transaction id, or `None` when no transaction is active.
    ///
    /// Distinct from [`oldest_transaction`](Self::oldest_transaction) because
    /// an id of 0 is a real snapshot that reclamation must still respect.
    pub fn oldest(&self) -> Option<TxId> {
        let chunks = self.chunks.load();
        let mut oldest: Option<TxId> = None;
        for chunk in chunks.iter() {
            for slot in &chunk.slots {
                let raw = slot.load(Ordering::Acquire);
                if raw != 0 {
                    let id = raw - 1;
                    oldest = Some(oldest.map_or(id, |o| o.min(id)));
                }
            }
        }
        oldest
    }

    /// Minimum live transaction id, or 0 when none are active.
    pub fn oldest_transaction(&self) -> TxId {
        self.oldest().unwrap_or(0)
    }

    /// Number of currently registered transactions.
    pub fn active_count(&self) -> usize {
        let chunks = self.chunks.load();
        chunks
            .iter()
            .map(|chunk| chunk.slots.iter().filter(|s| s.load(Ordering::Acquire) != 0).count())
            .sum()
    }
}

impl Default for ActiveTransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
