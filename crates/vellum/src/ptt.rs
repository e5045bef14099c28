//! Page translation table: per-journal, versioned page mapping.
//!
//! Each journal owns one table mapping logical page numbers to the scratch
//! positions its committed transactions produced. Versions are kept per key
//! as an explicit chain, newest first, so a reader resolves the newest
//! version at or below its snapshot id without any retroactive mutation.
//!
//! The table is not internally synchronized. It lives inside the journal's
//! state, and the journal's one lock guards the table and the write cursor
//! together.

use std::collections::HashMap;

use crate::error::{PageId, TxId};

/// Physical location of one version of a logical page.
///
/// Immutable once created, except for the `unused_in_ptt` tag set when a
/// newer commit supersedes it. Freed pages are represented by tombstones
/// (`is_freed_page_marker`) with no scratch backing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePosition {
    /// Scratch file holding the page image.
    pub scratch_file_number: u32,
    /// Page-slot index inside the scratch file.
    pub position_in_scratch: u64,
    /// Transaction that committed this version.
    pub transaction_id: TxId,
    /// Journal the commit was appended to.
    pub journal_number: u64,
    /// True when this version records the page being freed.
    pub is_freed_page_marker: bool,
    /// True once a newer commit superseded this version and queued it for
    /// reclamation.
    pub unused_in_ptt: bool,
}

impl PagePosition {
    /// A live mapping to a scratch slot.
    pub fn mapped(
        scratch_file_number: u32,
        position_in_scratch: u64,
        transaction_id: TxId,
        journal_number: u64,
    ) -> Self {
        Self {
            scratch_file_number,
            position_in_scratch,
            transaction_id,
            journal_number,
            is_freed_page_marker: false,
            unused_in_ptt: false,
        }
    }

    /// A freed-page tombstone. Carries no scratch location; readers that
    /// resolve one stop searching older journals and fall back to the data
    /// file.
    pub fn tombstone(transaction_id: TxId, journal_number: u64) -> Self {
        Self {
            scratch_file_number: 0,
            position_in_scratch: 0,
            transaction_id,
            journal_number,
            is_freed_page_marker: true,
            unused_in_ptt: false,
        }
    }
}

/// Versioned map `page number → chain of PagePosition`, newest first.
#[derive(Debug, Default)]
pub struct PageTranslationTable {
    chains: HashMap<PageId, Vec<PagePosition>>,
    last_seen_tx: TxId,
}

impl PageTranslationTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the version of `page` visible to snapshot `tx`: the newest
    /// entry with writer id ≤ `tx`. Tombstones are returned, not hidden,
    /// so the caller can distinguish "freed as of this snapshot" from
    /// "never mapped here".
    pub fn resolve(&self, tx: TxId, page: PageId) -> Option<PagePosition> {
        self.chains
            .get(&page)?
            .iter()
            .find(|position| position.transaction_id <= tx)
            .copied()
    }

    /// Merges one committed transaction's delta. Every previous chain head a
    /// delta entry supersedes is tagged `unused_in_ptt` in place and a copy
    /// is returned for the journal's reclamation queue.
    ///
    /// Chains stay ordered because commits merge in ascending id order (the
    /// engine has a single writer).
    pub fn apply(&mut self, tx: TxId, delta: &[(PageId, PagePosition)]) -> Vec<PagePosition> {
        let mut superseded = Vec::new();
        for (page, position) in delta {
            debug_assert_eq!(position.transaction_id, tx);
            let chain = self.chains.entry(*page).or_default();
            if let Some(head) = chain.first_mut() {
                head.unused_in_ptt = true;
                superseded.push(*head);
            }
            chain.insert(0, *position);
        }
        if tx > self.last_seen_tx {
            self.last_seen_tx = tx;
        }
        superseded
    }

    /// Highest transaction id ever merged into this table.
    pub fn last_seen_transaction_id(&self) -> TxId {
        self.last_seen_tx
    }

    /// Removes every chain whose newest version is ≤ `synced` and returns
    /// all positions from the removed chains. Those pages are fully covered
    /// by the data file as of `synced`, so the journal no longer needs to
    /// shadow them.
    pub fn remove_keys_where_all_pages_older_than(&mut self, synced: TxId) -> Vec<PagePosition> {
        let mut removed = Vec::new();
        self.chains.retain(|_, chain| {
            let fully_synced = chain.first().is_some_and(|head| head.transaction_id <= synced);
            if fully_synced {
                removed.extend(chain.iter().copied());
            }
            !fully_synced
        });
        removed
    }

    /// Newest non-tombstone version at or below `boundary` for every page,
    /// used by the flush pass to gather what to fold into the data file.
    pub fn latest_visible(&self, boundary: TxId) -> Vec<(PageId, PagePosition)> {
        let mut gathered = Vec::new();
        for (page, chain) in &self.chains {
            if let Some(position) = chain.iter().find(|p| p.transaction_id <= boundary) {
                if !position.is_freed_page_marker {
                    gathered.push((*page, *position));
                }
            }
        }
        gathered
    }

    /// Number of pages with at least one live chain entry.
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// True when no chains remain.
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
