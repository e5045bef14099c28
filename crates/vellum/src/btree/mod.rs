//! B+ tree over the transactional page store.
//!
//! Keys and values live in slotted leaf pages, with branch pages routing
//! by separator key. Values too large to sit inline move to overflow
//! chains, leaving a fixed-size reference in the leaf. All page access
//! goes through the [`PageProvider`] seam, so the same tree code serves
//! read snapshots and buffered write transactions.
//!
//! ## Structure
//!
//! - `node.rs`: low-level leaf and branch node operations
//! - `overflow.rs`: chained storage for oversized values
//! - `split.rs`: node splitting for insertions

/// Low-level leaf and branch node operations on pages.
pub mod node;
/// Chained storage for values too large to inline in a leaf.
pub mod overflow;
/// Node splitting for leaf and branch pages during insertions.
pub mod split;

use std::borrow::Cow;

use node::{BranchNode, BranchNodeRef, LeafNode, LeafNodeRef, LeafValue, OverflowRef, SearchResult};
use split::{split_branch_for_key, split_leaf_for_key};

use crate::{
    error::{Error, PageId, PageType, Result, TxId},
    page::Page,
};

/// Trait providing page operations to the B-tree.
///
/// This abstraction lets the tree run against different providers:
/// read-only snapshot providers for read transactions and buffering
/// providers for write transactions.
pub trait PageProvider {
    /// Reads a page by id.
    fn read_page(&self, page_id: PageId) -> Result<Page>;

    /// Stores a page image.
    fn write_page(&mut self, page: Page);

    /// Allocates a new page of the given type.
    fn allocate_page(&mut self, page_type: PageType) -> Page;

    /// Releases a page for later reuse.
    fn free_page(&mut self, page_id: PageId);

    /// Page size in bytes.
    fn page_size(&self) -> usize;

    /// Id of the transaction this provider serves.
    fn txn_id(&self) -> TxId;
}

/// B+ tree accessor for one named tree.
///
/// Holds the tree's current root; structural changes update it, and the
/// caller persists the new root in the catalog after each operation.
pub struct BTree<P: PageProvider> {
    provider: P,
    /// Root page id (0 = empty tree).
    root_page: PageId,
    split_count: u64,
}

impl<P: PageProvider> BTree<P> {
    /// Creates an accessor rooted at `root_page` (0 for an empty tree).
    pub fn new(root_page: PageId, provider: P) -> Self {
        Self { provider, root_page, split_count: 0 }
    }

    /// Current root page id; changes when the root splits or empties.
    pub fn root_page(&self) -> PageId {
        self.root_page
    }

    /// Whether the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root_page == 0
    }

    /// Number of page splits performed through this accessor.
    pub fn split_count(&self) -> u64 {
        self.split_count
    }

    /// Tree height: 0 for empty, 1 when the root is a leaf.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a non-tree page is linked.
    pub fn depth(&self) -> Result<u32> {
        if self.root_page == 0 {
            return Ok(0);
        }
        let mut depth = 1u32;
        let mut page_id = self.root_page;
        loop {
            let page = self.provider.read_page(page_id)?;
            match page.page_type()? {
                PageType::Leaf => return Ok(depth),
                PageType::Branch => {
                    let branch = BranchNodeRef::from_page(&page)?;
                    page_id = if branch.cell_count() > 0 {
                        branch.child(0)
                    } else {
                        branch.rightmost_child()
                    };
                    depth += 1;
                },
                found => {
                    return Err(Error::PageTypeMismatch { expected: PageType::Leaf, found });
                },
            }
        }
    }

    /// Looks up `key`, materializing overflow values.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or linked pages are corrupt.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root_page == 0 {
            return Ok(None);
        }
        let mut page_id = self.root_page;
        loop {
            let page = self.provider.read_page(page_id)?;
            match page.page_type()? {
                PageType::Leaf => {
                    let leaf = LeafNodeRef::from_page(&page)?;
                    return match leaf.search(key) {
                        SearchResult::Found(idx) => match leaf.get(idx).1 {
                            LeafValue::Inline(value) => Ok(Some(value.to_vec())),
                            LeafValue::Overflow(reference) => {
                                Ok(Some(overflow::read_chain(&self.provider, reference)?))
                            },
                        },
                        SearchResult::NotFound(_) => Ok(None),
                    };
                },
                PageType::Branch => {
                    let branch = BranchNodeRef::from_page(&page)?;
                    page_id = branch.child_for_key(key);
                },
                found => {
                    return Err(Error::PageTypeMismatch { expected: PageType::Leaf, found });
                },
            }
        }
    }

    /// Inserts or replaces `key`, returning the previous value if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTooLarge`] for keys over the limit for this page
    /// size, or an error if page access fails.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let max_key = node::max_key_len(self.provider.page_size());
        if key.len() > max_key {
            return Err(Error::KeyTooLarge { size: key.len(), max: max_key });
        }

        let (payload, is_overflow) = self.plan_value(key.len(), value)?;

        if self.root_page == 0 {
            let mut page = self.new_leaf_page();
            {
                let mut leaf = LeafNode::from_page(&mut page)?;
                leaf.insert(0, key, &payload, is_overflow)?;
            }
            self.root_page = page.id;
            self.provider.write_page(page);
            return Ok(None);
        }

        let (promoted, old_value) =
            self.insert_recursive(self.root_page, key, &payload, is_overflow)?;

        if let Some((separator_key, new_child)) = promoted {
            // Root split: a fresh branch takes the old root as its left
            // child and the split-off page as rightmost.
            let mut new_root = self.new_branch_page(new_child);
            {
                let mut branch = BranchNode::from_page(&mut new_root)?;
                branch.insert(0, &separator_key, self.root_page)?;
            }
            self.root_page = new_root.id;
            self.provider.write_page(new_root);
        }

        Ok(old_value)
    }

    /// Removes `key`, returning its former value, or `None` if absent.
    ///
    /// Deletion does not rebalance: a leaf may become underfull but the
    /// tree stays valid. An emptied root is freed.
    ///
    /// # Errors
    ///
    /// Returns an error if page access fails.
    pub fn delete(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root_page == 0 {
            return Ok(None);
        }

        let leaf_page_id = self.find_leaf(key)?;
        let mut page = self.provider.read_page(leaf_page_id)?;

        let found = {
            let leaf = LeafNode::from_page(&mut page)?;
            match leaf.search(key) {
                SearchResult::Found(idx) => {
                    let (_, payload, is_overflow) = leaf.raw(idx);
                    Some((idx, payload.to_vec(), is_overflow))
                },
                SearchResult::NotFound(_) => None,
            }
        };
        let Some((idx, payload, is_overflow)) = found else {
            return Ok(None);
        };

        let old_value = if is_overflow {
            let reference = OverflowRef::decode(&payload);
            let value = overflow::read_chain(&self.provider, reference)?;
            overflow::free_chain(&mut self.provider, reference.first_page)?;
            value
        } else {
            payload
        };

        let remaining = {
            let mut leaf = LeafNode::from_page(&mut page)?;
            leaf.delete(idx);
            leaf.cell_count()
        };

        if remaining == 0 && page.id == self.root_page {
            self.provider.free_page(page.id);
            self.root_page = 0;
        } else {
            self.provider.write_page(page);
        }

        Ok(Some(old_value))
    }

    /// Decides inline vs. overflow placement and produces the leaf payload.
    fn plan_value<'v>(&mut self, key_len: usize, value: &'v [u8]) -> Result<(Cow<'v, [u8]>, bool)> {
        let page_size = self.provider.page_size();
        let inline = value.len() <= page_size / 4
            && 4 + key_len + value.len() <= node::max_leaf_entry(page_size);
        if inline {
            Ok((Cow::Borrowed(value), false))
        } else {
            let reference = overflow::write_chain(&mut self.provider, value)?;
            Ok((Cow::Owned(reference.encode().to_vec()), true))
        }
    }

    fn new_leaf_page(&mut self) -> Page {
        let mut page = self.provider.allocate_page(PageType::Leaf);
        LeafNode::init(&mut page);
        page
    }

    fn new_branch_page(&mut self, rightmost: PageId) -> Page {
        let mut page = self.provider.allocate_page(PageType::Branch);
        BranchNode::init(&mut page, rightmost);
        page
    }

    /// Recursive insert; returns a promoted separator/new-child pair when
    /// the visited page split, plus any replaced value.
    fn insert_recursive(
        &mut self,
        page_id: PageId,
        key: &[u8],
        payload: &[u8],
        is_overflow: bool,
    ) -> Result<(Option<(Vec<u8>, PageId)>, Option<Vec<u8>>)> {
        let mut page = self.provider.read_page(page_id)?;
        let page_type = page.page_type()?;

        match page_type {
            PageType::Leaf => {
                let existing = {
                    let leaf = LeafNode::from_page(&mut page)?;
                    match leaf.search(key) {
                        SearchResult::Found(idx) => {
                            let (_, old_payload, old_overflow) = leaf.raw(idx);
                            Some((idx, old_payload.to_vec(), old_overflow))
                        },
                        SearchResult::NotFound(idx) => {
                            // Absent key: plain insert or split.
                            let mut leaf = leaf;
                            if leaf.can_insert(key.len(), payload.len()) {
                                leaf.insert(idx, key, payload, is_overflow)?;
                                drop(leaf);
                                self.provider.write_page(page);
                                return Ok((None, None));
                            }
                            None
                        },
                    }
                };

                match existing {
                    None => self.insert_and_split_leaf(&mut page, key, payload, is_overflow, None),
                    Some((idx, old_payload, old_overflow)) => {
                        let old_value = if old_overflow {
                            let reference = OverflowRef::decode(&old_payload);
                            let value = overflow::read_chain(&self.provider, reference)?;
                            overflow::free_chain(&mut self.provider, reference.first_page)?;
                            value
                        } else {
                            old_payload
                        };

                        let mut leaf = LeafNode::from_page(&mut page)?;
                        if leaf.update(idx, payload, is_overflow) {
                            drop(leaf);
                            self.provider.write_page(page);
                            return Ok((None, Some(old_value)));
                        }

                        // Payload size changed: remove and reinsert.
                        leaf.delete(idx);
                        if leaf.can_insert(key.len(), payload.len()) {
                            match leaf.search(key) {
                                SearchResult::NotFound(new_idx) => {
                                    leaf.insert(new_idx, key, payload, is_overflow)?;
                                },
                                SearchResult::Found(_) => unreachable!("key was just deleted"),
                            }
                            drop(leaf);
                            self.provider.write_page(page);
                            Ok((None, Some(old_value)))
                        } else {
                            drop(leaf);
                            self.insert_and_split_leaf(
                                &mut page,
                                key,
                                payload,
                                is_overflow,
                                Some(old_value),
                            )
                        }
                    },
                }
            },
            PageType::Branch => {
                let child_page_id = {
                    let branch = BranchNodeRef::from_page(&page)?;
                    branch.child_for_key(key)
                };

                let (promoted, old_value) =
                    self.insert_recursive(child_page_id, key, payload, is_overflow)?;

                let Some((sep_key, new_child)) = promoted else {
                    return Ok((None, old_value));
                };

                // The child split: child_page_id kept the left half, so the
                // separator goes in pointing at it, and the pointer after
                // the separator moves to the new right half.
                let mut branch = BranchNode::from_page(&mut page)?;
                if branch.can_insert(sep_key.len()) {
                    let insert_idx = branch.child_index_for_key(&sep_key);
                    let count = branch.cell_count() as usize;
                    branch.insert(insert_idx, &sep_key, child_page_id)?;
                    if insert_idx == count {
                        branch.set_rightmost_child(new_child);
                    } else {
                        branch.set_child(insert_idx + 1, new_child);
                    }
                    drop(branch);
                    self.provider.write_page(page);
                    Ok((None, old_value))
                } else {
                    drop(branch);
                    self.insert_and_split_branch(&mut page, &sep_key, child_page_id, new_child, old_value)
                }
            },
            found => Err(Error::PageTypeMismatch { expected: PageType::Leaf, found }),
        }
    }

    /// Splits a leaf and places the pending entry in the correct half.
    fn insert_and_split_leaf(
        &mut self,
        page: &mut Page,
        key: &[u8],
        payload: &[u8],
        is_overflow: bool,
        old_value: Option<Vec<u8>>,
    ) -> Result<(Option<(Vec<u8>, PageId)>, Option<Vec<u8>>)> {
        self.split_count += 1;
        let mut new_page = self.new_leaf_page();

        let result = split_leaf_for_key(page, &mut new_page, key, payload.len())?;

        let target = if key < result.separator_key.as_slice() { &mut *page } else { &mut new_page };
        {
            let mut leaf = LeafNode::from_page(target)?;
            match leaf.search(key) {
                SearchResult::NotFound(idx) => leaf.insert(idx, key, payload, is_overflow)?,
                SearchResult::Found(_) => unreachable!("split never keeps the pending key"),
            }
        }

        self.provider.write_page(page.clone());
        self.provider.write_page(new_page);

        Ok((Some((result.separator_key, result.new_page_id)), old_value))
    }

    /// Splits a branch and places the pending separator in the correct
    /// half, repointing the children around it.
    fn insert_and_split_branch(
        &mut self,
        page: &mut Page,
        sep_key: &[u8],
        original_child: PageId,
        right_child: PageId,
        old_value: Option<Vec<u8>>,
    ) -> Result<(Option<(Vec<u8>, PageId)>, Option<Vec<u8>>)> {
        self.split_count += 1;
        let mut new_page = self.new_branch_page(0);

        let result = split_branch_for_key(page, &mut new_page, sep_key)?;

        let target =
            if sep_key < result.separator_key.as_slice() { &mut *page } else { &mut new_page };
        {
            let mut branch = BranchNode::from_page(target)?;
            let insert_idx = branch.child_index_for_key(sep_key);
            let count = branch.cell_count() as usize;
            branch.insert(insert_idx, sep_key, original_child)?;
            if insert_idx == count {
                branch.set_rightmost_child(right_child);
            } else {
                branch.set_child(insert_idx + 1, right_child);
            }
        }

        self.provider.write_page(page.clone());
        self.provider.write_page(new_page);

        Ok((Some((result.separator_key, result.new_page_id)), old_value))
    }

    /// Descends to the leaf that would hold `key`.
    fn find_leaf(&self, key: &[u8]) -> Result<PageId> {
        let mut page_id = self.root_page;
        loop {
            let page = self.provider.read_page(page_id)?;
            match page.page_type()? {
                PageType::Leaf => return Ok(page_id),
                PageType::Branch => {
                    let branch = BranchNodeRef::from_page(&page)?;
                    page_id = branch.child_for_key(key);
                },
                found => {
                    return Err(Error::PageTypeMismatch { expected: PageType::Leaf, found });
                },
            }
        }
    }
}
