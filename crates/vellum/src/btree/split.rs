//! Node splitting for leaf and branch pages during insertions.
//!
//! A leaf split distributes entries between the original page and a fresh
//! one so that the pending entry fits on its side of the separator. The
//! split point is probed outward from the middle, preferring balanced
//! splits; because no inline entry exceeds half the usable page, a feasible
//! point always exists for legal inputs. The separator promoted to the
//! parent is the first key of the right page (or the pending key itself
//! when everything stays left).
//!
//! A branch split promotes its chosen separator instead of copying it: the
//! promoted cell's child becomes the rightmost child of the left page, and
//! the original rightmost child stays with the right page. The promote
//! index is probed the same outward way so the pending separator is
//! guaranteed to fit beside its siblings.

use super::node::{BranchNode, LeafNode};
use crate::{
    error::{Error, PageId, Result},
    page::Page,
};

/// One leaf entry lifted off a page: key, payload bytes, overflow flag.
type LeafEntry = (Vec<u8>, Vec<u8>, bool);

/// Result of splitting a leaf node.
#[derive(Debug)]
pub struct LeafSplitResult {
    /// Page id of the new (right) leaf.
    pub new_page_id: PageId,
    /// Separator key to promote to the parent.
    pub separator_key: Vec<u8>,
}

/// Result of splitting a branch node.
#[derive(Debug)]
pub struct BranchSplitResult {
    /// Page id of the new (right) branch.
    pub new_page_id: PageId,
    /// Separator key to promote to the parent, removed from both halves.
    pub separator_key: Vec<u8>,
}

fn collect_leaf_entries(page: &mut Page) -> Result<Vec<LeafEntry>> {
    let node = LeafNode::from_page(page)?;
    let count = node.cell_count() as usize;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let (key, payload, overflow) = node.raw(i);
        entries.push((key.to_vec(), payload.to_vec(), overflow));
    }
    Ok(entries)
}

fn fill_leaf(page: &mut Page, entries: &[LeafEntry]) -> Result<bool> {
    let mut node = LeafNode::init(page);
    for (i, (key, payload, overflow)) in entries.iter().enumerate() {
        if !node.can_insert(key.len(), payload.len()) {
            return Ok(false);
        }
        node.insert(i, key, payload, *overflow)?;
    }
    Ok(true)
}

/// Splits a leaf so that a pending `new_key`/`new_payload` entry will fit
/// on its side. `original` keeps the left half; `new_page` receives the
/// right half. The pending entry itself is not inserted here.
///
/// # Errors
///
/// Returns [`Error::PageFull`] if no split point admits the pending entry,
/// which cannot happen for entries within the size limits.
pub fn split_leaf_for_key(
    original: &mut Page,
    new_page: &mut Page,
    new_key: &[u8],
    new_payload_len: usize,
) -> Result<LeafSplitResult> {
    let entries = collect_leaf_entries(original)?;

    if entries.is_empty() {
        LeafNode::init(original);
        LeafNode::init(new_page);
        return Ok(LeafSplitResult { new_page_id: new_page.id, separator_key: Vec::new() });
    }

    // Probes one split point: entries[..split_at] left, the rest right,
    // checking that the pending entry still fits on its side.
    let mut try_split = |split_at: usize, separator_key: &[u8]| -> Result<bool> {
        let pending_left = new_key < separator_key;

        if !fill_leaf(original, &entries[..split_at])? {
            return Ok(false);
        }
        {
            let left = LeafNode::from_page(original)?;
            if pending_left && !left.can_insert(new_key.len(), new_payload_len) {
                return Ok(false);
            }
        }

        if !fill_leaf(new_page, &entries[split_at..])? {
            return Ok(false);
        }
        {
            let right = LeafNode::from_page(new_page)?;
            if !pending_left && !right.can_insert(new_key.len(), new_payload_len) {
                return Ok(false);
            }
        }
        Ok(true)
    };

    let mid = entries.len() / 2;
    for offset in 0..=entries.len() {
        for split_at in [mid.saturating_sub(offset), (mid + offset).min(entries.len())] {
            let separator_key: Vec<u8> = if split_at == 0 {
                // Everything moves right; only useful if the pending key
                // sorts before all existing entries.
                if new_key >= entries[0].0.as_slice() {
                    continue;
                }
                entries[0].0.clone()
            } else if split_at == entries.len() {
                // Everything stays left; the pending key itself separates.
                if new_key <= entries[entries.len() - 1].0.as_slice() {
                    continue;
                }
                new_key.to_vec()
            } else {
                entries[split_at].0.clone()
            };

            if try_split(split_at, &separator_key)? {
                return Ok(LeafSplitResult { new_page_id: new_page.id, separator_key });
            }
        }
    }

    Err(Error::PageFull {
        page_id: original.id,
        needed: 2 + 4 + new_key.len() + new_payload_len,
        available: 0,
    })
}

fn collect_branch_entries(page: &mut Page) -> Result<(Vec<(Vec<u8>, PageId)>, PageId)> {
    let node = BranchNode::from_page(page)?;
    let count = node.cell_count() as usize;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        entries.push((node.key(i).to_vec(), node.child(i)));
    }
    let rightmost = node.rightmost_child();
    Ok((entries, rightmost))
}

fn fill_branch(page: &mut Page, entries: &[(Vec<u8>, PageId)], rightmost: PageId) -> Result<bool> {
    let mut node = BranchNode::init(page, rightmost);
    for (i, (key, child)) in entries.iter().enumerate() {
        if !node.can_insert(key.len()) {
            return Ok(false);
        }
        node.insert(i, key, *child)?;
    }
    Ok(true)
}

/// Splits a branch, promoting one separator, so that a pending separator
/// `new_key` will fit on its side afterward.
///
/// # Errors
///
/// Returns [`Error::PageFull`] if no promote index admits the pending
/// separator, which cannot happen for keys within the size limits.
pub fn split_branch_for_key(
    original: &mut Page,
    new_page: &mut Page,
    new_key: &[u8],
) -> Result<BranchSplitResult> {
    let (entries, rightmost) = collect_branch_entries(original)?;
    debug_assert!(!entries.is_empty());

    let mut try_split = |promote_at: usize| -> Result<bool> {
        let separator_key = entries[promote_at].0.as_slice();
        let pending_left = new_key < separator_key;

        // The promoted cell's child covers keys between the last left
        // separator and the promoted one: it becomes the left rightmost.
        if !fill_branch(original, &entries[..promote_at], entries[promote_at].1)? {
            return Ok(false);
        }
        {
            let left = BranchNode::from_page(original)?;
            if pending_left && !left.can_insert(new_key.len()) {
                return Ok(false);
            }
        }

        if !fill_branch(new_page, &entries[promote_at + 1..], rightmost)? {
            return Ok(false);
        }
        {
            let right = BranchNode::from_page(new_page)?;
            if !pending_left && !right.can_insert(new_key.len()) {
                return Ok(false);
            }
        }
        Ok(true)
    };

    let mid = entries.len() / 2;
    for offset in 0..=entries.len() {
        for promote_at in [mid.saturating_sub(offset), (mid + offset).min(entries.len() - 1)] {
            if try_split(promote_at)? {
                return Ok(BranchSplitResult {
                    new_page_id: new_page.id,
                    separator_key: entries[promote_at].0.clone(),
                });
            }
        }
    }

    Err(Error::PageFull {
        page_id: original.id,
        needed: 2 + 10 + new_key.len(),
        available: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::PageType,
        page::Page,
    };

    const PAGE_SIZE: usize = 4096;

    fn filled_leaf(values: &[(&[u8], usize)]) -> Page {
        let mut page = Page::new(1, PAGE_SIZE, PageType::Leaf, 1);
        let mut leaf = LeafNode::init(&mut page);
        for (i, (key, len)) in values.iter().enumerate() {
            leaf.insert(i, key, &vec![0x55; *len], false).unwrap();
        }
        page
    }

    #[test]
    fn test_leaf_split_balances_and_orders() {
        let mut original = filled_leaf(&[
            (b"aa", 700),
            (b"bb", 700),
            (b"cc", 700),
            (b"dd", 700),
            (b"ee", 700),
        ]);
        let mut new_page = Page::new(2, PAGE_SIZE, PageType::Leaf, 1);

        let result = split_leaf_for_key(&mut original, &mut new_page, b"cd", 700).unwrap();

        assert_eq!(result.new_page_id, 2);
        let left = LeafNode::from_page(&mut original).unwrap();
        let count_left = left.cell_count() as usize;
        assert!(count_left > 0);
        assert!(left.key(count_left - 1) < result.separator_key.as_slice());
        drop(left);
        let right = LeafNode::from_page(&mut new_page).unwrap();
        assert_eq!(right.key(0), result.separator_key.as_slice());
        assert_eq!(count_left + right.cell_count() as usize, 5);
        // The pending entry fits on its side.
        let pending_left = b"cd".as_slice() < result.separator_key.as_slice();
        if pending_left {
            let left = LeafNode::from_page(&mut original).unwrap();
            assert!(left.can_insert(2, 700));
        } else {
            assert!(right.can_insert(2, 700));
        }
    }

    #[test]
    fn test_leaf_split_shifts_off_middle_when_needed() {
        // Ten tiny entries then ten large ones: a middle split would leave
        // the large side overfull once the pending large entry joins it, so
        // the probe must walk outward.
        let mut values: Vec<(Vec<u8>, usize)> = Vec::new();
        for i in 0..10 {
            values.push((format!("a{i:02}").into_bytes(), 0));
        }
        for i in 0..10 {
            values.push((format!("m{i:02}").into_bytes(), 374));
        }
        let borrowed: Vec<(&[u8], usize)> =
            values.iter().map(|(k, l)| (k.as_slice(), *l)).collect();
        let mut original = filled_leaf(&borrowed);
        let mut new_page = Page::new(2, PAGE_SIZE, PageType::Leaf, 1);

        let result = split_leaf_for_key(&mut original, &mut new_page, b"m99", 374).unwrap();

        let right = LeafNode::from_page(&mut new_page).unwrap();
        assert!(right.can_insert(3, 374));
        assert!(b"m99".as_slice() >= result.separator_key.as_slice());
    }

    #[test]
    fn test_leaf_split_all_left_when_key_is_greatest() {
        let mut original = filled_leaf(&[(b"aa", 10), (b"bb", 10)]);
        let mut new_page = Page::new(2, PAGE_SIZE, PageType::Leaf, 1);

        let result = split_leaf_for_key(&mut original, &mut new_page, b"zz", 10).unwrap();

        // Small entries split at the middle; the greatest key heads right.
        assert!(b"zz".as_slice() >= result.separator_key.as_slice());
        let right = LeafNode::from_page(&mut new_page).unwrap();
        assert!(right.can_insert(2, 10));
    }

    #[test]
    fn test_branch_split_promotes_middle() {
        let mut page = Page::new(1, PAGE_SIZE, PageType::Branch, 1);
        {
            let mut branch = BranchNode::init(&mut page, 60);
            for (i, (key, child)) in
                [(b"ee", 10u64), (b"gg", 20), (b"kk", 30), (b"pp", 40), (b"tt", 50)]
                    .iter()
                    .enumerate()
            {
                branch.insert(i, *key, *child).unwrap();
            }
        }
        let mut new_page = Page::new(2, PAGE_SIZE, PageType::Branch, 1);

        let result = split_branch_for_key(&mut page, &mut new_page, b"hh").unwrap();

        assert_eq!(result.separator_key, b"kk");
        let left = BranchNode::from_page(&mut page).unwrap();
        assert_eq!(left.cell_count(), 2);
        // The promoted separator's child becomes the left rightmost.
        assert_eq!(left.rightmost_child(), 30);
        drop(left);
        let right = BranchNode::from_page(&mut new_page).unwrap();
        assert_eq!(right.cell_count(), 2);
        assert_eq!(right.key(0), b"pp");
        assert_eq!(right.rightmost_child(), 60);
    }

    #[test]
    fn test_branch_split_single_cell() {
        let mut page = Page::new(1, PAGE_SIZE, PageType::Branch, 1);
        {
            let mut branch = BranchNode::init(&mut page, 20);
            branch.insert(0, b"mm", 10).unwrap();
        }
        let mut new_page = Page::new(2, PAGE_SIZE, PageType::Branch, 1);

        let result = split_branch_for_key(&mut page, &mut new_page, b"aa").unwrap();

        assert_eq!(result.separator_key, b"mm");
        let left = BranchNode::from_page(&mut page).unwrap();
        assert_eq!(left.cell_count(), 0);
        assert_eq!(left.rightmost_child(), 10);
        drop(left);
        let right = BranchNode::from_page(&mut new_page).unwrap();
        assert_eq!(right.cell_count(), 0);
        assert_eq!(right.rightmost_child(), 20);
    }
}
