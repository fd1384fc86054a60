//! # B-Tree Algorithms
//!
//! Search, insert, erase, scan and integrity checking over the node layout
//! in [`super::node`]. The tree stores page ids, not pointers; every page
//! access goes through the pager, and multi-node mutations proceed in
//! scoped read-then-write phases so no two page borrows overlap.
//!
//! ## Search
//!
//! Descent runs a binary search per node. An internal node with keys
//! `k_0 < k_1 < ...` partitions its children so the subtree at slot `i`
//! holds keys strictly below `k_i` and the rightmost child holds the rest;
//! the descent therefore follows the first slot whose key exceeds the
//! target. At the leaf, the lower bound either matches exactly or gives
//! the insertion point.
//!
//! ## Insert
//!
//! A full leaf splits: the upper half of its slots moves to a fresh page,
//! and a copy of the right half's smallest key is promoted as the
//! separator. Internal splits move the middle slot's key up instead of
//! copying it. When the root splits, a new internal root adopts both
//! halves and the header's root id is updated.
//!
//! ## Erase
//!
//! Removing a slot may drop a node below the minimum fill. The node then
//! borrows a slot from a sibling when the sibling can spare one, or merges
//! with a sibling and pulls the separator out of the parent, recursing
//! upward. An internal root left with no keys is replaced by its sole
//! child; an empty leaf root is released and the tree returns to the
//! empty state (root id 0).
//!
//! ## Extended Keys
//!
//! Keys wider than the inline key area live in key blobs. Slot moves keep
//! blob ownership with the slot bytes; only two operations copy a key and
//! therefore allocate a fresh blob: promoting a leaf separator and
//! rewriting a parent separator after a leaf borrow. Leaf merges free the
//! separator copy they drop.

use std::cmp::Ordering;

use bumpalo::Bump;
use eyre::{ensure, Result, WrapErr};
use smallvec::SmallVec;

use crate::backend::{Backend, EraseResult, FindResult, ScanVisitor};
use crate::comparator::{Comparators, PrefixOutcome};
use crate::config::insert_flags;
use crate::error::{raise, Error};
use crate::record::{key_flags, RecordPtr};
use crate::storage::blob;
use crate::storage::{Page, PageId, PageType, Pager};
use crate::txn::Txn;

use super::node::{
    build_slot, node_capacity, raw_slot_ptr, set_raw_slot_ptr, Node, NodeMut,
    EXTENDED_BLOB_REF_SIZE,
};

/// Where a key sits (or would sit) in a node's slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotSearch {
    Found(usize),
    /// Index of the first slot whose key is greater than or equal to the
    /// target; the insertion point.
    NotFound(usize),
}

/// One descent step: the internal node and the child index taken
/// (`key_count` means the rightmost child).
type Path = SmallVec<[(PageId, usize); 8]>;

#[derive(Debug, Default)]
pub struct BtreeBackend;

impl BtreeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for BtreeBackend {
    fn create(&mut self, _pager: &mut Pager) -> Result<()> {
        // The root is allocated lazily by the first insert; a fresh header
        // already carries root id 0.
        Ok(())
    }

    fn open(&mut self, pager: &mut Pager) -> Result<()> {
        let root = pager.root_page();
        if root != 0 && root >= pager.page_count() {
            raise!(Error::Internal, "root page {} beyond file end", root);
        }
        Ok(())
    }

    fn close(&mut self, _pager: &mut Pager) -> Result<()> {
        Ok(())
    }

    fn find(
        &mut self,
        pager: &mut Pager,
        txn: &Txn,
        cmp: &Comparators,
        key: &[u8],
    ) -> Result<FindResult> {
        if pager.root_page() == 0 {
            raise!(Error::KeyNotFound);
        }

        let ks = pager.key_size();
        let (leaf, _path) = descend(pager, txn, cmp, key)?;
        match search_slots(pager, txn, cmp, leaf, key)? {
            SlotSearch::Found(idx) => {
                let page = fetch_index(pager, leaf)?;
                let node = Node::new(page.payload(), ks)?;
                let header = node.slot_header(idx)?;
                Ok(FindResult {
                    record_ptr: header.record_ptr(),
                    intflags: header.key_flags(),
                })
            }
            SlotSearch::NotFound(_) => raise!(Error::KeyNotFound),
        }
    }

    fn insert(
        &mut self,
        pager: &mut Pager,
        txn: &Txn,
        cmp: &Comparators,
        key: &[u8],
        record: &[u8],
        flags: u32,
    ) -> Result<()> {
        let ks = pager.key_size();

        if pager.root_page() == 0 {
            let root = pager.alloc(PageType::Index)?;
            let page = pager.fetch(root)?;
            NodeMut::init(page.payload_mut(), ks, true)?;
            pager.set_root_page(root);
        }

        let (leaf, path) = descend(pager, txn, cmp, key)?;
        let slot_idx = match search_slots(pager, txn, cmp, leaf, key)? {
            SlotSearch::Found(idx) => {
                if flags & insert_flags::OVERWRITE != 0 {
                    return overwrite_record(pager, leaf, idx, record);
                }
                raise!(Error::DuplicateKey);
            }
            SlotSearch::NotFound(idx) => idx,
        };

        let (ptr_word, rec_flags) = match RecordPtr::encode_inline(record) {
            Some(encoded) => encoded,
            None => RecordPtr::encode_blob(blob::alloc(pager, record)?),
        };

        let (slot, key_blob) = match make_slot(pager, key, ptr_word, rec_flags) {
            Ok(built) => built,
            Err(e) => {
                if RecordPtr::is_blob(rec_flags) {
                    let _ = blob::free(pager, ptr_word);
                }
                return Err(e);
            }
        };

        if let Err(e) = insert_at(pager, txn, leaf, slot_idx, slot, path) {
            if RecordPtr::is_blob(rec_flags) {
                let _ = blob::free(pager, ptr_word);
            }
            if let Some(kb) = key_blob {
                let _ = blob::free(pager, kb);
            }
            return Err(e);
        }
        Ok(())
    }

    fn erase(
        &mut self,
        pager: &mut Pager,
        txn: &Txn,
        cmp: &Comparators,
        key: &[u8],
    ) -> Result<EraseResult> {
        if pager.root_page() == 0 {
            raise!(Error::KeyNotFound);
        }

        let ks = pager.key_size();
        let (leaf, path) = descend(pager, txn, cmp, key)?;
        let idx = match search_slots(pager, txn, cmp, leaf, key)? {
            SlotSearch::Found(idx) => idx,
            SlotSearch::NotFound(_) => raise!(Error::KeyNotFound),
        };

        let (record_ptr, intflags, key_blob) = {
            let page = fetch_index(pager, leaf)?;
            let node = Node::new(page.payload(), ks)?;
            let header = node.slot_header(idx)?;
            (
                header.record_ptr(),
                header.key_flags(),
                node.key_blob_id(idx)?,
            )
        };

        if let Some(kb) = key_blob {
            blob::free(pager, kb).wrap_err("freeing extended key blob")?;
        }

        {
            let ks = pager.key_size();
            let page = fetch_index(pager, leaf)?;
            NodeMut::new(page.payload_mut(), ks)?.remove_slot(idx)?;
        }

        rebalance_path(pager, txn, leaf, path)?;

        Ok(EraseResult {
            record_ptr,
            intflags,
        })
    }

    fn check_integrity(&mut self, pager: &mut Pager, txn: &Txn, cmp: &Comparators) -> Result<()> {
        let root = pager.root_page();
        if root == 0 {
            return Ok(());
        }

        let _ = txn;
        let mut leaf_depth = None;
        walk_checked(pager, cmp, root, 0, None, None, true, &mut leaf_depth)
            .map_err(|e| e.wrap_err(Error::IntegrityViolated))
    }

    fn scan(
        &mut self,
        pager: &mut Pager,
        _txn: &Txn,
        visitor: &mut dyn ScanVisitor,
    ) -> Result<()> {
        let root = pager.root_page();
        if root == 0 {
            return Ok(());
        }
        let mut scratch = Bump::new();
        scan_node(pager, root, &mut scratch, &mut |key, record| {
            visitor.visit(key, record)
        })
    }

    fn dump(&mut self, pager: &mut Pager, _txn: &Txn, cb: &mut dyn FnMut(&[u8])) -> Result<()> {
        let root = pager.root_page();
        if root == 0 {
            return Ok(());
        }
        let mut scratch = Bump::new();
        scan_node(pager, root, &mut scratch, &mut |key, _record| {
            cb(key);
            Ok(())
        })
    }
}

/// Fetches a page and verifies it carries a B-tree node.
fn fetch_index(pager: &mut Pager, id: PageId) -> Result<&mut Page> {
    let page = pager.fetch(id)?;
    if page.kind() != PageType::Index {
        raise!(Error::Internal, "page {} is not an index page", id);
    }
    Ok(page)
}

fn capacity(pager: &Pager) -> usize {
    node_capacity(pager.usable_page_size(), pager.key_size())
}

fn min_keys(pager: &Pager) -> usize {
    capacity(pager).div_ceil(2)
}

/// Materialises the full key of a slot into `arena`.
fn full_key<'a>(
    pager: &mut Pager,
    arena: &'a Bump,
    page_id: PageId,
    idx: usize,
) -> Result<&'a [u8]> {
    let ks = pager.key_size();
    let blob_id = {
        let page = fetch_index(pager, page_id)?;
        let node = Node::new(page.payload(), ks)?;
        match node.key_blob_id(idx)? {
            None => return Ok(arena.alloc_slice_copy(node.inline_key(idx)?)),
            Some(id) => id,
        }
    };
    blob::read(pager, arena, blob_id).wrap_err("reading extended key")
}

/// Compares the stored key at (`page_id`, `idx`) against `target`,
/// consulting the prefix comparator before materialising an extended key.
fn compare_slot(
    pager: &mut Pager,
    txn: &Txn,
    cmp: &Comparators,
    page_id: PageId,
    idx: usize,
    target: &[u8],
) -> Result<Ordering> {
    let ks = pager.key_size();
    let (prefix, full_len): (SmallVec<[u8; 64]>, usize) = {
        let page = fetch_index(pager, page_id)?;
        let node = Node::new(page.payload(), ks)?;
        let header = node.slot_header(idx)?;
        if header.key_flags() & key_flags::EXTENDED == 0 {
            return Ok((cmp.compare)(node.inline_key(idx)?, target));
        }
        (
            SmallVec::from_slice(node.inline_key(idx)?),
            header.key_len() as usize,
        )
    };

    if let Some(prefix_compare) = cmp.prefix_compare {
        if let PrefixOutcome::Decided(ord) = prefix_compare(&prefix, full_len, target, target.len())
        {
            return Ok(ord);
        }
    }

    let full = full_key(pager, txn.key_arena(), page_id, idx)?;
    Ok((cmp.compare)(full, target))
}

/// Binary search within one node: the lower bound of `key`.
fn search_slots(
    pager: &mut Pager,
    txn: &Txn,
    cmp: &Comparators,
    page_id: PageId,
    key: &[u8],
) -> Result<SlotSearch> {
    let count = {
        let ks = pager.key_size();
        let page = fetch_index(pager, page_id)?;
        Node::new(page.payload(), ks)?.key_count()
    };

    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match compare_slot(pager, txn, cmp, page_id, mid, key)? {
            Ordering::Less => lo = mid + 1,
            _ => hi = mid,
        }
    }

    if lo < count && compare_slot(pager, txn, cmp, page_id, lo, key)? == Ordering::Equal {
        Ok(SlotSearch::Found(lo))
    } else {
        Ok(SlotSearch::NotFound(lo))
    }
}

/// Walks from the root to the leaf responsible for `key`, recording the
/// child index taken at every internal node.
fn descend(
    pager: &mut Pager,
    txn: &Txn,
    cmp: &Comparators,
    key: &[u8],
) -> Result<(PageId, Path)> {
    let ks = pager.key_size();
    let mut path = Path::new();
    let mut current = pager.root_page();

    loop {
        let is_leaf = {
            let page = fetch_index(pager, current)?;
            Node::new(page.payload(), ks)?.is_leaf()
        };
        if is_leaf {
            return Ok((current, path));
        }

        // Equal keys live at or right of their separator, so equality
        // continues past the slot.
        let child_idx = match search_slots(pager, txn, cmp, current, key)? {
            SlotSearch::Found(idx) => idx + 1,
            SlotSearch::NotFound(idx) => idx,
        };

        let child = {
            let page = fetch_index(pager, current)?;
            let node = Node::new(page.payload(), ks)?;
            if child_idx == node.key_count() {
                node.right_child()
            } else {
                node.child(child_idx)?
            }
        };
        if child == 0 {
            raise!(Error::Internal, "node {} has a null child", current);
        }

        path.push((current, child_idx));
        current = child;
    }
}

/// Builds the slot for a new key, spilling oversized keys into a key blob.
/// Returns the slot bytes and the key blob id, if one was allocated.
fn make_slot(
    pager: &mut Pager,
    key: &[u8],
    record_ptr: u64,
    rec_flags: u8,
) -> Result<(Vec<u8>, Option<PageId>)> {
    let ks = pager.key_size();

    if key.len() <= ks {
        let slot = build_slot(ks, key.len() as u16, rec_flags, record_ptr, key);
        return Ok((slot, None));
    }

    let key_blob = blob::alloc(pager, key).wrap_err("spilling extended key")?;
    let mut inline = Vec::with_capacity(ks);
    inline.extend_from_slice(&key[..ks - EXTENDED_BLOB_REF_SIZE]);
    inline.extend_from_slice(&key_blob.to_le_bytes());
    let slot = build_slot(
        ks,
        key.len() as u16,
        rec_flags | key_flags::EXTENDED,
        record_ptr,
        &inline,
    );
    Ok((slot, Some(key_blob)))
}

/// Copies the key of (`src`, `src_idx`) into a separator slot pointing at
/// `child`. Extended keys get their own fresh key blob so blobs stay
/// unshared.
fn copy_separator(
    pager: &mut Pager,
    txn: &Txn,
    src: PageId,
    src_idx: usize,
    child: PageId,
) -> Result<Vec<u8>> {
    let ks = pager.key_size();
    let (key_len, extended): (usize, bool) = {
        let page = fetch_index(pager, src)?;
        let node = Node::new(page.payload(), ks)?;
        let header = node.slot_header(src_idx)?;
        if header.key_flags() & key_flags::EXTENDED == 0 {
            let slot = build_slot(
                ks,
                header.key_len(),
                0,
                child,
                node.inline_key(src_idx)?,
            );
            return Ok(slot);
        }
        (header.key_len() as usize, true)
    };
    debug_assert!(extended);

    let full = full_key(pager, txn.key_arena(), src, src_idx)?;
    let new_blob = blob::alloc(pager, full).wrap_err("copying separator key blob")?;
    let mut inline = Vec::with_capacity(ks);
    inline.extend_from_slice(&full[..ks - EXTENDED_BLOB_REF_SIZE]);
    inline.extend_from_slice(&new_blob.to_le_bytes());
    Ok(build_slot(
        ks,
        key_len as u16,
        key_flags::EXTENDED,
        child,
        &inline,
    ))
}

/// Replaces the record of an existing key in place.
fn overwrite_record(pager: &mut Pager, leaf: PageId, idx: usize, record: &[u8]) -> Result<()> {
    let ks = pager.key_size();
    let (old_ptr, old_flags) = {
        let page = fetch_index(pager, leaf)?;
        let node = Node::new(page.payload(), ks)?;
        let header = node.slot_header(idx)?;
        (header.record_ptr(), header.key_flags())
    };

    if RecordPtr::is_blob(old_flags) {
        blob::free(pager, old_ptr).wrap_err("freeing overwritten record blob")?;
    }

    let (ptr_word, rec_flags) = match RecordPtr::encode_inline(record) {
        Some(encoded) => encoded,
        None => RecordPtr::encode_blob(blob::alloc(pager, record)?),
    };

    let page = fetch_index(pager, leaf)?;
    let mut node = NodeMut::new(page.payload_mut(), ks)?;
    let header = node.slot_header_mut(idx)?;
    header.set_record_ptr(ptr_word);
    header.set_key_flags((old_flags & key_flags::EXTENDED) | rec_flags);
    Ok(())
}

/// Inserts a built slot into the leaf, splitting upward as needed.
fn insert_at(
    pager: &mut Pager,
    txn: &Txn,
    leaf: PageId,
    idx: usize,
    slot: Vec<u8>,
    path: Path,
) -> Result<()> {
    let ks = pager.key_size();
    let has_room = {
        let page = fetch_index(pager, leaf)?;
        let node = Node::new(page.payload(), ks)?;
        node.key_count() < node.capacity()
    };

    if has_room {
        let page = fetch_index(pager, leaf)?;
        return NodeMut::new(page.payload_mut(), ks)?.insert_slot(idx, &slot);
    }

    let (separator, new_right) = split_leaf(pager, txn, leaf, idx, &slot)?;
    propagate_split(pager, path, leaf, new_right, separator)
}

/// Splits a full leaf around an incoming slot. Returns the separator slot
/// (keyed by the right half's minimum, pointing at the left half) and the
/// new right page.
fn split_leaf(
    pager: &mut Pager,
    txn: &Txn,
    leaf: PageId,
    insert_idx: usize,
    slot: &[u8],
) -> Result<(Vec<u8>, PageId)> {
    let ks = pager.key_size();
    let width = slot.len();

    let new_page = pager.alloc(PageType::Index)?;
    let result = (|| -> Result<(Vec<u8>, PageId)> {
        // Combined slot array with the new slot in position.
        let mut combined = {
            let page = fetch_index(pager, leaf)?;
            let node = Node::new(page.payload(), ks)?;
            let count = node.key_count();
            let mut bytes = Vec::with_capacity((count + 1) * width);
            for i in 0..count {
                bytes.extend_from_slice(node.raw_slot(i)?);
            }
            bytes
        };
        combined.splice(insert_idx * width..insert_idx * width, slot.iter().copied());

        let total = combined.len() / width;
        let mid = total / 2;

        {
            let page = fetch_index(pager, leaf)?;
            let mut node = NodeMut::new(page.payload_mut(), ks)?;
            node.truncate(0)?;
            node.append_slots(&combined[..mid * width])?;
        }
        {
            let page = fetch_index(pager, new_page)?;
            let mut node = NodeMut::init(page.payload_mut(), ks, true)?;
            node.append_slots(&combined[mid * width..])?;
        }

        let separator = copy_separator(pager, txn, new_page, 0, leaf)?;
        pager.metrics_mut().btree_splits += 1;
        Ok((separator, new_page))
    })();

    match result {
        Ok(done) => Ok(done),
        Err(e) => {
            // The split page is provisional until the separator lands in
            // the parent; put it back on the freelist.
            let _ = pager.free(new_page);
            Err(e)
        }
    }
}

/// Carries a separator up the recorded path, splitting internal nodes as
/// they fill, and grows a new root when the split reaches the top.
fn propagate_split(
    pager: &mut Pager,
    mut path: Path,
    mut left: PageId,
    mut right: PageId,
    mut separator: Vec<u8>,
) -> Result<()> {
    let ks = pager.key_size();

    while let Some((parent, child_idx)) = path.pop() {
        set_raw_slot_ptr(&mut separator, left);

        let has_room = {
            let page = fetch_index(pager, parent)?;
            let node = Node::new(page.payload(), ks)?;
            node.key_count() < node.capacity()
        };

        if has_room {
            let page = fetch_index(pager, parent)?;
            let mut node = NodeMut::new(page.payload_mut(), ks)?;
            if child_idx == node.key_count() {
                // Left was the rightmost child.
                node.insert_slot(child_idx, &separator)?;
                node.set_right_child(right);
            } else {
                node.insert_slot(child_idx, &separator)?;
                node.slot_header_mut(child_idx + 1)?.set_record_ptr(right);
            }
            return Ok(());
        }

        let (promoted, parent_right) =
            split_internal(pager, parent, child_idx, &separator, right)?;
        separator = promoted;
        left = parent;
        right = parent_right;
    }

    // The root itself split.
    set_raw_slot_ptr(&mut separator, left);
    let new_root = pager.alloc(PageType::Index)?;
    {
        let page = fetch_index(pager, new_root)?;
        let mut node = NodeMut::init(page.payload_mut(), ks, false)?;
        node.set_right_child(right);
        node.insert_slot(0, &separator)?;
    }
    pager.set_root_page(new_root);
    Ok(())
}

/// Splits a full internal node around an incoming separator. The middle
/// slot's key moves up; its child becomes the left half's rightmost child.
fn split_internal(
    pager: &mut Pager,
    node_id: PageId,
    child_idx: usize,
    separator: &[u8],
    right_child_of_sep: PageId,
) -> Result<(Vec<u8>, PageId)> {
    let ks = pager.key_size();
    let width = separator.len();

    let new_page = pager.alloc(PageType::Index)?;
    let result = (|| -> Result<(Vec<u8>, PageId)> {
        let (mut combined, mut combined_rc, count) = {
            let page = fetch_index(pager, node_id)?;
            let node = Node::new(page.payload(), ks)?;
            let count = node.key_count();
            let mut bytes = Vec::with_capacity((count + 1) * width);
            for i in 0..count {
                bytes.extend_from_slice(node.raw_slot(i)?);
            }
            (bytes, node.right_child(), count)
        };

        combined.splice(
            child_idx * width..child_idx * width,
            separator.iter().copied(),
        );
        if child_idx < count {
            let next = (child_idx + 1) * width;
            set_raw_slot_ptr(&mut combined[next..next + width], right_child_of_sep);
        } else {
            combined_rc = right_child_of_sep;
        }

        let total = count + 1;
        let mid = total / 2;
        let promoted = combined[mid * width..(mid + 1) * width].to_vec();
        let promoted_child = raw_slot_ptr(&promoted);

        {
            let page = fetch_index(pager, node_id)?;
            let mut node = NodeMut::new(page.payload_mut(), ks)?;
            node.truncate(0)?;
            node.append_slots(&combined[..mid * width])?;
            node.set_right_child(promoted_child);
        }
        {
            let page = fetch_index(pager, new_page)?;
            let mut node = NodeMut::init(page.payload_mut(), ks, false)?;
            node.append_slots(&combined[(mid + 1) * width..])?;
            node.set_right_child(combined_rc);
        }

        pager.metrics_mut().btree_splits += 1;
        Ok((promoted, new_page))
    })();

    match result {
        Ok(done) => Ok(done),
        Err(e) => {
            let _ = pager.free(new_page);
            Err(e)
        }
    }
}

/// Walks back up after an erase, fixing any node that dropped below the
/// minimum fill, and collapses the root when it empties out.
fn rebalance_path(
    pager: &mut Pager,
    txn: &Txn,
    leaf: PageId,
    mut path: Path,
) -> Result<()> {
    let ks = pager.key_size();
    let mut current = leaf;

    loop {
        let (count, is_leaf, right_child) = {
            let page = fetch_index(pager, current)?;
            let node = Node::new(page.payload(), ks)?;
            (node.key_count(), node.is_leaf(), node.right_child())
        };

        let Some(&(parent, child_idx)) = path.last() else {
            // `current` is the root.
            if count == 0 {
                if is_leaf {
                    pager.free(current)?;
                    pager.set_root_page(0);
                } else {
                    pager.set_root_page(right_child);
                    pager.free(current)?;
                }
            }
            return Ok(());
        };

        if count >= min_keys(pager) {
            return Ok(());
        }

        let merged = rebalance_node(pager, txn, parent, child_idx, current)?;
        if !merged {
            return Ok(());
        }
        path.pop();
        current = parent;
    }
}

/// Fixes one underfull node through its parent: borrow from a sibling if
/// one is above the minimum, otherwise merge. Returns true when a merge
/// removed a separator from the parent (which may now be underfull
/// itself).
fn rebalance_node(
    pager: &mut Pager,
    txn: &Txn,
    parent: PageId,
    child_idx: usize,
    node_id: PageId,
) -> Result<bool> {
    let ks = pager.key_size();
    let min = min_keys(pager);
    let cap = capacity(pager);

    let (parent_count, left_sib, right_sib) = {
        let page = fetch_index(pager, parent)?;
        let node = Node::new(page.payload(), ks)?;
        let parent_count = node.key_count();
        let left = if child_idx > 0 {
            Some(node.child(child_idx - 1)?)
        } else {
            None
        };
        let right = if child_idx < parent_count {
            Some(if child_idx + 1 == parent_count {
                node.right_child()
            } else {
                node.child(child_idx + 1)?
            })
        } else {
            None
        };
        (parent_count, left, right)
    };
    ensure!(parent_count > 0, "internal node {} has no separators", parent);

    let (node_count, node_is_leaf) = {
        let page = fetch_index(pager, node_id)?;
        let node = Node::new(page.payload(), ks)?;
        (node.key_count(), node.is_leaf())
    };

    let sib_count = |pager: &mut Pager, id: PageId| -> Result<usize> {
        let page = fetch_index(pager, id)?;
        Ok(Node::new(page.payload(), ks)?.key_count())
    };

    if let Some(left) = left_sib {
        if sib_count(pager, left)? > min {
            borrow_from_left(pager, txn, parent, child_idx, left, node_id, node_is_leaf)?;
            return Ok(false);
        }
    }
    if let Some(right) = right_sib {
        if sib_count(pager, right)? > min {
            borrow_from_right(pager, txn, parent, child_idx, node_id, right, node_is_leaf)?;
            return Ok(false);
        }
    }

    let overhead = if node_is_leaf { 0 } else { 1 };
    if let Some(left) = left_sib {
        if sib_count(pager, left)? + node_count + overhead <= cap {
            merge_nodes(pager, parent, child_idx - 1, left, node_id, node_is_leaf)?;
            return Ok(true);
        }
    }
    if let Some(right) = right_sib {
        if node_count + sib_count(pager, right)? + overhead <= cap {
            merge_nodes(pager, parent, child_idx, node_id, right, node_is_leaf)?;
            return Ok(true);
        }
    }

    // No sibling can lend or absorb; tolerate the underfull node.
    Ok(false)
}

fn borrow_from_left(
    pager: &mut Pager,
    txn: &Txn,
    parent: PageId,
    child_idx: usize,
    left: PageId,
    node_id: PageId,
    is_leaf: bool,
) -> Result<()> {
    let ks = pager.key_size();
    let sep_idx = child_idx - 1;

    if is_leaf {
        let moved = {
            let page = fetch_index(pager, left)?;
            let node = Node::new(page.payload(), ks)?;
            node.raw_slot(node.key_count() - 1)?.to_vec()
        };
        {
            let page = fetch_index(pager, left)?;
            let mut node = NodeMut::new(page.payload_mut(), ks)?;
            let last = node.key_count() - 1;
            node.remove_slot(last)?;
        }
        {
            let page = fetch_index(pager, node_id)?;
            NodeMut::new(page.payload_mut(), ks)?.insert_slot(0, &moved)?;
        }
        // The moved key is the node's new minimum and becomes the
        // separator.
        replace_separator(pager, txn, parent, sep_idx, node_id, 0)?;
        return Ok(());
    }

    // Internal rotation: the separator key comes down, the left sibling's
    // last key goes up. Key-blob ownership moves with the slot bytes.
    let left_rc = {
        let page = fetch_index(pager, left)?;
        Node::new(page.payload(), ks)?.right_child()
    };
    let mut new_front = {
        let page = fetch_index(pager, parent)?;
        Node::new(page.payload(), ks)?.raw_slot(sep_idx)?.to_vec()
    };
    set_raw_slot_ptr(&mut new_front, left_rc);
    {
        let page = fetch_index(pager, node_id)?;
        NodeMut::new(page.payload_mut(), ks)?.insert_slot(0, &new_front)?;
    }

    let (mut new_sep, left_last_child) = {
        let page = fetch_index(pager, left)?;
        let node = Node::new(page.payload(), ks)?;
        let last = node.key_count() - 1;
        let raw = node.raw_slot(last)?.to_vec();
        let child = raw_slot_ptr(&raw);
        (raw, child)
    };
    set_raw_slot_ptr(&mut new_sep, left);
    {
        let page = fetch_index(pager, parent)?;
        NodeMut::new(page.payload_mut(), ks)?.replace_slot(sep_idx, &new_sep)?;
    }
    {
        let page = fetch_index(pager, left)?;
        let mut node = NodeMut::new(page.payload_mut(), ks)?;
        let last = node.key_count() - 1;
        node.set_right_child(left_last_child);
        node.remove_slot(last)?;
    }
    Ok(())
}

fn borrow_from_right(
    pager: &mut Pager,
    txn: &Txn,
    parent: PageId,
    child_idx: usize,
    node_id: PageId,
    right: PageId,
    is_leaf: bool,
) -> Result<()> {
    let ks = pager.key_size();
    let sep_idx = child_idx;

    if is_leaf {
        let moved = {
            let page = fetch_index(pager, right)?;
            Node::new(page.payload(), ks)?.raw_slot(0)?.to_vec()
        };
        {
            let page = fetch_index(pager, right)?;
            NodeMut::new(page.payload_mut(), ks)?.remove_slot(0)?;
        }
        {
            let page = fetch_index(pager, node_id)?;
            let mut node = NodeMut::new(page.payload_mut(), ks)?;
            let count = node.key_count();
            node.insert_slot(count, &moved)?;
        }
        // The right sibling's new minimum separates the two leaves.
        replace_separator(pager, txn, parent, sep_idx, right, 0)?;
        return Ok(());
    }

    let node_rc = {
        let page = fetch_index(pager, node_id)?;
        Node::new(page.payload(), ks)?.right_child()
    };
    let mut new_back = {
        let page = fetch_index(pager, parent)?;
        Node::new(page.payload(), ks)?.raw_slot(sep_idx)?.to_vec()
    };
    set_raw_slot_ptr(&mut new_back, node_rc);

    let (mut new_sep, right_first_child) = {
        let page = fetch_index(pager, right)?;
        let node = Node::new(page.payload(), ks)?;
        let raw = node.raw_slot(0)?.to_vec();
        let child = raw_slot_ptr(&raw);
        (raw, child)
    };
    set_raw_slot_ptr(&mut new_sep, node_id);

    {
        let page = fetch_index(pager, node_id)?;
        let mut node = NodeMut::new(page.payload_mut(), ks)?;
        let count = node.key_count();
        node.insert_slot(count, &new_back)?;
        node.set_right_child(right_first_child);
    }
    {
        let page = fetch_index(pager, parent)?;
        NodeMut::new(page.payload_mut(), ks)?.replace_slot(sep_idx, &new_sep)?;
    }
    {
        let page = fetch_index(pager, right)?;
        NodeMut::new(page.payload_mut(), ks)?.remove_slot(0)?;
    }
    Ok(())
}

/// Rewrites the parent separator at `sep_idx` with a copy of the key at
/// (`src`, `src_idx`), keeping the existing child pointer and freeing the
/// old separator's key blob.
fn replace_separator(
    pager: &mut Pager,
    txn: &Txn,
    parent: PageId,
    sep_idx: usize,
    src: PageId,
    src_idx: usize,
) -> Result<()> {
    let ks = pager.key_size();
    let (old_key_blob, child) = {
        let page = fetch_index(pager, parent)?;
        let node = Node::new(page.payload(), ks)?;
        (node.key_blob_id(sep_idx)?, node.child(sep_idx)?)
    };

    let new_slot = copy_separator(pager, txn, src, src_idx, child)?;
    if let Some(kb) = old_key_blob {
        blob::free(pager, kb).wrap_err("freeing replaced separator key blob")?;
    }

    let page = fetch_index(pager, parent)?;
    NodeMut::new(page.payload_mut(), ks)?.replace_slot(sep_idx, &new_slot)
}

/// Merges the right node into the left and removes the separator between
/// them from the parent. `sep_idx` is the parent slot separating the two;
/// its child is the left node.
fn merge_nodes(
    pager: &mut Pager,
    parent: PageId,
    sep_idx: usize,
    left: PageId,
    right: PageId,
    is_leaf: bool,
) -> Result<()> {
    let ks = pager.key_size();

    if !is_leaf {
        // The separator key comes down between the two halves.
        let left_rc = {
            let page = fetch_index(pager, left)?;
            Node::new(page.payload(), ks)?.right_child()
        };
        let mut sep = {
            let page = fetch_index(pager, parent)?;
            Node::new(page.payload(), ks)?.raw_slot(sep_idx)?.to_vec()
        };
        set_raw_slot_ptr(&mut sep, left_rc);
        let page = fetch_index(pager, left)?;
        NodeMut::new(page.payload_mut(), ks)?.append_slots(&sep)?;
    } else {
        // A leaf separator is a copy; its key blob dies with it.
        let sep_key_blob = {
            let page = fetch_index(pager, parent)?;
            Node::new(page.payload(), ks)?.key_blob_id(sep_idx)?
        };
        if let Some(kb) = sep_key_blob {
            blob::free(pager, kb).wrap_err("freeing merged separator key blob")?;
        }
    }

    let (right_slots, right_rc) = {
        let page = fetch_index(pager, right)?;
        let node = Node::new(page.payload(), ks)?;
        let count = node.key_count();
        let mut bytes = Vec::new();
        for i in 0..count {
            bytes.extend_from_slice(node.raw_slot(i)?);
        }
        (bytes, node.right_child())
    };
    {
        let page = fetch_index(pager, left)?;
        let mut node = NodeMut::new(page.payload_mut(), ks)?;
        node.append_slots(&right_slots)?;
        if !is_leaf {
            node.set_right_child(right_rc);
        }
    }

    {
        let page = fetch_index(pager, parent)?;
        let mut node = NodeMut::new(page.payload_mut(), ks)?;
        let count = node.key_count();
        // Whatever referenced the right node now references the merged one.
        if sep_idx + 1 < count {
            node.slot_header_mut(sep_idx + 1)?.set_record_ptr(left);
        } else {
            node.set_right_child(left);
        }
        node.remove_slot(sep_idx)?;
    }

    pager.free(right)?;
    pager.metrics_mut().btree_merges += 1;
    Ok(())
}

/// Recursive in-order traversal delivering materialised keys and records.
fn scan_node(
    pager: &mut Pager,
    page_id: PageId,
    scratch: &mut Bump,
    visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
) -> Result<()> {
    let ks = pager.key_size();
    let (is_leaf, count, children): (bool, usize, SmallVec<[PageId; 32]>) = {
        let page = fetch_index(pager, page_id)?;
        let node = Node::new(page.payload(), ks)?;
        let count = node.key_count();
        if node.is_leaf() {
            (true, count, SmallVec::new())
        } else {
            let mut children = SmallVec::with_capacity(count + 1);
            for i in 0..count {
                children.push(node.child(i)?);
            }
            children.push(node.right_child());
            (false, count, children)
        }
    };

    if !is_leaf {
        for child in children {
            scan_node(pager, child, scratch, visit)?;
        }
        return Ok(());
    }

    for i in 0..count {
        scratch.reset();
        let key = full_key(pager, scratch, page_id, i)?;
        let (ptr, flags) = {
            let page = fetch_index(pager, page_id)?;
            let node = Node::new(page.payload(), ks)?;
            let header = node.slot_header(i)?;
            (header.record_ptr(), header.key_flags())
        };
        let record: &[u8] = match RecordPtr::decode(ptr, flags & key_flags::INLINE_MASK) {
            RecordPtr::Blob(blob_id) => blob::read(pager, scratch, blob_id)?,
            inline => scratch.alloc_slice_copy(inline.inline_bytes().expect("inline record")),
        };
        visit(key, record)?;
    }
    Ok(())
}

/// Depth-first structural verification: page types, slot ordering, child
/// separation, uniform leaf depth.
#[allow(clippy::too_many_arguments)]
fn walk_checked(
    pager: &mut Pager,
    cmp: &Comparators,
    page_id: PageId,
    depth: usize,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    is_root: bool,
    leaf_depth: &mut Option<usize>,
) -> Result<()> {
    let ks = pager.key_size();

    ensure!(
        !pager.freelist().contains(page_id),
        "node {} is reachable from the root but also free",
        page_id
    );

    let (is_leaf, count, right_child) = {
        let page = pager.fetch(page_id)?;
        ensure!(
            page.kind() == PageType::Index,
            "page {} reachable as a node but typed {:?}",
            page_id,
            page.kind()
        );
        let node = Node::new(page.payload(), ks)?;
        ensure!(
            node.key_count() <= node.capacity(),
            "node {} claims {} keys, capacity {}",
            page_id,
            node.key_count(),
            node.capacity()
        );
        (node.is_leaf(), node.key_count(), node.right_child())
    };

    ensure!(
        is_root || count >= 1,
        "non-root node {} is empty",
        page_id
    );

    // Keys strictly ascending and inside the separator bounds.
    let scratch = Bump::new();
    let mut keys: Vec<Vec<u8>> = Vec::with_capacity(count);
    for i in 0..count {
        let key = full_key(pager, &scratch, page_id, i)?.to_vec();
        if let Some(prev) = keys.last() {
            ensure!(
                (cmp.compare)(prev, &key) == Ordering::Less,
                "node {} keys out of order at slot {}",
                page_id,
                i
            );
        }
        keys.push(key);
    }
    if let (Some(lower), Some(first)) = (lower.as_ref(), keys.first()) {
        ensure!(
            (cmp.compare)(lower, first) != Ordering::Greater,
            "node {} violates its lower bound",
            page_id
        );
    }
    if let (Some(upper), Some(last)) = (upper.as_ref(), keys.last()) {
        ensure!(
            (cmp.compare)(last, upper) == Ordering::Less,
            "node {} violates its upper bound",
            page_id
        );
    }

    if is_leaf {
        match *leaf_depth {
            None => *leaf_depth = Some(depth),
            Some(expected) => ensure!(
                expected == depth,
                "leaf {} at depth {}, expected {}",
                page_id,
                depth,
                expected
            ),
        }
        return Ok(());
    }

    ensure!(right_child != 0, "internal node {} has no rightmost child", page_id);

    let children: Vec<PageId> = {
        let page = pager.fetch(page_id)?;
        let node = Node::new(page.payload(), ks)?;
        (0..count).map(|i| node.child(i)).collect::<Result<_>>()?
    };

    for (i, &child) in children.iter().enumerate() {
        let child_lower = if i == 0 {
            lower.clone()
        } else {
            Some(keys[i - 1].clone())
        };
        walk_checked(
            pager,
            cmp,
            child,
            depth + 1,
            child_lower,
            Some(keys[i].clone()),
            false,
            leaf_depth,
        )?;
    }
    walk_checked(
        pager,
        cmp,
        right_child,
        depth + 1,
        keys.last().cloned(),
        upper,
        false,
        leaf_depth,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemDevice;
    use crate::txn::TXN_TEMPORARY;

    fn setup(page_size: u16, key_size: u16) -> (Pager, BtreeBackend, Comparators, Txn) {
        let pager =
            Pager::create(Box::new(MemDevice::new()), 0, page_size, key_size, 16).unwrap();
        (
            pager,
            BtreeBackend::new(),
            Comparators::default(),
            Txn::begin(TXN_TEMPORARY),
        )
    }

    fn lookup(
        backend: &mut BtreeBackend,
        pager: &mut Pager,
        txn: &Txn,
        cmp: &Comparators,
        key: &[u8],
    ) -> Option<Vec<u8>> {
        match backend.find(pager, txn, cmp, key) {
            Ok(found) => {
                let decoded =
                    RecordPtr::decode(found.record_ptr, found.intflags & key_flags::INLINE_MASK);
                match decoded {
                    RecordPtr::Blob(id) => {
                        let arena = Bump::new();
                        Some(blob::read(pager, &arena, id).unwrap().to_vec())
                    }
                    inline => Some(inline.inline_bytes().unwrap().to_vec()),
                }
            }
            Err(e) => {
                assert_eq!(Error::kind_of(&e), Some(Error::KeyNotFound));
                None
            }
        }
    }

    #[test]
    fn find_on_empty_tree_is_key_not_found() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);

        let err = backend.find(&mut pager, &txn, &cmp, b"nope").unwrap_err();
        assert_eq!(Error::kind_of(&err), Some(Error::KeyNotFound));
    }

    #[test]
    fn first_insert_allocates_the_root() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);
        assert_eq!(pager.root_page(), 0);

        backend
            .insert(&mut pager, &txn, &cmp, b"hello", b"world", 0)
            .unwrap();

        assert_ne!(pager.root_page(), 0);
        assert_eq!(
            lookup(&mut backend, &mut pager, &txn, &cmp, b"hello"),
            Some(b"world".to_vec())
        );
    }

    #[test]
    fn duplicate_key_is_rejected_without_overwrite() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);
        backend.insert(&mut pager, &txn, &cmp, b"k", b"v1", 0).unwrap();

        let err = backend
            .insert(&mut pager, &txn, &cmp, b"k", b"v2", 0)
            .unwrap_err();
        assert_eq!(Error::kind_of(&err), Some(Error::DuplicateKey));

        assert_eq!(
            lookup(&mut backend, &mut pager, &txn, &cmp, b"k"),
            Some(b"v1".to_vec())
        );
    }

    #[test]
    fn overwrite_replaces_the_record() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);
        backend.insert(&mut pager, &txn, &cmp, b"k", b"v1", 0).unwrap();

        backend
            .insert(&mut pager, &txn, &cmp, b"k", b"second", insert_flags::OVERWRITE)
            .unwrap();

        assert_eq!(
            lookup(&mut backend, &mut pager, &txn, &cmp, b"k"),
            Some(b"second".to_vec())
        );
    }

    #[test]
    fn overwrite_frees_the_old_record_blob() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);
        let big = vec![7u8; 600];
        backend.insert(&mut pager, &txn, &cmp, b"k", &big, 0).unwrap();

        let free_before = pager.freelist().len();
        backend
            .insert(&mut pager, &txn, &cmp, b"k", b"tiny", insert_flags::OVERWRITE)
            .unwrap();

        assert!(pager.freelist().len() > free_before);
        assert_eq!(
            lookup(&mut backend, &mut pager, &txn, &cmp, b"k"),
            Some(b"tiny".to_vec())
        );
    }

    #[test]
    fn ascending_inserts_split_and_stay_searchable() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);

        for i in 0..300u32 {
            let key = format!("key{:05}", i);
            let value = i.to_le_bytes();
            backend
                .insert(&mut pager, &txn, &cmp, key.as_bytes(), &value, 0)
                .unwrap();
        }

        assert!(pager.metrics().btree_splits >= 2);
        backend.check_integrity(&mut pager, &txn, &cmp).unwrap();

        for i in 0..300u32 {
            let key = format!("key{:05}", i);
            assert_eq!(
                lookup(&mut backend, &mut pager, &txn, &cmp, key.as_bytes()),
                Some(i.to_le_bytes().to_vec()),
                "missing {}",
                key
            );
        }
    }

    #[test]
    fn descending_inserts_stay_searchable() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);

        for i in (0..200u32).rev() {
            let key = format!("key{:05}", i);
            backend
                .insert(&mut pager, &txn, &cmp, key.as_bytes(), &i.to_le_bytes(), 0)
                .unwrap();
        }

        backend.check_integrity(&mut pager, &txn, &cmp).unwrap();
        for i in 0..200u32 {
            let key = format!("key{:05}", i);
            assert!(lookup(&mut backend, &mut pager, &txn, &cmp, key.as_bytes()).is_some());
        }
    }

    #[test]
    fn erase_missing_key_is_key_not_found() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);
        backend.insert(&mut pager, &txn, &cmp, b"a", b"1", 0).unwrap();

        let err = backend.erase(&mut pager, &txn, &cmp, b"b").unwrap_err();
        assert_eq!(Error::kind_of(&err), Some(Error::KeyNotFound));
    }

    #[test]
    fn erase_every_other_key_keeps_the_rest() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);

        for i in 0..300u32 {
            let key = format!("key{:05}", i);
            backend
                .insert(&mut pager, &txn, &cmp, key.as_bytes(), &i.to_le_bytes(), 0)
                .unwrap();
        }
        for i in (0..300u32).step_by(2) {
            let key = format!("key{:05}", i);
            backend.erase(&mut pager, &txn, &cmp, key.as_bytes()).unwrap();
        }

        backend.check_integrity(&mut pager, &txn, &cmp).unwrap();

        for i in 0..300u32 {
            let key = format!("key{:05}", i);
            let got = lookup(&mut backend, &mut pager, &txn, &cmp, key.as_bytes());
            if i % 2 == 0 {
                assert!(got.is_none(), "{} should be gone", key);
            } else {
                assert!(got.is_some(), "{} should remain", key);
            }
        }
    }

    #[test]
    fn erasing_everything_collapses_to_the_empty_tree() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);

        for i in 0..250u32 {
            let key = format!("key{:05}", i);
            backend
                .insert(&mut pager, &txn, &cmp, key.as_bytes(), &i.to_le_bytes(), 0)
                .unwrap();
        }
        assert!(pager.metrics().btree_splits > 0);

        for i in 0..250u32 {
            let key = format!("key{:05}", i);
            backend.erase(&mut pager, &txn, &cmp, key.as_bytes()).unwrap();
        }

        assert_eq!(pager.root_page(), 0);
        assert!(pager.metrics().btree_merges > 0);
        assert!(
            lookup(&mut backend, &mut pager, &txn, &cmp, b"key00000").is_none()
        );
    }

    #[test]
    fn extended_keys_roundtrip_and_free_their_blobs() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);
        let long_key = vec![b'x'; 100];

        backend
            .insert(&mut pager, &txn, &cmp, &long_key, b"payload", 0)
            .unwrap();
        assert_eq!(
            lookup(&mut backend, &mut pager, &txn, &cmp, &long_key),
            Some(b"payload".to_vec())
        );

        // A different long key with the same inline prefix must not match.
        let mut other = long_key.clone();
        *other.last_mut().unwrap() = b'y';
        assert!(lookup(&mut backend, &mut pager, &txn, &cmp, &other).is_none());

        let free_before = pager.freelist().len();
        backend.erase(&mut pager, &txn, &cmp, &long_key).unwrap();
        assert!(pager.freelist().len() > free_before);
    }

    #[test]
    fn extended_keys_survive_splits() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);

        for i in 0..120u32 {
            let key = format!("long-key-{:05}-{}", i, "p".repeat(40));
            backend
                .insert(&mut pager, &txn, &cmp, key.as_bytes(), &i.to_le_bytes(), 0)
                .unwrap();
        }

        backend.check_integrity(&mut pager, &txn, &cmp).unwrap();
        for i in 0..120u32 {
            let key = format!("long-key-{:05}-{}", i, "p".repeat(40));
            assert_eq!(
                lookup(&mut backend, &mut pager, &txn, &cmp, key.as_bytes()),
                Some(i.to_le_bytes().to_vec())
            );
        }
    }

    #[test]
    fn scan_visits_keys_in_order() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);

        for i in [5u32, 1, 4, 2, 3] {
            let key = format!("k{}", i);
            backend
                .insert(&mut pager, &txn, &cmp, key.as_bytes(), &i.to_le_bytes(), 0)
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut visitor = |key: &[u8], record: &[u8]| -> eyre::Result<()> {
            seen.push((key.to_vec(), record.to_vec()));
            Ok(())
        };
        backend.scan(&mut pager, &txn, &mut visitor).unwrap();

        let keys: Vec<Vec<u8>> = seen.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec(), b"k4".to_vec(), b"k5".to_vec()]);
        assert_eq!(seen[0].1, 1u32.to_le_bytes().to_vec());
    }

    #[test]
    fn dump_reports_every_key_once() {
        let (mut pager, mut backend, cmp, txn) = setup(512, 16);
        for i in 0..50u32 {
            let key = format!("k{:03}", i);
            backend
                .insert(&mut pager, &txn, &cmp, key.as_bytes(), b"", 0)
                .unwrap();
        }

        let mut count = 0usize;
        backend
            .dump(&mut pager, &txn, &mut |_key| count += 1)
            .unwrap();
        assert_eq!(count, 50);
    }
}
