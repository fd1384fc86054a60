//! # B-Tree Node Layout
//!
//! A node is the payload of an `Index` page: a 16-byte node header followed
//! by an array of fixed-width slots. Slot width is fixed at create time by
//! the configured key size, so slots can be inserted, removed and moved
//! between nodes as plain byte ranges.
//!
//! ## Node Header (16 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  --------------------------------------
//! 0       1     flags        0x01 = leaf
//! 1       1     reserved
//! 2       2     key_count    Live slots
//! 4       4     reserved
//! 8       8     right_child  Rightmost child page id (internal only)
//! ```
//!
//! ## Slot (12 bytes + key size)
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  ---------------------------------------
//! 0       2     key_len     Full key length in bytes
//! 2       1     key_flags   Inline size class / extended bit
//! 3       1     reserved
//! 4       8     record_ptr  Record pointer (leaf) or child id (internal)
//! 12      K     key bytes   Inline key, zero padded
//! ```
//!
//! A key longer than K is extended: bytes `[0..K-8)` of the key area hold
//! the key prefix and the last 8 bytes hold the id of a blob containing
//! the full key.
//!
//! In an internal node the subtree at slot `i` holds keys strictly less
//! than slot `i`'s key, and the header's rightmost child holds keys greater
//! than or equal to the last slot's key.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::record::key_flags;
use crate::storage::PageId;

pub const NODE_HEADER_SIZE: usize = 16;
pub const SLOT_FIXED_SIZE: usize = 12;

pub const NODE_FLAG_LEAF: u8 = 0x01;

/// Inline key bytes sacrificed to the key-blob id when a key is extended.
pub const EXTENDED_BLOB_REF_SIZE: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    flags: u8,
    reserved: u8,
    key_count: U16,
    reserved2: [u8; 4],
    right_child: U64,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    pub fn is_leaf(&self) -> bool {
        self.flags & NODE_FLAG_LEAF != 0
    }

    crate::le_accessors! {
        key_count: u16,
        right_child: u64,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SlotHeader {
    key_len: U16,
    key_flags: u8,
    reserved: u8,
    record_ptr: U64,
}

const _: () = assert!(std::mem::size_of::<SlotHeader>() == SLOT_FIXED_SIZE);

impl SlotHeader {
    pub fn key_flags(&self) -> u8 {
        self.key_flags
    }

    pub fn set_key_flags(&mut self, flags: u8) {
        self.key_flags = flags;
    }

    crate::le_accessors! {
        key_len: u16,
        record_ptr: u64,
    }
}

/// Builds the raw bytes of one slot. `key` must already fit the inline
/// area; extended keys pass their prefix plus blob reference.
pub fn build_slot(
    key_size: usize,
    key_len: u16,
    flags: u8,
    record_ptr: u64,
    inline_key: &[u8],
) -> Vec<u8> {
    debug_assert!(inline_key.len() <= key_size);
    let mut slot = vec![0u8; SLOT_FIXED_SIZE + key_size];
    slot[0..2].copy_from_slice(&key_len.to_le_bytes());
    slot[2] = flags;
    slot[4..12].copy_from_slice(&record_ptr.to_le_bytes());
    slot[SLOT_FIXED_SIZE..SLOT_FIXED_SIZE + inline_key.len()].copy_from_slice(inline_key);
    slot
}

/// Record-pointer word of raw slot bytes.
pub fn raw_slot_ptr(slot: &[u8]) -> u64 {
    u64::from_le_bytes(slot[4..12].try_into().unwrap())
}

/// Overwrites the record-pointer word of raw slot bytes.
pub fn set_raw_slot_ptr(slot: &mut [u8], ptr: u64) {
    slot[4..12].copy_from_slice(&ptr.to_le_bytes());
}

/// Read-only view of a node within a page payload.
pub struct Node<'a> {
    data: &'a [u8],
    key_size: usize,
}

/// Mutable view of a node within a page payload.
pub struct NodeMut<'a> {
    data: &'a mut [u8],
    key_size: usize,
}

fn slot_size(key_size: usize) -> usize {
    SLOT_FIXED_SIZE + key_size
}

pub fn node_capacity(payload_len: usize, key_size: usize) -> usize {
    (payload_len - NODE_HEADER_SIZE) / slot_size(key_size)
}

impl<'a> Node<'a> {
    pub fn new(data: &'a [u8], key_size: usize) -> Result<Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE + slot_size(key_size),
            "page payload too small for a node: {} bytes",
            data.len()
        );
        Ok(Self { data, key_size })
    }

    fn header(&self) -> &NodeHeader {
        NodeHeader::ref_from_bytes(&self.data[..NODE_HEADER_SIZE]).expect("node header layout")
    }

    pub fn is_leaf(&self) -> bool {
        self.header().is_leaf()
    }

    pub fn key_count(&self) -> usize {
        self.header().key_count() as usize
    }

    pub fn right_child(&self) -> PageId {
        self.header().right_child()
    }

    pub fn capacity(&self) -> usize {
        node_capacity(self.data.len(), self.key_size)
    }

    /// Minimum fill for non-root nodes.
    pub fn min_keys(&self) -> usize {
        self.capacity().div_ceil(2)
    }

    fn slot_offset(&self, idx: usize) -> usize {
        NODE_HEADER_SIZE + idx * slot_size(self.key_size)
    }

    pub fn slot_header(&self, idx: usize) -> Result<&SlotHeader> {
        ensure!(idx < self.key_count(), "slot {} out of range", idx);
        let at = self.slot_offset(idx);
        SlotHeader::ref_from_bytes(&self.data[at..at + SLOT_FIXED_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse SlotHeader: {:?}", e))
    }

    fn key_area(&self, idx: usize) -> &'a [u8] {
        let at = self.slot_offset(idx) + SLOT_FIXED_SIZE;
        &self.data[at..at + self.key_size]
    }

    /// The inline bytes of the key at `idx`: the whole key, or the stored
    /// prefix when the key is extended.
    pub fn inline_key(&self, idx: usize) -> Result<&'a [u8]> {
        let header = self.slot_header(idx)?;
        let area = self.key_area(idx);
        if header.key_flags() & key_flags::EXTENDED != 0 {
            Ok(&area[..self.key_size - EXTENDED_BLOB_REF_SIZE])
        } else {
            Ok(&area[..(header.key_len() as usize).min(self.key_size)])
        }
    }

    /// The key-blob id of an extended key.
    pub fn key_blob_id(&self, idx: usize) -> Result<Option<PageId>> {
        let header = self.slot_header(idx)?;
        if header.key_flags() & key_flags::EXTENDED == 0 {
            return Ok(None);
        }
        let area = self.key_area(idx);
        let at = self.key_size - EXTENDED_BLOB_REF_SIZE;
        Ok(Some(u64::from_le_bytes(area[at..].try_into().unwrap())))
    }

    /// The child page referenced by slot `idx` of an internal node.
    pub fn child(&self, idx: usize) -> Result<PageId> {
        Ok(self.slot_header(idx)?.record_ptr())
    }

    /// Raw bytes of one slot, for moving it between nodes.
    pub fn raw_slot(&self, idx: usize) -> Result<&'a [u8]> {
        ensure!(idx < self.key_count(), "slot {} out of range", idx);
        let at = self.slot_offset(idx);
        Ok(&self.data[at..at + slot_size(self.key_size)])
    }
}

impl<'a> NodeMut<'a> {
    pub fn new(data: &'a mut [u8], key_size: usize) -> Result<Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE + slot_size(key_size),
            "page payload too small for a node: {} bytes",
            data.len()
        );
        Ok(Self { data, key_size })
    }

    /// Formats a fresh node over the payload.
    pub fn init(data: &'a mut [u8], key_size: usize, leaf: bool) -> Result<Self> {
        let mut node = Self::new(data, key_size)?;
        node.data[..NODE_HEADER_SIZE].fill(0);
        node.header_mut().flags = if leaf { NODE_FLAG_LEAF } else { 0 };
        Ok(node)
    }

    pub fn as_ref(&self) -> Node<'_> {
        Node {
            data: self.data,
            key_size: self.key_size,
        }
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        NodeHeader::mut_from_bytes(&mut self.data[..NODE_HEADER_SIZE]).expect("node header layout")
    }

    pub fn key_count(&self) -> usize {
        self.as_ref().key_count()
    }

    pub fn capacity(&self) -> usize {
        node_capacity(self.data.len(), self.key_size)
    }

    pub fn set_right_child(&mut self, id: PageId) {
        self.header_mut().set_right_child(id);
    }

    pub fn slot_header_mut(&mut self, idx: usize) -> Result<&mut SlotHeader> {
        ensure!(idx < self.key_count(), "slot {} out of range", idx);
        let at = NODE_HEADER_SIZE + idx * slot_size(self.key_size);
        SlotHeader::mut_from_bytes(&mut self.data[at..at + SLOT_FIXED_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse SlotHeader: {:?}", e))
    }

    /// Inserts raw slot bytes at `idx`, shifting later slots right.
    pub fn insert_slot(&mut self, idx: usize, slot: &[u8]) -> Result<()> {
        let count = self.key_count();
        let width = slot_size(self.key_size);
        ensure!(slot.len() == width, "slot byte length mismatch");
        ensure!(count < self.capacity(), "node overflow");
        ensure!(idx <= count, "insert index {} out of range", idx);

        let start = NODE_HEADER_SIZE + idx * width;
        let end = NODE_HEADER_SIZE + count * width;
        self.data.copy_within(start..end, start + width);
        self.data[start..start + width].copy_from_slice(slot);
        self.header_mut().set_key_count(count as u16 + 1);
        Ok(())
    }

    /// Removes the slot at `idx`, shifting later slots left. The REMOVED
    /// state never persists; the shift happens before the mutation returns.
    pub fn remove_slot(&mut self, idx: usize) -> Result<()> {
        let count = self.key_count();
        ensure!(idx < count, "remove index {} out of range", idx);

        let width = slot_size(self.key_size);
        let start = NODE_HEADER_SIZE + (idx + 1) * width;
        let end = NODE_HEADER_SIZE + count * width;
        self.data.copy_within(start..end, start - width);
        self.header_mut().set_key_count(count as u16 - 1);
        Ok(())
    }

    /// Overwrites the slot at `idx` with new raw bytes.
    pub fn replace_slot(&mut self, idx: usize, slot: &[u8]) -> Result<()> {
        let width = slot_size(self.key_size);
        ensure!(slot.len() == width, "slot byte length mismatch");
        ensure!(idx < self.key_count(), "replace index {} out of range", idx);
        let at = NODE_HEADER_SIZE + idx * width;
        self.data[at..at + width].copy_from_slice(slot);
        Ok(())
    }

    /// Appends raw slot bytes (one or more contiguous slots).
    pub fn append_slots(&mut self, slots: &[u8]) -> Result<()> {
        let width = slot_size(self.key_size);
        ensure!(slots.len() % width == 0, "slot byte length mismatch");
        let adding = slots.len() / width;
        let count = self.key_count();
        ensure!(count + adding <= self.capacity(), "node overflow");

        let at = NODE_HEADER_SIZE + count * width;
        self.data[at..at + slots.len()].copy_from_slice(slots);
        self.header_mut().set_key_count((count + adding) as u16);
        Ok(())
    }

    /// Drops every slot at `from` and beyond.
    pub fn truncate(&mut self, from: usize) -> Result<()> {
        ensure!(from <= self.key_count(), "truncate index out of range");
        self.header_mut().set_key_count(from as u16);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_SIZE: usize = 16;
    const PAYLOAD: usize = 504;

    fn leaf_payload() -> Vec<u8> {
        let mut data = vec![0u8; PAYLOAD];
        NodeMut::init(&mut data, KEY_SIZE, true).unwrap();
        data
    }

    fn slot_for(key: &[u8], ptr: u64) -> Vec<u8> {
        build_slot(KEY_SIZE, key.len() as u16, key_flags::BLOB_SIZE_EMPTY, ptr, key)
    }

    #[test]
    fn header_and_slot_sizes() {
        assert_eq!(std::mem::size_of::<NodeHeader>(), 16);
        assert_eq!(std::mem::size_of::<SlotHeader>(), 12);
    }

    #[test]
    fn init_produces_empty_leaf() {
        let data = leaf_payload();
        let node = Node::new(&data, KEY_SIZE).unwrap();

        assert!(node.is_leaf());
        assert_eq!(node.key_count(), 0);
        assert_eq!(node.right_child(), 0);
        assert_eq!(node.capacity(), (PAYLOAD - NODE_HEADER_SIZE) / (12 + KEY_SIZE));
    }

    #[test]
    fn insert_keeps_slots_ordered_by_index() {
        let mut data = leaf_payload();
        let mut node = NodeMut::new(&mut data, KEY_SIZE).unwrap();

        node.insert_slot(0, &slot_for(b"bb", 2)).unwrap();
        node.insert_slot(0, &slot_for(b"aa", 1)).unwrap();
        node.insert_slot(2, &slot_for(b"cc", 3)).unwrap();

        let view = node.as_ref();
        assert_eq!(view.key_count(), 3);
        assert_eq!(view.inline_key(0).unwrap(), b"aa");
        assert_eq!(view.inline_key(1).unwrap(), b"bb");
        assert_eq!(view.inline_key(2).unwrap(), b"cc");
        assert_eq!(view.slot_header(1).unwrap().record_ptr(), 2);
    }

    #[test]
    fn remove_shifts_later_slots_left() {
        let mut data = leaf_payload();
        let mut node = NodeMut::new(&mut data, KEY_SIZE).unwrap();
        for (i, key) in [b"aa", b"bb", b"cc"].iter().enumerate() {
            node.insert_slot(i, &slot_for(*key, i as u64)).unwrap();
        }

        node.remove_slot(1).unwrap();

        let view = node.as_ref();
        assert_eq!(view.key_count(), 2);
        assert_eq!(view.inline_key(0).unwrap(), b"aa");
        assert_eq!(view.inline_key(1).unwrap(), b"cc");
    }

    #[test]
    fn raw_slot_moves_between_nodes() {
        let mut left = leaf_payload();
        let mut right = leaf_payload();

        {
            let mut node = NodeMut::new(&mut left, KEY_SIZE).unwrap();
            node.insert_slot(0, &slot_for(b"key", 77)).unwrap();
        }

        let raw = {
            let node = Node::new(&left, KEY_SIZE).unwrap();
            node.raw_slot(0).unwrap().to_vec()
        };

        let mut node = NodeMut::new(&mut right, KEY_SIZE).unwrap();
        node.append_slots(&raw).unwrap();

        let view = node.as_ref();
        assert_eq!(view.inline_key(0).unwrap(), b"key");
        assert_eq!(view.slot_header(0).unwrap().record_ptr(), 77);
    }

    #[test]
    fn extended_key_exposes_prefix_and_blob_id() {
        let mut data = leaf_payload();
        let long_key = b"0123456789abcdefXYZ";

        let mut inline = Vec::new();
        inline.extend_from_slice(&long_key[..KEY_SIZE - EXTENDED_BLOB_REF_SIZE]);
        inline.extend_from_slice(&42u64.to_le_bytes());
        let slot = build_slot(
            KEY_SIZE,
            long_key.len() as u16,
            key_flags::EXTENDED,
            7,
            &inline,
        );

        let mut node = NodeMut::new(&mut data, KEY_SIZE).unwrap();
        node.insert_slot(0, &slot).unwrap();

        let view = node.as_ref();
        assert_eq!(view.inline_key(0).unwrap(), &long_key[..8]);
        assert_eq!(view.key_blob_id(0).unwrap(), Some(42));
        assert_eq!(view.slot_header(0).unwrap().key_len() as usize, long_key.len());
    }

    #[test]
    fn overflow_is_rejected() {
        let mut data = leaf_payload();
        let mut node = NodeMut::new(&mut data, KEY_SIZE).unwrap();
        let cap = node.capacity();

        for i in 0..cap {
            let key = format!("k{:04}", i);
            node.insert_slot(i, &slot_for(key.as_bytes(), i as u64)).unwrap();
        }

        let err = node.insert_slot(cap, &slot_for(b"zz", 0));
        assert!(err.is_err());
    }
}
